//! Flow export records and sinks.
//!
//! Each reconciliation or teardown produces a [`FlowDataIpv4`] record.
//! Sinks must be safe to call from the aging pass and must never block
//! it: the JSONL sink counts a failed write and drops the record; the
//! next pass naturally re-exports current state.

use std::io::Write;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// One exported flow sample. `flowuuid` is always present; everything
/// else is omitted from the wire when unset.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FlowDataIpv4 {
    pub flowuuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sourceip: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destip: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sport: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dport: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sourcevn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destvn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_packets: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverse_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teardown_time: Option<u64>,
    /// 1 = ingress, 0 = egress.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction_ing: Option<u8>,
}

/// Destination for export records.
pub trait FlowExportSink: Send + Sync {
    fn export(&self, record: &FlowDataIpv4);

    fn flush(&self) {}

    /// Records dropped on write errors so far.
    fn drops(&self) -> u64 {
        0
    }
}

/// JSONL sink: one serde-serialized record per line. The lock is held
/// only for the write, never during serialization.
pub struct JsonlExportSink {
    writer: Mutex<Box<dyn Write + Send>>,
    drops: AtomicU64,
}

impl JsonlExportSink {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
            drops: AtomicU64::new(0),
        }
    }
}

impl FlowExportSink for JsonlExportSink {
    fn export(&self, record: &FlowDataIpv4) {
        let mut buf = match serde_json::to_vec(record) {
            Ok(buf) => buf,
            Err(_) => {
                self.drops.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        buf.push(b'\n');
        let mut writer = self.writer.lock().expect("export writer poisoned");
        if writer.write_all(&buf).is_err() {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn flush(&self) {
        let _ = self.writer.lock().expect("export writer poisoned").flush();
    }

    fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

/// Buffering sink for tests.
#[derive(Default)]
pub struct VecExportSink {
    records: Mutex<Vec<FlowDataIpv4>>,
}

impl VecExportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<FlowDataIpv4> {
        self.records.lock().expect("record buffer poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("record buffer poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records.lock().expect("record buffer poisoned").clear();
    }
}

impl FlowExportSink for VecExportSink {
    fn export(&self, record: &FlowDataIpv4) {
        self.records
            .lock()
            .expect("record buffer poisoned")
            .push(record.clone());
    }
}
