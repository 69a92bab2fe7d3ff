//! Inter-VN traffic aggregation.
//!
//! The aging pass feeds every reconciliation delta into this aggregator,
//! keyed by `(source_vn, dest_vn)`. Telemetry reads the snapshot.

use std::sync::Mutex;

use ahash::AHashMap;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VnPairStats {
    pub bytes: u64,
    pub packets: u64,
}

#[derive(Default)]
pub struct InterVnStats {
    pairs: Mutex<AHashMap<(String, String), VnPairStats>>,
}

impl InterVnStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, source_vn: &str, dest_vn: &str, diff_bytes: u64, diff_packets: u64) {
        let mut pairs = self.pairs.lock().expect("inter-vn lock poisoned");
        let entry = pairs
            .entry((source_vn.to_string(), dest_vn.to_string()))
            .or_default();
        entry.bytes = entry.bytes.saturating_add(diff_bytes);
        entry.packets = entry.packets.saturating_add(diff_packets);
    }

    pub fn get(&self, source_vn: &str, dest_vn: &str) -> Option<VnPairStats> {
        self.pairs
            .lock()
            .expect("inter-vn lock poisoned")
            .get(&(source_vn.to_string(), dest_vn.to_string()))
            .copied()
    }

    pub fn snapshot(&self) -> Vec<((String, String), VnPairStats)> {
        self.pairs
            .lock()
            .expect("inter-vn lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}
