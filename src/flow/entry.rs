//! Userspace shadow of a kernel flow.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

/// 5-tuple flow key. Total order matters: the aging pass iterates the
/// table in key order from a saved position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowKey {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub proto: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, proto: u8, src_port: u16, dst_port: u16) -> Self {
        Self {
            src_ip,
            dst_ip,
            proto,
            src_port,
            dst_port,
        }
    }
}

/// Index into the kernel flow table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FlowHandle(pub u32);

impl FlowHandle {
    pub const INVALID: FlowHandle = FlowHandle(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Aging-loop state of a flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FlowState {
    #[default]
    New,
    /// Stats have been reconciled at least once.
    Active,
    /// Aging-eligible but the reverse flow was not ready.
    Aging,
    /// Removed from the table; teardown exported.
    Deleted,
}

/// Mutable flow payload. Written only under the `Agent::FlowHandler` task
/// class; read anywhere.
#[derive(Clone, Debug, Default)]
pub struct FlowData {
    /// Cumulative byte counter: kernel low 48 bits plus userspace-held
    /// carry in the top 16. Non-decreasing until the flow dies.
    pub bytes: u64,
    /// Cumulative packet counter: kernel low 40 bits plus carry in the
    /// top 24.
    pub packets: u64,
    /// Microseconds; last stats reconciliation.
    pub last_modified_time: u64,
    pub setup_time: u64,
    pub teardown_time: Option<u64>,
    /// Non-owning link to the paired flow, validated by lookup on use.
    pub reverse_key: Option<FlowKey>,
    pub ingress: bool,
    pub local: bool,
    pub nat: bool,
    pub short_flow: bool,
    pub source_vn: String,
    pub dest_vn: String,
    /// Ingress interface index, for VM-name resolution at export.
    pub intf_in: Option<u32>,
    pub state: FlowState,
}

/// A flow record. The key, handle, and UUIDs are immutable; counters and
/// flags live behind the data lock.
#[derive(Debug)]
pub struct FlowEntry {
    key: FlowKey,
    flow_handle: FlowHandle,
    uuid: Uuid,
    /// Second identity used when exporting the egress direction of a
    /// local flow.
    egress_uuid: Uuid,
    data: Mutex<FlowData>,
}

impl FlowEntry {
    pub fn new(key: FlowKey, flow_handle: FlowHandle) -> Self {
        Self {
            key,
            flow_handle,
            uuid: Uuid::new_v4(),
            egress_uuid: Uuid::new_v4(),
            data: Mutex::new(FlowData::default()),
        }
    }

    /// Pre-insert configuration convenience.
    pub fn with_data(self, f: impl FnOnce(&mut FlowData)) -> Self {
        f(&mut self.data.lock().expect("flow data lock poisoned"));
        self
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn flow_handle(&self) -> FlowHandle {
        self.flow_handle
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn egress_uuid(&self) -> Uuid {
        self.egress_uuid
    }

    pub fn data(&self) -> MutexGuard<'_, FlowData> {
        self.data.lock().expect("flow data lock poisoned")
    }

    pub fn reverse_key(&self) -> Option<FlowKey> {
        self.data().reverse_key
    }

    pub fn is_short_flow(&self) -> bool {
        self.data().short_flow
    }
}

/// Shared flow reference.
pub type FlowRef = Arc<FlowEntry>;
