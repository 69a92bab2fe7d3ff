//! Read-only view of the kernel flow table.
//!
//! The collector only ever reads these records; writes go through the
//! kernel-sync path, whose task class is mutually excluded with both the
//! flow handler and the stats collector.

use std::sync::RwLock;

use super::entry::FlowHandle;

/// Per-index kernel flow statistics. The 32-bit counters wrap; the oflow
/// fields extend them to 48 effective bits (16 extra for bytes, 8 here
/// plus userspace carry for packets).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelFlowRecord {
    pub flow_bytes: u32,
    pub flow_packets: u32,
    pub flow_bytes_oflow: u16,
    pub flow_packets_oflow: u8,
}

/// Fetches kernel flow records by handle.
pub trait KernelFlowReader: Send + Sync {
    /// Returns the record at `handle`, or `None` when the slot is empty
    /// or the handle is invalid.
    fn kernel_flow(&self, handle: FlowHandle) -> Option<KernelFlowRecord>;
}

/// In-memory kernel flow table used by tests and by bootstrap until the
/// netlink transport attaches.
#[derive(Default)]
pub struct SimKernelFlowTable {
    slots: RwLock<Vec<Option<KernelFlowRecord>>>,
}

impl SimKernelFlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, handle: FlowHandle, record: KernelFlowRecord) {
        let mut slots = self.slots.write().expect("kernel slots lock poisoned");
        let idx = handle.0 as usize;
        if slots.len() <= idx {
            slots.resize(idx + 1, None);
        }
        slots[idx] = Some(record);
    }

    /// Empties a slot, as the kernel does when it reuses or evicts one.
    pub fn clear(&self, handle: FlowHandle) {
        let mut slots = self.slots.write().expect("kernel slots lock poisoned");
        if let Some(slot) = slots.get_mut(handle.0 as usize) {
            *slot = None;
        }
    }
}

impl KernelFlowReader for SimKernelFlowTable {
    fn kernel_flow(&self, handle: FlowHandle) -> Option<KernelFlowRecord> {
        if !handle.is_valid() {
            return None;
        }
        self.slots
            .read()
            .expect("kernel slots lock poisoned")
            .get(handle.0 as usize)
            .copied()
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_read_back() {
        let t = SimKernelFlowTable::new();
        let rec = KernelFlowRecord {
            flow_bytes: 100,
            flow_packets: 2,
            ..Default::default()
        };
        t.set(FlowHandle(3), rec);
        assert_eq!(t.kernel_flow(FlowHandle(3)), Some(rec));
        assert_eq!(t.kernel_flow(FlowHandle(0)), None);
        assert_eq!(t.kernel_flow(FlowHandle::INVALID), None);
    }

    #[test]
    fn clear_empties_slot() {
        let t = SimKernelFlowTable::new();
        t.set(FlowHandle(1), KernelFlowRecord::default());
        t.clear(FlowHandle(1));
        assert_eq!(t.kernel_flow(FlowHandle(1)), None);
    }
}
