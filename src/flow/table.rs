//! The flow table: an ordered map of flows keyed by 5-tuple.
//!
//! Unlike the generic object tables, flows are installed and removed
//! directly by code running under the `Agent::FlowHandler` class (the
//! packet path installs, the aging loop retires); there is no request
//! queue. The scheduler's exclusion policy keeps those writers off each
//! other and off the stats-collection and kernel-sync paths.

use std::ops::Bound;
use std::sync::{Arc, RwLock};
use std::collections::BTreeMap;

use crate::agent::stats::AgentStats;

use super::entry::{FlowEntry, FlowKey, FlowRef, FlowState};

pub struct FlowTable {
    flows: RwLock<BTreeMap<FlowKey, FlowRef>>,
    stats: Arc<AgentStats>,
}

impl FlowTable {
    pub fn new(stats: Arc<AgentStats>) -> Arc<Self> {
        Arc::new(Self {
            flows: RwLock::new(BTreeMap::new()),
            stats,
        })
    }

    pub fn size(&self) -> usize {
        self.flows.read().expect("flow table lock poisoned").len()
    }

    pub fn find(&self, key: &FlowKey) -> Option<FlowRef> {
        self.flows
            .read()
            .expect("flow table lock poisoned")
            .get(key)
            .cloned()
    }

    /// Inserts a flow, replacing any previous flow with the same key.
    pub fn insert(&self, entry: FlowEntry) -> FlowRef {
        let entry = Arc::new(entry);
        let mut flows = self.flows.write().expect("flow table lock poisoned");
        flows.insert(*entry.key(), Arc::clone(&entry));
        AgentStats::incr(&self.stats.flow_created);
        AgentStats::set(&self.stats.flow_active, flows.len() as u64);
        entry
    }

    /// Cross-links two flows as a forward/reverse pair.
    pub fn link_pair(&self, a: &FlowRef, b: &FlowRef) {
        a.data().reverse_key = Some(*b.key());
        b.data().reverse_key = Some(*a.key());
    }

    /// First flow strictly after `after`, or the first flow of the table
    /// when `after` is `None`. The aging pass uses this to resume from its
    /// saved position.
    pub fn next_entry(&self, after: Option<&FlowKey>) -> Option<FlowRef> {
        let flows = self.flows.read().expect("flow table lock poisoned");
        match after {
            Some(key) => flows
                .range((Bound::Excluded(*key), Bound::Unbounded))
                .next()
                .map(|(_, v)| Arc::clone(v)),
            None => flows.iter().next().map(|(_, v)| Arc::clone(v)),
        }
    }

    /// Removes a flow, and its reverse flow when `delete_reverse` is set.
    /// Returns the removed flows, primary first, marked `Deleted`.
    pub fn delete_flow(&self, key: &FlowKey, delete_reverse: bool) -> Vec<FlowRef> {
        let mut removed = Vec::with_capacity(2);
        let mut flows = self.flows.write().expect("flow table lock poisoned");
        if let Some(primary) = flows.remove(key) {
            if delete_reverse {
                if let Some(rev_key) = primary.reverse_key() {
                    if let Some(rev) = flows.remove(&rev_key) {
                        removed.push(rev);
                    }
                }
            }
            removed.insert(0, primary);
        }
        AgentStats::set(&self.stats.flow_active, flows.len() as u64);
        drop(flows);
        for flow in &removed {
            flow.data().state = FlowState::Deleted;
        }
        removed
    }
}
