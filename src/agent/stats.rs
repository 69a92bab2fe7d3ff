//! Process-wide counters.
//!
//! Plain relaxed atomics: these are accounting, not synchronization. The
//! snapshot feeds the fatal-error diagnostic dump and operator queries.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct AgentStats {
    pub flow_created: AtomicU64,
    pub flow_aged: AtomicU64,
    /// Gauge: current flow table population.
    pub flow_active: AtomicU64,
    pub flow_exported: AtomicU64,
}

impl AgentStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn set(counter: &AtomicU64, n: u64) {
        counter.store(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// One line per counter, for the diagnostic dump.
    pub fn snapshot_lines(&self) -> Vec<String> {
        vec![
            format!("flow_created: {}", Self::get(&self.flow_created)),
            format!("flow_aged: {}", Self::get(&self.flow_aged)),
            format!("flow_active: {}", Self::get(&self.flow_active)),
            format!("flow_exported: {}", Self::get(&self.flow_exported)),
        ]
    }
}
