//! Per-shard storage: the entry map, the request queue, and the remove
//! queue.
//!
//! A shard's queues are multi-producer (any thread may enqueue) with a
//! single consumer: the shard's drain task. The entry map is guarded by an
//! `RwLock` whose writer is only ever the drain task (and entry
//! finalization); each request commits under one write-lock critical
//! section, so readers on other tasks observe only committed state.
//!
//! The `running` latch implements the start-runner protocol: producers
//! submit a drain task only when none is queued or running; the drain task
//! clears the latch only after re-checking both queues under the latch
//! lock, closing the race with concurrent producers.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, RwLock};

use crossbeam_queue::SegQueue;

use super::request::DbRequest;
use super::table::TableHooks;

/// Max queue items (removals + requests) consumed per drain task run.
/// The task reschedules itself when work remains.
pub(crate) const DRAIN_BATCH: usize = 32;

/// Request-queue depth at which the producer class is paused.
pub(crate) const HIGH_WATER: usize = 1024;

/// Depth at which a paused producer class is resumed.
pub(crate) const LOW_WATER: usize = HIGH_WATER / 2;

pub(crate) struct Partition<H: TableHooks> {
    pub(crate) entries: RwLock<BTreeMap<H::Key, Arc<H::Entry>>>,
    pub(crate) requests: SegQueue<DbRequest<H>>,
    pub(crate) removals: SegQueue<Arc<H::Entry>>,
    /// Tracks `requests` depth for the high-water mark; `SegQueue::len` is
    /// O(n).
    pub(crate) request_count: AtomicUsize,
    /// Drain-task latch; see module docs.
    pub(crate) running: Mutex<bool>,
}

impl<H: TableHooks> Partition<H> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            requests: SegQueue::new(),
            removals: SegQueue::new(),
            request_count: AtomicUsize::new(0),
            running: Mutex::new(false),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().expect("entry map lock poisoned").len()
    }

    /// Snapshot of the shard's entries, in key order. Deleted entries are
    /// included; the walker filters them at visit time.
    pub(crate) fn snapshot(&self) -> Vec<Arc<H::Entry>> {
        self.entries
            .read()
            .expect("entry map lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub(crate) fn find_arc(&self, key: &H::Key) -> Option<Arc<H::Entry>> {
        self.entries
            .read()
            .expect("entry map lock poisoned")
            .get(key)
            .cloned()
    }
}
