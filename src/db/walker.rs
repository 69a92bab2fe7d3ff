//! Asynchronous table iteration.
//!
//! A walk fans one scan task out per shard under the table's task class,
//! so walker callbacks are serialized with that shard's mutations and
//! never see torn state. When the last shard finishes, the done callback
//! runs exactly once as its own task keyed to the table.
//!
//! Cancellation is cooperative: the flag is checked between entries, and a
//! cancelled walk still runs its done callback (with the cancellation
//! indicator) so downstream bookkeeping (refcount decrements, next-walk
//! scheduling) always happens.
//!
//! Entries present at walk start are visited unless deleted before their
//! shard task runs; entries added mid-walk may or may not be seen.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use log::debug;

use crate::scheduler::{shard_instance, ClassId, Scheduler, TaskKey};

use super::entry::DbEntry;
use super::table::{Table, TableHooks};

/// Walk identifier; monotonic, never reused within a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WalkId(pub u64);

/// Sentinel for "no walk outstanding" slots kept by walk owners.
pub const INVALID_WALK: WalkId = WalkId(0);

struct WalkState {
    cancelled: AtomicBool,
    remaining: AtomicUsize,
}

/// Table walk dispatcher. One per agent.
pub struct Walker {
    scheduler: Arc<Scheduler>,
    db_class: ClassId,
    walks: Mutex<AHashMap<u64, Arc<WalkState>>>,
    next_id: AtomicU64,
    started: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
}

impl Walker {
    pub fn new(scheduler: Arc<Scheduler>, db_class: ClassId) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            db_class,
            walks: Mutex::new(AHashMap::new()),
            // 0 is INVALID_WALK.
            next_id: AtomicU64::new(1),
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        })
    }

    /// Starts a walk over `table`.
    ///
    /// `entry_fn(shard, entry)` runs synchronously on each shard's task for
    /// every live entry; returning false cancels the remainder of the
    /// walk. `done_fn(cancelled)` runs exactly once when all shards have
    /// finished or the walk was cancelled.
    pub fn walk_table<H: TableHooks>(
        self: &Arc<Self>,
        table: &Table<H>,
        entry_fn: impl Fn(u32, &Arc<H::Entry>) -> bool + Send + Sync + 'static,
        done_fn: impl FnOnce(bool) + Send + 'static,
    ) -> WalkId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shards = table.partition_count();
        let state = Arc::new(WalkState {
            cancelled: AtomicBool::new(false),
            remaining: AtomicUsize::new(shards as usize),
        });
        self.walks
            .lock()
            .expect("walk registry poisoned")
            .insert(id, Arc::clone(&state));
        self.started.fetch_add(1, Ordering::Relaxed);

        let entry_fn = Arc::new(entry_fn);
        let done_fn: Arc<Mutex<Option<Box<dyn FnOnce(bool) + Send>>>> =
            Arc::new(Mutex::new(Some(Box::new(done_fn))));

        for pidx in 0..shards {
            let walker = Arc::clone(self);
            let table = table.clone();
            let state = Arc::clone(&state);
            let entry_fn = Arc::clone(&entry_fn);
            let done_fn = Arc::clone(&done_fn);
            let key = TaskKey::new(self.db_class, shard_instance(table.id(), pidx));
            let task_state = Arc::clone(&state);
            let task_done_fn = Arc::clone(&done_fn);
            let submitted = self.scheduler.submit_once(key, move || {
                let state = task_state;
                let done_fn = task_done_fn;
                if !state.cancelled.load(Ordering::Acquire) {
                    for entry in table.snapshot_shard(pidx as usize) {
                        if state.cancelled.load(Ordering::Acquire) {
                            break;
                        }
                        if entry.core().is_deleted() {
                            continue;
                        }
                        if !entry_fn(pidx, &entry) {
                            state.cancelled.store(true, Ordering::Release);
                            break;
                        }
                    }
                }
                walker.finish_shard(id, &table, &state, &done_fn);
            });
            if submitted.is_err() {
                // Scheduler shutdown: account for the shard that will
                // never run so the done callback still fires.
                let walker = Arc::clone(self);
                state.cancelled.store(true, Ordering::Release);
                walker.finish_shard_inline(id, &state, &done_fn);
            }
        }

        WalkId(id)
    }

    /// Requests cancellation. Shard tasks exit at the next entry boundary;
    /// the done callback still runs. Returns false for unknown (already
    /// finished) walks.
    pub fn walk_cancel(&self, id: WalkId) -> bool {
        let walks = self.walks.lock().expect("walk registry poisoned");
        match walks.get(&id.0) {
            Some(state) => {
                state.cancelled.store(true, Ordering::Release);
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn finish_shard<H: TableHooks>(
        self: &Arc<Self>,
        id: u64,
        table: &Table<H>,
        state: &Arc<WalkState>,
        done_fn: &Arc<Mutex<Option<Box<dyn FnOnce(bool) + Send>>>>,
    ) {
        if state.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        // Last shard: run done as its own task, serialized with the table.
        let walker = Arc::clone(self);
        let task_state = Arc::clone(state);
        let task_done = Arc::clone(done_fn);
        let key = TaskKey::new(self.db_class, table.id() as u64);
        let submitted = self.scheduler.submit_once(key, move || {
            walker.run_done(id, &task_state, &task_done);
        });
        if submitted.is_err() {
            self.run_done(id, state, done_fn);
        }
    }

    fn finish_shard_inline(
        self: &Arc<Self>,
        id: u64,
        state: &Arc<WalkState>,
        done_fn: &Arc<Mutex<Option<Box<dyn FnOnce(bool) + Send>>>>,
    ) {
        if state.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.run_done(id, state, done_fn);
        }
    }

    fn run_done(
        &self,
        id: u64,
        state: &Arc<WalkState>,
        done_fn: &Arc<Mutex<Option<Box<dyn FnOnce(bool) + Send>>>>,
    ) {
        self.walks.lock().expect("walk registry poisoned").remove(&id);
        let cancelled = state.cancelled.load(Ordering::Acquire);
        self.completed.fetch_add(1, Ordering::Relaxed);
        if let Some(f) = done_fn.lock().expect("done slot poisoned").take() {
            f(cancelled);
        } else {
            debug!("walk {id}: done callback already consumed");
        }
    }

    /// Walks currently in flight.
    pub fn active(&self) -> usize {
        self.walks.lock().expect("walk registry poisoned").len()
    }

    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn cancel_count(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Outstanding walk ids, for the diagnostic dump.
    pub fn outstanding(&self) -> Vec<WalkId> {
        self.walks
            .lock()
            .expect("walk registry poisoned")
            .keys()
            .map(|&id| WalkId(id))
            .collect()
    }
}
