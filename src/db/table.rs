//! Generic partitioned table with observer subscriptions.
//!
//! A table is a fixed set of shards, each owning a keyed entry map, a FIFO
//! request queue, and a remove queue. All mutation of a shard happens on a
//! single scheduler task keyed `(db::DBTable, (table_id, shard))`; readers
//! anywhere see only committed state.
//!
//! Table-specific behavior plugs in through [`TableHooks`], a capability
//! set dispatched per request; no inheritance hierarchy, one vtable call.
//!
//! # Entry lifecycle
//!
//! ```text
//!  ADD ──► live ──CHANGE*──► DELETE ──► deleted (still findable)
//!                                          │ refs = 0, states detached
//!                                          ▼
//!                                    remove queue
//!                              ┌───────────┴────────────┐
//!                              │ no actor               │ actor
//!                              ▼                        ▼
//!                       finalize_remove        LifetimeManager retries
//!                     (unmap, retired hook,    may_delete → shutdown →
//!                      resync/reuse check)     destroy → finalize_remove
//! ```
//!
//! A deleted entry stays findable (`find(key, true)`) until finalization so
//! listeners can drain their `DbState`. A delete timer bounds the window:
//! expiry means a reference leak and is process-fatal.
//!
//! # Caveats
//!
//! - Listener callbacks run on the shard task and must not register or
//!   unregister listeners (the listener list lock is held).
//! - `find(key, true)` on an entry mid-finalization can briefly revive its
//!   refcount; callers doing that outside the table's task class must
//!   tolerate retirement racing them.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, error};

use crate::scheduler::{
    shard_instance, ClassId, Scheduler, TaskKey, TaskOutcome, TimerManager,
};

use super::entry::{DbEntry, DbState, EntryRef, ListenerId};
use super::lifetime::LifetimeManager;
use super::partition::{Partition, DRAIN_BATCH, HIGH_WATER, LOW_WATER};
use super::request::{DbOperation, DbRequest};

/// Listener notification kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbNotice {
    Add,
    Change,
    Delete,
}

/// Table-specific behavior, dispatched per request.
///
/// `Key` must hash identically for equal keys (shard routing) and order
/// totally (map iteration).
pub trait TableHooks: Send + Sync + Sized + 'static {
    type Key: Ord + Hash + Clone + Send + Sync + fmt::Debug + 'static;
    type Data: Send + 'static;
    type Entry: DbEntry<Key = Self::Key>;

    /// Creates the entry for an ADD. Runs before the map insert; must not
    /// touch the table.
    fn alloc(&self, key: &Self::Key) -> Self::Entry;

    /// Called after a fresh entry is inserted.
    fn add(&self, table: &Table<Self>, entry: &Arc<Self::Entry>, data: Option<Self::Data>);

    /// Called for ADD_OR_UPDATE on a live entry. Return false to reject
    /// the request: it is logged and dropped without notification.
    fn on_change(
        &self,
        table: &Table<Self>,
        entry: &Arc<Self::Entry>,
        data: Option<Self::Data>,
    ) -> bool;

    /// Called when a DELETE is processed, before the deleted flag is set.
    fn delete(&self, table: &Table<Self>, entry: &Arc<Self::Entry>);

    /// Gates listener notification for an entry.
    fn can_notify(&self, entry: &Arc<Self::Entry>) -> bool {
        let _ = entry;
        true
    }

    /// Called after the entry is removed from the map (retirement).
    fn retired(&self, table: &Table<Self>, entry: &Arc<Self::Entry>) {
        let _ = (table, entry);
    }

    /// Reuse protocol: consulted at retirement for a pending re-creation
    /// of the same key. Returning data re-issues an ADD.
    fn resync(&self, key: &Self::Key) -> Option<Self::Data> {
        let _ = key;
        None
    }
}

/// Shared construction context for tables.
#[derive(Clone)]
pub struct DbContext {
    pub scheduler: Arc<Scheduler>,
    pub timers: Arc<TimerManager>,
    pub lifetime: Arc<LifetimeManager>,
    /// The class every table task runs under (`db::DBTable`).
    pub db_class: ClassId,
    /// Shards per table; power of two.
    pub partition_count: u32,
    /// Delete-timer bound; expiry is process-fatal.
    pub delete_timeout: Duration,
    /// Class paused when a shard request queue crosses its high-water mark.
    pub producer_class: Option<ClassId>,
}

impl DbContext {
    pub fn validate(&self) {
        assert!(
            self.partition_count.is_power_of_two(),
            "partition_count must be a power of two"
        );
        assert!(self.delete_timeout > Duration::ZERO);
    }
}

/// Allocates table ids and carries the shared context.
pub struct Database {
    ctx: DbContext,
    next_table_id: AtomicU32,
}

impl Database {
    pub fn new(ctx: DbContext) -> Arc<Self> {
        ctx.validate();
        Arc::new(Self {
            ctx,
            // Table ids start at 1 so shard instance keys (id << 32 | shard)
            // never collide with plain-id instance keys.
            next_table_id: AtomicU32::new(1),
        })
    }

    pub fn ctx(&self) -> &DbContext {
        &self.ctx
    }

    pub fn create_table<H: TableHooks>(&self, name: &str, hooks: H) -> Table<H> {
        let id = self.next_table_id.fetch_add(1, Ordering::Relaxed);
        Table::new(id, name, hooks, self.ctx.clone())
    }
}

struct ListenerSlot<H: TableHooks> {
    #[allow(clippy::type_complexity)]
    f: Box<dyn Fn(&Table<H>, DbNotice, &Arc<H::Entry>) + Send + Sync>,
}

struct TableInner<H: TableHooks> {
    id: u32,
    name: String,
    hooks: H,
    ctx: DbContext,
    partitions: Vec<Partition<H>>,
    /// Registration order preserved; unregistered slots become `None` so
    /// later ids keep their positions.
    listeners: RwLock<Vec<Option<ListenerSlot<H>>>>,
    hasher: ahash::RandomState,
    producer_paused: AtomicBool,
}

/// Handle to a partitioned table. Cheap to clone; all clones share state.
pub struct Table<H: TableHooks> {
    inner: Arc<TableInner<H>>,
}

impl<H: TableHooks> Clone for Table<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: TableHooks> Table<H> {
    fn new(id: u32, name: &str, hooks: H, ctx: DbContext) -> Self {
        let partitions = (0..ctx.partition_count).map(|_| Partition::new()).collect();
        Self {
            inner: Arc::new(TableInner {
                id,
                name: name.to_string(),
                hooks,
                ctx,
                partitions,
                listeners: RwLock::new(Vec::new()),
                // Fixed seeds: shard routing must be stable for the life of
                // the table, and reproducible runs help debugging.
                hasher: ahash::RandomState::with_seeds(
                    0x243f_6a88_85a3_08d3,
                    0x1319_8a2e_0370_7344,
                    0xa409_3822_299f_31d0,
                    0x082e_fa98_ec4e_6c89,
                ),
                producer_paused: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn hooks(&self) -> &H {
        &self.inner.hooks
    }

    pub fn partition_count(&self) -> u32 {
        self.inner.ctx.partition_count
    }

    /// Entry count across shards, deleted entries included.
    pub fn size(&self) -> usize {
        self.inner.partitions.iter().map(|p| p.len()).sum()
    }

    pub(crate) fn partition_index(&self, key: &H::Key) -> usize {
        let h = self.inner.hasher.hash_one(key);
        (h as usize) & (self.inner.partitions.len() - 1)
    }

    // ------------------------------------------------------------------
    // Mutation path
    // ------------------------------------------------------------------

    /// Queues a mutation. Returns false when the shard queue is at or past
    /// its high-water mark; the producer class (if configured) has been
    /// paused and callers should stop producing.
    pub fn enqueue(&self, req: DbRequest<H>) -> bool {
        let pidx = self.partition_index(&req.key);
        let part = &self.inner.partitions[pidx];
        // Count before push: the drain task decrements after each pop, and
        // the counter must never lag behind a poppable item.
        let depth = part.request_count.fetch_add(1, Ordering::AcqRel) + 1;
        part.requests.push(req);
        self.maybe_start_runner(pidx);

        if depth >= HIGH_WATER {
            if let Some(producer) = self.inner.ctx.producer_class {
                if !self.inner.producer_paused.swap(true, Ordering::AcqRel) {
                    debug!(
                        "table {}: shard {} over high-water, pausing producer",
                        self.inner.name, pidx
                    );
                    self.inner.ctx.scheduler.pause_class(producer);
                }
            }
            return false;
        }
        true
    }

    pub(crate) fn queue_remove(&self, entry: Arc<H::Entry>) {
        if entry.core().claim_remove_q() {
            let pidx = self.partition_index(entry.key());
            self.inner.partitions[pidx].removals.push(entry);
            self.maybe_start_runner(pidx);
        }
    }

    fn maybe_start_runner(&self, pidx: usize) {
        let part = &self.inner.partitions[pidx];
        let mut running = part.running.lock().expect("runner latch poisoned");
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let table = self.clone();
        let key = TaskKey::new(
            self.inner.ctx.db_class,
            shard_instance(self.inner.id, pidx as u32),
        );
        if self
            .inner
            .ctx
            .scheduler
            .submit(key, move || table.drain(pidx))
            .is_err()
        {
            // Scheduler shutdown; leave the latch set so nothing retries.
            debug!("table {}: drain submit during shutdown", self.inner.name);
        }
    }

    /// One drain task run for a shard: removals first, then a bounded batch
    /// of requests; reschedules itself while work remains.
    fn drain(&self, pidx: usize) -> TaskOutcome {
        let part = &self.inner.partitions[pidx];
        let mut count = 0;

        while let Some(entry) = part.removals.pop() {
            self.process_remove(&entry);
            count += 1;
            if count == DRAIN_BATCH {
                return TaskOutcome::Reschedule;
            }
        }

        while let Some(req) = part.requests.pop() {
            let depth = part.request_count.fetch_sub(1, Ordering::AcqRel) - 1;
            self.maybe_resume_producer(depth);
            self.process_request(pidx, req);
            count += 1;
            if count == DRAIN_BATCH {
                return TaskOutcome::Reschedule;
            }
        }

        // Producers may have appended while we were draining; only clear
        // the latch when both queues are verifiably empty.
        let mut running = part.running.lock().expect("runner latch poisoned");
        if part.requests.is_empty() && part.removals.is_empty() {
            *running = false;
            TaskOutcome::Done
        } else {
            TaskOutcome::Reschedule
        }
    }

    fn maybe_resume_producer(&self, depth: usize) {
        if depth == LOW_WATER
            && self.inner.producer_paused.swap(false, Ordering::AcqRel)
        {
            if let Some(producer) = self.inner.ctx.producer_class {
                debug!("table {}: below low-water, resuming producer", self.inner.name);
                self.inner.ctx.scheduler.resume_class(producer);
            }
        }
    }

    fn process_request(&self, pidx: usize, req: DbRequest<H>) {
        let part = &self.inner.partitions[pidx];
        match req.op {
            DbOperation::AddChange => {
                let existing = part.find_arc(&req.key);
                match existing {
                    None => {
                        let entry = Arc::new(self.inner.hooks.alloc(&req.key));
                        let entry = {
                            let mut map =
                                part.entries.write().expect("entry map lock poisoned");
                            map.insert(req.key.clone(), Arc::clone(&entry));
                            entry
                        };
                        self.inner.hooks.add(self, &entry, req.data);
                        self.notify(DbNotice::Add, &entry);
                    }
                    Some(entry) if entry.core().is_deleted() => {
                        // The reuse protocol is the only re-creation path
                        // for a pending-delete key.
                        debug!(
                            "table {}: entry pending delete, ignoring request for {:?}",
                            self.inner.name, req.key
                        );
                    }
                    Some(entry) => {
                        if self.inner.hooks.on_change(self, &entry, req.data) {
                            self.notify(DbNotice::Change, &entry);
                        } else {
                            debug!(
                                "table {}: change rejected for {:?}",
                                self.inner.name, req.key
                            );
                        }
                    }
                }
            }
            DbOperation::Delete => {
                let existing = part.find_arc(&req.key);
                match existing {
                    Some(entry) if !entry.core().is_deleted() => {
                        self.inner.hooks.delete(self, &entry);
                        entry.core().set_deleted();
                        self.start_delete_timer(pidx, &entry);
                        self.notify(DbNotice::Delete, &entry);
                        // Nothing holds it and no listener kept state:
                        // retire without waiting for an external trigger.
                        self.check_removal(&entry);
                    }
                    _ => {
                        debug!(
                            "table {}: delete for absent key {:?}",
                            self.inner.name, req.key
                        );
                    }
                }
            }
        }
    }

    fn process_remove(&self, entry: &Arc<H::Entry>) {
        let core = entry.core();
        if core.is_deleted() && core.refcount() == 0 && core.states_empty() {
            if entry.delete_actor().is_some() {
                // The lifetime manager owns the rest: may_delete →
                // shutdown → destroy, where destroy finalizes.
                core.clear_remove_q();
                self.inner.ctx.lifetime.poke();
            } else {
                self.finalize_remove(entry);
            }
        } else {
            core.clear_remove_q();
        }
    }

    /// Unmaps a retired entry, cancels its delete timer, runs the
    /// `retired` hook and the reuse resync. Idempotent.
    ///
    /// Called from the shard drain for plain entries and from
    /// `LifetimeActor::destroy` for managed ones.
    pub fn finalize_remove(&self, entry: &Arc<H::Entry>) {
        if let Some(timer) = entry.core().take_delete_timer() {
            self.inner.ctx.timers.cancel(timer);
        }
        let pidx = self.partition_index(entry.key());
        let removed = {
            let mut map = self.inner.partitions[pidx]
                .entries
                .write()
                .expect("entry map lock poisoned");
            map.remove(entry.key())
        };
        if removed.is_some() {
            self.inner.hooks.retired(self, entry);
            if let Some(data) = self.inner.hooks.resync(entry.key()) {
                debug!(
                    "table {}: resync re-creating {:?}",
                    self.inner.name,
                    entry.key()
                );
                self.enqueue(DbRequest::add(entry.key().clone(), data));
            }
        }
    }

    pub(crate) fn check_removal(&self, entry: &Arc<H::Entry>) {
        let core = entry.core();
        if core.is_deleted() && core.refcount() == 0 && core.states_empty() {
            self.queue_remove(Arc::clone(entry));
        }
    }

    fn start_delete_timer(&self, pidx: usize, entry: &Arc<H::Entry>) {
        let table = self.clone();
        let key = entry.key().clone();
        let task_key = TaskKey::new(
            self.inner.ctx.db_class,
            shard_instance(self.inner.id, pidx as u32),
        );
        let timer = self
            .inner
            .ctx
            .timers
            .start(self.inner.ctx.delete_timeout, task_key, move || {
                if let Some(entry) = table.find_raw(&key) {
                    table.delete_timeout_expired(&entry);
                }
            });
        entry.core().set_delete_timer(timer);
    }

    /// A deleted entry outlived its timer: a holder leaked a reference or a
    /// listener never detached. Dump state and abort.
    fn delete_timeout_expired(&self, entry: &Arc<H::Entry>) {
        error!(
            "table {}: delete timer expired for {:?}: refcount={} listener_states={} table_size={} lifetime_pending={}",
            self.inner.name,
            entry.key(),
            entry.core().refcount(),
            entry.core().state_count(),
            self.size(),
            self.inner.ctx.lifetime.pending(),
        );
        for line in self.inner.ctx.scheduler.diagnostics() {
            error!("  {line}");
        }
        // Relaxed to a loud error under test so the path is coverable.
        #[cfg(not(test))]
        std::process::abort();
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Synchronous lookup. Deleted entries are returned only when
    /// `include_deleted` is set; they remain findable until retirement so
    /// listeners can drain their state.
    pub fn find(&self, key: &H::Key, include_deleted: bool) -> Option<EntryRef<H>> {
        let pidx = self.partition_index(key);
        let entry = self.inner.partitions[pidx].find_arc(key)?;
        if !include_deleted && entry.core().is_deleted() {
            return None;
        }
        Some(EntryRef::new(self.clone(), entry))
    }

    /// Uncounted lookup for internal paths that must not disturb the
    /// refcount (delete-timer check, walker filtering).
    pub(crate) fn find_raw(&self, key: &H::Key) -> Option<Arc<H::Entry>> {
        let pidx = self.partition_index(key);
        self.inner.partitions[pidx].find_arc(key)
    }

    /// Takes a counted reference to an entry surfaced by a callback.
    pub fn make_ref(&self, entry: &Arc<H::Entry>) -> EntryRef<H> {
        EntryRef::new(self.clone(), Arc::clone(entry))
    }

    pub(crate) fn snapshot_shard(&self, pidx: usize) -> Vec<Arc<H::Entry>> {
        self.inner.partitions[pidx].snapshot()
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Subscribes to notifications. Existing entries are not replayed; new
    /// listeners start from live state.
    pub fn register(
        &self,
        f: impl Fn(&Table<H>, DbNotice, &Arc<H::Entry>) + Send + Sync + 'static,
    ) -> ListenerId {
        let mut listeners = self.inner.listeners.write().expect("listener lock poisoned");
        let id = ListenerId(listeners.len() as u32);
        listeners.push(Some(ListenerSlot { f: Box::new(f) }));
        id
    }

    /// Drops a subscription. The listener's per-entry states are not
    /// cleared; the owner must detach them first.
    pub fn unregister(&self, id: ListenerId) {
        let mut listeners = self.inner.listeners.write().expect("listener lock poisoned");
        if let Some(slot) = listeners.get_mut(id.0 as usize) {
            *slot = None;
        }
    }

    fn notify(&self, op: DbNotice, entry: &Arc<H::Entry>) {
        if !self.inner.hooks.can_notify(entry) {
            return;
        }
        let listeners = self.inner.listeners.read().expect("listener lock poisoned");
        for slot in listeners.iter().flatten() {
            (slot.f)(self, op, entry);
        }
    }

    // ------------------------------------------------------------------
    // Listener state
    // ------------------------------------------------------------------

    pub fn set_state(&self, entry: &Arc<H::Entry>, id: ListenerId, state: DbState) {
        entry.core().set_state(id, state);
    }

    /// Detaches a listener's state. Clearing the last state of a retired
    /// entry queues it for removal.
    pub fn clear_state(&self, entry: &Arc<H::Entry>, id: ListenerId) -> Option<DbState> {
        let state = entry.core().clear_state(id);
        self.check_removal(entry);
        state
    }

    pub fn with_state<R>(
        &self,
        entry: &Arc<H::Entry>,
        id: ListenerId,
        f: impl FnOnce(Option<&mut DbState>) -> R,
    ) -> R {
        entry.core().with_state(id, f)
    }
}

impl<H: TableHooks> fmt::Debug for Table<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("size", &self.size())
            .finish()
    }
}
