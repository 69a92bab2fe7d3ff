//! Entry bookkeeping shared by every table entry type.
//!
//! An entry is owned by its shard map (`Arc`) and referenced by external
//! holders through counted [`EntryRef`] guards. The explicit refcount (not
//! `Arc::strong_count`) is what the retirement protocol watches: the map's
//! own `Arc` and transient clones held by walkers or listeners during a
//! callback do not keep an entry alive.
//!
//! Retirement preconditions, all tracked here:
//! - `deleted` set (the DELETE request was processed),
//! - refcount zero (all `EntryRef`s dropped),
//! - listener state table empty (every listener detached its `DbState`).
//!
//! The `on_remove_q` latch mirrors the shard remove queue: an entry is
//! enqueued for removal at most once no matter how many triggers race.

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use ahash::AHashMap;

use crate::scheduler::TimerId;

use super::lifetime::LifetimeActor;
use super::table::{Table, TableHooks};

/// Opaque per-listener state attached to an entry.
pub type DbState = Box<dyn Any + Send>;

/// Listener subscription id, unique per table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u32);

/// Shared bookkeeping embedded in every entry.
pub struct EntryCore {
    deleted: AtomicBool,
    refcount: AtomicU32,
    on_remove_q: AtomicBool,
    states: Mutex<AHashMap<u32, DbState>>,
    delete_timer: Mutex<Option<TimerId>>,
}

impl EntryCore {
    pub fn new() -> Self {
        Self {
            deleted: AtomicBool::new(false),
            refcount: AtomicU32::new(0),
            on_remove_q: AtomicBool::new(false),
            states: Mutex::new(AHashMap::new()),
            delete_timer: Mutex::new(None),
        }
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub(crate) fn set_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn incr_ref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true when this drop released the last reference.
    pub(crate) fn decr_ref(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Claims the remove-queue slot; true if the caller should enqueue.
    pub(crate) fn claim_remove_q(&self) -> bool {
        !self.on_remove_q.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_remove_q(&self) {
        self.on_remove_q.store(false, Ordering::Release);
    }

    pub fn states_empty(&self) -> bool {
        self.states.lock().expect("state lock poisoned").is_empty()
    }

    pub fn state_count(&self) -> usize {
        self.states.lock().expect("state lock poisoned").len()
    }

    pub(crate) fn set_state(&self, listener: ListenerId, state: DbState) {
        self.states
            .lock()
            .expect("state lock poisoned")
            .insert(listener.0, state);
    }

    pub(crate) fn clear_state(&self, listener: ListenerId) -> Option<DbState> {
        self.states
            .lock()
            .expect("state lock poisoned")
            .remove(&listener.0)
    }

    pub(crate) fn with_state<R>(
        &self,
        listener: ListenerId,
        f: impl FnOnce(Option<&mut DbState>) -> R,
    ) -> R {
        let mut states = self.states.lock().expect("state lock poisoned");
        f(states.get_mut(&listener.0))
    }

    pub(crate) fn set_delete_timer(&self, id: TimerId) {
        *self.delete_timer.lock().expect("timer slot poisoned") = Some(id);
    }

    pub(crate) fn take_delete_timer(&self) -> Option<TimerId> {
        self.delete_timer.lock().expect("timer slot poisoned").take()
    }
}

impl Default for EntryCore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EntryCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryCore")
            .field("deleted", &self.is_deleted())
            .field("refcount", &self.refcount())
            .field("states", &self.state_count())
            .finish()
    }
}

/// Implemented by every table entry type.
pub trait DbEntry: Send + Sync + 'static {
    type Key: Ord + Clone + Send + Sync + fmt::Debug + 'static;

    fn key(&self) -> &Self::Key;
    fn core(&self) -> &EntryCore;

    /// Retirement hook for entries with managed lifetimes. Entries without
    /// one are removed directly once eligible.
    fn delete_actor(&self) -> Option<Arc<dyn LifetimeActor>> {
        None
    }
}

/// Counted reference to a table entry.
///
/// Dropping the last `EntryRef` of a deleted entry queues it for
/// retirement on its shard.
pub struct EntryRef<H: TableHooks> {
    table: Table<H>,
    entry: Arc<H::Entry>,
}

impl<H: TableHooks> EntryRef<H> {
    pub(crate) fn new(table: Table<H>, entry: Arc<H::Entry>) -> Self {
        entry.core().incr_ref();
        Self { table, entry }
    }

    pub fn entry(&self) -> &Arc<H::Entry> {
        &self.entry
    }
}

impl<H: TableHooks> Deref for EntryRef<H> {
    type Target = H::Entry;

    fn deref(&self) -> &H::Entry {
        &self.entry
    }
}

impl<H: TableHooks> Clone for EntryRef<H> {
    fn clone(&self) -> Self {
        Self::new(self.table.clone(), Arc::clone(&self.entry))
    }
}

impl<H: TableHooks> Drop for EntryRef<H> {
    fn drop(&mut self) {
        if self.entry.core().decr_ref() && self.entry.core().is_deleted() {
            self.table.queue_remove(Arc::clone(&self.entry));
        }
    }
}

impl<H: TableHooks> fmt::Debug for EntryRef<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryRef")
            .field("key", self.entry.key())
            .field("core", self.entry.core())
            .finish()
    }
}
