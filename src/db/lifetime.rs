//! Deferred-destruction manager for objects with dependents.
//!
//! An object that cannot die immediately (a VRF with route tables still
//! draining, an entry other subsystems still reference) attaches a
//! [`LifetimeActor`]. `delete` marks the actor pending; retirement scans
//! retry `may_delete()` and, once it holds, run `shutdown()` then
//! `destroy()` exactly once.
//!
//! Scans run as a scheduler task under a configured class (the agent uses
//! `db::DBTable`), so actors observe a quiescent table during `destroy()`.
//! A scan is scheduled whenever something that can change eligibility
//! happens (a delete, a reference release, a dependent table draining); a
//! short retry timer backs this up while survivors remain pending.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;

use crate::scheduler::{Scheduler, TaskKey, TimerManager};

/// Retirement hook attached to a deletable object.
///
/// `shutdown` releases outbound references (breaking ownership cycles);
/// `destroy` performs final teardown. Both run at most once, in that
/// order, and only after `may_delete` returns true.
pub trait LifetimeActor: Send + Sync + 'static {
    fn may_delete(&self) -> bool;
    fn shutdown(&self);
    fn destroy(&self);
}

/// Instance key for the retirement scan task; reserved so it never
/// collides with a table shard instance.
const LIFETIME_INSTANCE: u64 = u64::MAX;

/// Retry cadence while pending actors remain undeletable.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

struct ManagerState {
    pending: Vec<Arc<dyn LifetimeActor>>,
    scan_scheduled: bool,
    retry_armed: bool,
}

/// The lifetime manager. One per agent, created right after the scheduler.
pub struct LifetimeManager {
    scheduler: Arc<Scheduler>,
    timers: Arc<TimerManager>,
    key: TaskKey,
    state: Mutex<ManagerState>,
    destroyed: AtomicU64,
}

impl LifetimeManager {
    pub fn new(
        scheduler: Arc<Scheduler>,
        timers: Arc<TimerManager>,
        class: crate::scheduler::ClassId,
    ) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            timers,
            key: TaskKey::new(class, LIFETIME_INSTANCE),
            state: Mutex::new(ManagerState {
                pending: Vec::new(),
                scan_scheduled: false,
                retry_armed: false,
            }),
            destroyed: AtomicU64::new(0),
        })
    }

    /// Marks `actor` pending for retirement. Idempotent per actor.
    pub fn delete(self: &Arc<Self>, actor: Arc<dyn LifetimeActor>) {
        {
            let mut st = self.state.lock().expect("lifetime lock poisoned");
            if st.pending.iter().any(|a| Arc::ptr_eq(a, &actor)) {
                return;
            }
            st.pending.push(actor);
        }
        self.poke();
    }

    /// Schedules a retirement scan if none is queued. Called by anything
    /// that may have changed an actor's eligibility.
    pub fn poke(self: &Arc<Self>) {
        let mut st = self.state.lock().expect("lifetime lock poisoned");
        if st.pending.is_empty() || st.scan_scheduled {
            return;
        }
        st.scan_scheduled = true;
        drop(st);

        let manager = Arc::clone(self);
        if self
            .scheduler
            .submit_once(self.key, move || manager.scan())
            .is_err()
        {
            // Shutdown race: the scan will never run; clear the latch so a
            // later poke (in tests that restart) is not wedged.
            self.state.lock().expect("lifetime lock poisoned").scan_scheduled = false;
        }
    }

    fn scan(self: &Arc<Self>) {
        let mut work = {
            let mut st = self.state.lock().expect("lifetime lock poisoned");
            st.scan_scheduled = false;
            std::mem::take(&mut st.pending)
        };

        let mut survivors = Vec::new();
        for actor in work.drain(..) {
            if actor.may_delete() {
                actor.shutdown();
                actor.destroy();
                self.destroyed.fetch_add(1, Ordering::Relaxed);
            } else {
                survivors.push(actor);
            }
        }

        let arm_retry = {
            let mut st = self.state.lock().expect("lifetime lock poisoned");
            // New deletes may have arrived mid-scan; keep them after the
            // survivors so retry order stays roughly FIFO.
            let newcomers = std::mem::take(&mut st.pending);
            st.pending = survivors;
            st.pending.extend(newcomers);
            let arm = !st.pending.is_empty() && !st.retry_armed;
            if arm {
                st.retry_armed = true;
            }
            arm
        };

        if arm_retry {
            debug!("lifetime: actors still pending, arming retry");
            let manager = Arc::clone(self);
            self.timers.start(RETRY_INTERVAL, self.key, move || {
                manager
                    .state
                    .lock()
                    .expect("lifetime lock poisoned")
                    .retry_armed = false;
                manager.poke();
            });
        }
    }

    /// Actors retired so far.
    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    /// Pending actor count, for the diagnostic dump.
    pub fn pending(&self) -> usize {
        self.state.lock().expect("lifetime lock poisoned").pending.len()
    }
}
