//! Wall-clock timers that fire as scheduler tasks.
//!
//! One dedicated thread owns a deadline heap; when a deadline passes, the
//! timer's body is submitted under its `(class, instance)` like any other
//! task, so timer work obeys the same serialization and exclusion rules.
//!
//! The population is small (entry delete timers plus the flow aging timer),
//! so a binary heap beats a wheel here. Cancellation is lazy: `cancel`
//! removes the body; the heap entry is skipped when it surfaces.
//!
//! Periodic timers are built by re-arming from the fired body, which is how
//! the flow stats collector retunes its interval after every pass.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use log::debug;

use super::executor::{Scheduler, TaskBody, TaskKey, TaskOutcome};

/// Handle for cancelling a pending timer. Ids are never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(PartialEq, Eq)]
struct HeapEntry {
    deadline: Instant,
    id: u64,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct PendingTimer {
    key: TaskKey,
    body: TaskBody,
}

struct TimerState {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    pending: AHashMap<u64, PendingTimer>,
    next_id: u64,
    shutdown: bool,
}

struct TimerInner {
    state: Mutex<TimerState>,
    cv: Condvar,
}

/// Process-wide timer service. Construct once at bootstrap.
pub struct TimerManager {
    inner: Arc<TimerInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerManager {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                pending: AHashMap::new(),
                next_id: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
        });
        let thread_inner = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name("agent-timer".to_string())
            .spawn(move || timer_loop(thread_inner, scheduler))
            .expect("failed to spawn timer thread");
        Self {
            inner,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Arms a one-shot timer. After `delay`, `body` is submitted under
    /// `key`. Re-arm from the body for periodic behavior.
    pub fn start(
        &self,
        delay: Duration,
        key: TaskKey,
        body: impl FnOnce() + Send + 'static,
    ) -> TimerId {
        let mut body = Some(body);
        let body: TaskBody = Box::new(move || {
            if let Some(f) = body.take() {
                f();
            }
            TaskOutcome::Done
        });

        let mut st = self.inner.state.lock().expect("timer lock poisoned");
        let id = st.next_id;
        st.next_id += 1;
        st.pending.insert(id, PendingTimer { key, body });
        st.heap.push(Reverse(HeapEntry {
            deadline: Instant::now() + delay,
            id,
        }));
        self.inner.cv.notify_one();
        TimerId(id)
    }

    /// Cancels a pending timer. Returns false if it already fired (or was
    /// already cancelled).
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut st = self.inner.state.lock().expect("timer lock poisoned");
        st.pending.remove(&id.0).is_some()
    }

    /// Number of armed timers, for the diagnostic dump.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().expect("timer lock poisoned").pending.len()
    }

    /// Stops the timer thread. Pending timers never fire.
    pub fn shutdown(&self) {
        {
            let mut st = self.inner.state.lock().expect("timer lock poisoned");
            st.shutdown = true;
            st.pending.clear();
        }
        self.inner.cv.notify_all();
        if let Some(th) = self.thread.lock().expect("timer thread lock").take() {
            let _ = th.join();
        }
    }
}

fn timer_loop(inner: Arc<TimerInner>, scheduler: Arc<Scheduler>) {
    let mut st = inner.state.lock().expect("timer lock poisoned");
    loop {
        if st.shutdown {
            return;
        }
        let now = Instant::now();
        let next_deadline = st.heap.peek().map(|Reverse(entry)| entry.deadline);
        match next_deadline {
            None => {
                st = inner.cv.wait(st).expect("timer lock poisoned");
            }
            Some(deadline) if deadline > now => {
                let (guard, _timeout) = inner
                    .cv
                    .wait_timeout(st, deadline - now)
                    .expect("timer lock poisoned");
                st = guard;
            }
            Some(_) => {
                let Reverse(entry) = st.heap.pop().expect("peeked entry");
                // Cancelled timers leave a stale heap entry behind.
                if let Some(pending) = st.pending.remove(&entry.id) {
                    drop(st);
                    if scheduler.submit_boxed(pending.key, pending.body).is_err() {
                        debug!("timer fired during scheduler shutdown; dropped");
                    }
                    st = inner.state.lock().expect("timer lock poisoned");
                }
            }
        }
    }
}
