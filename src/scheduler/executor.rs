//! Exclusion-aware task scheduler on a work-stealing worker pool.
//!
//! # Architecture
//!
//! ```text
//!  Producers ──► Scheduler::submit ──► Admission (Mutex<AdmitState>)
//!                                          │ runnable?
//!                    ┌─────────────────────┴──────────────────────┐
//!                    │ yes: RunnableTask                          │ no: queued per
//!                    ▼                                            │ (class, instance),
//!            Injector / worker deques                             │ instance parked on
//!                    │                                            │ the blocked list
//!                    ▼                                            │
//!            Worker threads: run body ──► complete() ─────────────┘
//!                                          releases class slot,
//!                                          dispatches unblocked work
//! ```
//!
//! The pool itself (per-worker Chase-Lev deque, global injector, randomized
//! stealing, tiered spin/yield/park idle) executes whatever the admission
//! layer hands it. The admission layer is where the scheduling contract
//! lives:
//!
//! 1. at most one running task per `(class, instance_key)`,
//! 2. no two running tasks of classes that exclude each other
//!    (symmetric closure, see [`ClassRegistry`]),
//! 3. FIFO submission order within a `(class, instance_key)`.
//!
//! # Failure semantics
//!
//! A panicking task body is caught, logged, and counted; its class slot and
//! instance latch are released so later tasks of the same instance still
//! run. The pool never dies on a task panic.
//!
//! # Blocking
//!
//! Task bodies must complete a bounded unit of work and return; there is no
//! mid-task yield. `TaskOutcome::Reschedule` re-queues the body at the head
//! of its instance queue, which is how long-lived loops (shard drains, the
//! flow aging pass) give the scheduler a suspension point. Never call
//! [`Scheduler::wait_idle`] from inside a task body.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ahash::AHashMap;
use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use crossbeam_utils::sync::{Parker, Unparker};
use log::{error, warn};

use super::metrics::{AdmissionCounters, SchedulerMetrics, WorkerCounters};
use super::registry::{ClassId, ClassRegistry, PolicyError};
use super::rng::XorShift64;

/// Discriminates parallel instances of one task class.
///
/// Tables use [`shard_instance`] to pack `(table_id, shard)`; singleton
/// activities use a constant.
pub type InstanceKey = u64;

/// Packs a table id and shard index into one instance key.
#[inline]
pub fn shard_instance(table_id: u32, shard: u32) -> InstanceKey {
    ((table_id as u64) << 32) | shard as u64
}

/// Identity of a serialization domain: one class, one instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub class: ClassId,
    pub instance: InstanceKey,
}

impl TaskKey {
    pub fn new(class: ClassId, instance: InstanceKey) -> Self {
        Self { class, instance }
    }
}

/// What a task body asks for after a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task is finished; drop the body.
    Done,
    /// Re-queue this body at the head of its instance queue. Used by drain
    /// loops that processed a bounded batch and have more work.
    Reschedule,
}

/// A task body. `FnMut` because rescheduled bodies run again.
pub type TaskBody = Box<dyn FnMut() -> TaskOutcome + Send + 'static>;

struct RunnableTask {
    key: TaskKey,
    body: TaskBody,
}

/// Errors from task submission.
#[derive(Debug)]
#[non_exhaustive]
pub enum SubmitError {
    /// The scheduler is shutting down and accepts no new work.
    ShuttingDown,
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShuttingDown => write!(f, "scheduler is shutting down"),
        }
    }
}

impl std::error::Error for SubmitError {}

// ============================================================================
// Configuration
// ============================================================================

/// Pool configuration. Defaults suit a control agent: enough workers to
/// cover the host, long park timeout because the agent is mostly idle.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// Worker thread count.
    pub workers: usize,
    /// Seed for randomized steal victim selection.
    pub seed: u64,
    /// Steal attempts per idle cycle before backing off.
    pub steal_tries: u32,
    /// Spin iterations before parking.
    pub spin_iters: u32,
    /// Park timeout; a safety net, normal wakeups are explicit unparks.
    pub park_timeout: Duration,
}

impl SchedulerConfig {
    /// Panics on invalid values.
    pub fn validate(&self) {
        assert!(self.workers > 0, "workers must be > 0");
        assert!(self.steal_tries > 0, "steal_tries must be > 0");
        assert!(self.park_timeout > Duration::ZERO, "park_timeout must be > 0");
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            seed: 0x853c_49e6_748f_ea9b,
            steal_tries: 4,
            spin_iters: 64,
            park_timeout: Duration::from_millis(50),
        }
    }
}

// ============================================================================
// Admission state
// ============================================================================

#[derive(Default)]
struct InstanceState {
    queue: VecDeque<TaskBody>,
    running: bool,
    /// On the blocked list (has work, could not dispatch). Prevents both
    /// duplicate blocked entries and removal of a still-referenced state.
    blocked: bool,
}

struct AdmitState {
    registry: ClassRegistry,
    /// Running task count per class, indexed by `ClassId`.
    class_running: Vec<u32>,
    class_paused: Vec<bool>,
    instances: AHashMap<TaskKey, InstanceState>,
    /// Instances with pending work that could not be dispatched.
    blocked: Vec<TaskKey>,
    /// Queued bodies + running bodies. Zero means idle.
    pending: usize,
    accepting: bool,
}

impl AdmitState {
    fn ensure_class_slots(&mut self) {
        let n = self.registry.len();
        if self.class_running.len() < n {
            self.class_running.resize(n, 0);
            self.class_paused.resize(n, false);
        }
    }
}

struct Shared {
    injector: Injector<RunnableTask>,
    stealers: Vec<Stealer<RunnableTask>>,
    unparkers: Vec<Unparker>,
    next_unpark: AtomicUsize,
    /// Worker stop flag; set once at shutdown.
    done: AtomicBool,
    admit: Mutex<AdmitState>,
    idle_cv: Condvar,
    counters: AdmissionCounters,
}

impl Shared {
    fn unpark_one(&self) {
        let n = self.unparkers.len();
        if n == 0 {
            return;
        }
        let idx = self.next_unpark.fetch_add(1, Ordering::Relaxed) % n;
        self.unparkers[idx].unpark();
    }

    fn unpark_all(&self) {
        for u in &self.unparkers {
            u.unpark();
        }
    }

    /// Dispatches every task for `key` that the contract allows right now
    /// (at most one: the instance head). Appends dispatched tasks to `out`;
    /// the caller routes them to a queue.
    fn try_dispatch(&self, st: &mut AdmitState, key: TaskKey, out: &mut Vec<RunnableTask>) {
        let Some(inst) = st.instances.get_mut(&key) else {
            return;
        };
        if inst.running || inst.queue.is_empty() {
            return;
        }
        if st.class_paused[key.class.index()] {
            AdmissionCounters::bump(&self.counters.deferred_paused);
            Self::mark_blocked(&mut st.blocked, key, inst);
            return;
        }
        if st
            .registry
            .excludes(key.class)
            .iter()
            .any(|&other| st.class_running[other.index()] > 0)
        {
            AdmissionCounters::bump(&self.counters.deferred_exclusion);
            Self::mark_blocked(&mut st.blocked, key, inst);
            return;
        }

        inst.running = true;
        inst.blocked = false;
        let body = inst.queue.pop_front().expect("non-empty queue");
        st.class_running[key.class.index()] += 1;
        AdmissionCounters::bump(&self.counters.dispatched);
        out.push(RunnableTask { key, body });
    }

    fn mark_blocked(blocked: &mut Vec<TaskKey>, key: TaskKey, inst: &mut InstanceState) {
        if !inst.blocked {
            inst.blocked = true;
            blocked.push(key);
        }
    }

    /// Re-examines every blocked instance. Called after any event that can
    /// unblock work (completion, resume).
    fn sweep_blocked(&self, st: &mut AdmitState, out: &mut Vec<RunnableTask>) {
        let blocked = std::mem::take(&mut st.blocked);
        for key in blocked {
            if let Some(inst) = st.instances.get_mut(&key) {
                inst.blocked = false;
            }
            self.try_dispatch(st, key, out);
        }
    }

    /// Post-run accounting. Returns tasks that became runnable.
    fn complete(&self, key: TaskKey, outcome: TaskOutcome, body: TaskBody) -> Vec<RunnableTask> {
        let mut out = Vec::new();
        let mut guard = self.admit.lock().expect("admission lock poisoned");
        let st = &mut *guard;
        st.class_running[key.class.index()] -= 1;
        {
            let inst = st
                .instances
                .get_mut(&key)
                .expect("completed task has instance state");
            inst.running = false;
            if let TaskOutcome::Reschedule = outcome {
                inst.queue.push_front(body);
            }
        }
        if let TaskOutcome::Done = outcome {
            st.pending -= 1;
        }

        self.try_dispatch(st, key, &mut out);
        let drop_instance = st
            .instances
            .get(&key)
            .map_or(false, |inst| inst.queue.is_empty() && !inst.running && !inst.blocked);
        if drop_instance {
            st.instances.remove(&key);
        }
        self.sweep_blocked(st, &mut out);

        if st.pending == 0 {
            self.idle_cv.notify_all();
        }
        out
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// The process-wide task scheduler. Created once at bootstrap and shared by
/// reference; it is the concurrency arbiter for everything the agent does.
pub struct Scheduler {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<WorkerCounters>>>,
}

impl Scheduler {
    pub fn new(cfg: SchedulerConfig) -> Self {
        cfg.validate();

        let mut locals = Vec::with_capacity(cfg.workers);
        let mut stealers = Vec::with_capacity(cfg.workers);
        for _ in 0..cfg.workers {
            let w = Worker::new_lifo();
            stealers.push(w.stealer());
            locals.push(w);
        }

        let mut parkers = Vec::with_capacity(cfg.workers);
        let mut unparkers = Vec::with_capacity(cfg.workers);
        for _ in 0..cfg.workers {
            let p = Parker::new();
            unparkers.push(p.unparker().clone());
            parkers.push(p);
        }

        let shared = Arc::new(Shared {
            injector: Injector::new(),
            stealers,
            unparkers,
            next_unpark: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            admit: Mutex::new(AdmitState {
                registry: ClassRegistry::new(),
                class_running: Vec::new(),
                class_paused: Vec::new(),
                instances: AHashMap::new(),
                blocked: Vec::new(),
                pending: 0,
                accepting: true,
            }),
            idle_cv: Condvar::new(),
            counters: AdmissionCounters::default(),
        });

        let mut threads = Vec::with_capacity(cfg.workers);
        for worker_id in (0..cfg.workers).rev() {
            let shared = Arc::clone(&shared);
            let local = locals.pop().expect("locals length mismatch");
            let parker = parkers.pop().expect("parkers length mismatch");
            let seed = cfg.seed ^ (worker_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
            let th = thread::Builder::new()
                .name(format!("agent-worker-{worker_id}"))
                .spawn(move || worker_loop(cfg, shared, local, parker, XorShift64::new(seed)))
                .expect("failed to spawn worker thread");
            threads.push(th);
        }
        threads.reverse();

        Self {
            shared,
            threads: Mutex::new(threads),
        }
    }

    /// Interns a task class name.
    pub fn class_id(&self, name: &str) -> ClassId {
        let mut st = self.shared.admit.lock().expect("admission lock poisoned");
        let id = st.registry.class_id(name);
        st.ensure_class_slots();
        id
    }

    pub fn class_name(&self, class: ClassId) -> String {
        let st = self.shared.admit.lock().expect("admission lock poisoned");
        st.registry.name(class).to_string()
    }

    /// Installs the declared exclusion set for `class`.
    ///
    /// # Errors
    ///
    /// Fails if the class already has live work (sealed) or lists itself.
    /// Callers installing the boot-time agent policy treat this as fatal.
    pub fn set_policy(&self, class: ClassId, excludes: &[ClassId]) -> Result<(), PolicyError> {
        let mut st = self.shared.admit.lock().expect("admission lock poisoned");
        st.registry.set_policy(class, excludes)
    }

    /// Submits a task body under `(class, instance)`.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::ShuttingDown`] once shutdown has begun.
    pub fn submit(
        &self,
        key: TaskKey,
        body: impl FnMut() -> TaskOutcome + Send + 'static,
    ) -> Result<(), SubmitError> {
        self.submit_boxed(key, Box::new(body))
    }

    /// Submits a one-shot closure.
    pub fn submit_once(
        &self,
        key: TaskKey,
        body: impl FnOnce() + Send + 'static,
    ) -> Result<(), SubmitError> {
        let mut body = Some(body);
        self.submit_boxed(
            key,
            Box::new(move || {
                if let Some(f) = body.take() {
                    f();
                }
                TaskOutcome::Done
            }),
        )
    }

    pub(crate) fn submit_boxed(&self, key: TaskKey, body: TaskBody) -> Result<(), SubmitError> {
        let mut out = Vec::new();
        {
            let mut st = self.shared.admit.lock().expect("admission lock poisoned");
            if !st.accepting {
                return Err(SubmitError::ShuttingDown);
            }
            st.ensure_class_slots();
            st.registry.seal(key.class);
            st.pending += 1;
            let inst = st.instances.entry(key).or_default();
            if inst.running {
                AdmissionCounters::bump(&self.shared.counters.deferred_instance);
            }
            inst.queue.push_back(body);
            self.shared.try_dispatch(&mut st, key, &mut out);
        }
        for task in out {
            self.shared.injector.push(task);
            self.shared.unpark_one();
        }
        Ok(())
    }

    /// Stops dispatching tasks of `class`; running tasks finish normally.
    /// Used for OVERLOAD backpressure: queues grow, nothing is dropped.
    pub fn pause_class(&self, class: ClassId) {
        let mut st = self.shared.admit.lock().expect("admission lock poisoned");
        st.ensure_class_slots();
        st.class_paused[class.index()] = true;
    }

    /// Resumes a paused class and dispatches anything that was held back.
    pub fn resume_class(&self, class: ClassId) {
        let mut out = Vec::new();
        {
            let mut st = self.shared.admit.lock().expect("admission lock poisoned");
            st.ensure_class_slots();
            st.class_paused[class.index()] = false;
            self.shared.sweep_blocked(&mut st, &mut out);
        }
        for task in out {
            self.shared.injector.push(task);
            self.shared.unpark_one();
        }
    }

    /// Blocks until no task is queued or running.
    ///
    /// Must not be called from a task body (the caller's own task would
    /// keep `pending` nonzero forever).
    pub fn wait_idle(&self) {
        let mut st = self.shared.admit.lock().expect("admission lock poisoned");
        while st.pending > 0 {
            st = self
                .shared
                .idle_cv
                .wait(st)
                .expect("admission lock poisoned");
        }
    }

    /// Queued-plus-running task count.
    pub fn pending(&self) -> usize {
        self.shared.admit.lock().expect("admission lock poisoned").pending
    }

    /// One diagnostic line per class with running or blocked work, for the
    /// fatal-error dump.
    pub fn diagnostics(&self) -> Vec<String> {
        let st = self.shared.admit.lock().expect("admission lock poisoned");
        let mut lines = Vec::new();
        lines.push(format!("pending tasks: {}", st.pending));
        for (i, &running) in st.class_running.iter().enumerate() {
            if running > 0 {
                lines.push(format!(
                    "class {:?}: {} running",
                    st.registry.name(ClassId(i as u32)),
                    running
                ));
            }
        }
        for key in &st.blocked {
            lines.push(format!(
                "blocked: class {:?} instance {:#x}",
                st.registry.name(key.class),
                key.instance
            ));
        }
        lines
    }

    /// Drains all work, stops the workers, and returns merged metrics.
    pub fn shutdown(&self) -> SchedulerMetrics {
        {
            let mut st = self.shared.admit.lock().expect("admission lock poisoned");
            st.accepting = false;
        }
        self.wait_idle();
        self.shared.done.store(true, Ordering::Release);
        self.shared.unpark_all();

        let mut merged = WorkerCounters::default();
        let mut threads = self.threads.lock().expect("thread list lock poisoned");
        while let Some(th) = threads.pop() {
            match th.join() {
                Ok(counters) => merged.merge(&counters),
                Err(_) => warn!("scheduler worker thread panicked outside a task"),
            }
        }
        SchedulerMetrics::from_parts(&merged, &self.shared.counters)
    }
}

// ============================================================================
// Worker loop
// ============================================================================

fn worker_loop(
    cfg: SchedulerConfig,
    shared: Arc<Shared>,
    local: Worker<RunnableTask>,
    parker: Parker,
    mut rng: XorShift64,
) -> WorkerCounters {
    let mut counters = WorkerCounters::default();
    let mut idle_rounds: u32 = 0;

    loop {
        if shared.done.load(Ordering::Acquire) {
            break;
        }

        let task = local.pop().or_else(|| {
            counters.steal_attempts += 1;
            match shared.injector.steal_batch_and_pop(&local) {
                Steal::Success(t) => {
                    counters.steal_successes += 1;
                    Some(t)
                }
                Steal::Retry | Steal::Empty => steal_from_victims(
                    &shared,
                    &mut rng,
                    cfg.steal_tries,
                    &mut counters,
                ),
            }
        });

        match task {
            Some(mut task) => {
                idle_rounds = 0;
                counters.tasks_executed += 1;
                let outcome = match panic::catch_unwind(AssertUnwindSafe(|| (task.body)())) {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        AdmissionCounters::bump(&shared.counters.task_panics);
                        error!(
                            "task panicked (class id {}, instance {:#x}); continuing",
                            task.key.class.0, task.key.instance
                        );
                        TaskOutcome::Done
                    }
                };
                let unblocked = shared.complete(task.key, outcome, task.body);
                // First unblocked task stays local (cache-warm for shard
                // drains); the rest go global so siblings can help.
                let mut iter = unblocked.into_iter();
                if let Some(first) = iter.next() {
                    local.push(first);
                }
                for extra in iter {
                    shared.injector.push(extra);
                    shared.unpark_one();
                }
            }
            None => {
                idle_rounds = idle_rounds.saturating_add(1);
                if idle_rounds <= cfg.spin_iters {
                    std::hint::spin_loop();
                } else {
                    if (idle_rounds & 0xF) == 0 {
                        thread::yield_now();
                    }
                    parker.park_timeout(cfg.park_timeout);
                }
            }
        }
    }

    counters
}

fn steal_from_victims(
    shared: &Shared,
    rng: &mut XorShift64,
    tries: u32,
    counters: &mut WorkerCounters,
) -> Option<RunnableTask> {
    let n = shared.stealers.len();
    if n == 0 {
        return None;
    }
    for _ in 0..tries {
        counters.steal_attempts += 1;
        let victim = rng.next_usize(n);
        if let Steal::Success(t) = shared.stealers[victim].steal() {
            counters.steal_successes += 1;
            return Some(t);
        }
    }
    None
}

// ============================================================================
// Tests
// ============================================================================
