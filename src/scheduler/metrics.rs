//! Scheduler metrics: per-worker counters plus admission-layer counters.
//!
//! Worker counters live in plain (non-atomic) per-worker structs so the hot
//! path never contends a cache line; they are merged into a
//! [`SchedulerMetrics`] snapshot when the pool shuts down. Admission
//! counters are atomics on the scheduler because multiple producers bump
//! them.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-worker counters. One instance per worker thread, no sharing.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkerCounters {
    /// Task bodies executed on this worker.
    pub tasks_executed: u64,
    /// Steal attempts (injector batch steals and victim steals).
    pub steal_attempts: u64,
    /// Steal attempts that yielded a task.
    pub steal_successes: u64,
}

impl WorkerCounters {
    pub fn merge(&mut self, other: &WorkerCounters) {
        self.tasks_executed = self.tasks_executed.saturating_add(other.tasks_executed);
        self.steal_attempts = self.steal_attempts.saturating_add(other.steal_attempts);
        self.steal_successes = self.steal_successes.saturating_add(other.steal_successes);
    }
}

/// Admission-layer counters, shared across producers.
#[derive(Debug, Default)]
pub struct AdmissionCounters {
    /// Tasks handed to the worker pool.
    pub dispatched: AtomicU64,
    /// Dispatch attempts deferred because an excluded class was running.
    pub deferred_exclusion: AtomicU64,
    /// Dispatch attempts deferred behind a running task of the same
    /// `(class, instance)`.
    pub deferred_instance: AtomicU64,
    /// Dispatch attempts deferred because the class was paused.
    pub deferred_paused: AtomicU64,
    /// Task bodies that panicked (caught, logged, treated as done).
    pub task_panics: AtomicU64,
}

impl AdmissionCounters {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Merged snapshot returned by `Scheduler::shutdown`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchedulerMetrics {
    pub tasks_executed: u64,
    pub steal_attempts: u64,
    pub steal_successes: u64,
    pub dispatched: u64,
    pub deferred_exclusion: u64,
    pub deferred_instance: u64,
    pub deferred_paused: u64,
    pub task_panics: u64,
}

impl SchedulerMetrics {
    pub fn from_parts(workers: &WorkerCounters, admission: &AdmissionCounters) -> Self {
        Self {
            tasks_executed: workers.tasks_executed,
            steal_attempts: workers.steal_attempts,
            steal_successes: workers.steal_successes,
            dispatched: admission.dispatched.load(Ordering::Relaxed),
            deferred_exclusion: admission.deferred_exclusion.load(Ordering::Relaxed),
            deferred_instance: admission.deferred_instance.load(Ordering::Relaxed),
            deferred_paused: admission.deferred_paused.load(Ordering::Relaxed),
            task_panics: admission.task_panics.load(Ordering::Relaxed),
        }
    }
}
