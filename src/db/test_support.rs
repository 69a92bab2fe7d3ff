//! Shared fixtures for table-engine unit tests: a string-keyed table with
//! counting hooks and a ready-wired scheduler/timer/lifetime stack.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHashMap;

use crate::scheduler::{class, Scheduler, SchedulerConfig, TimerManager};

use super::entry::{DbEntry, EntryCore};
use super::lifetime::LifetimeManager;
use super::table::{Database, DbContext, Table, TableHooks};

pub struct TestEntry {
    key: String,
    payload: Mutex<i64>,
    core: EntryCore,
}

impl TestEntry {
    pub fn payload(&self) -> i64 {
        *self.payload.lock().unwrap()
    }
}

impl DbEntry for TestEntry {
    type Key = String;

    fn key(&self) -> &String {
        &self.key
    }

    fn core(&self) -> &EntryCore {
        &self.core
    }
}

#[derive(Default)]
pub struct TestHooks {
    pub adds: AtomicUsize,
    pub changes: AtomicUsize,
    pub deletes: AtomicUsize,
    pub retired: AtomicUsize,
    pub reject_changes: AtomicBool,
    /// One-shot pending re-creations, consumed by the reuse protocol.
    pub resync_data: Mutex<AHashMap<String, i64>>,
}

impl TableHooks for TestHooks {
    type Key = String;
    type Data = i64;
    type Entry = TestEntry;

    fn alloc(&self, key: &String) -> TestEntry {
        TestEntry {
            key: key.clone(),
            payload: Mutex::new(0),
            core: EntryCore::new(),
        }
    }

    fn add(&self, _table: &Table<Self>, entry: &Arc<TestEntry>, data: Option<i64>) {
        self.adds.fetch_add(1, Ordering::SeqCst);
        if let Some(v) = data {
            *entry.payload.lock().unwrap() = v;
        }
    }

    fn on_change(&self, _table: &Table<Self>, entry: &Arc<TestEntry>, data: Option<i64>) -> bool {
        if self.reject_changes.load(Ordering::SeqCst) {
            return false;
        }
        self.changes.fetch_add(1, Ordering::SeqCst);
        if let Some(v) = data {
            *entry.payload.lock().unwrap() = v;
        }
        true
    }

    fn delete(&self, _table: &Table<Self>, _entry: &Arc<TestEntry>) {
        self.deletes.fetch_add(1, Ordering::SeqCst);
    }

    fn retired(&self, _table: &Table<Self>, _entry: &Arc<TestEntry>) {
        self.retired.fetch_add(1, Ordering::SeqCst);
    }

    fn resync(&self, key: &String) -> Option<i64> {
        self.resync_data.lock().unwrap().remove(key)
    }
}

/// Scheduler + timers + database wired the way the agent wires them.
pub fn test_db(workers: usize) -> (Arc<Scheduler>, Arc<TimerManager>, Arc<Database>) {
    let scheduler = Arc::new(Scheduler::new(SchedulerConfig {
        workers,
        ..Default::default()
    }));
    let timers = Arc::new(TimerManager::new(Arc::clone(&scheduler)));
    let db_class = scheduler.class_id(class::DB_TABLE);
    let lifetime = LifetimeManager::new(Arc::clone(&scheduler), Arc::clone(&timers), db_class);
    let db = Database::new(DbContext {
        scheduler: Arc::clone(&scheduler),
        timers: Arc::clone(&timers),
        lifetime,
        db_class,
        partition_count: 4,
        delete_timeout: Duration::from_secs(30),
        producer_class: None,
    });
    (scheduler, timers, db)
}
