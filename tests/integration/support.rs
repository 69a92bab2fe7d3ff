//! Shared fixtures: a wired scheduler/database stack and a string-keyed
//! table for lifecycle tests.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vrouter_agent::db::{
    Database, DbContext, DbEntry, EntryCore, LifetimeManager, Table, TableHooks,
};
use vrouter_agent::scheduler::{class, Scheduler, SchedulerConfig, TimerManager};

pub struct Stack {
    pub scheduler: Arc<Scheduler>,
    pub timers: Arc<TimerManager>,
    pub db: Arc<Database>,
}

impl Stack {
    pub fn new(workers: usize) -> Self {
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
        Self {
            scheduler,
            timers,
            db,
        }
    }

    pub fn teardown(&self) {
        self.timers.shutdown();
        self.scheduler.shutdown();
    }
}

pub fn wait_for(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !cond() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(cond(), "condition not reached in time");
}

pub struct NamedEntry {
    name: String,
    value: Mutex<u64>,
    core: EntryCore,
}

impl NamedEntry {
    pub fn value(&self) -> u64 {
        *self.value.lock().unwrap()
    }
}

impl DbEntry for NamedEntry {
    type Key = String;

    fn key(&self) -> &String {
        &self.name
    }

    fn core(&self) -> &EntryCore {
        &self.core
    }
}

#[derive(Default)]
pub struct NamedHooks;

impl TableHooks for NamedHooks {
    type Key = String;
    type Data = u64;
    type Entry = NamedEntry;

    fn alloc(&self, key: &String) -> NamedEntry {
        NamedEntry {
            name: key.clone(),
            value: Mutex::new(0),
            core: EntryCore::new(),
        }
    }

    fn add(&self, _table: &Table<Self>, entry: &Arc<NamedEntry>, data: Option<u64>) {
        if let Some(v) = data {
            *entry.value.lock().unwrap() = v;
        }
    }

    fn on_change(&self, _table: &Table<Self>, entry: &Arc<NamedEntry>, data: Option<u64>) -> bool {
        if let Some(v) = data {
            *entry.value.lock().unwrap() = v;
        }
        true
    }

    fn delete(&self, _table: &Table<Self>, _entry: &Arc<NamedEntry>) {}
}
