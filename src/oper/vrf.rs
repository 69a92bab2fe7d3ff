//! VRF table: named routing instances.
//!
//! A VRF owns a unicast route table created at ADD and torn down at
//! retirement. Deletion is lifetime-managed: the VRF stays findable
//! (marked deleted) until its references drop, its listener states
//! detach, and its route table drains; only then does the delete actor
//! shut it down and destroy it. Retirement frees the VRF id for reuse
//! and consults the configuration source for a pending re-creation.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, info};

use crate::db::{
    Database, DbEntry, EntryCore, LifetimeActor, LifetimeManager, Table, TableHooks,
};

use super::route::{RouteHooks, RouteTable};

pub const INVALID_VRF_ID: u32 = u32::MAX;

/// Monotonic id allocator with lowest-first reuse of freed ids.
pub struct IndexAllocator {
    next: u32,
    free_list: BinaryHeap<Reverse<u32>>,
}

impl IndexAllocator {
    pub fn new() -> Self {
        Self {
            next: 0,
            free_list: BinaryHeap::new(),
        }
    }

    pub fn alloc(&mut self) -> u32 {
        if let Some(Reverse(id)) = self.free_list.pop() {
            return id;
        }
        let id = self.next;
        self.next += 1;
        id
    }

    pub fn free(&mut self, id: u32) {
        self.free_list.push(Reverse(id));
    }
}

impl Default for IndexAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// VRF payload. Creation intent carries no attributes yet; the key is the
/// instance name.
#[derive(Clone, Copy, Debug, Default)]
pub struct VrfData;

/// Consulted at retirement for a pending re-creation of the same VRF
/// (the reuse protocol).
pub trait VrfConfigSource: Send + Sync {
    fn pending_recreate(&self, name: &str) -> Option<VrfData>;
}

pub struct VrfEntry {
    name: String,
    id: AtomicU32,
    core: EntryCore,
    actor: Mutex<Option<Arc<VrfDeleteActor>>>,
    route_table: Mutex<Option<RouteTable>>,
}

impl VrfEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vrf_id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    pub fn route_table(&self) -> Option<RouteTable> {
        self.route_table
            .lock()
            .expect("route table slot poisoned")
            .clone()
    }
}

impl DbEntry for VrfEntry {
    type Key = String;

    fn key(&self) -> &String {
        &self.name
    }

    fn core(&self) -> &EntryCore {
        &self.core
    }

    fn delete_actor(&self) -> Option<Arc<dyn LifetimeActor>> {
        self.actor
            .lock()
            .expect("actor slot poisoned")
            .clone()
            .map(|a| a as Arc<dyn LifetimeActor>)
    }
}

/// Lifetime hook for a VRF. Holds the entry weakly: the map and the
/// manager keep the entry alive for exactly as long as retirement needs.
pub struct VrfDeleteActor {
    table: Table<VrfHooks>,
    entry: Weak<VrfEntry>,
}

impl LifetimeActor for VrfDeleteActor {
    fn may_delete(&self) -> bool {
        let Some(entry) = self.entry.upgrade() else {
            return true;
        };
        let core = entry.core();
        if !core.is_deleted() || core.refcount() != 0 || !core.states_empty() {
            return false;
        }
        // Route entries still draining pin the VRF.
        entry
            .route_table()
            .map(|rt| rt.size() == 0)
            .unwrap_or(true)
    }

    fn shutdown(&self) {
        // Release outbound references so retirement breaks the
        // VRF ↔ route-table cycle.
        if let Some(entry) = self.entry.upgrade() {
            entry
                .route_table
                .lock()
                .expect("route table slot poisoned")
                .take();
        }
    }

    fn destroy(&self) {
        if let Some(entry) = self.entry.upgrade() {
            self.table.finalize_remove(&entry);
        }
    }
}

pub struct VrfHooks {
    db: Arc<Database>,
    lifetime: Arc<LifetimeManager>,
    index: Mutex<IndexAllocator>,
    config_source: Mutex<Option<Arc<dyn VrfConfigSource>>>,
}

impl VrfHooks {
    pub fn new(db: Arc<Database>, lifetime: Arc<LifetimeManager>) -> Self {
        Self {
            db,
            lifetime,
            index: Mutex::new(IndexAllocator::new()),
            config_source: Mutex::new(None),
        }
    }

    pub fn set_config_source(&self, source: Arc<dyn VrfConfigSource>) {
        *self
            .config_source
            .lock()
            .expect("config source slot poisoned") = Some(source);
    }
}

impl TableHooks for VrfHooks {
    type Key = String;
    type Data = VrfData;
    type Entry = VrfEntry;

    fn alloc(&self, key: &String) -> VrfEntry {
        VrfEntry {
            name: key.clone(),
            id: AtomicU32::new(INVALID_VRF_ID),
            core: EntryCore::new(),
            actor: Mutex::new(None),
            route_table: Mutex::new(None),
        }
    }

    fn add(&self, table: &Table<Self>, entry: &Arc<VrfEntry>, _data: Option<VrfData>) {
        // A second live allocation for one name means the engine's
        // duplicate handling broke; this is unrecoverable.
        assert_eq!(
            entry.vrf_id(),
            INVALID_VRF_ID,
            "duplicate ADD for VRF {:?}",
            entry.name
        );
        let id = self.index.lock().expect("index lock poisoned").alloc();
        entry.id.store(id, Ordering::Release);

        let rt = self
            .db
            .create_table(&format!("{}.uc.route.0", entry.name), RouteHooks);
        *entry
            .route_table
            .lock()
            .expect("route table slot poisoned") = Some(rt);
        *entry.actor.lock().expect("actor slot poisoned") = Some(Arc::new(VrfDeleteActor {
            table: table.clone(),
            entry: Arc::downgrade(entry),
        }));
        info!("vrf {}: added, id {}", entry.name, id);
    }

    // VRFs carry no mutable attributes; a repeat ADD is dropped.
    fn on_change(&self, _table: &Table<Self>, entry: &Arc<VrfEntry>, _data: Option<VrfData>) -> bool {
        debug!("vrf {}: change ignored", entry.name);
        false
    }

    fn delete(&self, _table: &Table<Self>, entry: &Arc<VrfEntry>) {
        info!("vrf {}: delete triggered", entry.name);
        if let Some(actor) = entry.delete_actor() {
            self.lifetime.delete(actor);
        }
    }

    fn retired(&self, _table: &Table<Self>, entry: &Arc<VrfEntry>) {
        let id = entry.vrf_id();
        if id != INVALID_VRF_ID {
            self.index.lock().expect("index lock poisoned").free(id);
        }
        info!("vrf {}: deleted, freed id {}", entry.name, id);
    }

    fn resync(&self, key: &String) -> Option<VrfData> {
        self.config_source
            .lock()
            .expect("config source slot poisoned")
            .as_ref()
            .and_then(|src| src.pending_recreate(key))
    }
}

pub type VrfTable = Table<VrfHooks>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_db;
    use crate::db::DbRequest;
    use crate::oper::route::{RouteData, RouteKey};
    use std::net::Ipv4Addr;
    use std::time::{Duration, Instant};

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !cond() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(cond(), "condition not reached in time");
    }

    #[test]
    fn add_assigns_monotonic_ids_and_creates_route_table() {
        let (sched, timers, db) = test_db(2);
        let hooks = VrfHooks::new(Arc::clone(&db), Arc::clone(&db.ctx().lifetime));
        let table: VrfTable = db.create_table("db.vrf.0", hooks);

        table.enqueue(DbRequest::add("vrf-a".to_string(), VrfData));
        table.enqueue(DbRequest::add("vrf-b".to_string(), VrfData));
        sched.wait_idle();

        let a = table.find(&"vrf-a".to_string(), false).expect("vrf-a");
        let b = table.find(&"vrf-b".to_string(), false).expect("vrf-b");
        let mut ids = [a.vrf_id(), b.vrf_id()];
        ids.sort_unstable();
        assert_eq!(ids, [0, 1]);
        assert!(a.route_table().is_some());
        drop(a);
        drop(b);
        timers.shutdown();
        sched.shutdown();
    }

    #[test]
    fn unreferenced_vrf_retires_and_id_is_reused() {
        let (sched, timers, db) = test_db(2);
        let hooks = VrfHooks::new(Arc::clone(&db), Arc::clone(&db.ctx().lifetime));
        let table: VrfTable = db.create_table("db.vrf.0", hooks);

        table.enqueue(DbRequest::add("vrf-a".to_string(), VrfData));
        sched.wait_idle();
        let id_a = {
            let a = table.find(&"vrf-a".to_string(), false).expect("vrf-a");
            a.vrf_id()
        };

        table.enqueue(DbRequest::delete("vrf-a".to_string()));
        wait_for(|| table.size() == 0);
        assert!(table.find(&"vrf-a".to_string(), true).is_none());
        assert_eq!(db.ctx().lifetime.destroyed(), 1);

        // Freed id is handed out again, lowest-first.
        table.enqueue(DbRequest::add("vrf-c".to_string(), VrfData));
        sched.wait_idle();
        let c = table.find(&"vrf-c".to_string(), false).expect("vrf-c");
        assert_eq!(c.vrf_id(), id_a);
        drop(c);
        timers.shutdown();
        sched.shutdown();
    }

    #[test]
    fn vrf_with_routes_waits_for_route_table_to_drain() {
        let (sched, timers, db) = test_db(2);
        let hooks = VrfHooks::new(Arc::clone(&db), Arc::clone(&db.ctx().lifetime));
        let table: VrfTable = db.create_table("db.vrf.0", hooks);

        table.enqueue(DbRequest::add("vrf-a".to_string(), VrfData));
        sched.wait_idle();
        let rt = {
            let a = table.find(&"vrf-a".to_string(), false).expect("vrf-a");
            a.route_table().expect("route table")
        };
        let rkey = RouteKey::new(Ipv4Addr::new(10, 1, 1, 0), 24);
        rt.enqueue(DbRequest::add(
            rkey,
            RouteData {
                peer: "peer-1".to_string(),
                next_hop: Ipv4Addr::new(192, 168, 0, 1),
                label: 10,
            },
        ));
        sched.wait_idle();

        table.enqueue(DbRequest::delete("vrf-a".to_string()));
        sched.wait_idle();
        std::thread::sleep(Duration::from_millis(150));
        // Deleted but pinned by its route.
        assert_eq!(table.size(), 1);
        assert!(table.find(&"vrf-a".to_string(), true).is_some());

        rt.enqueue(DbRequest::delete(rkey));
        wait_for(|| table.size() == 0);
        timers.shutdown();
        sched.shutdown();
    }

    #[test]
    fn resync_recreates_vrf_after_retirement() {
        struct OneShot(Mutex<bool>);
        impl VrfConfigSource for OneShot {
            fn pending_recreate(&self, name: &str) -> Option<VrfData> {
                let mut pending = self.0.lock().unwrap();
                if *pending && name == "vrf-a" {
                    *pending = false;
                    Some(VrfData)
                } else {
                    None
                }
            }
        }

        let (sched, timers, db) = test_db(2);
        let hooks = VrfHooks::new(Arc::clone(&db), Arc::clone(&db.ctx().lifetime));
        hooks.set_config_source(Arc::new(OneShot(Mutex::new(true))));
        let table: VrfTable = db.create_table("db.vrf.0", hooks);

        table.enqueue(DbRequest::add("vrf-a".to_string(), VrfData));
        sched.wait_idle();
        table.enqueue(DbRequest::delete("vrf-a".to_string()));

        // Retires, then the reuse protocol re-creates it.
        wait_for(|| {
            table
                .find(&"vrf-a".to_string(), false)
                .map(|e| {
                    let live = !e.core().is_deleted();
                    drop(e);
                    live
                })
                .unwrap_or(false)
                && db.ctx().lifetime.destroyed() == 1
        });
        timers.shutdown();
        sched.shutdown();
    }

    #[test]
    fn index_allocator_reuses_lowest_freed_id() {
        let mut alloc = IndexAllocator::new();
        assert_eq!(alloc.alloc(), 0);
        assert_eq!(alloc.alloc(), 1);
        assert_eq!(alloc.alloc(), 2);
        alloc.free(1);
        alloc.free(0);
        assert_eq!(alloc.alloc(), 0);
        assert_eq!(alloc.alloc(), 1);
        assert_eq!(alloc.alloc(), 3);
    }
}
