//! Per-VRF IPv4 unicast route table.
//!
//! Each VRF owns one of these, created when the VRF is added and torn
//! down when the VRF retires. Routes carry the peer that advertised them
//! so peer-scoped withdrawal can walk and delete selectively.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use crate::db::{DbEntry, EntryCore, Table, TableHooks};

/// `prefix/len`, the route key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RouteKey {
    pub prefix: Ipv4Addr,
    pub prefix_len: u8,
}

impl RouteKey {
    pub fn new(prefix: Ipv4Addr, prefix_len: u8) -> Self {
        Self { prefix, prefix_len }
    }
}

impl fmt::Debug for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.prefix, self.prefix_len)
    }
}

/// Route payload: source peer, next hop, MPLS label.
#[derive(Clone, Debug)]
pub struct RouteData {
    pub peer: String,
    pub next_hop: Ipv4Addr,
    pub label: u32,
}

pub struct RouteEntry {
    key: RouteKey,
    data: Mutex<Option<RouteData>>,
    core: EntryCore,
}

impl RouteEntry {
    pub fn peer(&self) -> Option<String> {
        self.data
            .lock()
            .expect("route data lock poisoned")
            .as_ref()
            .map(|d| d.peer.clone())
    }

    pub fn next_hop(&self) -> Option<Ipv4Addr> {
        self.data
            .lock()
            .expect("route data lock poisoned")
            .as_ref()
            .map(|d| d.next_hop)
    }

    pub fn label(&self) -> Option<u32> {
        self.data
            .lock()
            .expect("route data lock poisoned")
            .as_ref()
            .map(|d| d.label)
    }
}

impl DbEntry for RouteEntry {
    type Key = RouteKey;

    fn key(&self) -> &RouteKey {
        &self.key
    }

    fn core(&self) -> &EntryCore {
        &self.core
    }
}

#[derive(Default)]
pub struct RouteHooks;

impl TableHooks for RouteHooks {
    type Key = RouteKey;
    type Data = RouteData;
    type Entry = RouteEntry;

    fn alloc(&self, key: &RouteKey) -> RouteEntry {
        RouteEntry {
            key: *key,
            data: Mutex::new(None),
            core: EntryCore::new(),
        }
    }

    fn add(&self, _table: &Table<Self>, entry: &Arc<RouteEntry>, data: Option<RouteData>) {
        *entry.data.lock().expect("route data lock poisoned") = data;
    }

    fn on_change(&self, _table: &Table<Self>, entry: &Arc<RouteEntry>, data: Option<RouteData>) -> bool {
        if let Some(data) = data {
            *entry.data.lock().expect("route data lock poisoned") = Some(data);
        }
        true
    }

    fn delete(&self, _table: &Table<Self>, _entry: &Arc<RouteEntry>) {}
}

/// Handle type for a VRF's unicast route table.
pub type RouteTable = Table<RouteHooks>;
