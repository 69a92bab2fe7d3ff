//! Interface table: index → kind, name, bound VM.
//!
//! The flow export path resolves a flow's ingress interface here to fill
//! the `vm` field; only VM ports resolve.

use std::sync::{Arc, Mutex};

use crate::db::{DbEntry, EntryCore, Table, TableHooks};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntfKind {
    VmPort,
    Ethernet,
    VirtualHost,
}

#[derive(Clone, Debug)]
pub struct IntfData {
    pub kind: IntfKind,
    pub name: String,
    /// Configured name of the VM bound to a VM port.
    pub vm_name: Option<String>,
}

pub struct IntfEntry {
    index: u32,
    data: Mutex<Option<IntfData>>,
    core: EntryCore,
}

impl IntfEntry {
    pub fn kind(&self) -> Option<IntfKind> {
        self.data
            .lock()
            .expect("intf data lock poisoned")
            .as_ref()
            .map(|d| d.kind)
    }

    /// The bound VM's name; `None` for non-VM ports.
    pub fn vm_name(&self) -> Option<String> {
        self.data
            .lock()
            .expect("intf data lock poisoned")
            .as_ref()
            .filter(|d| d.kind == IntfKind::VmPort)
            .and_then(|d| d.vm_name.clone())
    }
}

impl DbEntry for IntfEntry {
    type Key = u32;

    fn key(&self) -> &u32 {
        &self.index
    }

    fn core(&self) -> &EntryCore {
        &self.core
    }
}

#[derive(Default)]
pub struct IntfHooks;

impl TableHooks for IntfHooks {
    type Key = u32;
    type Data = IntfData;
    type Entry = IntfEntry;

    fn alloc(&self, key: &u32) -> IntfEntry {
        IntfEntry {
            index: *key,
            data: Mutex::new(None),
            core: EntryCore::new(),
        }
    }

    fn add(&self, _table: &Table<Self>, entry: &Arc<IntfEntry>, data: Option<IntfData>) {
        *entry.data.lock().expect("intf data lock poisoned") = data;
    }

    fn on_change(&self, _table: &Table<Self>, entry: &Arc<IntfEntry>, data: Option<IntfData>) -> bool {
        if let Some(data) = data {
            *entry.data.lock().expect("intf data lock poisoned") = Some(data);
        }
        true
    }

    fn delete(&self, _table: &Table<Self>, _entry: &Arc<IntfEntry>) {}
}

pub type IntfTable = Table<IntfHooks>;
