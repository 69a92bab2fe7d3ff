//! Table engine lifecycle scenarios.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vrouter_agent::db::{DbEntry, DbNotice, DbRequest, ListenerId};
use vrouter_agent::oper::{VrfData, VrfHooks};

use crate::support::{wait_for, NamedHooks, Stack};

#[test]
fn add_then_lookup_assigns_monotonic_ids() {
    let stack = Stack::new(2);
    let hooks = VrfHooks::new(Arc::clone(&stack.db), Arc::clone(&stack.db.ctx().lifetime));
    let table = stack.db.create_table("db.vrf.0", hooks);

    table.enqueue(DbRequest::add("vrf-a".to_string(), VrfData));
    stack.scheduler.wait_idle();

    let entry = table.find(&"vrf-a".to_string(), false).expect("vrf-a");
    assert_eq!(entry.vrf_id(), 0);
    drop(entry);

    table.enqueue(DbRequest::add("vrf-b".to_string(), VrfData));
    stack.scheduler.wait_idle();
    let entry = table.find(&"vrf-b".to_string(), false).expect("vrf-b");
    assert_eq!(entry.vrf_id(), 1);
    drop(entry);
    stack.teardown();
}

#[test]
fn delete_held_by_listener_retires_after_detach() {
    let stack = Stack::new(2);
    let table = stack.db.create_table("t", NamedHooks);

    let listener_id = Arc::new(Mutex::new(None::<ListenerId>));
    let deletes_seen = Arc::new(AtomicUsize::new(0));
    let id_cell = Arc::clone(&listener_id);
    let seen = Arc::clone(&deletes_seen);
    let id = table.register(move |t, op, entry| {
        let id = id_cell.lock().unwrap().expect("id stored before traffic");
        match op {
            DbNotice::Add => t.set_state(entry, id, Box::new("listener-state")),
            DbNotice::Delete => {
                seen.fetch_add(1, Ordering::SeqCst);
            }
            DbNotice::Change => {}
        }
    });
    *listener_id.lock().unwrap() = Some(id);

    table.enqueue(DbRequest::add("k".to_string(), 1));
    stack.scheduler.wait_idle();
    table.enqueue(DbRequest::delete("k".to_string()));
    stack.scheduler.wait_idle();

    // Listener saw the delete; its state pins the entry.
    assert_eq!(deletes_seen.load(Ordering::SeqCst), 1);
    let held = table.find(&"k".to_string(), true).expect("pinned entry");
    assert!(held.core().is_deleted());
    let arc = Arc::clone(held.entry());
    drop(held);

    // Detaching the state releases the entry for retirement.
    let state = table.clear_state(&arc, id);
    assert!(state.is_some());
    wait_for(|| table.find(&"k".to_string(), true).is_none());
    assert_eq!(table.size(), 0);
    stack.teardown();
}

#[test]
fn add_delete_round_trip_leaves_table_empty() {
    let stack = Stack::new(2);
    let table = stack.db.create_table("t", NamedHooks);

    for i in 0..64 {
        table.enqueue(DbRequest::add(format!("k{i}"), i));
    }
    for i in 0..64 {
        table.enqueue(DbRequest::delete(format!("k{i}")));
    }
    wait_for(|| table.size() == 0);
    stack.teardown();
}

#[test]
fn readd_same_key_notifies_change_not_add() {
    let stack = Stack::new(2);
    let table = stack.db.create_table("t", NamedHooks);
    let notices = Arc::new(Mutex::new(Vec::new()));
    let n = Arc::clone(&notices);
    table.register(move |_, op, _| n.lock().unwrap().push(op));

    table.enqueue(DbRequest::add("k".to_string(), 5));
    stack.scheduler.wait_idle();
    table.enqueue(DbRequest::add("k".to_string(), 5));
    stack.scheduler.wait_idle();

    assert_eq!(
        *notices.lock().unwrap(),
        vec![DbNotice::Add, DbNotice::Change]
    );
    let entry = table.find(&"k".to_string(), false).expect("entry");
    assert_eq!(entry.value(), 5);
    drop(entry);
    stack.teardown();
}

#[test]
fn unregistered_listener_stops_receiving() {
    let stack = Stack::new(2);
    let table = stack.db.create_table("t", NamedHooks);
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    let id = table.register(move |_, _, _| {
        c.fetch_add(1, Ordering::SeqCst);
    });

    table.enqueue(DbRequest::add("a".to_string(), 1));
    stack.scheduler.wait_idle();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    table.unregister(id);
    table.enqueue(DbRequest::add("b".to_string(), 2));
    stack.scheduler.wait_idle();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    stack.teardown();
}
