//! Walker behavior under concurrent mutation, and the composite
//! peer-withdrawal walk.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use vrouter_agent::db::{DbNotice, DbRequest, Walker};
use vrouter_agent::oper::{del_peer_routes, Peer, RouteData, RouteKey, VrfData, VrfHooks};

use crate::support::{wait_for, NamedHooks, Stack};

#[test]
fn cancelled_walk_during_mass_delete_runs_done_once() {
    let stack = Stack::new(4);
    let table = stack.db.create_table("t", NamedHooks);
    let walker = Walker::new(Arc::clone(&stack.db.ctx().scheduler), stack.db.ctx().db_class);

    for i in 0..100 {
        table.enqueue(DbRequest::add(format!("k{i:03}"), i));
    }
    stack.scheduler.wait_idle();

    let deletes_seen = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&deletes_seen);
    table.register(move |_, op, _| {
        if op == DbNotice::Delete {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    });

    let done_runs = Arc::new(AtomicUsize::new(0));
    let done = Arc::clone(&done_runs);
    let id = walker.walk_table(&table, |_, _| true, move |_| {
        done.fetch_add(1, Ordering::SeqCst);
    });

    // Concurrent mass delete, then cancel mid-flight.
    for i in 0..100 {
        table.enqueue(DbRequest::delete(format!("k{i:03}")));
    }
    walker.walk_cancel(id);

    wait_for(|| done_runs.load(Ordering::SeqCst) == 1);
    wait_for(|| deletes_seen.load(Ordering::SeqCst) == 100);
    wait_for(|| table.size() == 0);
    // Done fired exactly once even with cancellation racing completion.
    std::thread::sleep(std::time::Duration::from_millis(30));
    assert_eq!(done_runs.load(Ordering::SeqCst), 1);
    stack.teardown();
}

#[test]
fn peer_withdrawal_walks_every_vrf_route_table() {
    let stack = Stack::new(4);
    let hooks = VrfHooks::new(Arc::clone(&stack.db), Arc::clone(&stack.db.ctx().lifetime));
    let vrf_table = stack.db.create_table("db.vrf.0", hooks);
    let walker = Walker::new(Arc::clone(&stack.db.ctx().scheduler), stack.db.ctx().db_class);

    for i in 0..3 {
        vrf_table.enqueue(DbRequest::add(format!("vrf-{i}"), VrfData));
    }
    stack.scheduler.wait_idle();

    let mut route_tables = Vec::new();
    for i in 0..3u8 {
        let vrf = vrf_table.find(&format!("vrf-{i}"), false).expect("vrf");
        let rt = vrf.route_table().expect("route table");
        for j in 0..6u8 {
            let peer = if j < 3 { "gone-peer" } else { "kept-peer" };
            rt.enqueue(DbRequest::add(
                RouteKey::new(Ipv4Addr::new(10, i, j, 0), 24),
                RouteData {
                    peer: peer.to_string(),
                    next_hop: Ipv4Addr::new(172, 16, 0, 1),
                    label: 100 + j as u32,
                },
            ));
        }
        route_tables.push(rt);
        drop(vrf);
    }
    stack.scheduler.wait_idle();

    let peer = Peer::new("gone-peer");
    let cleanup = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&cleanup);
    del_peer_routes(&walker, &vrf_table, &peer, move || {
        c.fetch_add(1, Ordering::SeqCst);
    });

    wait_for(|| cleanup.load(Ordering::SeqCst) == 1);
    wait_for(|| route_tables.iter().all(|rt| rt.size() == 3));
    stack.teardown();
}
