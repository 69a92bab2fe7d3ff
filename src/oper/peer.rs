//! Peer-scoped route withdrawal: the walk-of-walks.
//!
//! "Delete every route learned from peer P" composes as an outer walk
//! over the VRF table whose entry callback spawns an inner walk per VRF
//! route table; each inner walk enqueues DELETEs for the peer's routes.
//! Completion is joined on an explicit counter rather than nested
//! closures, so the composite walk's progress is observable and
//! cancellation leaves no dangling bookkeeping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::db::{DbEntry, DbRequest, WalkId, Walker, INVALID_WALK};

use super::vrf::VrfTable;

/// A route source. Walk handles are non-owning: they are validated
/// against the walker registry on use.
pub struct Peer {
    name: String,
    vrf_walk: Mutex<WalkId>,
}

impl Peer {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            vrf_walk: Mutex::new(INVALID_WALK),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vrf_walk(&self) -> WalkId {
        *self.vrf_walk.lock().expect("walk slot poisoned")
    }
}

/// Composite-walk join state: one slot for the outer walk plus one per
/// spawned inner walk. The continuation fires when the count drains.
struct DelPeerState {
    pending: AtomicUsize,
    done: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl DelPeerState {
    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(f) = self.done.lock().expect("done slot poisoned").take() {
                f();
            }
        }
    }
}

/// Withdraws every route advertised by `peer` across all VRFs, then runs
/// `done` exactly once.
///
/// A prior withdrawal walk for the same peer is cancelled first; its done
/// bookkeeping still runs via the walker's cancellation contract.
pub fn del_peer_routes(
    walker: &Arc<Walker>,
    vrf_table: &VrfTable,
    peer: &Arc<Peer>,
    done: impl FnOnce() + Send + 'static,
) -> WalkId {
    {
        let prior = *peer.vrf_walk.lock().expect("walk slot poisoned");
        if prior != INVALID_WALK && walker.walk_cancel(prior) {
            debug!("peer {}: cancelled stale withdrawal walk", peer.name);
        }
    }

    // One hold for the outer walk itself.
    let state = Arc::new(DelPeerState {
        pending: AtomicUsize::new(1),
        done: Mutex::new(Some(Box::new(done))),
    });

    let entry_state = Arc::clone(&state);
    let entry_walker = Arc::clone(walker);
    let peer_name = peer.name.clone();
    let done_state = Arc::clone(&state);
    let done_peer = Arc::clone(peer);

    let walk_id = walker.walk_table(
        vrf_table,
        move |_, vrf| {
            let Some(rt) = vrf.route_table() else {
                return true;
            };
            entry_state.pending.fetch_add(1, Ordering::AcqRel);
            let inner_state = Arc::clone(&entry_state);
            let inner_rt = rt.clone();
            let inner_peer = peer_name.clone();
            entry_walker.walk_table(
                &rt,
                move |_, route| {
                    if route.peer().as_deref() == Some(inner_peer.as_str()) {
                        inner_rt.enqueue(DbRequest::delete(*route.key()));
                    }
                    true
                },
                move |_| inner_state.finish_one(),
            );
            true
        },
        move |_| {
            *done_peer.vrf_walk.lock().expect("walk slot poisoned") = INVALID_WALK;
            done_state.finish_one();
        },
    );

    *peer.vrf_walk.lock().expect("walk slot poisoned") = walk_id;
    walk_id
}
