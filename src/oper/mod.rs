//! Concrete tables built on the generic engine.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`vrf`] | Named routing instances with managed lifetimes |
//! | [`route`] | Per-VRF IPv4 unicast routes |
//! | [`interface`] | Interface index → kind / VM binding |
//! | [`peer`] | Peer-scoped route withdrawal (walk-of-walks) |

pub mod interface;
pub mod peer;
pub mod route;
pub mod vrf;

pub use interface::{IntfData, IntfEntry, IntfHooks, IntfKind, IntfTable};
pub use peer::{del_peer_routes, Peer};
pub use route::{RouteData, RouteEntry, RouteHooks, RouteKey, RouteTable};
pub use vrf::{
    IndexAllocator, VrfConfigSource, VrfData, VrfEntry, VrfHooks, VrfTable, INVALID_VRF_ID,
};
