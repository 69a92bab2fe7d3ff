//! Generic database of named, versioned, reference-counted entries.
//!
//! Tables are partitioned into shards; every shard mutation runs on a
//! single scheduler task under `db::DBTable`, keyed by `(table, shard)`.
//! Listeners observe a per-shard total order of `(ADD|CHANGE|DELETE,
//! entry)` notifications; there is no cross-shard ordering.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`table`] | Partitioned table, hooks, listeners, drain loop |
//! | [`partition`] | Per-shard maps and queues |
//! | [`entry`] | Entry bookkeeping: refcount, deleted flag, `DbState` |
//! | [`request`] | Mutation envelopes |
//! | [`walker`] | Asynchronous table iteration with cancellation |
//! | [`lifetime`] | Deferred destruction of objects with dependents |

pub mod entry;
pub mod lifetime;
pub(crate) mod partition;
pub mod request;
pub mod table;
pub mod walker;

#[cfg(test)]
pub mod test_support;

pub use entry::{DbEntry, DbState, EntryCore, EntryRef, ListenerId};
pub use lifetime::{LifetimeActor, LifetimeManager};
pub use request::{DbOperation, DbRequest};
pub use table::{Database, DbContext, DbNotice, Table, TableHooks};
pub use walker::{WalkId, Walker, INVALID_WALK};
