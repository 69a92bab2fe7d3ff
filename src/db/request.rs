//! Table mutation requests.
//!
//! All table writes travel as `{oper, key, data}` envelopes through the
//! owning shard's request queue; nothing mutates an entry map directly.

use super::table::TableHooks;

/// Mutation kind. An ADD_OR_UPDATE for an existing live key becomes a
/// CHANGE; for an absent key it becomes an ADD.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbOperation {
    AddChange,
    Delete,
}

/// A queued mutation for one key.
pub struct DbRequest<H: TableHooks> {
    pub op: DbOperation,
    pub key: H::Key,
    pub data: Option<H::Data>,
}

impl<H: TableHooks> DbRequest<H> {
    pub fn add(key: H::Key, data: H::Data) -> Self {
        Self {
            op: DbOperation::AddChange,
            key,
            data: Some(data),
        }
    }

    pub fn delete(key: H::Key) -> Self {
        Self {
            op: DbOperation::Delete,
            key,
            data: None,
        }
    }
}
