//! End-to-end scenarios for the agent core.
//!
//! Run with: `cargo test --test integration`

mod flow_aging;
mod scheduler_policy;
mod support;
mod table_lifecycle;
mod walker_composition;
