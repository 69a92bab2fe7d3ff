//! Virtual-router control agent core.
//!
//! The agent runs on a compute host, receives virtual-networking
//! configuration, materializes it into kernel-dataplane state, and
//! exports per-flow statistics. Three tightly coupled subsystems form
//! the core:
//!
//! - [`scheduler`]: every piece of work runs as a task tagged
//!   `(class, instance)` on one bounded worker pool; declared exclusion
//!   policies keep whole activity classes from ever overlapping.
//! - [`db`]: partitioned tables of named, reference-counted entries with
//!   observer subscriptions, background walkers, and deferred destruction
//!   through a lifetime manager.
//! - [`flow`]: a timer-driven loop that reconciles userspace flow records
//!   against the kernel flow table, exports deltas, and retires idle
//!   flows at an adaptive cadence.
//!
//! [`oper`] holds the concrete tables (VRFs, routes, interfaces) built on
//! the engine, and [`agent`] wires everything together in dependency
//! order.
//!
//! Configuration ingestion, the netlink transport, controller RPC, and
//! the packet fast path are external collaborators; they appear here only
//! as the interfaces the core consumes (request queues, the kernel flow
//! reader, the export sink).

pub mod agent;
pub mod db;
pub mod flow;
pub mod oper;
pub mod scheduler;

pub use agent::{Agent, AgentConfig, AgentStats, TunnelType};
