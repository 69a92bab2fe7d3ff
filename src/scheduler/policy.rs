//! Boot-time task policy for the agent.
//!
//! Database mutations may not overlap any consumer that reads tables; flow
//! aging may not run while new flows are being installed; kernel sync may
//! not race flow stats collection. The scheduler enforces the symmetric
//! closure of the declared sets.

use super::executor::Scheduler;

/// Task class names used across the agent. Interned once at bootstrap;
/// modules look them up by these constants.
pub mod class {
    pub const DB_TABLE: &str = "db::DBTable";
    pub const FLOW_HANDLER: &str = "Agent::FlowHandler";
    pub const SERVICES: &str = "Agent::Services";
    pub const STATS_COLLECTOR: &str = "Agent::StatsCollector";
    pub const UVE: &str = "Agent::Uve";
    pub const KSYNC: &str = "Agent::KSync";
    pub const SANDESH_RECV: &str = "sandesh::RecvQueue";
    pub const IO_READER: &str = "io::ReaderTask";
    pub const BGP_CONFIG: &str = "bgp::Config";
    pub const XMPP_STATE_MACHINE: &str = "xmpp::StateMachine";
}

fn set_policy_one(scheduler: &Scheduler, task: &str, exclude_list: &[&str]) {
    let ids: Vec<_> = exclude_list
        .iter()
        .map(|name| scheduler.class_id(name))
        .collect();
    let class = scheduler.class_id(task);
    // Policy conflicts at install time are unrecoverable: running with a
    // partial exclusion graph would corrupt table state.
    if let Err(err) = scheduler.set_policy(class, &ids) {
        panic!("task policy install failed for {task:?}: {err}");
    }
}

/// Installs the agent's exclusion policy. Must run before any task is
/// submitted; policies are frozen on first submission.
pub fn install_agent_task_policy(scheduler: &Scheduler) {
    set_policy_one(
        scheduler,
        class::DB_TABLE,
        &[
            class::FLOW_HANDLER,
            class::SERVICES,
            class::STATS_COLLECTOR,
            class::SANDESH_RECV,
            class::IO_READER,
            class::UVE,
            class::KSYNC,
        ],
    );

    set_policy_one(
        scheduler,
        class::FLOW_HANDLER,
        &[class::STATS_COLLECTOR, class::IO_READER],
    );

    set_policy_one(
        scheduler,
        class::SANDESH_RECV,
        &[
            class::DB_TABLE,
            class::FLOW_HANDLER,
            class::SERVICES,
            class::STATS_COLLECTOR,
            class::IO_READER,
        ],
    );

    set_policy_one(
        scheduler,
        class::BGP_CONFIG,
        &[
            class::FLOW_HANDLER,
            class::SERVICES,
            class::STATS_COLLECTOR,
            class::SANDESH_RECV,
            class::IO_READER,
            class::XMPP_STATE_MACHINE,
            class::DB_TABLE,
        ],
    );

    set_policy_one(
        scheduler,
        class::XMPP_STATE_MACHINE,
        &[class::IO_READER, class::DB_TABLE],
    );

    set_policy_one(
        scheduler,
        class::KSYNC,
        &[class::FLOW_HANDLER, class::STATS_COLLECTOR, class::DB_TABLE],
    );
}
