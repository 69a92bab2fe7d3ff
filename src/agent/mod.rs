//! Agent context and bootstrap.
//!
//! The `Agent` is an explicit context value threaded to every component at
//! construction; the scheduler is the only process-wide singleton, created
//! first because it arbitrates all concurrency. Construction follows the
//! dependency order: scheduler → policy → timers → lifetime manager →
//! database and tables → flow table → stats collector.

pub mod config;
pub mod stats;

use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::db::{Database, DbContext, DbRequest, LifetimeManager, Walker};
use crate::flow::{
    FlowExportSink, FlowStatsCollector, FlowStatsConfig, FlowStatsDeps, FlowTable, InterVnStats,
    KernelFlowReader, TimeSource,
};
use crate::oper::{IntfHooks, IntfTable, VrfData, VrfHooks, VrfTable};
use crate::scheduler::{
    class, install_agent_task_policy, Scheduler, SchedulerConfig, TimerManager,
};

pub use config::{AgentConfig, ConfigError, TunnelType};
pub use stats::AgentStats;

/// Well-known virtual-network and VRF names.
pub mod names {
    pub const FABRIC_VN: &str = "default-domain:default-project:ip-fabric";
    pub const FABRIC_VRF: &str = "default-domain:default-project:ip-fabric:__default__";
    pub const LINK_LOCAL_VN: &str = "default-domain:default-project:__link_local__";
    pub const LINK_LOCAL_VRF: &str =
        "default-domain:default-project:__link_local__:__link_local__";
}

/// How long a deleted entry may linger before the delete timer declares a
/// reference leak.
const ENTRY_DELETE_TIMEOUT: Duration = Duration::from_secs(30);

const DB_PARTITIONS: u32 = 4;

pub struct Agent {
    pub config: AgentConfig,
    pub scheduler: Arc<Scheduler>,
    pub timers: Arc<TimerManager>,
    pub lifetime: Arc<LifetimeManager>,
    pub database: Arc<Database>,
    pub walker: Arc<Walker>,
    pub stats: Arc<AgentStats>,
    pub vrf_table: VrfTable,
    pub intf_table: IntfTable,
    pub flow_table: Arc<FlowTable>,
    pub inter_vn: Arc<InterVnStats>,
    pub flow_stats: Arc<FlowStatsCollector>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        sink: Arc<dyn FlowExportSink>,
        kernel: Arc<dyn KernelFlowReader>,
        clock: Arc<dyn TimeSource>,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Scheduler::new(SchedulerConfig::default()));
        install_agent_task_policy(&scheduler);

        let timers = Arc::new(TimerManager::new(Arc::clone(&scheduler)));
        let db_class = scheduler.class_id(class::DB_TABLE);
        let flow_class = scheduler.class_id(class::FLOW_HANDLER);
        let config_class = scheduler.class_id(class::BGP_CONFIG);
        let lifetime = LifetimeManager::new(Arc::clone(&scheduler), Arc::clone(&timers), db_class);

        let database = Database::new(DbContext {
            scheduler: Arc::clone(&scheduler),
            timers: Arc::clone(&timers),
            lifetime: Arc::clone(&lifetime),
            db_class,
            partition_count: DB_PARTITIONS,
            delete_timeout: ENTRY_DELETE_TIMEOUT,
            producer_class: Some(config_class),
        });
        let walker = Walker::new(Arc::clone(&scheduler), db_class);

        let vrf_table = database.create_table(
            "db.vrf.0",
            VrfHooks::new(Arc::clone(&database), Arc::clone(&lifetime)),
        );
        let intf_table = database.create_table("db.interface.0", IntfHooks);

        let stats = Arc::new(AgentStats::new());
        let flow_table = FlowTable::new(Arc::clone(&stats));
        let inter_vn = Arc::new(InterVnStats::new());

        let resolver_table = intf_table.clone();
        let flow_stats = FlowStatsCollector::new(
            FlowStatsDeps {
                scheduler: Arc::clone(&scheduler),
                timers: Arc::clone(&timers),
                flow_class,
                table: Arc::clone(&flow_table),
                kernel,
                sink,
                inter_vn: Arc::clone(&inter_vn),
                stats: Arc::clone(&stats),
                clock,
                vm_resolver: Some(Arc::new(move |index| {
                    resolver_table
                        .find(&index, false)
                        .and_then(|intf| intf.vm_name())
                })),
            },
            FlowStatsConfig::default(),
        );

        Arc::new(Self {
            config,
            scheduler,
            timers,
            lifetime,
            database,
            walker,
            stats,
            vrf_table,
            intf_table,
            flow_table,
            inter_vn,
            flow_stats,
        })
    }

    /// Creates the fabric and link-local VRFs. These never come from the
    /// configuration source.
    pub fn create_default_vrfs(&self) {
        self.vrf_table
            .enqueue(DbRequest::add(names::FABRIC_VRF.to_string(), VrfData));
        self.vrf_table
            .enqueue(DbRequest::add(names::LINK_LOCAL_VRF.to_string(), VrfData));
    }

    /// Starts the periodic work (currently the flow aging loop).
    pub fn start(&self) {
        info!(
            "{}: agent up, host {:?}, tunnel {:?}",
            self.config.program_name, self.config.host_name, self.config.tunnel_type
        );
        self.flow_stats.start();
    }

    /// Full diagnostic dump for fatal errors and operator queries.
    pub fn diagnostics(&self) -> Vec<String> {
        let mut lines = Vec::new();
        lines.push(format!(
            "vrf table: {} entries; interface table: {} entries; flows: {}",
            self.vrf_table.size(),
            self.intf_table.size(),
            self.flow_table.size()
        ));
        lines.extend(self.stats.snapshot_lines());
        lines.push(format!(
            "walks outstanding: {:?}",
            self.walker.outstanding()
        ));
        lines.push(format!("lifetime pending: {}", self.lifetime.pending()));
        lines.extend(self.scheduler.diagnostics());
        lines
    }

    /// Stops periodic work and drains the scheduler.
    pub fn shutdown(&self) {
        self.flow_stats.stop();
        self.timers.shutdown();
        let metrics = self.scheduler.shutdown();
        info!(
            "agent shutdown: {} tasks executed, {} panics",
            metrics.tasks_executed, metrics.task_panics
        );
    }
}
