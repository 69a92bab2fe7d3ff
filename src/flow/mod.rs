//! Flow table, statistics aging loop, and export path.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`entry`] | Flow records: 5-tuple key, counters, flags, pair links |
//! | [`table`] | Ordered flow map with positional iteration |
//! | [`stats`] | The aging/export pass and its adaptive pacing |
//! | [`export`] | `FlowDataIpv4` records and sinks |
//! | [`kernel`] | Read-only kernel flow record access |
//! | [`inter_vn`] | Per-VN-pair traffic aggregation |

pub mod entry;
pub mod export;
pub mod inter_vn;
pub mod kernel;
pub mod stats;
pub mod table;

pub use entry::{FlowData, FlowEntry, FlowHandle, FlowKey, FlowRef, FlowState};
pub use export::{FlowDataIpv4, FlowExportSink, JsonlExportSink, VecExportSink};
pub use inter_vn::{InterVnStats, VnPairStats};
pub use kernel::{KernelFlowReader, KernelFlowRecord, SimKernelFlowTable};
pub use stats::{
    FlowStatsCollector, FlowStatsConfig, FlowStatsDeps, ManualClock, SystemClock, TimeSource,
};
pub use table::FlowTable;
