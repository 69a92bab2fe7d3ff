//! Flow aging and export scenarios.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use vrouter_agent::agent::AgentStats;
use vrouter_agent::flow::{
    FlowEntry, FlowHandle, FlowKey, FlowStatsCollector, FlowStatsConfig, FlowStatsDeps,
    FlowTable, InterVnStats, KernelFlowReader, KernelFlowRecord, ManualClock,
    SimKernelFlowTable, TimeSource, VecExportSink,
};
use vrouter_agent::scheduler::{class, Scheduler, SchedulerConfig, TimerManager};

struct FlowStack {
    scheduler: Arc<Scheduler>,
    timers: Arc<TimerManager>,
    table: Arc<FlowTable>,
    kernel: Arc<SimKernelFlowTable>,
    sink: Arc<VecExportSink>,
    clock: Arc<ManualClock>,
    collector: Arc<FlowStatsCollector>,
}

impl FlowStack {
    fn new() -> Self {
        let scheduler = Arc::new(Scheduler::new(SchedulerConfig {
            workers: 2,
            ..Default::default()
        }));
        let timers = Arc::new(TimerManager::new(Arc::clone(&scheduler)));
        let flow_class = scheduler.class_id(class::FLOW_HANDLER);
        let stats = Arc::new(AgentStats::new());
        let table = FlowTable::new(Arc::clone(&stats));
        let kernel = Arc::new(SimKernelFlowTable::new());
        let sink = Arc::new(VecExportSink::new());
        let clock = Arc::new(ManualClock::new(10_000_000));
        let collector = FlowStatsCollector::new(
            FlowStatsDeps {
                scheduler: Arc::clone(&scheduler),
                timers: Arc::clone(&timers),
                flow_class,
                table: Arc::clone(&table),
                kernel: Arc::clone(&kernel) as Arc<dyn KernelFlowReader>,
                sink: Arc::clone(&sink) as _,
                inter_vn: Arc::new(InterVnStats::new()),
                stats,
                clock: Arc::clone(&clock) as Arc<dyn TimeSource>,
                vm_resolver: None,
            },
            FlowStatsConfig::default(),
        );
        Self {
            scheduler,
            timers,
            table,
            kernel,
            sink,
            clock,
            collector,
        }
    }

    fn teardown(&self) {
        self.collector.stop();
        self.timers.shutdown();
        self.scheduler.shutdown();
    }
}

fn fkey(last: u8) -> FlowKey {
    FlowKey::new(
        Ipv4Addr::new(10, 0, 0, last),
        Ipv4Addr::new(10, 0, 1, last),
        6,
        30000,
        443,
    )
}

#[test]
fn paired_flows_age_together_with_dual_export_for_local() {
    let stack = FlowStack::new();
    let now = stack.clock.now_usec();

    // A is a local flow (both endpoints on this host); B is its reverse.
    let a = stack
        .table
        .insert(FlowEntry::new(fkey(1), FlowHandle(0)).with_data(|d| {
            d.local = true;
            d.ingress = true;
            d.bytes = 1000;
            d.packets = 10;
            d.last_modified_time = now;
        }));
    let b = stack
        .table
        .insert(FlowEntry::new(fkey(2), FlowHandle(1)).with_data(|d| {
            d.bytes = 1000;
            d.packets = 10;
            d.last_modified_time = now;
        }));
    stack.table.link_pair(&a, &b);

    // Kernel counters unchanged for both across 2x the age interval.
    for (handle, _) in [(0u32, &a), (1u32, &b)] {
        stack.kernel.set(
            FlowHandle(handle),
            KernelFlowRecord {
                flow_bytes: 1000,
                flow_packets: 10,
                ..Default::default()
            },
        );
    }
    stack.clock.advance(Duration::from_secs(360));

    stack.collector.run_once();

    assert_eq!(stack.table.size(), 0, "both halves of the pair retired");
    let records = stack.sink.records();
    assert_eq!(records.len(), 2, "local flow exports both directions");
    assert_eq!(records[0].flowuuid, a.uuid().to_string());
    assert_eq!(records[0].direction_ing, Some(1));
    assert_eq!(records[1].flowuuid, a.egress_uuid().to_string());
    assert_eq!(records[1].direction_ing, Some(0));
    assert!(records[0].teardown_time.is_some());
    // The non-local partner is deleted silently.
    assert!(records.iter().all(|r| r.flowuuid != b.uuid().to_string()));
    stack.teardown();
}

#[test]
fn lone_eligible_half_of_pair_waits_for_partner() {
    let stack = FlowStack::new();
    let now = stack.clock.now_usec();

    let a = stack
        .table
        .insert(FlowEntry::new(fkey(1), FlowHandle::INVALID).with_data(|d| {
            d.last_modified_time = now;
        }));
    let b = stack
        .table
        .insert(FlowEntry::new(fkey(2), FlowHandle::INVALID).with_data(|d| {
            // Partner saw traffic recently.
            d.last_modified_time = now + 350_000_000;
        }));
    stack.table.link_pair(&a, &b);

    stack.clock.advance(Duration::from_secs(360));
    stack.collector.run_once();

    assert_eq!(stack.table.size(), 2, "pair must age together or not at all");
    stack.teardown();
}

#[test]
fn nat_ingress_export_overrides_source_ip() {
    let stack = FlowStack::new();
    let now = stack.clock.now_usec();

    let a_key = FlowKey::new(
        Ipv4Addr::new(10, 0, 0, 1),
        Ipv4Addr::new(10, 0, 1, 1),
        6,
        30000,
        443,
    );
    // Reverse flow whose key destination is the NAT-translated address.
    let b_key = FlowKey::new(
        Ipv4Addr::new(10, 0, 1, 1),
        Ipv4Addr::new(192, 168, 1, 1),
        6,
        443,
        30000,
    );

    let a = stack
        .table
        .insert(FlowEntry::new(a_key, FlowHandle(0)).with_data(|d| {
            d.ingress = true;
            d.nat = true;
            d.last_modified_time = now;
        }));
    let b = stack
        .table
        .insert(FlowEntry::new(b_key, FlowHandle::INVALID).with_data(|d| {
            d.last_modified_time = now;
        }));
    stack.table.link_pair(&a, &b);

    // Fresh kernel traffic forces a stats export for A.
    stack.kernel.set(
        FlowHandle(0),
        KernelFlowRecord {
            flow_bytes: 500,
            flow_packets: 4,
            ..Default::default()
        },
    );
    stack.collector.run_once();

    let records = stack.sink.records();
    let rec = records
        .iter()
        .find(|r| r.flowuuid == a.uuid().to_string())
        .expect("export for A");
    assert_eq!(rec.direction_ing, Some(1));
    assert_eq!(rec.sourceip, Some(Ipv4Addr::new(192, 168, 1, 1)));
    assert_eq!(rec.reverse_uuid, Some(b.uuid().to_string()));
    stack.teardown();
}

#[test]
fn kernel_counter_wrap_carries_into_high_bits() {
    let stack = FlowStack::new();
    let now = stack.clock.now_usec();

    let flow = stack
        .table
        .insert(FlowEntry::new(fkey(1), FlowHandle(0)).with_data(|d| {
            d.bytes = 0x0000_ffff_ffff_ff00;
            d.packets = 0x0000_00ff_ffff_ff00;
            d.last_modified_time = now;
        }));
    stack.kernel.set(
        FlowHandle(0),
        KernelFlowRecord {
            flow_bytes: 0x10,
            flow_packets: 0x10,
            flow_bytes_oflow: 0,
            flow_packets_oflow: 0,
        },
    );

    stack.collector.run_once();

    let data = flow.data();
    assert_eq!(data.bytes, 0x0001_0000_0000_0010);
    assert_eq!(data.packets, 0x0000_0100_0000_0010);
    stack.teardown();
}

#[test]
fn pacing_respects_clamps_and_default() {
    let stack = FlowStack::new();

    // Empty table: default interval, floor budget.
    let interval = stack.collector.run_once();
    assert_eq!(interval, FlowStatsConfig::default().default_interval_ms);
    let (_, per_pass) = stack.collector.pacing();
    assert_eq!(per_pass, 100);

    // Small table: interval capped at 1000ms, budget floored at 100.
    let now = stack.clock.now_usec();
    for i in 0..8u8 {
        stack
            .table
            .insert(FlowEntry::new(fkey(i), FlowHandle::INVALID).with_data(|d| {
                d.last_modified_time = now;
            }));
    }
    let interval = stack.collector.run_once();
    assert!(interval <= 1000);
    let (_, per_pass) = stack.collector.pacing();
    assert!(per_pass >= 100);
    stack.teardown();
}

#[test]
fn periodic_timer_drives_passes() {
    let stack = FlowStack::new();
    stack.collector.set_age_time(Duration::from_secs(180));
    stack.collector.start();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while stack.collector.run_counter() < 2 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(
        stack.collector.run_counter() >= 2,
        "timer should re-arm after each pass"
    );
    stack.teardown();
}
