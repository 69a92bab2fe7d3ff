//! Flow statistics collection, aging, and export.
//!
//! A periodic task under `Agent::FlowHandler` sweeps the flow table in key
//! order, resuming each pass from the successor of the last visited key.
//! Per flow it:
//!
//! 1. reads the kernel record at the flow's handle,
//! 2. decides aging eligibility (kernel-counter regression means the
//!    kernel slot was reused and the flow is skipped),
//! 3. retires eligible pairs together (a lone eligible half waits for its
//!    partner),
//! 4. reconciles counters, composing the kernel's overflow words and
//!    carrying userspace-held wraparound bits so the 64-bit counters stay
//!    monotonic across kernel resets, and exports the delta,
//! 5. retires short flows immediately after export.
//!
//! After each pass the timer interval and per-pass budget are retuned so
//! every flow is visited roughly once per age interval regardless of
//! table size, with the interval capped at 1s and the budget floored at
//! 100 flows.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::debug;

use crate::agent::stats::AgentStats;
use crate::scheduler::{ClassId, Scheduler, TaskKey, TimerManager};

use super::entry::{FlowKey, FlowRef, FlowState};
use super::export::{FlowDataIpv4, FlowExportSink};
use super::inter_vn::InterVnStats;
use super::kernel::{KernelFlowRecord, KernelFlowReader};
use super::table::FlowTable;

/// Userspace byte counter: kernel-backed low 48 bits, carry high 16.
const BYTES_LOW: u64 = 0x0000_ffff_ffff_ffff;
const BYTES_HIGH: u64 = 0xffff_0000_0000_0000;
const BYTES_CARRY: u64 = 0x0001_0000_0000_0000;

/// Userspace packet counter: kernel-backed low 40 bits, carry high 24.
const PKTS_LOW: u64 = 0x0000_00ff_ffff_ffff;
const PKTS_HIGH: u64 = 0xffff_ff00_0000_0000;
const PKTS_CARRY: u64 = 0x0000_0100_0000_0000;

/// Instance key of the collector's timer task.
const FLOW_STATS_INSTANCE: u64 = 0;

/// Microsecond clock, swappable so tests drive aging without sleeping.
pub trait TimeSource: Send + Sync {
    fn now_usec(&self) -> u64;
}

pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now_usec(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for tests.
#[derive(Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(now_usec: u64) -> Self {
        Self(AtomicU64::new(now_usec))
    }

    pub fn set(&self, now_usec: u64) {
        self.0.store(now_usec, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: Duration) {
        self.0.fetch_add(delta.as_micros() as u64, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now_usec(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Aging-loop tuning.
#[derive(Clone, Copy, Debug)]
pub struct FlowStatsConfig {
    /// Idle time after which a flow is aging-eligible.
    pub age_time: Duration,
    /// Scales the interval formula; larger means more passes per age
    /// interval.
    pub flow_multiplier: u32,
    /// Timer interval when the table is empty.
    pub default_interval_ms: u32,
}

impl Default for FlowStatsConfig {
    fn default() -> Self {
        Self {
            age_time: Duration::from_secs(180),
            flow_multiplier: 10,
            default_interval_ms: 1000,
        }
    }
}

/// Everything the collector needs, wired at bootstrap.
pub struct FlowStatsDeps {
    pub scheduler: Arc<Scheduler>,
    pub timers: Arc<TimerManager>,
    pub flow_class: ClassId,
    pub table: Arc<FlowTable>,
    pub kernel: Arc<dyn KernelFlowReader>,
    pub sink: Arc<dyn FlowExportSink>,
    pub inter_vn: Arc<InterVnStats>,
    pub stats: Arc<AgentStats>,
    pub clock: Arc<dyn TimeSource>,
    /// Resolves an ingress interface index to the bound VM's name.
    pub vm_resolver: Option<Arc<dyn Fn(u32) -> Option<String> + Send + Sync>>,
}

struct PassState {
    /// Last visited key; the next pass resumes from its successor.
    iteration_key: Option<FlowKey>,
    flow_count_per_pass: u32,
    timer_interval_ms: u32,
    age_time: Duration,
    run_counter: u64,
}

pub struct FlowStatsCollector {
    deps: FlowStatsDeps,
    config: FlowStatsConfig,
    state: Mutex<PassState>,
    stopped: AtomicBool,
}

impl FlowStatsCollector {
    pub fn new(deps: FlowStatsDeps, config: FlowStatsConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PassState {
                iteration_key: None,
                flow_count_per_pass: 100,
                timer_interval_ms: config.default_interval_ms,
                age_time: config.age_time,
                run_counter: 0,
            }),
            deps,
            config,
            stopped: AtomicBool::new(false),
        })
    }

    /// Arms the periodic aging timer. Each firing runs one pass and
    /// re-arms with the retuned interval, so passes never interleave.
    pub fn start(self: &Arc<Self>) {
        let interval = self.state.lock().expect("pass state poisoned").timer_interval_ms;
        Self::arm(Arc::clone(self), interval);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn arm(me: Arc<Self>, interval_ms: u32) {
        if me.stopped.load(Ordering::Acquire) {
            return;
        }
        let key = TaskKey::new(me.deps.flow_class, FLOW_STATS_INSTANCE);
        let delay = Duration::from_millis(interval_ms.max(1) as u64);
        let timers = Arc::clone(&me.deps.timers);
        timers.start(delay, key, move || {
            let next = me.run_once();
            Self::arm(Arc::clone(&me), next);
        });
    }

    pub fn set_age_time(&self, age_time: Duration) {
        self.state.lock().expect("pass state poisoned").age_time = age_time;
    }

    /// `(timer_interval_ms, flow_count_per_pass)` after the last pass.
    pub fn pacing(&self) -> (u32, u32) {
        let st = self.state.lock().expect("pass state poisoned");
        (st.timer_interval_ms, st.flow_count_per_pass)
    }

    pub fn run_counter(&self) -> u64 {
        self.state.lock().expect("pass state poisoned").run_counter
    }

    /// Runs one aging pass and returns the retuned interval in ms.
    ///
    /// Normally driven by the timer; tests call it directly.
    pub fn run_once(&self) -> u32 {
        let mut st = self.state.lock().expect("pass state poisoned");
        st.run_counter += 1;

        let age_time_usec = st.age_time.as_micros() as u64;
        let now = self.deps.clock.now_usec();
        let budget = st.flow_count_per_pass;
        let mut count: u32 = 0;
        let mut more_work = false;

        if self.deps.table.size() > 0 {
            let mut cursor = self
                .deps
                .table
                .next_entry(st.iteration_key.as_ref())
                .or_else(|| self.deps.table.next_entry(None));

            while let Some(entry) = cursor {
                let mut next = self.deps.table.next_entry(Some(entry.key()));
                st.iteration_key = Some(*entry.key());

                let k_flow = self.deps.kernel.kernel_flow(entry.flow_handle());
                let mut deleted = false;
                let mut reverse: Option<FlowRef> = None;

                if self.should_be_aged(&entry, k_flow.as_ref(), now, age_time_usec) {
                    reverse = entry.reverse_key().and_then(|k| self.deps.table.find(&k));
                    match &reverse {
                        // A paired flow waits for its partner; both go
                        // together or neither goes.
                        Some(rev) => {
                            let k_rev = self.deps.kernel.kernel_flow(rev.flow_handle());
                            if self.should_be_aged(rev, k_rev.as_ref(), now, age_time_usec) {
                                deleted = true;
                            } else {
                                entry.data().state = FlowState::Aging;
                            }
                        }
                        None => deleted = true,
                    }
                }

                if deleted {
                    // Keep the iterator ahead of the partner we are about
                    // to remove.
                    if let (Some(n), Some(rev)) = (&next, &reverse) {
                        if Arc::ptr_eq(n, rev) {
                            next = self.deps.table.next_entry(Some(rev.key()));
                        }
                    }
                    self.delete_flow(&entry, reverse.is_some(), now);
                    if reverse.is_some() {
                        count += 1;
                        if count == budget {
                            more_work = next.is_some();
                            break;
                        }
                    }
                }

                if !deleted {
                    if let Some(k) = k_flow {
                        self.reconcile(&entry, &k, now);
                    }
                    if entry.is_short_flow() {
                        self.delete_flow(&entry, false, now);
                    }
                }

                count += 1;
                if count == budget {
                    more_work = next.is_some();
                    break;
                }
                cursor = next;
            }
        }

        // Wrapped around (or drained the table): restart from the top
        // next pass.
        if !(count == budget && more_work) {
            st.iteration_key = None;
        }

        self.retune(&mut st);
        debug!(
            "flow aging pass {}: visited {}, interval {}ms, budget {}",
            st.run_counter, count, st.timer_interval_ms, st.flow_count_per_pass
        );
        st.timer_interval_ms
    }

    /// Visit each flow roughly once per age interval: interval shrinks as
    /// the table grows (capped at 1s), and the per-pass budget grows to
    /// match (floored at 100).
    fn retune(&self, st: &mut PassState) {
        let total_flows = self.deps.table.size() as u32;
        let age_time_ms = st.age_time.as_millis() as u32;

        st.timer_interval_ms = if total_flows > 0 {
            ((age_time_ms * self.config.flow_multiplier) / total_flows).min(1000)
        } else {
            self.config.default_interval_ms
        };

        st.flow_count_per_pass = if age_time_ms > 0 {
            ((st.timer_interval_ms * total_flows) / age_time_ms).max(100)
        } else {
            100
        };
    }

    /// Aging eligibility.
    ///
    /// A kernel record whose composed counters have regressed below our
    /// stored low bits means the kernel slot was reused for another flow;
    /// that flow is never aged here. Otherwise eligibility is pure idle
    /// time.
    fn should_be_aged(
        &self,
        entry: &FlowRef,
        k_flow: Option<&KernelFlowRecord>,
        now: u64,
        age_time_usec: u64,
    ) -> bool {
        let data = entry.data();
        if let Some(k) = k_flow {
            let k_bytes = compose_bytes(k.flow_bytes_oflow, k.flow_bytes);
            let k_pkts = compose_packets(k.flow_packets_oflow, k.flow_packets);
            if k_bytes < (data.bytes & BYTES_LOW) || k_pkts < (data.packets & PKTS_LOW) {
                return false;
            }
        }
        now.saturating_sub(data.last_modified_time) >= age_time_usec
    }

    /// Counter reconciliation and delta export for one live flow.
    fn reconcile(&self, entry: &FlowRef, k: &KernelFlowRecord, now: u64) {
        let (diff_bytes, diff_packets, changed) = {
            let mut data = entry.data();
            let k_bytes = compose_bytes(k.flow_bytes_oflow, k.flow_bytes);
            let k_pkts = compose_packets(k.flow_packets_oflow, k.flow_packets);
            let new_bytes = updated_bytes(data.bytes, k_bytes);
            let new_packets = updated_packets(data.packets, k_pkts);
            if new_bytes == data.bytes {
                (0, 0, false)
            } else {
                let diff_bytes = new_bytes - data.bytes;
                let diff_packets = new_packets - data.packets;
                data.bytes = new_bytes;
                data.packets = new_packets;
                data.last_modified_time = now;
                data.state = FlowState::Active;
                (diff_bytes, diff_packets, true)
            }
        };
        if changed {
            let (source_vn, dest_vn) = {
                let data = entry.data();
                (data.source_vn.clone(), data.dest_vn.clone())
            };
            self.deps
                .inter_vn
                .update(&source_vn, &dest_vn, diff_bytes, diff_packets);
            let reverse = entry.reverse_key().and_then(|k| self.deps.table.find(&k));
            self.export_flow(entry, diff_bytes, diff_packets, reverse.as_ref());
        }
    }

    /// Removes a flow (with its partner for paired aging), stamps the
    /// teardown time, and emits the final export for the visited flow.
    fn delete_flow(&self, entry: &FlowRef, delete_reverse: bool, now: u64) {
        let removed = self.deps.table.delete_flow(entry.key(), delete_reverse);
        if removed.is_empty() {
            return;
        }
        for flow in &removed {
            flow.data().teardown_time = Some(now);
            AgentStats::incr(&self.deps.stats.flow_aged);
        }
        let reverse = removed
            .get(1)
            .cloned()
            .or_else(|| entry.reverse_key().and_then(|k| self.deps.table.find(&k)));
        self.export_flow(&removed[0], 0, 0, reverse.as_ref());
    }

    /// Emits export records for one flow.
    ///
    /// Local flows are exported twice (ingress first, then egress under
    /// the flow's egress UUID) so analytics can query either direction
    /// without de-duplication.
    fn export_flow(
        &self,
        flow: &FlowRef,
        diff_bytes: u64,
        diff_packets: u64,
        reverse: Option<&FlowRef>,
    ) {
        let data = flow.data();
        let mut rec = FlowDataIpv4 {
            flowuuid: flow.uuid().to_string(),
            sourceip: Some(flow.key().src_ip),
            destip: Some(flow.key().dst_ip),
            protocol: Some(flow.key().proto),
            sport: Some(flow.key().src_port),
            dport: Some(flow.key().dst_port),
            sourcevn: Some(data.source_vn.clone()),
            destvn: Some(data.dest_vn.clone()),
            bytes: Some(data.bytes),
            packets: Some(data.packets),
            diff_bytes: Some(diff_bytes),
            diff_packets: Some(diff_packets),
            reverse_uuid: reverse.map(|r| r.uuid().to_string()),
            setup_time: Some(data.setup_time),
            teardown_time: data.teardown_time,
            ..Default::default()
        };

        if let (Some(resolver), Some(intf)) = (&self.deps.vm_resolver, data.intf_in) {
            rec.vm = resolver(intf);
        }

        let local = data.local;
        let ingress = data.ingress;
        let nat = data.nat;
        drop(data);

        if local {
            rec.direction_ing = Some(1);
            self.source_ip_override(flow, nat, reverse, &mut rec);
            self.send(&rec);
            rec.direction_ing = Some(0);
            rec.flowuuid = flow.egress_uuid().to_string();
            self.send(&rec);
        } else {
            if ingress {
                rec.direction_ing = Some(1);
                self.source_ip_override(flow, nat, reverse, &mut rec);
            } else {
                rec.direction_ing = Some(0);
            }
            self.send(&rec);
        }
    }

    /// For NAT-ed ingress flows the analytics consumer wants the post-NAT
    /// source as seen by the VM: the reverse-flow key's destination.
    fn source_ip_override(
        &self,
        flow: &FlowRef,
        nat: bool,
        reverse: Option<&FlowRef>,
        rec: &mut FlowDataIpv4,
    ) {
        if !nat || rec.direction_ing != Some(1) {
            return;
        }
        if let Some(rev) = reverse {
            if flow.key().src_ip != rev.key().dst_ip {
                rec.sourceip = Some(rev.key().dst_ip);
            }
        }
    }

    fn send(&self, rec: &FlowDataIpv4) {
        self.deps.sink.export(rec);
        AgentStats::incr(&self.deps.stats.flow_exported);
    }
}

#[inline]
fn compose_bytes(oflow: u16, bytes: u32) -> u64 {
    ((oflow as u64) << 32) | bytes as u64
}

#[inline]
fn compose_packets(oflow: u8, packets: u32) -> u64 {
    ((oflow as u64) << 40) | packets as u64
}

/// Folds a freshly composed kernel byte counter into the stored 64-bit
/// value, bumping the userspace-held carry when the kernel counter reset.
#[inline]
fn updated_bytes(stored: u64, k_bytes: u64) -> u64 {
    let mut high = stored & BYTES_HIGH;
    if (stored & BYTES_LOW) > k_bytes {
        high += BYTES_CARRY;
    }
    high | k_bytes
}

#[inline]
fn updated_packets(stored: u64, k_packets: u64) -> u64 {
    let mut high = stored & PKTS_HIGH;
    if (stored & PKTS_LOW) > k_packets {
        high += PKTS_CARRY;
    }
    high | k_packets
}
