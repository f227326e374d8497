//! Timing of the detection and parse windows
//!
//! The dispatcher brackets every protocol-detection attempt and every
//! parser invocation. With the no-op profiler those brackets compile to
//! nothing; the histogram profiler records latencies and per-protocol
//! totals for capacity analysis.

use std::collections::HashMap;
use std::time::Duration;

use hdrhistogram::Histogram;
use serde::Serialize;

use crate::protocols::AppProto;

/// Profiling sink for one worker's app-layer windows
pub trait Profiler: Default + Send {
    /// Compile-time switch; when false the dispatcher skips the clock
    /// reads entirely
    const ENABLED: bool;

    /// A protocol-detection window closed
    fn record_proto_detect(&mut self, elapsed: Duration);

    /// A parse window closed for `alproto`
    fn record_parse(&mut self, alproto: AppProto, elapsed: Duration);

    /// A packet finished dispatch; flush per-packet accounting
    fn finish_packet(&mut self);
}

/// Disabled profiling; every hook is a no-op
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProfiler;

impl Profiler for NoopProfiler {
    const ENABLED: bool = false;

    fn record_proto_detect(&mut self, _elapsed: Duration) {}

    fn record_parse(&mut self, _alproto: AppProto, _elapsed: Duration) {}

    fn finish_packet(&mut self) {}
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
struct ProtoTotals {
    calls: u64,
    total_ns: u64,
}

/// Histogram-backed profiler
#[derive(Debug)]
pub struct HistProfiler {
    detect_hist: Histogram<u64>,
    parse_hist: Histogram<u64>,
    per_proto: HashMap<AppProto, ProtoTotals>,
    packets: u64,
}

impl Default for HistProfiler {
    fn default() -> Self {
        // 1ns to 1 second, 3 significant digits
        let detect_hist =
            Histogram::new_with_bounds(1, 1_000_000_000, 3).expect("Failed to create histogram");
        let parse_hist =
            Histogram::new_with_bounds(1, 1_000_000_000, 3).expect("Failed to create histogram");
        Self {
            detect_hist,
            parse_hist,
            per_proto: HashMap::new(),
            packets: 0,
        }
    }
}

impl HistProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detection-window latency percentile in nanoseconds
    pub fn detect_percentile(&self, p: f64) -> u64 {
        self.detect_hist.value_at_percentile(p)
    }

    /// Parse-window latency percentile in nanoseconds
    pub fn parse_percentile(&self, p: f64) -> u64 {
        self.parse_hist.value_at_percentile(p)
    }

    /// Packets dispatched since creation
    pub fn packets(&self) -> u64 {
        self.packets
    }

    /// Snapshot for reporting
    pub fn snapshot(&self) -> ProfileSnapshot {
        let mut per_proto: Vec<ProtoProfileSnapshot> = self
            .per_proto
            .iter()
            .map(|(alproto, totals)| ProtoProfileSnapshot {
                alproto: *alproto,
                parse_calls: totals.calls,
                parse_total_ns: totals.total_ns,
            })
            .collect();
        per_proto.sort_by_key(|s| s.alproto.0);

        ProfileSnapshot {
            detect_count: self.detect_hist.len(),
            detect_p50_ns: self.detect_hist.value_at_percentile(50.0),
            detect_p95_ns: self.detect_hist.value_at_percentile(95.0),
            detect_p99_ns: self.detect_hist.value_at_percentile(99.0),
            parse_count: self.parse_hist.len(),
            parse_p50_ns: self.parse_hist.value_at_percentile(50.0),
            parse_p95_ns: self.parse_hist.value_at_percentile(95.0),
            parse_p99_ns: self.parse_hist.value_at_percentile(99.0),
            packets: self.packets,
            per_proto,
        }
    }
}

impl Profiler for HistProfiler {
    const ENABLED: bool = true;

    fn record_proto_detect(&mut self, elapsed: Duration) {
        let ns = (elapsed.as_nanos() as u64).clamp(1, 1_000_000_000);
        let _ = self.detect_hist.record(ns);
    }

    fn record_parse(&mut self, alproto: AppProto, elapsed: Duration) {
        let ns = (elapsed.as_nanos() as u64).clamp(1, 1_000_000_000);
        let _ = self.parse_hist.record(ns);
        let totals = self.per_proto.entry(alproto).or_default();
        totals.calls += 1;
        totals.total_ns += ns;
    }

    fn finish_packet(&mut self) {
        self.packets += 1;
    }
}

/// Per-protocol parse totals (for reporting)
#[derive(Debug, Clone, Serialize)]
pub struct ProtoProfileSnapshot {
    pub alproto: AppProto,
    pub parse_calls: u64,
    pub parse_total_ns: u64,
}

/// Snapshot of one worker's app-layer timing
#[derive(Debug, Clone, Serialize)]
pub struct ProfileSnapshot {
    pub detect_count: u64,
    pub detect_p50_ns: u64,
    pub detect_p95_ns: u64,
    pub detect_p99_ns: u64,
    pub parse_count: u64,
    pub parse_p50_ns: u64,
    pub parse_p95_ns: u64,
    pub parse_p99_ns: u64,
    pub packets: u64,
    pub per_proto: Vec<ProtoProfileSnapshot>,
}
