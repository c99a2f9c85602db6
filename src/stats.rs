//! The per-container record the collectors fill in.

use serde::Serialize;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ContainerStats {
    /// Per-CPU perf counter values, core counters first followed by any
    /// uncore counters.
    pub perf_stats: Vec<PerfStat>,
    pub resctrl: ResctrlStats,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PerfStat {
    pub cpu: usize,
    #[serde(flatten)]
    pub value: PerfValue,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PerfValue {
    pub name: String,
    /// The counter value corrected for time multiplexing.
    pub value: u64,
    /// Fraction of the enabled time the counter was running, reported so
    /// consumers can judge how much of the value was extrapolated.
    pub scaling_ratio: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ResctrlStats {
    /// One entry per L3 monitoring domain, ordered by domain id.
    pub memory_bandwidth: Vec<MemoryBandwidthStats>,
    /// One entry per L3 monitoring domain, ordered by domain id.
    pub cache: Vec<CacheStats>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemoryBandwidthStats {
    pub total_bytes: u64,
    pub local_bytes: u64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub llc_occupancy: u64,
}
