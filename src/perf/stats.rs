use metriken::*;

#[metric(
    name = "perf_descriptors_open",
    description = "The number of perf counter descriptors currently held open by container collectors"
)]
pub static PERF_DESCRIPTORS_OPEN: LazyGauge = LazyGauge::new(Gauge::default);

#[metric(
    name = "perf_group_reads",
    description = "The number of successful per-CPU perf group reads",
    metadata = { unit = "reads" }
)]
pub static PERF_GROUP_READS: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "perf_group_read_errors",
    description = "The number of per-CPU perf group reads which failed or could not be decoded",
    metadata = { unit = "reads" }
)]
pub static PERF_GROUP_READ_ERRORS: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "perf_descriptor_close_errors",
    description = "The number of perf counter descriptors which failed to close cleanly"
)]
pub static PERF_CLOSE_ERRORS: LazyCounter = LazyCounter::new(Counter::default);
