use metriken::*;

#[metric(
    name = "resctrl_groups",
    description = "The number of monitoring groups currently provisioned by container collectors"
)]
pub static RESCTRL_GROUPS: LazyGauge = LazyGauge::new(Gauge::default);

#[metric(
    name = "resctrl_pids_assigned",
    description = "The number of pids written into monitoring groups",
    metadata = { unit = "pids" }
)]
pub static RESCTRL_PIDS_ASSIGNED: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "resctrl_pids_exited",
    description = "The number of pids which exited before they could be assigned",
    metadata = { unit = "pids" }
)]
pub static RESCTRL_PIDS_EXITED: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "resctrl_read_errors",
    description = "The number of failed monitoring group counter reads"
)]
pub static RESCTRL_READ_ERRORS: LazyCounter = LazyCounter::new(Counter::default);
