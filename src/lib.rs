//! Per-container hardware telemetry.
//!
//! Two collectors are provided, both driven through the [`Collector`] trait:
//!
//! * [`perf::PerfCollector`] counts groups of perf events on every online CPU,
//!   restricted to the container's cgroup, and corrects the values for
//!   counter multiplexing.
//! * [`resctrl::ResctrlCollector`] reports memory bandwidth and last level
//!   cache occupancy for a monitoring group that holds the container's
//!   processes.
//!
//! A scheduler creates one collector of each kind per container through
//! [`perf::PerfManager`] and [`resctrl::ResctrlManager`], polls them with
//! [`Collector::update_stats`] and finally calls [`Collector::destroy`].

#[cfg(not(target_os = "linux"))]
compile_error!("hwtelemetry only supports Linux");

mod collector;
mod error;

pub mod config;
pub mod perf;
pub mod resctrl;
pub mod stats;

pub use collector::{Collector, NoopCollector};
pub use error::{Error, Result};
pub use stats::ContainerStats;
