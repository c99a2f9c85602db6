//! Read the CPU and NUMA topology of the current system from sysfs.
//!
//! Only the pieces needed to place per-CPU perf counters are gathered: the
//! online CPU list, the package each CPU belongs to, and the online memory
//! nodes.

#[macro_use]
extern crate serde;

mod cpu;
mod error;
mod util;

pub use crate::cpu::{Cpu, Topology};
pub use crate::error::{Error, Result};

/// Read the [`Topology`] for the current system.
pub fn topology() -> Result<Topology> {
    Topology::new()
}

/// Read the list of online CPU ids for the current system.
pub fn online_cpus() -> Result<Vec<usize>> {
    util::read_list("/sys/devices/system/cpu/online")
}
