use crate::stats::ContainerStats;
use crate::Result;

/// A source of telemetry for a single container.
///
/// A collector is constructed for one container, polled with
/// [`Collector::update_stats`] for the lifetime of that container and torn down
/// with exactly one call to [`Collector::destroy`]. Polling after `destroy` is
/// not supported.
pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fill in the parts of `stats` this collector is responsible for.
    fn update_stats(&self, stats: &mut ContainerStats) -> Result<()>;

    /// Release every resource held by the collector. Failures are logged, the
    /// teardown always runs to completion.
    fn destroy(&self);
}

/// A collector which does nothing, handed out when a facility is disabled or
/// unsupported on this host.
#[derive(Default)]
pub struct NoopCollector {}

impl NoopCollector {
    pub fn new() -> Self {
        Self {}
    }
}

impl Collector for NoopCollector {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn update_stats(&self, _stats: &mut ContainerStats) -> Result<()> {
        Ok(())
    }

    fn destroy(&self) {}
}
