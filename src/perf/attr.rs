use crate::config::CustomEvent;

use perf_event_open_sys::bindings::{self, perf_event_attr};

use core::fmt;

/// The low-level encoding of an event: a PMU type and the three config words.
///
/// Produced either directly from a [`CustomEvent`] or by an
/// [`EventResolver`](super::EventResolver) from a symbolic name.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EventConfig {
    pub type_: u32,
    pub config: u64,
    pub config1: u64,
    pub config2: u64,
}

impl EventConfig {
    pub fn new(type_: u32, config: u64) -> Self {
        Self {
            type_,
            config,
            ..Default::default()
        }
    }

    pub fn with_config1(mut self, config1: u64) -> Self {
        self.config1 = config1;
        self
    }

    pub fn with_config2(mut self, config2: u64) -> Self {
        self.config2 = config2;
        self
    }

    /// Raw path: the config words of a custom event are used as is.
    pub fn from_custom(event: &CustomEvent) -> Self {
        let word = |index: usize| event.config.get(index).copied().unwrap_or(0);

        Self::new(event.type_, word(0))
            .with_config1(word(1))
            .with_config2(word(2))
    }

    /// Build the attributes used to open this event as a member of a counter
    /// group. Every member reads in group format with enabled/running times
    /// and ids, is inherited by child tasks and excludes guest execution. The
    /// leader is opened disabled so that nothing counts until the whole group
    /// has been assembled.
    pub fn attributes(&self, leader: bool) -> perf_event_attr {
        let mut attr = perf_event_attr::default();

        // Setting `size` accurately will not prevent the code from working
        // on older kernels.
        attr.size = std::mem::size_of::<perf_event_attr>() as u32;
        attr.type_ = self.type_;
        attr.config = self.config;
        attr.__bindgen_anon_3.config1 = self.config1;
        attr.__bindgen_anon_4.config2 = self.config2;

        attr.sample_type = bindings::PERF_SAMPLE_IDENTIFIER as u64;
        attr.read_format = bindings::PERF_FORMAT_TOTAL_TIME_ENABLED as u64
            | bindings::PERF_FORMAT_TOTAL_TIME_RUNNING as u64
            | bindings::PERF_FORMAT_GROUP as u64
            | bindings::PERF_FORMAT_ID as u64;

        attr.set_inherit(1);
        attr.set_exclude_guest(1);

        if leader {
            attr.set_disabled(1);
        }

        attr
    }
}

impl fmt::Display for EventConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type={} config={:#x} config1={:#x} config2={:#x}",
            self.type_, self.config, self.config1, self.config2
        )
    }
}
