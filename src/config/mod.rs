use serde::Deserialize;

use std::path::{Path, PathBuf};

mod general;
mod log;
mod perf;
mod resctrl;

pub use general::General;
pub use log::{Log, LogLevel};
pub use perf::{CustomEvent, EventSet, Group, PerfConfig, PerfEvents};
pub use resctrl::ResctrlConfig;

fn enabled() -> bool {
    true
}

fn interval() -> String {
    "1s".into()
}

fn cgroup_root() -> String {
    "/sys/fs/cgroup".into()
}

/// Error types for configuration loading and validation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to open config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to parse perf events file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("interval couldn't be parsed: {0}")]
    Interval(#[from] humantime::DurationError),
    #[error("event group {group} is empty")]
    EmptyGroup { group: usize },
    #[error("event {event:?} appears more than once in group {group}")]
    DuplicateEvent { event: String, group: usize },
    #[error("custom event {name:?} has {count} config words, expected 1 to 3")]
    CustomEventConfig { name: String, count: usize },
}

#[derive(Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    general: General,
    #[serde(default)]
    log: Log,
    #[serde(default)]
    perf: PerfConfig,
    #[serde(default)]
    resctrl: ResctrlConfig,
}

impl Config {
    pub fn load(path: &dyn AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;

        config.general.check()?;
        config.perf.events().check()?;

        Ok(config)
    }

    pub fn general(&self) -> &General {
        &self.general
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn perf(&self) -> &PerfConfig {
        &self.perf
    }

    pub fn resctrl(&self) -> &ResctrlConfig {
        &self.resctrl
    }

    /// Replace the configured perf events, eg with ones loaded from a
    /// standalone events file.
    pub fn set_perf_events(&mut self, events: PerfEvents) -> Result<(), ConfigError> {
        events.check()?;
        self.perf.set_events(events);
        Ok(())
    }
}
