use super::*;

use std::time::Duration;

#[derive(Deserialize)]
pub struct General {
    // how often the collectors are polled by the bundled binary
    #[serde(default = "interval")]
    interval: String,

    // mount point of the cgroup hierarchy, v1 controllers are found below it
    #[serde(default = "cgroup_root")]
    cgroup_root: String,
}

impl Default for General {
    fn default() -> Self {
        Self {
            interval: interval(),
            cgroup_root: cgroup_root(),
        }
    }
}

impl General {
    pub fn check(&self) -> Result<(), ConfigError> {
        self.interval.parse::<humantime::Duration>()?;
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        self.interval
            .parse::<humantime::Duration>()
            .map(Into::into)
            .unwrap_or(Duration::from_secs(1))
    }

    pub fn cgroup_root(&self) -> &Path {
        Path::new(&self.cgroup_root)
    }
}
