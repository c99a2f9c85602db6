//! Collects cache and memory bandwidth monitoring data for a single container
//! through the resctrl filesystem.
//!
//! Each container gets its own monitoring group under `mon_groups/` and every
//! process in the container's cgroup is moved into it. The kernel then
//! aggregates the L3 monitoring counters per group and per domain. The root
//! container is served by the resctrl root itself and is never provisioned or
//! removed.

mod cgroup;
mod group;
mod stats;

pub use cgroup::CgroupVersion;
pub use group::{group_name, Features, MonitoringGroup};

use crate::collector::{Collector, NoopCollector};
use crate::config::ResctrlConfig;
use crate::stats::ContainerStats;

use parking_lot::Mutex;
use stats::*;
use tracing::{debug, error, info};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

const NAME: &str = "resctrl";

/// The identifier of the container that stands for the whole machine.
pub const ROOT_CONTAINER: &str = "/";

const DEFAULT_ROOT: &str = "/sys/fs/resctrl";
const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Error types for resctrl monitoring
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to read monitoring features from {path}: {source}")]
    ReadFeatures {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unable to detect the cgroup hierarchy at {path}: {source}")]
    DetectCgroup {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("container id {id:?} does not name a monitoring group")]
    InvalidId { id: String },
    #[error("unable to create monitoring group {path}: {source}")]
    CreateGroup {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unable to assign pid {pid} to {path}: {source}")]
    Assign {
        pid: u32,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unable to enumerate cgroup {path}: {source}")]
    ListPids {
        path: PathBuf,
        source: walkdir::Error,
    },
    #[error("unable to read pids from {path}: {source}")]
    ReadPids {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid pid {value:?} in {path}")]
    ParsePid { path: PathBuf, value: String },
    #[error("unable to read monitoring data from {path}: {source}")]
    ReadCounters {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid counter value {value:?} in {path}")]
    ParseCounter { path: PathBuf, value: String },
}

pub struct ResctrlCollector {
    id: String,
    group: MonitoringGroup,
    pids_path: Option<PathBuf>,
    assigned: Mutex<BTreeSet<u32>>,
}

impl ResctrlCollector {
    /// Create the collector for container `id`. For any container other than
    /// the root this provisions the monitoring group and moves the current
    /// processes of the container into it.
    pub fn new(
        id: &str,
        resctrl_root: &Path,
        features: Features,
        cgroup_root: &Path,
        cgroup_version: CgroupVersion,
    ) -> Result<Self, Error> {
        if id == ROOT_CONTAINER {
            return Ok(Self {
                id: id.to_owned(),
                group: MonitoringGroup::root(resctrl_root, features),
                pids_path: None,
                assigned: Mutex::new(BTreeSet::new()),
            });
        }

        let pids_path = cgroup_version.pids_path(cgroup_root, id);
        let group = MonitoringGroup::create(resctrl_root, id, features)?;

        RESCTRL_GROUPS.increment();

        let collector = Self {
            id: id.to_owned(),
            group,
            pids_path: Some(pids_path),
            assigned: Mutex::new(BTreeSet::new()),
        };

        if let Err(e) = collector.update_pids() {
            collector.destroy();
            return Err(e);
        }

        Ok(collector)
    }

    /// Where the pids of the container are read from. `None` for the root.
    pub fn pids_path(&self) -> Option<&Path> {
        self.pids_path.as_deref()
    }

    /// Every pid that has been moved into the monitoring group so far.
    pub fn pids(&self) -> BTreeSet<u32> {
        self.assigned.lock().clone()
    }

    fn is_root(&self) -> bool {
        self.pids_path.is_none()
    }

    /// Write every current process of the container into the group. A task
    /// can be moved out of the group by others between polls, so pids seen
    /// before are written again. Pids are never removed: the kernel drops
    /// exited tasks from the group on its own.
    fn update_pids(&self) -> Result<(), Error> {
        let Some(path) = &self.pids_path else {
            return Ok(());
        };

        let pids = cgroup::pids(path)?;

        let mut assigned = self.assigned.lock();

        for pid in pids {
            if self.group.assign(pid)? {
                if assigned.insert(pid) {
                    RESCTRL_PIDS_ASSIGNED.increment();
                }
            } else {
                RESCTRL_PIDS_EXITED.increment();
                debug!("pid {pid} of container {} exited before assignment", self.id);
            }
        }

        Ok(())
    }
}

impl Collector for ResctrlCollector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn update_stats(&self, stats: &mut ContainerStats) -> crate::Result<()> {
        stats.resctrl = self.group.read_stats().inspect_err(|_| {
            RESCTRL_READ_ERRORS.increment();
        })?;

        self.update_pids()?;

        Ok(())
    }

    fn destroy(&self) {
        if self.is_root() {
            return;
        }

        RESCTRL_GROUPS.decrement();

        if let Err(e) = self.group.remove() {
            error!(
                "unable to remove monitoring group {:?} of container {}: {e}",
                self.group.path(),
                self.id
            );
        }
    }
}

struct Host {
    resctrl_root: PathBuf,
    features: Features,
    cgroup_root: PathBuf,
    cgroup_version: CgroupVersion,
}

/// Hands out a resctrl collector per container.
pub struct ResctrlManager {
    host: Option<Host>,
}

impl ResctrlManager {
    /// Inspect the host. If resctrl is disabled, not mounted or offers no L3
    /// monitoring the manager only hands out no-op collectors.
    pub fn new(config: &ResctrlConfig, cgroup_root: &Path) -> Self {
        if !config.enabled() {
            info!("resctrl monitoring is disabled");
            return Self::unavailable();
        }

        let resctrl_root = match config.root() {
            Some(root) => root.to_path_buf(),
            None => mount_point().unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT)),
        };

        match Self::with_root(&resctrl_root, cgroup_root) {
            Ok(manager) => manager,
            Err(e) => {
                info!("resctrl monitoring is unavailable: {e}");
                Self::unavailable()
            }
        }
    }

    /// Use the resctrl filesystem mounted at `resctrl_root`.
    pub fn with_root(resctrl_root: &Path, cgroup_root: &Path) -> Result<Self, Error> {
        let features = Features::read(resctrl_root)?;

        if !features.any() {
            info!("resctrl at {resctrl_root:?} supports no L3 monitoring events");
            return Ok(Self::unavailable());
        }

        let cgroup_version =
            CgroupVersion::detect(cgroup_root).map_err(|source| Error::DetectCgroup {
                path: cgroup_root.to_path_buf(),
                source,
            })?;

        debug!(
            "resctrl at {resctrl_root:?} with {features:?}, cgroup {cgroup_version:?} at {cgroup_root:?}"
        );

        Ok(Self {
            host: Some(Host {
                resctrl_root: resctrl_root.to_path_buf(),
                features,
                cgroup_root: cgroup_root.to_path_buf(),
                cgroup_version,
            }),
        })
    }

    pub fn unavailable() -> Self {
        Self { host: None }
    }

    pub fn is_available(&self) -> bool {
        self.host.is_some()
    }

    pub fn get_collector(&self, id: &str) -> Result<Box<dyn Collector>, Error> {
        let Some(host) = &self.host else {
            return Ok(Box::new(NoopCollector::new()));
        };

        let collector = ResctrlCollector::new(
            id,
            &host.resctrl_root,
            host.features,
            &host.cgroup_root,
            host.cgroup_version,
        )?;

        Ok(Box::new(collector))
    }
}

fn mount_point() -> Option<PathBuf> {
    let mountinfo = std::fs::read_to_string(MOUNTINFO).ok()?;

    find_mount(&mountinfo)
}

/// Find the first resctrl mount in a `/proc/<pid>/mountinfo` listing.
fn find_mount(mountinfo: &str) -> Option<PathBuf> {
    mountinfo.lines().find_map(|line| {
        let (mount, fs) = line.split_once(" - ")?;

        if fs.split_whitespace().next()? != "resctrl" {
            return None;
        }

        mount.split_whitespace().nth(4).map(unescape).map(PathBuf::from)
    })
}

// mountinfo escapes whitespace and backslashes as three digit octal
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            if let Some(byte) = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|octal| u8::from_str_radix(octal, 8).ok())
            {
                out.push(byte);
                i += 4;
                continue;
            }
        }

        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}
