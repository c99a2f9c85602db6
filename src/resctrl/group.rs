use super::Error;
use crate::stats::{CacheStats, MemoryBandwidthStats, ResctrlStats};

use tracing::debug;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

const MON_FEATURES: &str = "info/L3_MON/mon_features";
const MON_GROUPS: &str = "mon_groups";
const MON_DATA: &str = "mon_data";
const L3_DOMAIN_PREFIX: &str = "mon_L3_";
const TASKS: &str = "tasks";

const MBM_TOTAL: &str = "mbm_total_bytes";
const MBM_LOCAL: &str = "mbm_local_bytes";
const LLC_OCCUPANCY: &str = "llc_occupancy";

/// The L3 monitoring events the host supports.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Features {
    pub mbm_total: bool,
    pub mbm_local: bool,
    pub llc_occupancy: bool,
}

impl Features {
    pub fn read(resctrl_root: &Path) -> Result<Self, Error> {
        let path = resctrl_root.join(MON_FEATURES);

        let content = std::fs::read_to_string(&path)
            .map_err(|source| Error::ReadFeatures { path, source })?;

        Ok(Self::parse(&content))
    }

    fn parse(content: &str) -> Self {
        let mut features = Self::default();

        for line in content.lines() {
            match line.trim() {
                MBM_TOTAL => features.mbm_total = true,
                MBM_LOCAL => features.mbm_local = true,
                LLC_OCCUPANCY => features.llc_occupancy = true,
                _ => {}
            }
        }

        features
    }

    /// Memory bandwidth monitoring.
    pub fn mbm(&self) -> bool {
        self.mbm_total || self.mbm_local
    }

    /// Cache occupancy monitoring.
    pub fn cmt(&self) -> bool {
        self.llc_occupancy
    }

    pub fn any(&self) -> bool {
        self.mbm() || self.cmt()
    }
}

/// A directory in the resctrl filesystem that the kernel aggregates counters
/// for.
#[derive(Debug)]
pub struct MonitoringGroup {
    path: PathBuf,
    features: Features,
}

impl MonitoringGroup {
    /// The resctrl root itself, which monitors every task on the machine.
    pub fn root(resctrl_root: &Path, features: Features) -> Self {
        Self {
            path: resctrl_root.to_path_buf(),
            features,
        }
    }

    /// Provision the monitoring group for container `id`.
    pub fn create(resctrl_root: &Path, id: &str, features: Features) -> Result<Self, Error> {
        let name = group_name(id).ok_or_else(|| Error::InvalidId { id: id.to_owned() })?;
        let path = resctrl_root.join(MON_GROUPS).join(name);

        std::fs::create_dir_all(&path).map_err(|source| Error::CreateGroup {
            path: path.clone(),
            source,
        })?;

        debug!("created monitoring group {path:?} for container {id}");

        Ok(Self { path, features })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move `pid` into this group. Returns `false` when the process exited
    /// before it could be moved.
    pub fn assign(&self, pid: u32) -> Result<bool, Error> {
        let path = self.path.join(TASKS);

        let result = OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{pid}"));

        match result {
            Ok(()) => Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Ok(false),
            Err(source) => Err(Error::Assign { pid, path, source }),
        }
    }

    /// Read the counters of every L3 monitoring domain, ordered by domain id.
    pub fn read_stats(&self) -> Result<ResctrlStats, Error> {
        let mut stats = ResctrlStats::default();

        for domain in self.domains()? {
            if self.features.mbm() {
                stats.memory_bandwidth.push(MemoryBandwidthStats {
                    total_bytes: self.read_counter(&domain, MBM_TOTAL, self.features.mbm_total)?,
                    local_bytes: self.read_counter(&domain, MBM_LOCAL, self.features.mbm_local)?,
                });
            }

            if self.features.cmt() {
                stats.cache.push(CacheStats {
                    llc_occupancy: self.read_counter(&domain, LLC_OCCUPANCY, true)?,
                });
            }
        }

        Ok(stats)
    }

    fn domains(&self) -> Result<Vec<PathBuf>, Error> {
        let path = self.path.join(MON_DATA);

        let entries = std::fs::read_dir(&path).map_err(|source| Error::ReadCounters {
            path: path.clone(),
            source,
        })?;

        let mut domains = Vec::new();

        for entry in entries {
            let entry = entry.map_err(|source| Error::ReadCounters {
                path: path.clone(),
                source,
            })?;

            let name = entry.file_name();
            let id = name
                .to_str()
                .and_then(|n| n.strip_prefix(L3_DOMAIN_PREFIX))
                .and_then(|id| id.parse::<u32>().ok());

            if let Some(id) = id {
                domains.push((id, entry.path()));
            }
        }

        domains.sort_unstable_by_key(|(id, _)| *id);

        Ok(domains.into_iter().map(|(_, path)| path).collect())
    }

    fn read_counter(&self, domain: &Path, counter: &str, supported: bool) -> Result<u64, Error> {
        if !supported {
            return Ok(0);
        }

        let path = domain.join(counter);

        let content = std::fs::read_to_string(&path).map_err(|source| Error::ReadCounters {
            path: path.clone(),
            source,
        })?;

        content.trim().parse().map_err(|_| Error::ParseCounter {
            path,
            value: content.trim().to_owned(),
        })
    }

    /// Remove the group directory. The kernel moves its tasks back to the
    /// parent group.
    pub fn remove(&self) -> std::io::Result<()> {
        std::fs::remove_dir(&self.path)
    }
}

/// The directory name used for the monitoring group of container `id`, which
/// must be an absolute cgroup path such as `/docker/abc`.
///
/// Separators become `-`, so `-` and the `%` escape character are themselves
/// escaped and distinct containers never share a group. Returns `None` for
/// ids that have no usable directory name.
pub fn group_name(id: &str) -> Option<String> {
    let relative = id.strip_prefix('/')?;

    let mut name = String::with_capacity(relative.len());

    for c in relative.chars() {
        match c {
            '%' => name.push_str("%25"),
            '-' => name.push_str("%2D"),
            '/' => name.push('-'),
            c => name.push(c),
        }
    }

    match name.as_str() {
        "" | "." | ".." => None,
        _ => Some(name),
    }
}
