use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::util::*;
use crate::Result;

const SYSFS_DEVICES_SYSTEM: &str = "/sys/devices/system";

#[non_exhaustive]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cpu {
    pub id: usize,
    pub package_id: usize,
}

impl Cpu {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn package(&self) -> usize {
        self.package_id
    }
}

#[non_exhaustive]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Topology {
    pub cpus: Vec<Cpu>,
    pub nodes: Vec<usize>,
}

impl Topology {
    pub fn new() -> Result<Self> {
        Self::from_sysfs(SYSFS_DEVICES_SYSTEM)
    }

    /// Read the topology rooted at `root`, which mirrors
    /// `/sys/devices/system`.
    pub fn from_sysfs(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();

        let mut cpus = Vec::new();

        for id in read_list(root.join("cpu/online"))? {
            // offline-capable platforms may hide topology for a cpu that is
            // online but not yet fully initialized, treat it as package 0
            let package_id = read_usize(cpu_dir(root, id).join("topology/physical_package_id"))
                .unwrap_or(0);

            cpus.push(Cpu { id, package_id });
        }

        // Some platforms do not expose node topology. Consider everything part
        // of a single node in that case.
        let nodes = read_list(root.join("node/online")).unwrap_or_else(|_| vec![0]);

        Ok(Self { cpus, nodes })
    }

    pub fn online_cpus(&self) -> Vec<usize> {
        self.cpus.iter().map(|cpu| cpu.id).collect()
    }

    /// Map of cpu id to the package (socket) it belongs to.
    pub fn cpu_to_package(&self) -> BTreeMap<usize, usize> {
        self.cpus.iter().map(|cpu| (cpu.id, cpu.package_id)).collect()
    }

    pub fn packages(&self) -> usize {
        let mut packages: Vec<usize> = self.cpus.iter().map(|cpu| cpu.package_id).collect();
        packages.sort_unstable();
        packages.dedup();
        packages.len()
    }

    pub fn nodes(&self) -> &[usize] {
        &self.nodes
    }
}

fn cpu_dir(root: &Path, id: usize) -> PathBuf {
    root.join(format!("cpu/cpu{id}"))
}
