use super::Error;

use walkdir::WalkDir;

use std::collections::BTreeSet;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

const CGROUP2_SUPER_MAGIC: u64 = 0x6367_7270;

const PROCS: &str = "cgroup.procs";

/// The layout of the cgroup hierarchy, which decides where a container's
/// processes are listed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

impl CgroupVersion {
    /// Detect the hierarchy mounted at `cgroup_root` from its filesystem
    /// magic. Anything other than cgroup2 is treated as a v1 layout.
    pub fn detect(cgroup_root: &Path) -> std::io::Result<Self> {
        let path = CString::new(cgroup_root.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: `statfs` is plain old data and the path is nul terminated.
        let mut buf: libc::statfs = unsafe { std::mem::zeroed() };

        if unsafe { libc::statfs(path.as_ptr(), &mut buf) } < 0 {
            return Err(std::io::Error::last_os_error());
        }

        #[allow(clippy::unnecessary_cast)]
        if buf.f_type as u64 == CGROUP2_SUPER_MAGIC {
            Ok(Self::V2)
        } else {
            Ok(Self::V1)
        }
    }

    /// The directory whose process lists hold the pids of container `id`.
    pub fn pids_path(self, cgroup_root: &Path, id: &str) -> PathBuf {
        self.controller_path(cgroup_root, "cpu", id)
    }

    /// The cgroup directory of container `id` for `controller`. On the unified
    /// hierarchy every controller shares the same directory.
    pub fn controller_path(self, cgroup_root: &Path, controller: &str, id: &str) -> PathBuf {
        let id = id.trim_start_matches('/');

        match self {
            Self::V2 => cgroup_root.join(id),
            Self::V1 => cgroup_root.join(controller).join(id),
        }
    }
}

/// Every pid in the cgroup at `path` and its descendants.
pub fn pids(path: &Path) -> Result<BTreeSet<u32>, Error> {
    let mut pids = BTreeSet::new();

    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|source| Error::ListPids {
            path: path.to_path_buf(),
            source,
        })?;

        if entry.file_type().is_file() && entry.file_name() == PROCS {
            read_procs(entry.path(), &mut pids)?;
        }
    }

    Ok(pids)
}

fn read_procs(path: &Path, pids: &mut BTreeSet<u32>) -> Result<(), Error> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        // the cgroup was removed while we walked it
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(Error::ReadPids {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let pid = line.parse().map_err(|_| Error::ParsePid {
            path: path.to_path_buf(),
            value: line.to_owned(),
        })?;

        pids.insert(pid);
    }

    Ok(())
}
