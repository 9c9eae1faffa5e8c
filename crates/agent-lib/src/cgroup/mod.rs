//! Cgroup filesystem access
//!
//! This module knows where the kubelet places pod and container cgroups
//! (cgroupfs and systemd drivers, v1 and v2 hierarchies) and provides the
//! read/write primitive the resource executor uses for `cpuset.cpus`.

mod fs;
mod layout;

pub use fs::{CgroupFs, HostCgroupFs};
pub use layout::{parse_container_id, CgroupDriver, CgroupLayout, CPUSET_CPUS};

use std::path::{Path, PathBuf};
use tokio::fs as tfs;

#[derive(Debug, thiserror::Error)]
pub enum CgroupError {
    #[error("invalid container id {0:?}, expected <runtime>://<id>")]
    InvalidContainerId(String),

    #[error("container runtime {0:?} is not supported by the systemd driver")]
    UnsupportedRuntime(String),

    #[error("host application {app} uses cgroup base {base}, only CgroupRoot is supported")]
    UnsupportedCgroupBase { app: String, base: String },

    #[error("host application {0} has no cgroup path")]
    MissingCgroupPath(String),

    #[error("pod has no uid")]
    MissingPodUid,

    #[error("failed to list {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Detect which cgroup hierarchy is mounted at `cgroup_root`
pub async fn detect_cgroup_version(cgroup_root: &Path) -> CgroupVersion {
    // Unified hierarchy exposes cgroup.controllers at the root
    let v2_controllers = cgroup_root.join("cgroup.controllers");
    if tfs::metadata(&v2_controllers).await.is_ok() {
        return CgroupVersion::V2;
    }

    let v1_cpuset = cgroup_root.join("cpuset");
    if tfs::metadata(&v1_cpuset).await.is_ok() {
        return CgroupVersion::V1;
    }

    CgroupVersion::Unknown
}

/// Cgroup version detected on the system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
    Unknown,
}
