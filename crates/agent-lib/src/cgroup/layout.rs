use super::{detect_cgroup_version, CgroupError, CgroupVersion};
use crate::models::{CgroupBaseType, HostApplicationSpec, KubeQoS};
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

pub const CPUSET_CPUS: &str = "cpuset.cpus";

/// Cgroup driver configured for the kubelet and container runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupDriver {
    #[default]
    Cgroupfs,
    Systemd,
}

/// Maps pods, containers and host applications to cgroup directories
#[derive(Debug, Clone)]
pub struct CgroupLayout {
    root: PathBuf,
    version: CgroupVersion,
    driver: CgroupDriver,
}

impl CgroupLayout {
    pub fn new(root: impl Into<PathBuf>, version: CgroupVersion, driver: CgroupDriver) -> Self {
        Self {
            root: root.into(),
            version,
            driver,
        }
    }

    /// Build a layout for the hierarchy mounted at `root`
    pub async fn detect(root: impl Into<PathBuf>, driver: CgroupDriver) -> Self {
        let root = root.into();
        let version = match detect_cgroup_version(&root).await {
            CgroupVersion::Unknown => {
                warn!(root = %root.display(), "Could not detect cgroup version, defaulting to v2");
                CgroupVersion::V2
            }
            version => {
                info!(root = %root.display(), ?version, ?driver, "Detected cgroup hierarchy");
                version
            }
        };
        Self::new(root, version, driver)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    pub fn driver(&self) -> CgroupDriver {
        self.driver
    }

    /// Pod-level cgroup directory, relative to the controller root
    pub fn pod_cgroup_dir(&self, pod: &Pod) -> Result<String, CgroupError> {
        let uid = pod
            .metadata
            .uid
            .as_deref()
            .filter(|uid| !uid.is_empty())
            .ok_or(CgroupError::MissingPodUid)?;
        let qos = KubeQoS::from_pod(pod);

        let dir = match self.driver {
            CgroupDriver::Cgroupfs => match qos {
                KubeQoS::Guaranteed => format!("kubepods/pod{uid}"),
                KubeQoS::Burstable => format!("kubepods/burstable/pod{uid}"),
                KubeQoS::BestEffort => format!("kubepods/besteffort/pod{uid}"),
            },
            CgroupDriver::Systemd => {
                let uid = uid.replace('-', "_");
                match qos {
                    KubeQoS::Guaranteed => format!("kubepods.slice/kubepods-pod{uid}.slice"),
                    KubeQoS::Burstable => format!(
                        "kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod{uid}.slice"
                    ),
                    KubeQoS::BestEffort => format!(
                        "kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod{uid}.slice"
                    ),
                }
            }
        };

        Ok(dir)
    }

    /// Container cgroup directory for an id of the form `<runtime>://<id>`
    pub fn container_cgroup_dir(
        &self,
        pod_dir: &str,
        container_id: &str,
    ) -> Result<String, CgroupError> {
        let (runtime, id) = parse_container_id(container_id)?;

        match self.driver {
            CgroupDriver::Cgroupfs => Ok(format!("{pod_dir}/{id}")),
            CgroupDriver::Systemd => {
                let prefix = match runtime {
                    "containerd" => "cri-containerd-",
                    "docker" => "docker-",
                    "cri-o" => "crio-",
                    other => return Err(CgroupError::UnsupportedRuntime(other.to_string())),
                };
                Ok(format!("{pod_dir}/{prefix}{id}.scope"))
            }
        }
    }

    /// Cgroup directory of a host application. Only root-based paths are supported.
    pub fn host_app_cgroup_dir(&self, app: &HostApplicationSpec) -> Result<String, CgroupError> {
        let path = app
            .cgroup_path
            .as_ref()
            .ok_or_else(|| CgroupError::MissingCgroupPath(app.name.clone()))?;

        if path.base != CgroupBaseType::Root {
            return Err(CgroupError::UnsupportedCgroupBase {
                app: app.name.clone(),
                base: path.base.to_string(),
            });
        }

        let parts: Vec<&str> = [path.parent_dir.as_str(), path.relative_path.as_str()]
            .into_iter()
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
            .collect();
        Ok(parts.join("/"))
    }

    /// Absolute directory of a cgroup in the cpuset hierarchy
    pub fn controller_dir(&self, cgroup_dir: &str) -> PathBuf {
        let relative = cgroup_dir.trim_start_matches('/');
        match self.version {
            CgroupVersion::V1 => self.root.join("cpuset").join(relative),
            CgroupVersion::V2 | CgroupVersion::Unknown => self.root.join(relative),
        }
    }

    /// Absolute path of `cpuset.cpus` for a cgroup directory
    pub fn cpuset_path(&self, cgroup_dir: &str) -> PathBuf {
        self.controller_dir(cgroup_dir).join(CPUSET_CPUS)
    }

    /// Recover a container id from a cgroup directory name
    pub fn container_id_from_dir_name(&self, name: &str) -> Option<String> {
        match self.driver {
            CgroupDriver::Cgroupfs => Some(name.to_string()),
            CgroupDriver::Systemd => {
                let stem = name.strip_suffix(".scope")?;
                ["cri-containerd-", "docker-", "crio-"]
                    .iter()
                    .find_map(|prefix| stem.strip_prefix(prefix))
                    .map(str::to_string)
            }
        }
    }

    /// Container ids with a cgroup below the pod directory
    pub async fn list_container_ids(&self, pod_dir: &str) -> Result<Vec<String>, CgroupError> {
        let dir = self.controller_dir(pod_dir);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(CgroupError::Io { path: dir, source }),
        };

        let mut ids = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => return Err(CgroupError::Io { path: dir, source }),
            };

            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }

            if let Some(id) = self.container_id_from_dir_name(&entry.file_name().to_string_lossy())
            {
                ids.push(id);
            }
        }

        ids.sort();
        Ok(ids)
    }
}

/// Split `<runtime>://<id>`
pub fn parse_container_id(container_id: &str) -> Result<(&str, &str), CgroupError> {
    match container_id.split_once("://") {
        Some((runtime, id)) if !runtime.is_empty() && !id.is_empty() => Ok((runtime, id)),
        _ => Err(CgroupError::InvalidContainerId(container_id.to_string())),
    }
}
