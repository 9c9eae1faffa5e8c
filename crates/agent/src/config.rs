//! Agent configuration

use agent_lib::cgroup::CgroupDriver;
use agent_lib::statesinformer::InformerConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Mount point of the cgroup hierarchy
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,

    #[serde(default)]
    pub cgroup_driver: CgroupDriver,

    /// Place BE pods on the BE shared pools
    #[serde(default)]
    pub be_cpu_manager_enabled: bool,

    #[serde(default = "default_kubelet_root_dir")]
    pub kubelet_root_dir: PathBuf,

    #[serde(default = "default_pods_resync_interval")]
    pub pods_resync_interval_secs: u64,

    #[serde(default = "default_pod_resources_poll_interval")]
    pub pod_resources_poll_interval_secs: u64,

    /// Pending cgroup updates before submitters wait
    #[serde(default = "default_executor_queue_size")]
    pub executor_queue_size: usize,

    #[serde(default = "default_informer_sync_timeout")]
    pub informer_sync_timeout_secs: u64,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

fn default_kubelet_root_dir() -> PathBuf {
    PathBuf::from("/var/lib/kubelet")
}

fn default_pods_resync_interval() -> u64 {
    30
}

fn default_pod_resources_poll_interval() -> u64 {
    10
}

fn default_executor_queue_size() -> usize {
    1024
}

fn default_informer_sync_timeout() -> u64 {
    60
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            api_port: default_api_port(),
            cgroup_root: default_cgroup_root(),
            cgroup_driver: CgroupDriver::default(),
            be_cpu_manager_enabled: false,
            kubelet_root_dir: default_kubelet_root_dir(),
            pods_resync_interval_secs: default_pods_resync_interval(),
            pod_resources_poll_interval_secs: default_pod_resources_poll_interval(),
            executor_queue_size: default_executor_queue_size(),
            informer_sync_timeout_secs: default_informer_sync_timeout(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from `AGENT_*` environment variables
    pub fn load() -> Result<Self> {
        Self::from_builder(
            config::Config::builder().add_source(config::Environment::with_prefix("AGENT")),
        )
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        builder
            .build()?
            .try_deserialize()
            .context("invalid agent configuration")
    }

    pub fn informer_config(&self) -> InformerConfig {
        InformerConfig {
            pods_resync_interval: Duration::from_secs(self.pods_resync_interval_secs),
            pod_resources_poll_interval: Duration::from_secs(
                self.pod_resources_poll_interval_secs,
            ),
            kubelet_root_dir: self.kubelet_root_dir.clone(),
        }
    }

    pub fn informer_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.informer_sync_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::from_builder(config::Config::builder()).unwrap();

        assert_eq!(config.api_port, 8080);
        assert_eq!(config.cgroup_root, PathBuf::from("/sys/fs/cgroup"));
        assert_eq!(config.cgroup_driver, CgroupDriver::Cgroupfs);
        assert!(!config.be_cpu_manager_enabled);
        assert_eq!(config.executor_queue_size, 1024);
        assert_eq!(config.informer_sync_timeout(), Duration::from_secs(60));

        let informer = config.informer_config();
        assert_eq!(informer.pods_resync_interval, Duration::from_secs(30));
        assert_eq!(informer.pod_resources_poll_interval, Duration::from_secs(10));
        assert_eq!(informer.kubelet_root_dir, PathBuf::from("/var/lib/kubelet"));
    }

    #[test]
    fn test_overrides() {
        let builder = config::Config::builder()
            .set_override("cgroup_driver", "systemd")
            .unwrap()
            .set_override("be_cpu_manager_enabled", true)
            .unwrap()
            .set_override("cgroup_root", "/host/sys/fs/cgroup")
            .unwrap();
        let config = AgentConfig::from_builder(builder).unwrap();

        assert_eq!(config.cgroup_driver, CgroupDriver::Systemd);
        assert!(config.be_cpu_manager_enabled);
        assert_eq!(config.cgroup_root, PathBuf::from("/host/sys/fs/cgroup"));
        assert_eq!(config.api_port, 8080);
    }

    #[test]
    fn test_invalid_value_is_an_error() {
        let builder = config::Config::builder()
            .set_override("cgroup_driver", "sytemd")
            .unwrap()
            .set_override("executor_queue_size", 64)
            .unwrap();
        let err = AgentConfig::from_builder(builder).unwrap_err();
        assert!(err.to_string().contains("invalid agent configuration"));

        let builder = config::Config::builder()
            .set_override("api_port", "eighty")
            .unwrap();
        assert!(AgentConfig::from_builder(builder).is_err());
    }
}
