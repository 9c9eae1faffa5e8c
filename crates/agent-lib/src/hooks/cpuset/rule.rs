//! Node cpuset rule and the resolver that maps a request to a cpuset

use crate::cpu_list::{CpuSet, CpuSetParseError};
use crate::hooks::protocol::{ContainerRequest, HostAppRequest};
use crate::models::{
    CpuManagerPolicy, CpuSharedPool, KubeQoS, KubeletCpuManagerPolicy, NodeTopology, QoSClass,
    ResourceStatus, SystemQosResource, ANNOTATION_KUBELET_CPU_MANAGER_POLICY,
    ANNOTATION_NODE_BE_CPU_SHARED_POOLS, ANNOTATION_NODE_CPU_SHARED_POOLS,
    ANNOTATION_NODE_SYSTEM_QOS_RESOURCE, ANNOTATION_RESOURCE_STATUS, RESOURCE_BATCH_CPU,
    RESOURCE_CPU,
};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("failed to decode annotation {key}: {source}")]
    Annotation {
        key: String,
        source: serde_json::Error,
    },

    #[error(transparent)]
    InvalidCpuSet(#[from] CpuSetParseError),

    #[error("host application {name} has qos {qos}, only LS, BE and SYSTEM are supported")]
    UnsupportedHostAppQos { name: String, qos: QoSClass },
}

/// Switches that change resolution without being part of the node rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverConfig {
    pub be_cpu_manager_enabled: bool,
}

/// CPU placement policy of the node, decoded from the topology annotations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpusetRule {
    pub kubelet_policy: KubeletCpuManagerPolicy,
    pub share_pools: Vec<CpuSharedPool>,
    pub be_share_pools: Vec<CpuSharedPool>,
    pub system_qos_cpuset: String,
}

impl CpusetRule {
    /// Decode a rule from node topology annotations. Absent annotations give
    /// zero values; any malformed one fails the whole decode.
    pub fn from_topology(topology: &NodeTopology) -> Result<Self, RuleError> {
        let annotations = &topology.annotations;

        let kubelet_policy: KubeletCpuManagerPolicy =
            decode_annotation(annotations, ANNOTATION_KUBELET_CPU_MANAGER_POLICY)?
                .unwrap_or_default();
        let share_pools: Vec<CpuSharedPool> =
            decode_annotation(annotations, ANNOTATION_NODE_CPU_SHARED_POOLS)?.unwrap_or_default();
        let be_share_pools: Vec<CpuSharedPool> =
            decode_annotation(annotations, ANNOTATION_NODE_BE_CPU_SHARED_POOLS)?
                .unwrap_or_default();
        let system_qos: SystemQosResource =
            decode_annotation(annotations, ANNOTATION_NODE_SYSTEM_QOS_RESOURCE)?
                .unwrap_or_default();

        for pool in share_pools.iter().chain(be_share_pools.iter()) {
            CpuSet::parse(&pool.cpuset)?;
        }
        CpuSet::parse(&system_qos.cpuset)?;

        Ok(Self {
            kubelet_policy,
            share_pools,
            be_share_pools,
            system_qos_cpuset: system_qos.cpuset,
        })
    }

    /// Target cpuset of a container or sandbox.
    ///
    /// `Ok(None)` leaves the cgroup untouched; `Ok(Some(""))` clears it.
    pub fn container_cpuset(
        &self,
        req: &ContainerRequest,
        config: &ResolverConfig,
    ) -> Result<Option<String>, RuleError> {
        let status = ResourceStatus::from_annotations(&req.pod_annotations).map_err(|source| {
            RuleError::Annotation {
                key: ANNOTATION_RESOURCE_STATUS.to_string(),
                source,
            }
        })?;

        // Exclusive cpus picked by the scheduler
        if !status.cpuset.is_empty() {
            CpuSet::parse(&status.cpuset)?;
            return Ok(Some(status.cpuset));
        }

        if req.qos_class == QoSClass::Be && config.be_cpu_manager_enabled {
            let nodes = status.numa_nodes_with(&[RESOURCE_CPU, RESOURCE_BATCH_CPU]);
            if let Some(cpuset) = pools_on_nodes(&self.be_share_pools, &nodes) {
                return Ok(Some(cpuset));
            }
        }

        let nodes = status.numa_nodes_with(&[RESOURCE_CPU]);
        if let Some(cpuset) = pools_on_nodes(&self.share_pools, &nodes) {
            return Ok(Some(cpuset));
        }

        if req.qos_class == QoSClass::System && !self.system_qos_cpuset.is_empty() {
            return Ok(Some(self.system_qos_cpuset.clone()));
        }

        if req.qos_class == QoSClass::Ls {
            return Ok(Some(join_pools(&self.share_pools)));
        }

        if req.qos_class == QoSClass::Be
            || KubeQoS::from_cgroup_parent(&req.cgroup_parent) == KubeQoS::BestEffort
        {
            return Ok(Some(String::new()));
        }

        // Burstable, Guaranteed and unannotated LSR/LSE follow the kubelet
        match self.kubelet_policy.policy {
            CpuManagerPolicy::Static => Ok(None),
            CpuManagerPolicy::None => Ok(Some(join_pools(&self.share_pools))),
        }
    }

    /// Target cpuset of a host application
    pub fn host_app_cpuset(
        &self,
        req: Option<&HostAppRequest>,
        config: &ResolverConfig,
    ) -> Result<Option<String>, RuleError> {
        let Some(req) = req else {
            return Ok(None);
        };

        match req.qos_class {
            QoSClass::Ls => Ok(Some(join_pools(&self.share_pools))),
            QoSClass::Be => {
                if config.be_cpu_manager_enabled && !self.be_share_pools.is_empty() {
                    Ok(Some(join_pools(&self.be_share_pools)))
                } else {
                    Ok(Some(String::new()))
                }
            }
            QoSClass::System if !self.system_qos_cpuset.is_empty() => {
                Ok(Some(self.system_qos_cpuset.clone()))
            }
            QoSClass::System => Ok(None),
            qos => Err(RuleError::UnsupportedHostAppQos {
                name: req.name.clone(),
                qos,
            }),
        }
    }
}

fn decode_annotation<T: DeserializeOwned>(
    annotations: &BTreeMap<String, String>,
    key: &str,
) -> Result<Option<T>, RuleError> {
    annotations
        .get(key)
        .map(|raw| {
            serde_json::from_str(raw).map_err(|source| RuleError::Annotation {
                key: key.to_string(),
                source,
            })
        })
        .transpose()
}

/// Pools on any of `nodes`, joined in pool-list order. `None` if nothing matched.
fn pools_on_nodes(pools: &[CpuSharedPool], nodes: &[i32]) -> Option<String> {
    if nodes.is_empty() {
        return None;
    }

    let cpusets: Vec<&str> = pools
        .iter()
        .filter(|pool| nodes.contains(&pool.node) && !pool.cpuset.is_empty())
        .map(|pool| pool.cpuset.as_str())
        .collect();

    if cpusets.is_empty() {
        None
    } else {
        Some(cpusets.join(","))
    }
}

fn join_pools(pools: &[CpuSharedPool]) -> String {
    pools
        .iter()
        .filter(|pool| !pool.cpuset.is_empty())
        .map(|pool| pool.cpuset.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Holds the current rule; readers always see a whole rule
#[derive(Debug, Default)]
pub struct RuleStore {
    rule: RwLock<Option<Arc<CpusetRule>>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(rule: CpusetRule) -> Self {
        Self {
            rule: RwLock::new(Some(Arc::new(rule))),
        }
    }

    /// Current rule, `None` until the first successful parse
    pub async fn snapshot(&self) -> Option<Arc<CpusetRule>> {
        self.rule.read().await.clone()
    }

    /// Replace the rule if the topology yields a different one.
    ///
    /// Returns whether the rule changed. On error the current rule is kept.
    pub async fn parse_rule(&self, topology: &NodeTopology) -> Result<bool, RuleError> {
        let candidate = CpusetRule::from_topology(topology)?;

        let mut current = self.rule.write().await;
        if current.as_deref() == Some(&candidate) {
            return Ok(false);
        }

        *current = Some(Arc::new(candidate));
        Ok(true)
    }
}
