//! Core data models for the isolation agent
//!
//! Typed views of the cluster policy the agent enforces. Annotation payloads
//! are decoded into these structs at the informer boundary; nothing past the
//! decoders handles raw annotation text.

use k8s_openapi::api::core::v1::Pod;
use serde::{de, Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Pod label carrying the QoS class
pub const LABEL_POD_QOS: &str = "koordinator.sh/qosClass";

/// Pod annotation carrying the scheduler's resource allocation
pub const ANNOTATION_RESOURCE_STATUS: &str = "scheduling.koordinator.sh/resource-status";

/// Node topology annotation with the shared CPU pools
pub const ANNOTATION_NODE_CPU_SHARED_POOLS: &str = "node.koordinator.sh/cpu-shared-pools";

/// Node topology annotation with the best-effort shared CPU pools
pub const ANNOTATION_NODE_BE_CPU_SHARED_POOLS: &str = "node.koordinator.sh/be-cpu-shared-pools";

/// Node topology annotation mirroring the kubelet CPU manager policy
pub const ANNOTATION_KUBELET_CPU_MANAGER_POLICY: &str = "kubelet.koordinator.sh/cpu-manager-policy";

/// Node topology annotation with the CPUs reserved for system QoS
pub const ANNOTATION_NODE_SYSTEM_QOS_RESOURCE: &str = "node.koordinator.sh/system-qos-resource";

pub const RESOURCE_CPU: &str = "cpu";
pub const RESOURCE_BATCH_CPU: &str = "kubernetes.io/batch-cpu";

/// Workload priority tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum QoSClass {
    /// Latency-sensitive exclusive
    Lse,
    /// Latency-sensitive reserved (pinned)
    Lsr,
    /// Latency-sensitive shared
    Ls,
    /// Best effort
    Be,
    /// System-reserved
    System,
    /// No QoS label, treated like a plain Burstable pod
    #[default]
    None,
}

impl QoSClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            QoSClass::Lse => "LSE",
            QoSClass::Lsr => "LSR",
            QoSClass::Ls => "LS",
            QoSClass::Be => "BE",
            QoSClass::System => "SYSTEM",
            QoSClass::None => "",
        }
    }

    /// Read the QoS class from pod labels; unknown values map to `None`
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        labels
            .get(LABEL_POD_QOS)
            .map(|v| QoSClass::from(v.as_str()))
            .unwrap_or_default()
    }
}

impl From<&str> for QoSClass {
    fn from(value: &str) -> Self {
        match value {
            "LSE" => QoSClass::Lse,
            "LSR" => QoSClass::Lsr,
            "LS" => QoSClass::Ls,
            "BE" => QoSClass::Be,
            "SYSTEM" => QoSClass::System,
            _ => QoSClass::None,
        }
    }
}

impl From<String> for QoSClass {
    fn from(value: String) -> Self {
        QoSClass::from(value.as_str())
    }
}

impl From<QoSClass> for String {
    fn from(value: QoSClass) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for QoSClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QoSClass::None => f.write_str("None"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Kubernetes QoS tier as seen by the kubelet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KubeQoS {
    Guaranteed,
    Burstable,
    BestEffort,
}

impl KubeQoS {
    /// Infer the tier from a cgroup parent path such as
    /// `kubepods/besteffort/pod<uid>/<id>`
    pub fn from_cgroup_parent(cgroup_parent: &str) -> Self {
        if cgroup_parent.contains("besteffort") {
            KubeQoS::BestEffort
        } else if cgroup_parent.contains("burstable") {
            KubeQoS::Burstable
        } else {
            KubeQoS::Guaranteed
        }
    }

    /// Tier reported in the pod status. Pods without one are placed
    /// under the burstable hierarchy, matching what the kubelet does for
    /// pods with requests below limits.
    pub fn from_pod(pod: &Pod) -> Self {
        match pod
            .status
            .as_ref()
            .and_then(|s| s.qos_class.as_deref())
        {
            Some("Guaranteed") => KubeQoS::Guaranteed,
            Some("BestEffort") => KubeQoS::BestEffort,
            _ => KubeQoS::Burstable,
        }
    }
}

/// A NUMA-scoped range of CPUs shared by non-pinned workloads
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CpuSharedPool {
    #[serde(default)]
    pub socket: i32,
    #[serde(default)]
    pub node: i32,
    #[serde(default)]
    pub cpuset: String,
}

/// CPU manager mode of the kubelet on this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CpuManagerPolicy {
    #[default]
    None,
    Static,
}

impl TryFrom<String> for CpuManagerPolicy {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "" | "none" => Ok(CpuManagerPolicy::None),
            "static" => Ok(CpuManagerPolicy::Static),
            other => Err(format!("unknown cpu manager policy {other:?}")),
        }
    }
}

impl From<CpuManagerPolicy> for String {
    fn from(value: CpuManagerPolicy) -> Self {
        match value {
            CpuManagerPolicy::None => "none".to_string(),
            CpuManagerPolicy::Static => "static".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KubeletCpuManagerPolicy {
    #[serde(default)]
    pub policy: CpuManagerPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemQosResource {
    #[serde(default)]
    pub cpuset: String,
}

/// Resource quantity as found in allocation annotations (`"2"`, `"500m"`, `2`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quantity(pub String);

impl Quantity {
    /// Whether the quantity is strictly positive. Unparseable values count as zero.
    pub fn is_positive(&self) -> bool {
        let s = self.0.trim();
        let numeric: String = s
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '+' || *c == '-')
            .collect();
        numeric.parse::<f64>().map(|v| v > 0.0).unwrap_or(false)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(s) => Ok(Quantity(s)),
            serde_json::Value::Number(n) => Ok(Quantity(n.to_string())),
            other => Err(de::Error::custom(format!("invalid quantity {other}"))),
        }
    }
}

impl From<&str> for Quantity {
    fn from(value: &str) -> Self {
        Quantity(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NumaNodeResource {
    pub node: i32,
    #[serde(default)]
    pub resources: BTreeMap<String, Quantity>,
}

/// Per-pod allocation written by the topology-aware scheduler
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cpuset: String,
    #[serde(
        default,
        rename = "numaNodeResources",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub numa_node_resources: Vec<NumaNodeResource>,
}

impl ResourceStatus {
    /// Decode from pod annotations. A missing annotation is an empty status.
    pub fn from_annotations(
        annotations: &BTreeMap<String, String>,
    ) -> Result<Self, serde_json::Error> {
        match annotations.get(ANNOTATION_RESOURCE_STATUS) {
            Some(raw) => serde_json::from_str(raw),
            None => Ok(Self::default()),
        }
    }

    /// NUMA nodes holding a positive quantity of any of the given resources
    pub fn numa_nodes_with(&self, resource_names: &[&str]) -> Vec<i32> {
        self.numa_node_resources
            .iter()
            .filter(|numa| {
                resource_names.iter().any(|name| {
                    numa.resources
                        .get(*name)
                        .map(Quantity::is_positive)
                        .unwrap_or(false)
                })
            })
            .map(|numa| numa.node)
            .collect()
    }
}

/// Typed view of a NodeResourceTopology object
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeTopology {
    pub name: String,
    pub annotations: BTreeMap<String, String>,
}

/// Which cgroup hierarchy a host application path is relative to
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CgroupBaseType {
    #[default]
    Root,
    KubepodsBase,
    KubeBurstable,
    KubeBesteffort,
    Other(String),
}

impl From<String> for CgroupBaseType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "" | "CgroupRoot" => CgroupBaseType::Root,
            "KubepodsBase" => CgroupBaseType::KubepodsBase,
            "KubeBurstable" => CgroupBaseType::KubeBurstable,
            "KubeBesteffort" => CgroupBaseType::KubeBesteffort,
            _ => CgroupBaseType::Other(value),
        }
    }
}

impl From<CgroupBaseType> for String {
    fn from(value: CgroupBaseType) -> Self {
        match value {
            CgroupBaseType::Root => "CgroupRoot".to_string(),
            CgroupBaseType::KubepodsBase => "KubepodsBase".to_string(),
            CgroupBaseType::KubeBurstable => "KubeBurstable".to_string(),
            CgroupBaseType::KubeBesteffort => "KubeBesteffort".to_string(),
            CgroupBaseType::Other(s) => s,
        }
    }
}

impl fmt::Display for CgroupBaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from(self.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CgroupPath {
    #[serde(default)]
    pub base: CgroupBaseType,
    #[serde(default, rename = "parentDir")]
    pub parent_dir: String,
    #[serde(default, rename = "relativePath")]
    pub relative_path: String,
}

/// A non-pod workload on the node managed with the pod QoS model
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HostApplicationSpec {
    pub name: String,
    #[serde(default)]
    pub qos: QoSClass,
    #[serde(default, rename = "cgroupPath", skip_serializing_if = "Option::is_none")]
    pub cgroup_path: Option<CgroupPath>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeSloSpec {
    #[serde(default, rename = "hostApplications")]
    pub host_applications: Vec<HostApplicationSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeSlo {
    pub name: String,
    pub spec: NodeSloSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricCollectPolicy {
    #[serde(default, rename = "aggregateDurationSeconds")]
    pub aggregate_duration_seconds: Option<i64>,
    #[serde(default, rename = "reportIntervalSeconds")]
    pub report_interval_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeMetricSpec {
    #[serde(default, rename = "metricCollectPolicy")]
    pub collect_policy: Option<MetricCollectPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeMetric {
    pub name: String,
    pub spec: NodeMetricSpec,
}

/// CPU assignments recorded by the kubelet static CPU manager
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CpuManagerCheckpoint {
    #[serde(default, rename = "policyName")]
    pub policy_name: String,
    #[serde(default, rename = "defaultCpuSet")]
    pub default_cpu_set: String,
    /// pod UID -> container name -> cpuset
    #[serde(default)]
    pub entries: BTreeMap<String, BTreeMap<String, String>>,
}

/// A pod as tracked by the states informer
#[derive(Debug, Clone)]
pub struct PodMeta {
    pub pod: Pod,
    /// Pod-level cgroup directory relative to the controller root
    pub cgroup_dir: String,
    /// ID of the pod sandbox container, once discovered
    pub sandbox_id: Option<String>,
}

impl PodMeta {
    pub fn uid(&self) -> &str {
        self.pod.metadata.uid.as_deref().unwrap_or_default()
    }

    /// `namespace/name` for log fields
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.pod.metadata.namespace.as_deref().unwrap_or_default(),
            self.pod.metadata.name.as_deref().unwrap_or_default()
        )
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.pod.metadata.labels.clone().unwrap_or_default()
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.pod.metadata.annotations.clone().unwrap_or_default()
    }
}
