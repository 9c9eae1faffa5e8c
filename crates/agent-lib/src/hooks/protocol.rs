//! Per-target requests handed to resource hooks

use crate::models::{HostApplicationSpec, PodMeta, QoSClass};
use std::collections::BTreeMap;

/// Identity of the pod a request belongs to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodRequestMeta {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

/// Identity of the container a request belongs to. Empty for the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerMeta {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerRequest {
    pub pod_meta: PodRequestMeta,
    pub container_meta: ContainerMeta,
    pub qos_class: QoSClass,
    pub pod_labels: BTreeMap<String, String>,
    pub pod_annotations: BTreeMap<String, String>,
    /// Container cgroup directory relative to the controller root
    pub cgroup_parent: String,
}

impl ContainerRequest {
    pub fn new(pod: &PodMeta, container_meta: ContainerMeta, cgroup_parent: String) -> Self {
        let pod_labels = pod.labels();
        let qos_class = QoSClass::from_labels(&pod_labels);

        Self {
            pod_meta: PodRequestMeta {
                namespace: pod.pod.metadata.namespace.clone().unwrap_or_default(),
                name: pod.pod.metadata.name.clone().unwrap_or_default(),
                uid: pod.uid().to_string(),
            },
            container_meta,
            qos_class,
            pod_labels,
            pod_annotations: pod.annotations(),
            cgroup_parent,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostAppRequest {
    pub name: String,
    pub qos_class: QoSClass,
    pub cgroup_parent: String,
}

impl HostAppRequest {
    pub fn new(app: &HostApplicationSpec, cgroup_parent: String) -> Self {
        Self {
            name: app.name.clone(),
            qos_class: app.qos,
            cgroup_parent,
        }
    }
}
