use super::callback::CallbackTarget;
use crate::models::{CpuManagerCheckpoint, NodeMetric, NodeSlo, NodeTopology, PodMeta};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Node;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Cached cluster objects written by informer plugins
#[derive(Debug, Default)]
pub struct SharedState {
    node: RwLock<Option<Node>>,
    pods: DashMap<String, Arc<PodMeta>>,
    node_topology: RwLock<Option<NodeTopology>>,
    node_slo: RwLock<Option<NodeSlo>>,
    node_metric: RwLock<Option<NodeMetric>>,
    /// `namespace/claim` -> bound volume name
    pvc_volumes: DashMap<String, String>,
    cpu_checkpoint: RwLock<Option<CpuManagerCheckpoint>>,
}

impl SharedState {
    pub async fn node(&self) -> Option<Node> {
        self.node.read().await.clone()
    }

    pub async fn set_node(&self, node: Option<Node>) {
        *self.node.write().await = node;
    }

    /// All pods, ordered by `namespace/name`
    pub fn pods(&self) -> Vec<Arc<PodMeta>> {
        let mut pods: Vec<Arc<PodMeta>> = self.pods.iter().map(|e| e.value().clone()).collect();
        pods.sort_by_key(|p| p.key());
        pods
    }

    pub fn pod(&self, uid: &str) -> Option<Arc<PodMeta>> {
        self.pods.get(uid).map(|e| e.value().clone())
    }

    pub fn pod_count(&self) -> usize {
        self.pods.len()
    }

    pub fn upsert_pod(&self, pod: PodMeta) {
        self.pods.insert(pod.uid().to_string(), Arc::new(pod));
    }

    pub fn remove_pod(&self, uid: &str) -> Option<Arc<PodMeta>> {
        self.pods.remove(uid).map(|(_, pod)| pod)
    }

    /// Replace the whole pod set
    pub fn replace_pods(&self, pods: Vec<PodMeta>) {
        self.pods.clear();
        for pod in pods {
            self.upsert_pod(pod);
        }
    }

    pub async fn node_topology(&self) -> Option<NodeTopology> {
        self.node_topology.read().await.clone()
    }

    pub async fn set_node_topology(&self, topology: Option<NodeTopology>) {
        *self.node_topology.write().await = topology;
    }

    pub async fn node_slo(&self) -> Option<NodeSlo> {
        self.node_slo.read().await.clone()
    }

    pub async fn set_node_slo(&self, slo: Option<NodeSlo>) {
        *self.node_slo.write().await = slo;
    }

    pub async fn node_metric(&self) -> Option<NodeMetric> {
        self.node_metric.read().await.clone()
    }

    pub async fn set_node_metric(&self, metric: Option<NodeMetric>) {
        *self.node_metric.write().await = metric;
    }

    pub fn volume_name(&self, namespace: &str, claim: &str) -> Option<String> {
        self.pvc_volumes
            .get(&format!("{namespace}/{claim}"))
            .map(|e| e.value().clone())
    }

    pub fn set_volume_name(&self, namespace: &str, claim: &str, volume: Option<String>) {
        let key = format!("{namespace}/{claim}");
        match volume {
            Some(volume) => {
                self.pvc_volumes.insert(key, volume);
            }
            None => {
                self.pvc_volumes.remove(&key);
            }
        }
    }

    pub fn clear_volumes(&self) {
        self.pvc_volumes.clear();
    }

    pub async fn cpu_checkpoint(&self) -> Option<CpuManagerCheckpoint> {
        self.cpu_checkpoint.read().await.clone()
    }

    /// Store the checkpoint, returning whether it differs from the cached one
    pub async fn set_cpu_checkpoint(&self, checkpoint: CpuManagerCheckpoint) -> bool {
        let mut current = self.cpu_checkpoint.write().await;
        if current.as_ref() == Some(&checkpoint) {
            return false;
        }
        *current = Some(checkpoint);
        true
    }

    /// Snapshot handed to state callbacks
    pub async fn callback_target(&self) -> CallbackTarget {
        CallbackTarget {
            pods: self.pods(),
            host_applications: self
                .node_slo()
                .await
                .map(|slo| slo.spec.host_applications)
                .unwrap_or_default(),
            node_topology: self.node_topology().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod_meta(namespace: &str, name: &str, uid: &str) -> PodMeta {
        PodMeta {
            pod: Pod {
                metadata: ObjectMeta {
                    namespace: Some(namespace.to_string()),
                    name: Some(name.to_string()),
                    uid: Some(uid.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
            cgroup_dir: format!("kubepods/pod{uid}"),
            sandbox_id: None,
        }
    }

    #[test]
    fn test_pods_sorted_and_replaced() {
        let state = SharedState::default();
        state.upsert_pod(pod_meta("ns", "b", "2"));
        state.upsert_pod(pod_meta("ns", "a", "1"));

        let keys: Vec<String> = state.pods().iter().map(|p| p.key()).collect();
        assert_eq!(keys, vec!["ns/a".to_string(), "ns/b".to_string()]);

        state.replace_pods(vec![pod_meta("ns", "c", "3")]);
        assert_eq!(state.pod_count(), 1);
        assert!(state.pod("1").is_none());
        assert!(state.remove_pod("3").is_some());
    }

    #[tokio::test]
    async fn test_cpu_checkpoint_change_detection() {
        let state = SharedState::default();
        let checkpoint = CpuManagerCheckpoint {
            policy_name: "static".to_string(),
            default_cpu_set: "0-15".to_string(),
            ..Default::default()
        };

        assert!(state.set_cpu_checkpoint(checkpoint.clone()).await);
        assert!(!state.set_cpu_checkpoint(checkpoint).await);
    }

    #[test]
    fn test_volume_names() {
        let state = SharedState::default();
        state.set_volume_name("ns", "data", Some("pv-1".to_string()));
        assert_eq!(state.volume_name("ns", "data").as_deref(), Some("pv-1"));

        state.set_volume_name("ns", "data", None);
        assert!(state.volume_name("ns", "data").is_none());
    }
}
