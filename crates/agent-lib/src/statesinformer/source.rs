//! Typed watch streams over the cluster API
//!
//! Custom resources are watched as dynamic objects and decoded into the
//! agent's own models here, so plugins only ever see typed values.

use crate::models::{NodeMetric, NodeMetricSpec, NodeSlo, NodeSloSpec, NodeTopology};
use anyhow::Context;
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use serde::de::DeserializeOwned;
use std::pin::Pin;
use tokio_stream::{Stream, StreamExt};

/// Change observed on a watched collection
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Applied(K),
    Deleted(K),
    /// The watch was re-listed; the payload is the full current set
    Restarted(Vec<K>),
}

pub type EventStream<K> = Pin<Box<dyn Stream<Item = anyhow::Result<WatchEvent<K>>> + Send>>;

/// Source of the cluster objects the informer caches
pub trait ClusterSource: Send + Sync {
    fn watch_node(&self, node_name: &str) -> EventStream<Node>;

    /// Pods scheduled to `node_name`
    fn watch_pods(&self, node_name: &str) -> EventStream<Pod>;

    fn watch_node_topology(&self, node_name: &str) -> EventStream<NodeTopology>;

    fn watch_node_slo(&self, node_name: &str) -> EventStream<NodeSlo>;

    fn watch_node_metric(&self, node_name: &str) -> EventStream<NodeMetric>;

    fn watch_pvcs(&self) -> EventStream<PersistentVolumeClaim>;
}

/// [`ClusterSource`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeSource {
    client: Client,
}

impl KubeSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using in-cluster config or the local kubeconfig
    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default()
            .await
            .context("failed to build kubernetes client")?;
        Ok(Self::new(client))
    }

    fn dynamic_api(&self, resource: &ApiResource) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), resource)
    }
}

fn by_name(name: &str) -> watcher::Config {
    watcher::Config::default().fields(&format!("metadata.name={name}"))
}

pub fn node_topology_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("topology.node.k8s.io", "v1alpha1", "NodeResourceTopology"),
        "noderesourcetopologies",
    )
}

pub fn node_slo_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("slo.koordinator.sh", "v1alpha1", "NodeSLO"),
        "nodeslos",
    )
}

pub fn node_metric_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("slo.koordinator.sh", "v1alpha1", "NodeMetric"),
        "nodemetrics",
    )
}

impl ClusterSource for KubeSource {
    fn watch_node(&self, node_name: &str) -> EventStream<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        map_events(watcher(api, by_name(node_name)).default_backoff(), Ok)
    }

    fn watch_pods(&self, node_name: &str) -> EventStream<Pod> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let config = watcher::Config::default().fields(&format!("spec.nodeName={node_name}"));
        map_events(watcher(api, config).default_backoff(), Ok)
    }

    fn watch_node_topology(&self, node_name: &str) -> EventStream<NodeTopology> {
        let api = self.dynamic_api(&node_topology_resource());
        map_events(
            watcher(api, by_name(node_name)).default_backoff(),
            decode_node_topology,
        )
    }

    fn watch_node_slo(&self, node_name: &str) -> EventStream<NodeSlo> {
        let api = self.dynamic_api(&node_slo_resource());
        map_events(
            watcher(api, by_name(node_name)).default_backoff(),
            decode_node_slo,
        )
    }

    fn watch_node_metric(&self, node_name: &str) -> EventStream<NodeMetric> {
        let api = self.dynamic_api(&node_metric_resource());
        map_events(
            watcher(api, by_name(node_name)).default_backoff(),
            decode_node_metric,
        )
    }

    fn watch_pvcs(&self) -> EventStream<PersistentVolumeClaim> {
        let api: Api<PersistentVolumeClaim> = Api::all(self.client.clone());
        map_events(
            watcher(api, watcher::Config::default()).default_backoff(),
            Ok,
        )
    }
}

fn map_events<S, K, T, F>(stream: S, decode: F) -> EventStream<T>
where
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
    K: Send + 'static,
    T: Send + 'static,
    F: Fn(K) -> anyhow::Result<T> + Send + 'static,
{
    Box::pin(stream.map(move |event| -> anyhow::Result<WatchEvent<T>> {
        Ok(match event? {
            watcher::Event::Applied(obj) => WatchEvent::Applied(decode(obj)?),
            watcher::Event::Deleted(obj) => WatchEvent::Deleted(decode(obj)?),
            watcher::Event::Restarted(objs) => WatchEvent::Restarted(
                objs.into_iter()
                    .map(&decode)
                    .collect::<anyhow::Result<Vec<_>>>()?,
            ),
        })
    }))
}

fn decode_spec<T: DeserializeOwned + Default>(obj: &DynamicObject) -> anyhow::Result<T> {
    match obj.data.get("spec") {
        Some(spec) if !spec.is_null() => Ok(serde_json::from_value(spec.clone())?),
        _ => Ok(T::default()),
    }
}

pub fn decode_node_topology(obj: DynamicObject) -> anyhow::Result<NodeTopology> {
    Ok(NodeTopology {
        name: obj.metadata.name.unwrap_or_default(),
        annotations: obj.metadata.annotations.unwrap_or_default(),
    })
}

pub fn decode_node_slo(obj: DynamicObject) -> anyhow::Result<NodeSlo> {
    let spec: NodeSloSpec = decode_spec(&obj).context("invalid NodeSLO spec")?;
    Ok(NodeSlo {
        name: obj.metadata.name.unwrap_or_default(),
        spec,
    })
}

pub fn decode_node_metric(obj: DynamicObject) -> anyhow::Result<NodeMetric> {
    let spec: NodeMetricSpec = decode_spec(&obj).context("invalid NodeMetric spec")?;
    Ok(NodeMetric {
        name: obj.metadata.name.unwrap_or_default(),
        spec,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QoSClass, ANNOTATION_NODE_CPU_SHARED_POOLS};
    use serde_json::json;

    fn dynamic(resource: &ApiResource, name: &str, body: serde_json::Value) -> DynamicObject {
        let mut obj = DynamicObject::new(name, resource);
        obj.data = body;
        obj
    }

    #[test]
    fn test_decode_node_slo() {
        let obj = dynamic(
            &node_slo_resource(),
            "node-1",
            json!({
                "spec": {
                    "hostApplications": [{
                        "name": "nginx",
                        "qos": "LS",
                        "cgroupPath": {"base": "CgroupRoot", "parentDir": "host-ls", "relativePath": "nginx"}
                    }]
                }
            }),
        );

        let slo = decode_node_slo(obj).unwrap();
        assert_eq!(slo.name, "node-1");
        assert_eq!(slo.spec.host_applications.len(), 1);
        assert_eq!(slo.spec.host_applications[0].qos, QoSClass::Ls);
    }

    #[test]
    fn test_decode_missing_spec_is_default() {
        let obj = dynamic(&node_metric_resource(), "node-1", json!({}));
        let metric = decode_node_metric(obj).unwrap();
        assert_eq!(metric.spec, NodeMetricSpec::default());

        let obj = dynamic(&node_slo_resource(), "node-1", json!({"spec": {"hostApplications": 3}}));
        assert!(decode_node_slo(obj).is_err());
    }

    #[test]
    fn test_decode_node_topology_keeps_annotations() {
        let mut obj = dynamic(&node_topology_resource(), "node-1", json!({}));
        obj.metadata.annotations = Some(
            [(
                ANNOTATION_NODE_CPU_SHARED_POOLS.to_string(),
                "[]".to_string(),
            )]
            .into_iter()
            .collect(),
        );

        let topo = decode_node_topology(obj).unwrap();
        assert_eq!(topo.name, "node-1");
        assert_eq!(topo.annotations[ANNOTATION_NODE_CPU_SHARED_POOLS], "[]");
    }
}
