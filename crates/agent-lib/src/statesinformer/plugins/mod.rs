//! Built-in informer plugins

mod node;
mod node_metric;
mod node_slo;
mod node_topo;
mod pod_resources;
mod pods;
mod pvc;

pub use node::NodeInformer;
pub use node_metric::NodeMetricInformer;
pub use node_slo::NodeSloInformer;
pub use node_topo::NodeTopoInformer;
pub use pod_resources::PodResourcesInformer;
pub use pods::{build_pod_meta, PodsInformer};
pub use pvc::PvcInformer;

pub const NODE: &str = "node";
pub const PODS: &str = "pods";
pub const NODE_TOPO: &str = "nodeTopo";
pub const NODE_SLO: &str = "nodeSLO";
pub const NODE_METRIC: &str = "nodeMetric";
pub const PVC: &str = "pvc";
pub const POD_RESOURCES: &str = "podResources";
