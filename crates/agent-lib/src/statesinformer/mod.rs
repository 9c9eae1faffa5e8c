//! States informer
//!
//! Keeps a local cache of the cluster objects that drive resource
//! isolation on this node. Each object kind is owned by an informer plugin
//! running as its own task; plugins write into [`SharedState`] and notify
//! the [`CallbackRunner`], which hands a consistent snapshot to the
//! registered hooks.

mod callback;
pub mod plugins;
mod registry;
mod source;
mod state;


pub use callback::{CallbackRunner, CallbackTarget, RegisterType, StateCallback};
pub use registry::PluginRegistry;
pub use source::{
    decode_node_metric, decode_node_slo, decode_node_topology, ClusterSource, EventStream,
    KubeSource, WatchEvent,
};
pub use state::SharedState;

use crate::cgroup::CgroupLayout;
use crate::health::{components, HealthRegistry};
use crate::observability::AgentMetrics;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// Timing and paths used by the informer plugins
#[derive(Debug, Clone)]
pub struct InformerConfig {
    /// How often the pods plugin rescans cgroups and re-notifies
    pub pods_resync_interval: Duration,
    /// How often the kubelet CPU manager checkpoint is read
    pub pod_resources_poll_interval: Duration,
    pub kubelet_root_dir: PathBuf,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            pods_resync_interval: Duration::from_secs(30),
            pod_resources_poll_interval: Duration::from_secs(10),
            kubelet_root_dir: PathBuf::from("/var/lib/kubelet"),
        }
    }
}

/// Everything a plugin needs to run
#[derive(Clone)]
pub struct PluginContext {
    pub node_name: String,
    pub source: Arc<dyn ClusterSource>,
    pub state: Arc<SharedState>,
    pub callbacks: Arc<CallbackRunner>,
    pub layout: CgroupLayout,
    pub config: InformerConfig,
    pub metrics: AgentMetrics,
}

/// A source of one kind of cached state
#[async_trait]
pub trait InformerPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Run until shutdown
    async fn start(
        &self,
        ctx: PluginContext,
        shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()>;

    fn has_synced(&self) -> bool;
}

/// Next event from a watch stream, or `None` once the stream ends or
/// shutdown is signalled. Stream errors are logged and skipped.
pub(crate) async fn next_event<K>(
    plugin: &str,
    stream: &mut EventStream<K>,
    shutdown: &mut broadcast::Receiver<()>,
    metrics: &AgentMetrics,
) -> Option<WatchEvent<K>> {
    loop {
        tokio::select! {
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    metrics.inc_informer_event(plugin);
                    return Some(event);
                }
                Some(Err(e)) => {
                    warn!(plugin = %plugin, error = %e, "Watch stream error");
                }
                None => {
                    warn!(plugin = %plugin, "Watch stream ended");
                    return None;
                }
            },
            _ = shutdown.recv() => {
                debug!(plugin = %plugin, "Stopping informer plugin");
                return None;
            }
        }
    }
}

pub struct StatesInformer {
    ctx: PluginContext,
    plugins: Vec<Arc<dyn InformerPlugin>>,
    health: HealthRegistry,
}

impl StatesInformer {
    pub fn new(
        node_name: impl Into<String>,
        source: Arc<dyn ClusterSource>,
        layout: CgroupLayout,
        config: InformerConfig,
        registry: PluginRegistry,
        health: HealthRegistry,
    ) -> Self {
        let state = Arc::new(SharedState::default());
        let callbacks = Arc::new(CallbackRunner::new(state.clone()));

        let ctx = PluginContext {
            node_name: node_name.into(),
            source,
            state,
            callbacks,
            layout,
            config,
            metrics: AgentMetrics::new(),
        };

        Self {
            ctx,
            plugins: registry.into_plugins(),
            health,
        }
    }

    pub fn state(&self) -> Arc<SharedState> {
        self.ctx.state.clone()
    }

    pub fn callbacks(&self) -> Arc<CallbackRunner> {
        self.ctx.callbacks.clone()
    }

    /// Spawn the callback runner and every plugin
    pub fn start(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.plugins.len() + 1);

        let callbacks = self.ctx.callbacks.clone();
        let runner_shutdown = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            callbacks.run(runner_shutdown).await;
        }));

        for plugin in &self.plugins {
            let plugin = plugin.clone();
            let ctx = self.ctx.clone();
            let health = self.health.clone();
            let plugin_shutdown = shutdown.subscribe();

            info!(plugin = %plugin.name(), "Starting informer plugin");
            handles.push(tokio::spawn(async move {
                if let Err(e) = plugin.start(ctx, plugin_shutdown).await {
                    error!(plugin = %plugin.name(), error = %e, "Informer plugin failed");
                    health
                        .set_unhealthy(
                            components::STATES_INFORMER,
                            format!("plugin {} failed: {e}", plugin.name()),
                        )
                        .await;
                }
            }));
        }

        handles
    }

    pub fn has_synced(&self) -> bool {
        self.plugins.iter().all(|p| p.has_synced())
    }

    /// Names of plugins that have not synced yet
    pub fn pending_plugins(&self) -> Vec<String> {
        self.plugins
            .iter()
            .filter(|p| !p.has_synced())
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Wait until every plugin has synced. Returns false on timeout.
    pub async fn wait_for_sync(&self, limit: Duration) -> bool {
        let wait = async {
            let mut ticker = interval(Duration::from_millis(100));
            loop {
                ticker.tick().await;
                if self.has_synced() {
                    return;
                }
            }
        };

        match timeout(limit, wait).await {
            Ok(()) => {
                info!("States informer synced");
                true
            }
            Err(_) => {
                warn!(pending = ?self.pending_plugins(), "Timed out waiting for informer sync");
                false
            }
        }
    }
}
