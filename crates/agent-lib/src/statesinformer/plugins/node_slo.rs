use super::NODE_SLO;
use crate::statesinformer::{
    next_event, InformerPlugin, PluginContext, RegisterType, WatchEvent,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::info;

/// Caches the NodeSLO of this node, including its host applications
#[derive(Debug, Default)]
pub struct NodeSloInformer {
    synced: AtomicBool,
}

impl NodeSloInformer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InformerPlugin for NodeSloInformer {
    fn name(&self) -> &str {
        NODE_SLO
    }

    async fn start(
        &self,
        ctx: PluginContext,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut stream = ctx.source.watch_node_slo(&ctx.node_name);

        while let Some(event) =
            next_event(NODE_SLO, &mut stream, &mut shutdown, &ctx.metrics).await
        {
            let slo = match event {
                WatchEvent::Applied(slo) => Some(slo),
                WatchEvent::Deleted(_) => None,
                WatchEvent::Restarted(items) => items.into_iter().next(),
            };

            let host_apps = slo
                .as_ref()
                .map(|s| s.spec.host_applications.len())
                .unwrap_or(0);
            info!(host_applications = host_apps, "NodeSLO updated");
            ctx.metrics.set_host_apps_tracked(host_apps as i64);

            ctx.state.set_node_slo(slo).await;
            self.synced.store(true, Ordering::Release);
            ctx.callbacks.notify(RegisterType::NodeSloSpec);
        }

        Ok(())
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}
