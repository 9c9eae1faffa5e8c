use super::NODE_TOPO;
use crate::statesinformer::{
    next_event, InformerPlugin, PluginContext, RegisterType, WatchEvent,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

/// Caches the NodeResourceTopology of this node
#[derive(Debug, Default)]
pub struct NodeTopoInformer {
    synced: AtomicBool,
}

impl NodeTopoInformer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InformerPlugin for NodeTopoInformer {
    fn name(&self) -> &str {
        NODE_TOPO
    }

    async fn start(
        &self,
        ctx: PluginContext,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut stream = ctx.source.watch_node_topology(&ctx.node_name);

        while let Some(event) =
            next_event(NODE_TOPO, &mut stream, &mut shutdown, &ctx.metrics).await
        {
            let topology = match event {
                WatchEvent::Applied(topology) => Some(topology),
                WatchEvent::Deleted(_) => None,
                WatchEvent::Restarted(items) => items.into_iter().next(),
            };
            debug!(
                annotations = topology.as_ref().map(|t| t.annotations.len()).unwrap_or(0),
                "Node topology updated"
            );

            ctx.state.set_node_topology(topology).await;
            self.synced.store(true, Ordering::Release);
            ctx.callbacks.notify(RegisterType::NodeTopology);
        }

        Ok(())
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}
