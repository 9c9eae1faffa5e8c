use super::NODE;
use crate::statesinformer::{
    next_event, InformerPlugin, PluginContext, RegisterType, WatchEvent,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

/// Caches the Node object this agent runs on
#[derive(Debug, Default)]
pub struct NodeInformer {
    synced: AtomicBool,
}

impl NodeInformer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InformerPlugin for NodeInformer {
    fn name(&self) -> &str {
        NODE
    }

    async fn start(
        &self,
        ctx: PluginContext,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut stream = ctx.source.watch_node(&ctx.node_name);

        while let Some(event) = next_event(NODE, &mut stream, &mut shutdown, &ctx.metrics).await {
            let node = match event {
                WatchEvent::Applied(node) => Some(node),
                WatchEvent::Deleted(_) => None,
                WatchEvent::Restarted(nodes) => nodes.into_iter().next(),
            };
            debug!(node = %ctx.node_name, present = node.is_some(), "Node updated");

            ctx.state.set_node(node).await;
            self.synced.store(true, Ordering::Release);
            ctx.callbacks.notify(RegisterType::NodeMetadata);
        }

        Ok(())
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}
