use super::NODE_METRIC;
use crate::statesinformer::{next_event, InformerPlugin, PluginContext, WatchEvent};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

/// Caches the NodeMetric collection policy. No hook consumes it yet, so
/// updates do not trigger callbacks.
#[derive(Debug, Default)]
pub struct NodeMetricInformer {
    synced: AtomicBool,
}

impl NodeMetricInformer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InformerPlugin for NodeMetricInformer {
    fn name(&self) -> &str {
        NODE_METRIC
    }

    async fn start(
        &self,
        ctx: PluginContext,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut stream = ctx.source.watch_node_metric(&ctx.node_name);

        while let Some(event) =
            next_event(NODE_METRIC, &mut stream, &mut shutdown, &ctx.metrics).await
        {
            let metric = match event {
                WatchEvent::Applied(metric) => Some(metric),
                WatchEvent::Deleted(_) => None,
                WatchEvent::Restarted(items) => items.into_iter().next(),
            };
            debug!(
                policy = ?metric.as_ref().and_then(|m| m.spec.collect_policy.clone()),
                "NodeMetric updated"
            );

            ctx.state.set_node_metric(metric).await;
            self.synced.store(true, Ordering::Release);
        }

        Ok(())
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}
