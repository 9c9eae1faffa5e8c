use super::PVC;
use crate::statesinformer::{next_event, InformerPlugin, PluginContext, WatchEvent};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Maps persistent volume claims to their bound volume names
#[derive(Debug, Default)]
pub struct PvcInformer {
    synced: AtomicBool,
}

impl PvcInformer {
    pub fn new() -> Self {
        Self::default()
    }
}

fn claim_key(pvc: &PersistentVolumeClaim) -> (String, String) {
    (
        pvc.metadata.namespace.clone().unwrap_or_default(),
        pvc.metadata.name.clone().unwrap_or_default(),
    )
}

fn bound_volume(pvc: &PersistentVolumeClaim) -> Option<String> {
    pvc.spec
        .as_ref()
        .and_then(|spec| spec.volume_name.clone())
        .filter(|name| !name.is_empty())
}

#[async_trait]
impl InformerPlugin for PvcInformer {
    fn name(&self) -> &str {
        PVC
    }

    async fn start(
        &self,
        ctx: PluginContext,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut stream = ctx.source.watch_pvcs();

        while let Some(event) = next_event(PVC, &mut stream, &mut shutdown, &ctx.metrics).await {
            match event {
                WatchEvent::Applied(pvc) => {
                    let (namespace, name) = claim_key(&pvc);
                    ctx.state
                        .set_volume_name(&namespace, &name, bound_volume(&pvc));
                }
                WatchEvent::Deleted(pvc) => {
                    let (namespace, name) = claim_key(&pvc);
                    ctx.state.set_volume_name(&namespace, &name, None);
                }
                WatchEvent::Restarted(pvcs) => {
                    ctx.state.clear_volumes();
                    for pvc in &pvcs {
                        let (namespace, name) = claim_key(pvc);
                        ctx.state
                            .set_volume_name(&namespace, &name, bound_volume(pvc));
                    }
                    self.synced.store(true, Ordering::Release);
                }
            }
        }

        Ok(())
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}
