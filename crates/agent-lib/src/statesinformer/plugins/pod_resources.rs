use super::POD_RESOURCES;
use crate::models::CpuManagerCheckpoint;
use crate::statesinformer::{InformerPlugin, PluginContext};
use anyhow::Context;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const CPU_MANAGER_STATE_FILE: &str = "cpu_manager_state";

/// Polls the kubelet CPU manager checkpoint for exclusive CPU assignments
#[derive(Debug, Default)]
pub struct PodResourcesInformer {
    synced: AtomicBool,
}

impl PodResourcesInformer {
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) fn checkpoint_path(kubelet_root: &Path) -> PathBuf {
    kubelet_root.join(CPU_MANAGER_STATE_FILE)
}

/// Read the checkpoint; `Ok(None)` when the kubelet has not written one
pub(crate) async fn read_checkpoint(path: &Path) -> anyhow::Result<Option<CpuManagerCheckpoint>> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };

    let checkpoint = serde_json::from_str(&raw)
        .with_context(|| format!("invalid cpu manager checkpoint {}", path.display()))?;
    Ok(Some(checkpoint))
}

#[async_trait]
impl InformerPlugin for PodResourcesInformer {
    fn name(&self) -> &str {
        POD_RESOURCES
    }

    async fn start(
        &self,
        ctx: PluginContext,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let path = checkpoint_path(&ctx.config.kubelet_root_dir);
        let mut ticker = interval(ctx.config.pod_resources_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match read_checkpoint(&path).await {
                        Ok(Some(checkpoint)) => {
                            let pods = checkpoint.entries.len();
                            if ctx.state.set_cpu_checkpoint(checkpoint).await {
                                info!(pods = pods, "CPU manager checkpoint changed");
                            }
                            ctx.metrics.inc_informer_event(POD_RESOURCES);
                        }
                        Ok(None) => debug!(path = %path.display(), "No CPU manager checkpoint"),
                        Err(e) => warn!(error = %e, "Failed to load CPU manager checkpoint"),
                    }
                    self.synced.store(true, Ordering::Release);
                }
                _ = shutdown.recv() => {
                    debug!("Stopping pod resources plugin");
                    break;
                }
            }
        }

        Ok(())
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}
