use super::PODS;
use crate::cgroup::{parse_container_id, CgroupLayout};
use crate::models::PodMeta;
use crate::statesinformer::{
    next_event, InformerPlugin, PluginContext, RegisterType, WatchEvent,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const DEFAULT_RUNTIME: &str = "containerd";

/// Caches the pods scheduled to this node along with their cgroup placement
#[derive(Debug, Default)]
pub struct PodsInformer {
    synced: AtomicBool,
}

impl PodsInformer {
    pub fn new() -> Self {
        Self::default()
    }
}

fn is_terminated(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

/// Ids of all containers the pod status knows about, without runtime prefix
fn known_container_ids(pod: &Pod) -> (HashSet<String>, Option<String>) {
    let mut ids = HashSet::new();
    let mut runtime = None;

    let Some(status) = pod.status.as_ref() else {
        return (ids, runtime);
    };

    let statuses = status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten())
        .chain(status.ephemeral_container_statuses.iter().flatten());
    for container in statuses {
        if let Some(Ok((rt, id))) = container.container_id.as_deref().map(parse_container_id) {
            runtime.get_or_insert_with(|| rt.to_string());
            ids.insert(id.to_string());
        }
    }

    (ids, runtime)
}

/// Find the pod sandbox: the one child cgroup of the pod that is not one of
/// its containers. Several unknown children mean a container started before
/// the status reported it, so nothing is picked until the next scan.
async fn discover_sandbox(layout: &CgroupLayout, pod: &Pod, pod_dir: &str) -> Option<String> {
    let (known, runtime) = known_container_ids(pod);

    let children = match layout.list_container_ids(pod_dir).await {
        Ok(children) => children,
        Err(e) => {
            debug!(pod_dir = %pod_dir, error = %e, "Failed to scan pod cgroup");
            return None;
        }
    };

    let mut unknown = children.into_iter().filter(|id| !known.contains(id));
    let sandbox = unknown.next()?;
    if unknown.next().is_some() {
        debug!(pod_dir = %pod_dir, "Sandbox ambiguous, waiting for container statuses");
        return None;
    }
    let runtime = runtime.as_deref().unwrap_or(DEFAULT_RUNTIME);
    Some(format!("{runtime}://{sandbox}"))
}

/// Build the cached view of a pod. `None` for pods that cannot be placed.
pub async fn build_pod_meta(layout: &CgroupLayout, pod: Pod) -> Option<PodMeta> {
    let cgroup_dir = match layout.pod_cgroup_dir(&pod) {
        Ok(dir) => dir,
        Err(e) => {
            warn!(
                pod = %pod.metadata.name.as_deref().unwrap_or_default(),
                error = %e,
                "Skipping pod without cgroup placement"
            );
            return None;
        }
    };

    let sandbox_id = discover_sandbox(layout, &pod, &cgroup_dir).await;
    Some(PodMeta {
        pod,
        cgroup_dir,
        sandbox_id,
    })
}

/// A cached sandbox is stale once the pod status lists it as a container
fn sandbox_is_container(meta: &PodMeta) -> bool {
    let Some(Ok((_, id))) = meta.sandbox_id.as_deref().map(parse_container_id) else {
        return false;
    };
    known_container_ids(&meta.pod).0.contains(id)
}

/// Updated pod view when its sandbox is missing or stale and a rescan
/// gives a different answer
async fn refresh_sandbox(layout: &CgroupLayout, meta: &PodMeta) -> Option<PodMeta> {
    let stale = sandbox_is_container(meta);
    if meta.sandbox_id.is_some() && !stale {
        return None;
    }

    let sandbox_id = discover_sandbox(layout, &meta.pod, &meta.cgroup_dir).await;
    if sandbox_id == meta.sandbox_id {
        return None;
    }
    if stale {
        info!(
            pod = %meta.pod.metadata.name.as_deref().unwrap_or_default(),
            old = ?meta.sandbox_id,
            new = ?sandbox_id,
            "Replacing sandbox that turned out to be a container"
        );
    }

    let mut updated = meta.clone();
    updated.sandbox_id = sandbox_id;
    Some(updated)
}

impl PodsInformer {
    async fn apply(&self, ctx: &PluginContext, event: WatchEvent<Pod>) {
        match event {
            WatchEvent::Applied(pod) if is_terminated(&pod) => {
                if let Some(uid) = pod.metadata.uid.as_deref() {
                    ctx.state.remove_pod(uid);
                }
            }
            WatchEvent::Applied(pod) => {
                if let Some(meta) = build_pod_meta(&ctx.layout, pod).await {
                    ctx.state.upsert_pod(meta);
                }
            }
            WatchEvent::Deleted(pod) => {
                if let Some(uid) = pod.metadata.uid.as_deref() {
                    ctx.state.remove_pod(uid);
                }
            }
            WatchEvent::Restarted(pods) => {
                let mut metas = Vec::with_capacity(pods.len());
                for pod in pods.into_iter().filter(|p| !is_terminated(p)) {
                    if let Some(meta) = build_pod_meta(&ctx.layout, pod).await {
                        metas.push(meta);
                    }
                }
                info!(pods = metas.len(), "Pods relisted");
                ctx.state.replace_pods(metas);
                self.synced.store(true, Ordering::Release);
            }
        }
    }

    /// Rescan missing or stale sandboxes, then re-notify hooks
    async fn resync(&self, ctx: &PluginContext) {
        let mut refreshed = 0usize;
        for meta in ctx.state.pods() {
            if let Some(updated) = refresh_sandbox(&ctx.layout, &meta).await {
                ctx.state.upsert_pod(updated);
                refreshed += 1;
            }
        }
        debug!(refreshed = refreshed, "Pods resync finished");
    }
}

#[async_trait]
impl InformerPlugin for PodsInformer {
    fn name(&self) -> &str {
        PODS
    }

    async fn start(
        &self,
        ctx: PluginContext,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut stream = ctx.source.watch_pods(&ctx.node_name);
        let mut resync = interval(ctx.config.pods_resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately
        resync.tick().await;

        loop {
            tokio::select! {
                event = next_event(PODS, &mut stream, &mut shutdown, &ctx.metrics) => {
                    let Some(event) = event else { break };
                    self.apply(&ctx, event).await;
                }
                _ = resync.tick() => {
                    self.resync(&ctx).await;
                }
            }

            ctx.metrics.set_pods_tracked(ctx.state.pod_count() as i64);
            ctx.callbacks.notify(RegisterType::AllPods);
        }

        Ok(())
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}
