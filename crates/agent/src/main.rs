//! Isolation Agent - node-level cpuset isolation
//!
//! This binary runs as a DaemonSet on each Kubernetes node. It caches the
//! pods, topology and NodeSLO of its node and keeps every container, sandbox
//! and host application cgroup on the cpuset the node policy calls for.

use agent_lib::{
    cgroup::{CgroupLayout, HostCgroupFs},
    executor::ResourceUpdateExecutor,
    health::{components, HealthRegistry},
    hooks::cpuset::{CpusetPlugin, ResolverConfig},
    observability::{AgentMetrics, StructuredLogger},
    statesinformer::{KubeSource, PluginRegistry, StatesInformer},
};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting isolation-agent");

    let config = config::AgentConfig::load()?;
    info!(
        node_name = %config.node_name,
        cgroup_root = %config.cgroup_root.display(),
        cgroup_driver = ?config.cgroup_driver,
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::STATES_INFORMER).await;
    health_registry.register(components::RESOURCE_EXECUTOR).await;
    health_registry.register(components::CPUSET_HOOK).await;

    let metrics = AgentMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);

    let layout = CgroupLayout::detect(&config.cgroup_root, config.cgroup_driver).await;

    let (shutdown_tx, _) = broadcast::channel(1);

    let (executor, worker) =
        ResourceUpdateExecutor::new(Arc::new(HostCgroupFs), config.executor_queue_size);
    let executor_handle = {
        let health = health_registry.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let stats = worker.run(shutdown).await;
            health
                .set_unhealthy(components::RESOURCE_EXECUTOR, "Worker stopped")
                .await;
            stats
        })
    };

    let source = KubeSource::try_default().await?;
    let informer = Arc::new(StatesInformer::new(
        config.node_name.clone(),
        Arc::new(source),
        layout.clone(),
        config.informer_config(),
        PluginRegistry::with_defaults(),
        health_registry.clone(),
    ));

    let cpuset = Arc::new(CpusetPlugin::new(
        executor,
        layout,
        ResolverConfig {
            be_cpu_manager_enabled: config.be_cpu_manager_enabled,
        },
        health_registry.clone(),
        logger.clone(),
    ));
    cpuset.register(&informer.callbacks());

    let informer_handles = informer.start(&shutdown_tx);

    logger.log_startup(
        AGENT_VERSION,
        &config.cgroup_root.display().to_string(),
        config.be_cpu_manager_enabled,
    );

    // Ready once every informer plugin has synced
    let sync_handle = {
        let informer = informer.clone();
        let health = health_registry.clone();
        let limit = config.informer_sync_timeout();
        tokio::spawn(async move {
            while !informer.wait_for_sync(limit).await {
                health
                    .set_degraded(
                        components::STATES_INFORMER,
                        format!(
                            "waiting for informers: {}",
                            informer.pending_plugins().join(", ")
                        ),
                    )
                    .await;
            }
            health.set_healthy(components::STATES_INFORMER).await;
            health.set_ready(true).await;
        })
    };

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let reason = shutdown_signal().await?;
    logger.log_shutdown(reason);
    info!("Shutting down");

    health_registry.set_ready(false).await;
    sync_handle.abort();
    let _ = shutdown_tx.send(());

    for handle in informer_handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Informer task ended abnormally");
        }
    }

    match executor_handle.await {
        Ok(stats) => info!(
            written = stats.written,
            unchanged = stats.unchanged,
            failed = stats.failed,
            "Resource executor stopped"
        ),
        Err(e) => warn!(error = %e, "Resource executor task ended abnormally"),
    }

    api_handle.abort();

    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                Ok("SIGINT received")
            }
            _ = sigterm.recv() => Ok("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("SIGINT received")
    }
}
