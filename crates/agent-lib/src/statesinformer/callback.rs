//! State-change callbacks
//!
//! Plugins call [`CallbackRunner::notify`] after updating the shared state.
//! Notifications of the same type are coalesced until the runner task picks
//! them up, so a burst of pod events results in a single callback pass.

use super::state::SharedState;
use crate::models::{HostApplicationSpec, NodeTopology, PodMeta};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

/// Kind of state change a callback subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterType {
    NodeTopology,
    AllPods,
    NodeSloSpec,
    NodeMetadata,
}

impl RegisterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterType::NodeTopology => "NodeTopology",
            RegisterType::AllPods => "AllPods",
            RegisterType::NodeSloSpec => "NodeSLOSpec",
            RegisterType::NodeMetadata => "NodeMetadata",
        }
    }
}

impl fmt::Display for RegisterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the caches handed to callbacks
#[derive(Debug, Clone, Default)]
pub struct CallbackTarget {
    pub pods: Vec<Arc<PodMeta>>,
    pub host_applications: Vec<HostApplicationSpec>,
    pub node_topology: Option<NodeTopology>,
}

#[async_trait]
pub trait StateCallback: Send + Sync {
    async fn on_update(&self, kind: RegisterType, target: &CallbackTarget) -> anyhow::Result<()>;
}

struct Registration {
    name: String,
    description: String,
    callback: Arc<dyn StateCallback>,
}

pub struct CallbackRunner {
    state: Arc<SharedState>,
    callbacks: DashMap<RegisterType, Vec<Arc<Registration>>>,
    pending: DashSet<RegisterType>,
    tx: mpsc::UnboundedSender<RegisterType>,
    rx: Mutex<mpsc::UnboundedReceiver<RegisterType>>,
}

impl CallbackRunner {
    pub fn new(state: Arc<SharedState>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state,
            callbacks: DashMap::new(),
            pending: DashSet::new(),
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn register(
        &self,
        kind: RegisterType,
        name: &str,
        description: &str,
        callback: Arc<dyn StateCallback>,
    ) {
        info!(kind = %kind, name = %name, description = %description, "Registered state callback");
        self.callbacks
            .entry(kind)
            .or_default()
            .push(Arc::new(Registration {
                name: name.to_string(),
                description: description.to_string(),
                callback,
            }));
    }

    /// Names of the callbacks registered for `kind`, in invocation order
    pub fn registered(&self, kind: RegisterType) -> Vec<String> {
        self.callbacks
            .get(&kind)
            .map(|regs| regs.iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Schedule a callback pass for `kind`. Repeated calls before the pass
    /// starts collapse into one.
    pub fn notify(&self, kind: RegisterType) {
        if self.pending.insert(kind) && self.tx.send(kind).is_err() {
            self.pending.remove(&kind);
        }
    }

    /// Build a target from the current caches and invoke every callback for `kind`
    pub async fn run_callbacks(&self, kind: RegisterType) {
        // Copy out so no map guard is held across awaits
        let registrations: Vec<Arc<Registration>> = self
            .callbacks
            .get(&kind)
            .map(|regs| regs.value().clone())
            .unwrap_or_default();
        if registrations.is_empty() {
            debug!(kind = %kind, "No callbacks registered");
            return;
        }

        let target = self.state.callback_target().await;
        for registration in registrations {
            match registration.callback.on_update(kind, &target).await {
                Ok(()) => debug!(kind = %kind, name = %registration.name, "Callback finished"),
                Err(e) => warn!(
                    kind = %kind,
                    name = %registration.name,
                    description = %registration.description,
                    error = %e,
                    "Callback failed"
                ),
            }
        }
    }

    /// Serve notifications until shutdown
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("Starting state callback runner");
        let mut rx = self.rx.lock().await;

        loop {
            tokio::select! {
                kind = rx.recv() => {
                    let Some(kind) = kind else { break };
                    // Clear first so changes during the pass schedule another one
                    self.pending.remove(&kind);
                    self.run_callbacks(kind).await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down state callback runner");
                    break;
                }
            }
        }
    }
}
