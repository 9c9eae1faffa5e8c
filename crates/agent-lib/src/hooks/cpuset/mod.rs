//! Cpuset hook
//!
//! Keeps the node cpuset rule in sync with the topology annotations and
//! rewrites `cpuset.cpus` for every container, sandbox and host application
//! whenever the rule, the pod set or the NodeSLO changes.

mod rule;

#[cfg(test)]
mod tests;

pub use rule::{CpusetRule, ResolverConfig, RuleError, RuleStore};

use crate::cgroup::{CgroupError, CgroupLayout};
use crate::executor::{ExecutorError, ResourceUpdateExecutor, UpdateTicket};
use crate::health::{components, HealthRegistry};
use crate::hooks::protocol::{ContainerMeta, ContainerRequest, HostAppRequest};
use crate::models::PodMeta;
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::statesinformer::{CallbackRunner, CallbackTarget, RegisterType, StateCallback};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome for one cgroup target of a reconcile pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied { changed: bool },
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetReport {
    pub target: String,
    pub outcome: ReconcileOutcome,
}

/// Per-target results of one reconcile pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub targets: Vec<TargetReport>,
}

impl ReconcileReport {
    fn record(&mut self, target: String, outcome: ReconcileOutcome) {
        self.targets.push(TargetReport { target, outcome });
    }

    fn skip(&mut self, target: String, reason: impl Into<String>) {
        self.record(
            target,
            ReconcileOutcome::Skipped {
                reason: reason.into(),
            },
        );
    }

    fn fail(&mut self, target: String, error: impl fmt::Display) {
        self.record(
            target,
            ReconcileOutcome::Failed {
                error: error.to_string(),
            },
        );
    }

    pub fn applied(&self) -> usize {
        self.count(|o| matches!(o, ReconcileOutcome::Applied { .. }))
    }

    pub fn changed(&self) -> usize {
        self.count(|o| matches!(o, ReconcileOutcome::Applied { changed: true }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, ReconcileOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ReconcileOutcome::Failed { .. }))
    }

    pub fn failures(&self) -> impl Iterator<Item = &TargetReport> {
        self.targets
            .iter()
            .filter(|t| matches!(t.outcome, ReconcileOutcome::Failed { .. }))
    }

    /// Outcome recorded for a target, by its description
    pub fn outcome(&self, target: &str) -> Option<&ReconcileOutcome> {
        self.targets
            .iter()
            .find(|t| t.target == target)
            .map(|t| &t.outcome)
    }

    fn count(&self, pred: impl Fn(&ReconcileOutcome) -> bool) -> usize {
        self.targets.iter().filter(|t| pred(&t.outcome)).count()
    }

    fn failure_summary(&self) -> String {
        self.failures()
            .map(|t| match &t.outcome {
                ReconcileOutcome::Failed { error } => format!("{}: {}", t.target, error),
                _ => t.target.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("{failed} of {total} cpuset targets failed: {summary}")]
    Partial {
        failed: usize,
        total: usize,
        summary: String,
        report: ReconcileReport,
    },
}

impl ReconcileError {
    pub fn report(&self) -> &ReconcileReport {
        match self {
            ReconcileError::Partial { report, .. } => report,
        }
    }
}

/// Errors that fail a single target
#[derive(Debug, thiserror::Error)]
enum TargetError {
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error(transparent)]
    Cgroup(#[from] CgroupError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

pub fn container_target(pod: &PodMeta, container: &str) -> String {
    format!("container {}/{}", pod.key(), container)
}

pub fn sandbox_target(pod: &PodMeta) -> String {
    format!("sandbox {}", pod.key())
}

pub fn host_app_target(name: &str) -> String {
    format!("host application {name}")
}

pub struct CpusetPlugin {
    rules: RuleStore,
    executor: ResourceUpdateExecutor,
    layout: CgroupLayout,
    config: ResolverConfig,
    health: HealthRegistry,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl CpusetPlugin {
    pub fn new(
        executor: ResourceUpdateExecutor,
        layout: CgroupLayout,
        config: ResolverConfig,
        health: HealthRegistry,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            rules: RuleStore::new(),
            executor,
            layout,
            config,
            health,
            metrics: AgentMetrics::new(),
            logger,
        }
    }

    /// Start from a known rule instead of waiting for the topology
    pub fn with_rule(mut self, rule: CpusetRule) -> Self {
        self.rules = RuleStore::with_rule(rule);
        self
    }

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    /// Subscribe to the state changes that affect cpusets
    pub fn register(self: &Arc<Self>, runner: &CallbackRunner) {
        let callback: Arc<dyn StateCallback> = self.clone();
        runner.register(
            RegisterType::NodeTopology,
            "cpuset-rule",
            "parse cpuset rule from node topology and reconcile",
            callback.clone(),
        );
        runner.register(
            RegisterType::AllPods,
            "cpuset-pods",
            "reconcile container cpusets on pod changes",
            callback.clone(),
        );
        runner.register(
            RegisterType::NodeSloSpec,
            "cpuset-host-apps",
            "reconcile host application cpusets on NodeSLO changes",
            callback,
        );
    }

    /// Apply the current rule to every pod and host application in `target`
    pub async fn rule_update_cb(
        &self,
        target: &CallbackTarget,
    ) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::default();
        let Some(rule) = self.rules.snapshot().await else {
            debug!("Cpuset rule not parsed yet, skipping reconcile");
            return Ok(report);
        };

        let mut pending: Vec<(String, UpdateTicket)> = Vec::new();

        for pod in &target.pods {
            let statuses = pod.pod.status.as_ref();
            let containers = statuses
                .and_then(|s| s.init_container_statuses.as_ref())
                .into_iter()
                .flatten()
                .chain(
                    statuses
                        .and_then(|s| s.container_statuses.as_ref())
                        .into_iter()
                        .flatten(),
                );

            for status in containers {
                let name = container_target(pod, &status.name);
                let Some(container_id) = status.container_id.as_deref().filter(|id| !id.is_empty())
                else {
                    report.skip(name, "container has no id yet");
                    continue;
                };

                let result = self.layout
                    .container_cgroup_dir(&pod.cgroup_dir, container_id)
                    .map_err(TargetError::from)
                    .and_then(|dir| {
                        let req = ContainerRequest::new(
                            pod,
                            ContainerMeta {
                                name: status.name.clone(),
                                id: container_id.to_string(),
                            },
                            dir.clone(),
                        );
                        let cpuset = rule.container_cpuset(&req, &self.config)?;
                        Ok((dir, cpuset))
                    });
                self.submit(&mut report, &mut pending, name, result).await;
            }

            let name = sandbox_target(pod);
            let Some(sandbox_id) = pod.sandbox_id.as_deref() else {
                report.skip(name, "sandbox not discovered");
                continue;
            };
            let result = self
                .layout
                .container_cgroup_dir(&pod.cgroup_dir, sandbox_id)
                .map_err(TargetError::from)
                .and_then(|dir| {
                    let req = ContainerRequest::new(pod, ContainerMeta::default(), dir.clone());
                    let cpuset = rule.container_cpuset(&req, &self.config)?;
                    Ok((dir, cpuset))
                });
            self.submit(&mut report, &mut pending, name, result).await;
        }

        for app in &target.host_applications {
            let name = host_app_target(&app.name);
            let result = self
                .layout
                .host_app_cgroup_dir(app)
                .map_err(TargetError::from)
                .and_then(|dir| {
                    let req = HostAppRequest::new(app, dir.clone());
                    let cpuset = rule.host_app_cpuset(Some(&req), &self.config)?;
                    Ok((dir, cpuset))
                });
            self.submit(&mut report, &mut pending, name, result).await;
        }

        for (name, ticket) in pending {
            match ticket.wait().await {
                Ok(outcome) => report.record(
                    name,
                    ReconcileOutcome::Applied {
                        changed: outcome.changed(),
                    },
                ),
                Err(e) => report.fail(name, e),
            }
        }

        let failed = report.failed();
        if failed > 0 {
            return Err(ReconcileError::Partial {
                failed,
                total: report.targets.len(),
                summary: report.failure_summary(),
                report,
            });
        }

        Ok(report)
    }

    async fn submit(
        &self,
        report: &mut ReconcileReport,
        pending: &mut Vec<(String, UpdateTicket)>,
        name: String,
        resolved: Result<(String, Option<String>), TargetError>,
    ) {
        let (dir, cpuset) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                debug!(target_name = %name, error = %e, "Failed to resolve cpuset");
                report.fail(name, e);
                return;
            }
        };

        let Some(cpuset) = cpuset else {
            report.skip(name, "no cpuset policy applies");
            return;
        };

        match self
            .executor
            .submit_cpuset(self.layout.cpuset_path(&dir), cpuset)
            .await
        {
            Ok(ticket) => pending.push((name, ticket)),
            Err(e) => report.fail(name, TargetError::from(e)),
        }
    }

    async fn record_pass(&self, kind: RegisterType, report: &ReconcileReport, started: Instant) {
        let elapsed = started.elapsed();
        self.metrics.observe_reconcile_latency(elapsed.as_secs_f64());

        let failed = report.failed();
        self.metrics.add_reconcile_failures(failed as u64);
        self.logger.log_reconcile(
            kind.as_str(),
            report.applied(),
            report.changed(),
            report.skipped(),
            failed,
            elapsed.as_millis(),
        );

        if failed > 0 {
            self.health
                .set_degraded(
                    components::CPUSET_HOOK,
                    format!("{failed} cpuset targets failed in last reconcile"),
                )
                .await;
        } else {
            self.health.set_healthy(components::CPUSET_HOOK).await;
        }
    }
}

#[async_trait]
impl StateCallback for CpusetPlugin {
    async fn on_update(&self, kind: RegisterType, target: &CallbackTarget) -> anyhow::Result<()> {
        if kind == RegisterType::NodeTopology {
            let Some(topology) = target.node_topology.as_ref() else {
                return Ok(());
            };

            match self.rules.parse_rule(topology).await {
                Ok(true) => {
                    self.metrics.inc_rule_updates();
                    if let Some(rule) = self.rules.snapshot().await {
                        self.logger.log_rule_updated(
                            &String::from(rule.kubelet_policy.policy),
                            rule.share_pools.len(),
                            rule.be_share_pools.len(),
                            &rule.system_qos_cpuset,
                        );
                    }
                }
                Ok(false) => {
                    debug!(node_topology = %topology.name, "Cpuset rule unchanged");
                    return Ok(());
                }
                Err(e) => {
                    warn!(node_topology = %topology.name, error = %e, "Keeping previous cpuset rule");
                    return Err(e.into());
                }
            }
        }

        let started = Instant::now();
        let result = self.rule_update_cb(target).await;
        let report = match &result {
            Ok(report) => report,
            Err(e) => e.report(),
        };
        self.record_pass(kind, report, started).await;

        result.map(|_| ()).map_err(Into::into)
    }
}
