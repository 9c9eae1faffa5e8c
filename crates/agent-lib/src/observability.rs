//! Observability infrastructure for the isolation agent
//!
//! Provides:
//! - Prometheus metrics (reconcile latency, cgroup update outcomes, informer events)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for reconcile passes (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    reconcile_latency_seconds: Histogram,
    cgroup_updates: IntCounterVec,
    reconcile_failures: IntCounter,
    rule_updates: IntCounter,
    pods_tracked: IntGauge,
    host_apps_tracked: IntGauge,
    informer_events: IntCounterVec,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            reconcile_latency_seconds: register_histogram!(
                "isolation_agent_reconcile_latency_seconds",
                "Time spent on one cpuset reconcile pass",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_latency_seconds"),

            cgroup_updates: register_int_counter_vec!(
                "isolation_agent_cgroup_updates_total",
                "Cgroup file updates applied by the executor",
                &["outcome"]
            )
            .expect("Failed to register cgroup_updates"),

            reconcile_failures: register_int_counter!(
                "isolation_agent_reconcile_failures_total",
                "Targets that failed during reconcile passes"
            )
            .expect("Failed to register reconcile_failures"),

            rule_updates: register_int_counter!(
                "isolation_agent_cpuset_rule_updates_total",
                "Number of times the node cpuset rule changed"
            )
            .expect("Failed to register rule_updates"),

            pods_tracked: register_int_gauge!(
                "isolation_agent_pods_tracked",
                "Pods currently cached by the states informer"
            )
            .expect("Failed to register pods_tracked"),

            host_apps_tracked: register_int_gauge!(
                "isolation_agent_host_apps_tracked",
                "Host applications declared in the NodeSLO"
            )
            .expect("Failed to register host_apps_tracked"),

            informer_events: register_int_counter_vec!(
                "isolation_agent_informer_events_total",
                "Watch events handled per informer plugin",
                &["plugin"]
            )
            .expect("Failed to register informer_events"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn observe_reconcile_latency(&self, duration_secs: f64) {
        self.inner().reconcile_latency_seconds.observe(duration_secs);
    }

    /// Count an executor outcome: `written`, `unchanged` or `failed`
    pub fn inc_cgroup_update(&self, outcome: &str) {
        self.inner()
            .cgroup_updates
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn add_reconcile_failures(&self, count: u64) {
        self.inner().reconcile_failures.inc_by(count);
    }

    pub fn inc_rule_updates(&self) {
        self.inner().rule_updates.inc();
    }

    pub fn set_pods_tracked(&self, count: i64) {
        self.inner().pods_tracked.set(count);
    }

    pub fn set_host_apps_tracked(&self, count: i64) {
        self.inner().host_apps_tracked.set(count);
    }

    pub fn inc_informer_event(&self, plugin: &str) {
        self.inner()
            .informer_events
            .with_label_values(&[plugin])
            .inc();
    }
}

/// Structured logger for agent events
///
/// Emits one consistently shaped record per significant event so the JSON
/// output can be filtered on the `event` field.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str, cgroup_root: &str, be_cpu_manager_enabled: bool) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            cgroup_root = %cgroup_root,
            be_cpu_manager_enabled = be_cpu_manager_enabled,
            "Isolation agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Isolation agent shutting down"
        );
    }

    /// Log a change of the node cpuset rule
    pub fn log_rule_updated(
        &self,
        kubelet_policy: &str,
        share_pools: usize,
        be_share_pools: usize,
        system_cpuset: &str,
    ) {
        info!(
            event = "cpuset_rule_updated",
            node = %self.node_name,
            kubelet_policy = %kubelet_policy,
            share_pools = share_pools,
            be_share_pools = be_share_pools,
            system_cpuset = %system_cpuset,
            "Cpuset rule updated"
        );
    }

    /// Log the outcome of a reconcile pass
    pub fn log_reconcile(
        &self,
        trigger: &str,
        applied: usize,
        changed: usize,
        skipped: usize,
        failed: usize,
        elapsed_ms: u128,
    ) {
        if failed > 0 {
            warn!(
                event = "reconcile_completed",
                node = %self.node_name,
                trigger = %trigger,
                applied = applied,
                changed = changed,
                skipped = skipped,
                failed = failed,
                elapsed_ms = elapsed_ms,
                "Cpuset reconcile completed with failures"
            );
        } else {
            info!(
                event = "reconcile_completed",
                node = %self.node_name,
                trigger = %trigger,
                applied = applied,
                changed = changed,
                skipped = skipped,
                failed = failed,
                elapsed_ms = elapsed_ms,
                "Cpuset reconcile completed"
            );
        }
    }
}
