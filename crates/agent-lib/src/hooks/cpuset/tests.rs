use super::*;
use crate::cgroup::{CgroupDriver, CgroupVersion, HostCgroupFs};
use crate::health::ComponentStatus;
use crate::models::{
    CgroupBaseType, CgroupPath, CpuManagerPolicy, CpuSharedPool, HostApplicationSpec,
    KubeletCpuManagerPolicy, NodeTopology, QoSClass, ANNOTATION_NODE_CPU_SHARED_POOLS, ANNOTATION_RESOURCE_STATUS, LABEL_POD_QOS,
};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::TempDir;
use tokio::sync::broadcast;

struct Fixture {
    _temp_dir: TempDir,
    layout: CgroupLayout,
    executor: ResourceUpdateExecutor,
    shutdown: broadcast::Sender<()>,
}

impl Fixture {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let layout = CgroupLayout::new(temp_dir.path(), CgroupVersion::V2, CgroupDriver::Cgroupfs);
        let (executor, worker) = ResourceUpdateExecutor::new(Arc::new(HostCgroupFs), 64);
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(worker.run(shutdown_rx));

        Self {
            _temp_dir: temp_dir,
            layout,
            executor,
            shutdown,
        }
    }

    fn plugin(&self) -> CpusetPlugin {
        CpusetPlugin::new(
            self.executor.clone(),
            self.layout.clone(),
            ResolverConfig::default(),
            HealthRegistry::new(),
            StructuredLogger::new("test-node"),
        )
    }

    /// Create an empty `cpuset.cpus` for a cgroup directory
    fn touch(&self, cgroup_dir: &str) {
        let path = self.layout.cpuset_path(cgroup_dir);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }

    fn cpuset(&self, cgroup_dir: &str) -> String {
        read(&self.layout.cpuset_path(cgroup_dir))
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

fn share_rule() -> CpusetRule {
    CpusetRule {
        share_pools: vec![
            CpuSharedPool {
                socket: 0,
                node: 0,
                cpuset: "0-1".to_string(),
            },
            CpuSharedPool {
                socket: 1,
                node: 1,
                cpuset: "5-7".to_string(),
            },
        ],
        ..Default::default()
    }
}

fn status(name: &str, id: Option<&str>) -> ContainerStatus {
    ContainerStatus {
        name: name.to_string(),
        container_id: id.map(str::to_string),
        ..Default::default()
    }
}

fn pod_meta(
    name: &str,
    qos: &str,
    resource_status: Option<&str>,
    init: Vec<ContainerStatus>,
    containers: Vec<ContainerStatus>,
) -> PodMeta {
    let uid = format!("uid-{name}");
    let mut annotations = BTreeMap::new();
    if let Some(value) = resource_status {
        annotations.insert(ANNOTATION_RESOURCE_STATUS.to_string(), value.to_string());
    }

    PodMeta {
        pod: Pod {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some(name.to_string()),
                uid: Some(uid.clone()),
                labels: Some(BTreeMap::from([(
                    LABEL_POD_QOS.to_string(),
                    qos.to_string(),
                )])),
                annotations: Some(annotations),
                ..Default::default()
            },
            status: Some(PodStatus {
                init_container_statuses: Some(init),
                container_statuses: Some(containers),
                ..Default::default()
            }),
            ..Default::default()
        },
        cgroup_dir: format!("kubepods/burstable/pod{uid}"),
        sandbox_id: Some(format!("containerd://sandbox-{name}")),
    }
}

fn host_app(name: &str, qos: QoSClass) -> HostApplicationSpec {
    HostApplicationSpec {
        name: name.to_string(),
        qos,
        cgroup_path: Some(CgroupPath {
            base: CgroupBaseType::Root,
            parent_dir: "host-latency-sensitive".to_string(),
            relative_path: name.to_string(),
        }),
    }
}

#[tokio::test]
async fn test_reconcile_writes_each_target_independently() {
    let fixture = Fixture::new();
    let plugin = fixture.plugin().with_rule(share_rule());

    let pinned = pod_meta(
        "pinned",
        "LSR",
        Some(r#"{"cpuset":"2-4"}"#),
        vec![],
        vec![status("main", Some("containerd://pinned-main"))],
    );
    let shared = pod_meta(
        "shared",
        "LS",
        None,
        vec![status("init", Some("containerd://shared-init"))],
        vec![status("main", Some("containerd://shared-main"))],
    );
    let broken = pod_meta(
        "broken",
        "LS",
        Some("bad-format"),
        vec![],
        vec![status("main", Some("containerd://broken-main"))],
    );

    let dirs = [
        "kubepods/burstable/poduid-pinned/pinned-main",
        "kubepods/burstable/poduid-pinned/sandbox-pinned",
        "kubepods/burstable/poduid-shared/shared-init",
        "kubepods/burstable/poduid-shared/shared-main",
        "kubepods/burstable/poduid-shared/sandbox-shared",
        "kubepods/burstable/poduid-broken/broken-main",
        "kubepods/burstable/poduid-broken/sandbox-broken",
        "host-latency-sensitive/nginx",
        "host-latency-sensitive/redis",
    ];
    for dir in dirs {
        fixture.touch(dir);
    }

    let target = CallbackTarget {
        pods: vec![Arc::new(pinned.clone()), Arc::new(shared.clone()), Arc::new(broken.clone())],
        host_applications: vec![host_app("nginx", QoSClass::Ls), host_app("redis", QoSClass::Lsr)],
        node_topology: None,
    };

    let err = plugin.rule_update_cb(&target).await.unwrap_err();
    let report = err.report();

    assert_eq!(fixture.cpuset("kubepods/burstable/poduid-pinned/pinned-main"), "2-4");
    assert_eq!(fixture.cpuset("kubepods/burstable/poduid-pinned/sandbox-pinned"), "2-4");
    assert_eq!(fixture.cpuset("kubepods/burstable/poduid-shared/shared-init"), "0-1,5-7");
    assert_eq!(fixture.cpuset("kubepods/burstable/poduid-shared/shared-main"), "0-1,5-7");
    assert_eq!(fixture.cpuset("kubepods/burstable/poduid-shared/sandbox-shared"), "0-1,5-7");
    assert_eq!(fixture.cpuset("kubepods/burstable/poduid-broken/broken-main"), "");
    assert_eq!(fixture.cpuset("kubepods/burstable/poduid-broken/sandbox-broken"), "");
    assert_eq!(fixture.cpuset("host-latency-sensitive/nginx"), "0-1,5-7");
    assert_eq!(fixture.cpuset("host-latency-sensitive/redis"), "");

    assert_eq!(report.applied(), 6);
    assert_eq!(report.failed(), 3);
    assert!(matches!(
        report.outcome(&container_target(&broken, "main")),
        Some(ReconcileOutcome::Failed { .. })
    ));
    assert!(matches!(
        report.outcome(&sandbox_target(&broken)),
        Some(ReconcileOutcome::Failed { .. })
    ));
    assert!(matches!(
        report.outcome(&host_app_target("redis")),
        Some(ReconcileOutcome::Failed { .. })
    ));
    assert!(err.to_string().starts_with("3 of 9 cpuset targets failed"));
}

#[tokio::test]
async fn test_second_pass_reports_unchanged() {
    let fixture = Fixture::new();
    let plugin = fixture.plugin().with_rule(share_rule());

    let pod = pod_meta(
        "shared",
        "LS",
        None,
        vec![],
        vec![status("main", Some("containerd://shared-main"))],
    );
    fixture.touch("kubepods/burstable/poduid-shared/shared-main");
    fixture.touch("kubepods/burstable/poduid-shared/sandbox-shared");

    let target = CallbackTarget {
        pods: vec![Arc::new(pod)],
        ..Default::default()
    };

    let first = plugin.rule_update_cb(&target).await.unwrap();
    assert_eq!(first.changed(), 2);

    let second = plugin.rule_update_cb(&target).await.unwrap();
    assert_eq!(second.applied(), 2);
    assert_eq!(second.changed(), 0);
}

#[tokio::test]
async fn test_missing_ids_and_sandbox_are_skipped() {
    let fixture = Fixture::new();
    let plugin = fixture.plugin().with_rule(share_rule());

    let mut pod = pod_meta("starting", "LS", None, vec![], vec![status("main", None)]);
    pod.sandbox_id = None;

    let target = CallbackTarget {
        pods: vec![Arc::new(pod.clone())],
        ..Default::default()
    };

    let report = plugin.rule_update_cb(&target).await.unwrap();
    assert_eq!(report.skipped(), 2);
    assert!(matches!(
        report.outcome(&container_target(&pod, "main")),
        Some(ReconcileOutcome::Skipped { .. })
    ));
    assert!(matches!(
        report.outcome(&sandbox_target(&pod)),
        Some(ReconcileOutcome::Skipped { .. })
    ));
}

#[tokio::test]
async fn test_static_kubelet_policy_leaves_unlabelled_pod_untouched() {
    let fixture = Fixture::new();
    let plugin = fixture.plugin().with_rule(CpusetRule {
        kubelet_policy: KubeletCpuManagerPolicy {
            policy: CpuManagerPolicy::Static,
        },
        ..share_rule()
    });

    let mut pod = pod_meta(
        "plain",
        "",
        None,
        vec![],
        vec![status("main", Some("containerd://plain-main"))],
    );
    pod.pod.metadata.labels = None;

    // Cpus the kubelet already assigned
    let main_dir = "kubepods/burstable/poduid-plain/plain-main";
    let sandbox_dir = "kubepods/burstable/poduid-plain/sandbox-plain";
    for dir in [main_dir, sandbox_dir] {
        fixture.touch(dir);
        std::fs::write(fixture.layout.cpuset_path(dir), "0-3\n").unwrap();
    }

    let target = CallbackTarget {
        pods: vec![Arc::new(pod.clone())],
        ..Default::default()
    };

    let report = plugin.rule_update_cb(&target).await.unwrap();
    assert_eq!(report.skipped(), 2);
    assert_eq!(report.changed(), 0);
    assert!(matches!(
        report.outcome(&container_target(&pod, "main")),
        Some(ReconcileOutcome::Skipped { .. })
    ));
    assert!(matches!(
        report.outcome(&sandbox_target(&pod)),
        Some(ReconcileOutcome::Skipped { .. })
    ));
    assert_eq!(fixture.cpuset(main_dir), "0-3\n");
    assert_eq!(fixture.cpuset(sandbox_dir), "0-3\n");
}

#[tokio::test]
async fn test_reconcile_waits_for_rule() {
    let fixture = Fixture::new();
    let plugin = fixture.plugin();

    let pod = pod_meta(
        "shared",
        "LS",
        None,
        vec![],
        vec![status("main", Some("containerd://shared-main"))],
    );
    fixture.touch("kubepods/burstable/poduid-shared/shared-main");

    let target = CallbackTarget {
        pods: vec![Arc::new(pod)],
        ..Default::default()
    };

    let report = plugin.rule_update_cb(&target).await.unwrap();
    assert!(report.targets.is_empty());
    assert_eq!(fixture.cpuset("kubepods/burstable/poduid-shared/shared-main"), "");
}

#[tokio::test]
async fn test_topology_update_parses_rule_and_reconciles() {
    let fixture = Fixture::new();
    let plugin = fixture.plugin();

    let pod = pod_meta(
        "shared",
        "LS",
        None,
        vec![],
        vec![status("main", Some("containerd://shared-main"))],
    );
    fixture.touch("kubepods/burstable/poduid-shared/shared-main");
    fixture.touch("kubepods/burstable/poduid-shared/sandbox-shared");

    let topology = |pools: String| NodeTopology {
        name: "test-node".to_string(),
        annotations: BTreeMap::from([(ANNOTATION_NODE_CPU_SHARED_POOLS.to_string(), pools)]),
    };

    let mut target = CallbackTarget {
        pods: vec![Arc::new(pod)],
        host_applications: vec![],
        node_topology: Some(topology(
            serde_json::to_string(&share_rule().share_pools).unwrap(),
        )),
    };

    plugin
        .on_update(RegisterType::NodeTopology, &target)
        .await
        .unwrap();
    assert_eq!(fixture.cpuset("kubepods/burstable/poduid-shared/shared-main"), "0-1,5-7");
    assert_eq!(
        plugin.rules().snapshot().await.unwrap().share_pools,
        share_rule().share_pools
    );

    // A malformed annotation keeps the previous rule
    target.node_topology = Some(topology("bad-format".to_string()));
    assert!(plugin
        .on_update(RegisterType::NodeTopology, &target)
        .await
        .is_err());
    assert_eq!(
        plugin.rules().snapshot().await.unwrap().share_pools,
        share_rule().share_pools
    );
}

#[tokio::test]
async fn test_failed_pass_degrades_hook_health() {
    let fixture = Fixture::new();
    let health = HealthRegistry::new();
    let plugin = CpusetPlugin::new(
        fixture.executor.clone(),
        fixture.layout.clone(),
        ResolverConfig::default(),
        health.clone(),
        StructuredLogger::new("test-node"),
    )
    .with_rule(share_rule());

    // No cgroup files exist, so every write fails
    let target = CallbackTarget {
        host_applications: vec![host_app("nginx", QoSClass::Ls)],
        ..Default::default()
    };
    assert!(plugin
        .on_update(RegisterType::NodeSloSpec, &target)
        .await
        .is_err());

    let component = health.component(components::CPUSET_HOOK).await.unwrap();
    assert_eq!(component.status, ComponentStatus::Degraded);
    assert!(component.message.is_some());

    fixture.touch("host-latency-sensitive/nginx");
    plugin
        .on_update(RegisterType::NodeSloSpec, &target)
        .await
        .unwrap();
    let component = health.component(components::CPUSET_HOOK).await.unwrap();
    assert_eq!(component.status, ComponentStatus::Healthy);
}
