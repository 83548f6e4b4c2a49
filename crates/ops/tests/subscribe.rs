use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use k8test_core::labels::SUBSCRIPTION_PREFIX;
use k8test_core::{generate_resource_name, identity_labels, subscription_balance, DeployedImage, ExposeStrategy, ResourceError, ResourceIdentity, SingletonStrategy};
use k8test_kubehub::memory::MemoryCluster;
use k8test_kubehub::{ClusterApis, ResourceApi};
use k8test_ops::{
    lock_name, manifests, LeaseConfig, Orchestrator, OrchestratorConfig, ReadinessCheck, ScopeLease, SubscribeRequest, UnsubscribeRequest, Unsubscribed,
};
use tokio_util::sync::CancellationToken;

const NS: &str = "k8test-ns";

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        settle_delay: Duration::ZERO,
        ready_poll_interval: Duration::from_millis(5),
        lease: LeaseConfig { retry_interval: Duration::from_millis(5), ..Default::default() },
        ..Default::default()
    }
}

fn setup() -> (Arc<MemoryCluster>, Arc<Orchestrator>) {
    let cluster = Arc::new(MemoryCluster::new("192.168.49.2"));
    let orch = Arc::new(Orchestrator::new(cluster.clone(), fast_config()));
    (cluster, orch)
}

fn redis(strategy: SingletonStrategy) -> ResourceIdentity {
    ResourceIdentity::new("app-1", "library/redis", NS, strategy)
}

fn request(identity: ResourceIdentity) -> SubscribeRequest {
    SubscribeRequest::new(identity, 6379, ExposeStrategy::UserMachine)
}

fn balance(cluster: &MemoryCluster, name: &str) -> i64 {
    let dep = cluster.memory_deployments(NS).snapshot(name).expect("deployment exists");
    subscription_balance(dep.metadata.labels.as_ref().expect("labels"))
}

#[tokio::test]
async fn concurrent_subscribers_share_one_deployment_until_the_last_leaves() {
    let (cluster, orch) = setup();
    let n = 5;
    let images: Vec<DeployedImage> = join_all((0..n).map(|_| {
        let orch = Arc::clone(&orch);
        async move { orch.subscribe(request(redis(SingletonStrategy::AppId))).await }
    }))
    .await
    .into_iter()
    .collect::<anyhow::Result<_>>()
    .expect("all subscribes succeed");

    let deployments = cluster.memory_deployments(NS);
    let services = cluster.memory_services(NS);
    assert_eq!(deployments.created_count(), 1);
    assert_eq!(services.created_count(), 1);
    assert!(images.iter().all(|i| i == &images[0]));
    let name = images[0].deployment_name.clone();
    assert_eq!(balance(&cluster, &name), n);

    let unsubscribe = UnsubscribeRequest::for_image(redis(SingletonStrategy::AppId), &images[0]);
    for left in (1..n).rev() {
        assert_eq!(orch.unsubscribe(&unsubscribe).await.expect("unsubscribe"), Unsubscribed::Remaining(left));
        assert!(deployments.snapshot(&name).is_some());
        assert!(services.snapshot(&name).is_some());
    }
    assert_eq!(orch.unsubscribe(&unsubscribe).await.expect("last unsubscribe"), Unsubscribed::Deleted);
    assert!(deployments.names().is_empty());
    assert!(services.names().is_empty());
}

#[tokio::test]
async fn separate_processes_racing_on_one_scope_share_the_pair() {
    let cluster = Arc::new(MemoryCluster::new("192.168.49.2").with_ready_delay(Duration::from_millis(50)));
    let first = Orchestrator::new(cluster.clone(), fast_config());
    let second = Orchestrator::new(cluster.clone(), fast_config());
    let (a, b) = tokio::join!(first.subscribe(request(redis(SingletonStrategy::AppId))), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        second.subscribe(request(redis(SingletonStrategy::AppId))).await
    });
    let a = a.expect("first process subscribes");
    let b = b.expect("second process adopts");
    assert_eq!(a, b);
    assert_eq!(cluster.memory_deployments(NS).created_count(), 1);
    assert_eq!(cluster.memory_services(NS).created_count(), 1);
    assert_eq!(balance(&cluster, &a.deployment_name), 2);
    assert!(cluster.memory_leases(NS).names().is_empty());

    let req = UnsubscribeRequest::for_image(redis(SingletonStrategy::AppId), &a);
    assert_eq!(second.unsubscribe(&req).await.expect("second leaves"), Unsubscribed::Remaining(1));
    assert_eq!(first.unsubscribe(&req).await.expect("first leaves"), Unsubscribed::Deleted);
    assert!(cluster.memory_deployments(NS).names().is_empty());
    assert!(cluster.memory_services(NS).names().is_empty());
}

#[tokio::test]
async fn scope_lock_held_elsewhere_blocks_subscribe_until_released() {
    let (cluster, orch) = setup();
    let name = generate_resource_name(&redis(SingletonStrategy::AppId)).resource_name;
    let lease_cfg = LeaseConfig { retry_interval: Duration::from_millis(5), ..Default::default() };
    let other = ScopeLease::acquire(cluster.leases(NS), NS, &lock_name(&name), "other-process", &lease_cfg, &CancellationToken::new()).await.expect("lock");

    let waiting = {
        let orch = Arc::clone(&orch);
        tokio::spawn(async move { orch.subscribe(request(redis(SingletonStrategy::AppId))).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiting.is_finished());
    assert_eq!(cluster.memory_services(NS).created_count(), 0);

    other.release().await;
    let image = waiting.await.expect("join").expect("subscribes once unlocked");
    assert_eq!(image.deployment_name, name);
    assert_eq!(balance(&cluster, &name), 1);
}

#[tokio::test]
async fn subscription_labels_are_append_only() {
    let (cluster, orch) = setup();
    let image = orch.subscribe(request(redis(SingletonStrategy::AppId))).await.expect("first");
    orch.subscribe(request(redis(SingletonStrategy::AppId))).await.expect("second");
    orch.unsubscribe(&UnsubscribeRequest::for_image(redis(SingletonStrategy::AppId), &image)).await.expect("unsubscribe");

    let dep = cluster.memory_deployments(NS).snapshot(&image.deployment_name).expect("still there");
    let history: Vec<&String> = dep.metadata.labels.as_ref().expect("labels").iter().filter(|(k, _)| k.starts_with(SUBSCRIPTION_PREFIX)).map(|(_, v)| v).collect();
    assert_eq!(history.len(), 3);
    assert_eq!(history.iter().filter(|v| v.as_str() == "unsubscribe").count(), 1);
}

#[tokio::test]
async fn many_strategy_creates_a_deployment_per_call() {
    let (cluster, orch) = setup();
    let a = orch.subscribe(request(redis(SingletonStrategy::Many))).await.expect("a");
    let b = orch.subscribe(request(redis(SingletonStrategy::Many))).await.expect("b");
    assert_ne!(a.deployment_name, b.deployment_name);
    assert_eq!(cluster.memory_deployments(NS).created_count(), 2);

    let res = orch.unsubscribe(&UnsubscribeRequest::for_image(redis(SingletonStrategy::Many), &a)).await.expect("unsubscribe a");
    assert_eq!(res, Unsubscribed::Deleted);
    assert_eq!(cluster.memory_deployments(NS).names(), vec![b.deployment_name.clone()]);
}

#[tokio::test]
async fn namespace_singleton_survives_unsubscribe() {
    let (cluster, orch) = setup();
    let image = orch.subscribe(request(redis(SingletonStrategy::Namespace))).await.expect("subscribe");
    assert!(image.deployment_name.starts_with("k8test-ns-app-1-"));
    let res = orch.unsubscribe(&UnsubscribeRequest::for_image(redis(SingletonStrategy::Namespace), &image)).await.expect("unsubscribe");
    assert_eq!(res, Unsubscribed::Kept);
    assert!(cluster.memory_deployments(NS).snapshot(&image.deployment_name).is_some());
    assert_eq!(balance(&cluster, &image.deployment_name), 1);
}

#[tokio::test]
async fn strategy_mismatch_on_existing_resource_fails() {
    let (cluster, orch) = setup();
    let wanted = redis(SingletonStrategy::AppId);
    let naming = generate_resource_name(&wanted);
    let mut foreign = naming.clone();
    foreign.strategy = SingletonStrategy::Namespace;
    let labels = identity_labels(&wanted, &foreign);
    cluster.memory_services(NS).insert(manifests::service(&naming, NS, &labels, 6379));

    let err = orch.subscribe(request(wanted)).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<ResourceError>(), Some(ResourceError::InconsistentClusterState(_))), "{:#}", err);
    assert_eq!(cluster.memory_deployments(NS).created_count(), 0);
}

#[tokio::test]
async fn orphaned_service_is_reported_not_healed() {
    let (cluster, orch) = setup();
    let wanted = redis(SingletonStrategy::AppId);
    let naming = generate_resource_name(&wanted);
    let labels = identity_labels(&wanted, &naming);
    cluster.memory_services(NS).insert(manifests::service(&naming, NS, &labels, 6379));

    let err = orch.subscribe(request(wanted)).await.unwrap_err();
    match err.downcast_ref::<ResourceError>() {
        Some(ResourceError::InconsistentClusterState(msg)) => assert!(msg.contains("Delete namespace k8test-ns"), "{}", msg),
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn expose_strategies_resolve_different_addresses() {
    let (cluster, orch) = setup();
    let outside = orch.subscribe(request(redis(SingletonStrategy::AppId))).await.expect("user machine");
    assert_eq!(outside.deployed_image_address, "192.168.49.2");
    assert!(outside.deployed_image_port >= 30000);

    let mut req = request(redis(SingletonStrategy::AppId));
    req.expose_strategy = ExposeStrategy::InsideCluster;
    let inside = orch.subscribe(req).await.expect("inside cluster");
    let svc = cluster.services(NS).get(&inside.service_name).await.expect("service");
    assert_eq!(Some(inside.deployed_image_address.clone()), svc.spec.and_then(|s| s.cluster_ip));
    assert_eq!(inside.deployed_image_port, 6379);
    assert_eq!(inside.deployed_image_url, "library/redis");
}

#[tokio::test]
async fn readiness_check_is_polled_until_it_passes() {
    let (_cluster, orch) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let check: ReadinessCheck = Arc::new(move |_image: DeployedImage| -> BoxFuture<'static, anyhow::Result<()>> {
        let seen = Arc::clone(&seen);
        Box::pin(async move {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("connection refused")
            }
            Ok(())
        })
    });
    let mut req = request(redis(SingletonStrategy::AppId));
    req.readiness = Some(check);
    orch.subscribe(req).await.expect("becomes ready");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn cancelled_readiness_wait_returns_cancelled() {
    let (_cluster, orch) = setup();
    let mut req = request(redis(SingletonStrategy::AppId));
    req.readiness = Some(Arc::new(|_image: DeployedImage| -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async { Err(anyhow::anyhow!("never up")) })
    }));
    req.cancel.cancel();
    let err = orch.subscribe(req).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<ResourceError>(), Some(ResourceError::Cancelled(_))));
}
