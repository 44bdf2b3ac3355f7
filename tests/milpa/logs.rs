use milpa::milpa::api::types::{pod_reference, PodPhase};
use milpa::milpa::test_support::{fake_node, fake_pod, test_instance_provider};

/// A pod that is not running is served from the registry snapshot; no
/// agent involved.
#[tokio::test]
async fn waiting_pod_logs_come_from_the_registry() {
    let tp = test_instance_provider();

    let pod = tp.provider.create_pod(fake_pod("p2")).unwrap();
    assert_eq!(pod.status.phase, PodPhase::Waiting);
    tp.provider
        .logs
        .put_log(pod_reference(&pod), "", "Old pod log lines")
        .unwrap();

    let log = tp.provider.find_log("p2", "", 0).await.unwrap();
    assert_eq!(log.content, "Old pod log lines");
    assert_eq!(log.parent_object.kind, "Pod");
    assert_eq!(log.parent_object.uid, pod.meta.uid);
}

/// A running pod's logs come straight from its node agent.
#[tokio::test]
async fn running_pod_logs_come_from_the_agent() {
    let tp = test_instance_provider();

    tp.provider.nodes.create_node(fake_node("n1", "t2.small")).unwrap();
    let mut pod = tp.provider.create_pod(fake_pod("p1")).unwrap();
    pod.status.phase = PodPhase::Running;
    pod.status.bound_node_name = "n1".to_string();
    tp.provider.pods.update_pod(&pod).unwrap();

    tp.agents.agent_for("n1").set_log("main", "live container logs");

    let log = tp.provider.find_log("p1", "", 0).await.unwrap();
    assert_eq!(log.content, "live container logs");
    assert_eq!(log.parent_object.name, "p1");
}

/// Snapshots for cluster objects other than pods (a cell's own agent
/// log) resolve through the same fallback.
#[tokio::test]
async fn node_logs_resolve_by_parent_name() {
    let tp = test_instance_provider();

    let node = tp.provider.nodes.create_node(fake_node("n9", "t2.small")).unwrap();
    tp.provider
        .logs
        .put_log(
            milpa::milpa::api::types::node_reference(&node),
            "itzo",
            "agent boot log",
        )
        .unwrap();

    let log = tp.provider.find_log("n9", "itzo", 0).await.unwrap();
    assert_eq!(log.content, "agent boot log");
    assert_eq!(log.parent_object.kind, "Node");
}

/// Missing logs are an error, not an empty result.
#[tokio::test]
async fn absent_logs_error() {
    let tp = test_instance_provider();
    assert!(tp.provider.find_log("ghost", "", 0).await.is_err());
}
