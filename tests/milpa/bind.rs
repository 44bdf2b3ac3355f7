use std::time::Duration;

use milpa::milpa::api::types::{NodePhase, PodPhase, REASON_FAILED_SCHEDULING};
use milpa::milpa::test_support::{fake_node, fake_pod};

use crate::common::{fast_provider, running_provider, shut_down, start_controllers, wait_until};

/// An Available cell plus a Waiting pod converge to the reciprocal
/// binding: pod Dispatching on the cell, cell Claimed by the pod.
#[tokio::test(flavor = "multi_thread")]
async fn waiting_pod_binds_to_available_cell() {
    let tp = fast_provider();
    // Seed the warm cell before the loops run so it is the standby the
    // scaler keeps, and keep its agent dark so the pod parks in
    // Dispatching.
    tp.provider.nodes.create_node(fake_node("n1", "t2.small")).unwrap();
    tp.agents.agent_for("n1").set_unreachable(true);
    start_controllers(&tp).await;

    tp.provider.create_pod(fake_pod("p1")).unwrap();

    wait_until("pod to bind", || async {
        tp.provider
            .pods
            .get_pod("default", "p1")
            .map(|pod| pod.status.phase == PodPhase::Dispatching)
            .unwrap_or(false)
    })
    .await;

    let pod = tp.provider.pods.get_pod("default", "p1").unwrap();
    let node = tp.provider.nodes.get_node("n1").unwrap();
    assert_eq!(pod.status.bound_node_name, "n1");
    assert_eq!(pod.status.bound_instance_id, "i-n1");
    assert_eq!(pod.status.bound_instance_type, "t2.small");
    assert_eq!(node.status.phase, NodePhase::Claimed);
    assert_eq!(node.status.bound_pod_name, "p1");

    // Once the agent answers, the next sweep delivers the spec and the
    // pod reaches Running.
    tp.agents.agent_for("n1").set_unreachable(false);
    wait_until("pod to run", || async {
        tp.provider
            .pods
            .get_pod("default", "p1")
            .map(|pod| pod.status.phase == PodPhase::Running)
            .unwrap_or(false)
    })
    .await;

    let deployed = tp.agents.agent_for("n1").deployed_pod().expect("spec on agent");
    assert_eq!(deployed.meta.name, "p1");
    shut_down(tp).await;
}

/// Unknown explicit instance types are a scheduling failure, not an
/// admission failure: the pod stays Waiting, collects a
/// FailedScheduling event and is retried.
#[tokio::test(flavor = "multi_thread")]
async fn unknown_instance_type_keeps_pod_waiting() {
    let tp = running_provider().await;

    let mut pod = fake_pod("p3");
    pod.spec.instance_type = Some("x9.huge".to_string());
    tp.provider.create_pod(pod).unwrap();

    wait_until("FailedScheduling event", || async {
        tp.provider
            .events
            .list_events(|event| {
                event.involved_object.name == "p3"
                    && event.reason == REASON_FAILED_SCHEDULING
                    && event.message.contains("x9.huge")
            })
            .map(|events| !events.is_empty())
            .unwrap_or(false)
    })
    .await;

    let pod = tp.provider.pods.get_pod("default", "p3").unwrap();
    assert_eq!(pod.status.phase, PodPhase::Waiting);
    assert!(pod.status.bound_node_name.is_empty());
    shut_down(tp).await;
}

/// Deleting a pod while it is Dispatching hands the cell back to the
/// pool exactly once and removes the pod record.
#[tokio::test(flavor = "multi_thread")]
async fn delete_during_dispatch_releases_the_cell() {
    let tp = fast_provider();
    tp.provider.nodes.create_node(fake_node("n1", "t2.small")).unwrap();
    tp.agents.agent_for("n1").set_unreachable(true);
    start_controllers(&tp).await;

    tp.provider.create_pod(fake_pod("p1")).unwrap();

    wait_until("pod to bind", || async {
        tp.provider
            .pods
            .get_pod("default", "p1")
            .map(|pod| pod.status.phase == PodPhase::Dispatching)
            .unwrap_or(false)
    })
    .await;

    tp.provider.delete_pod("default", "p1").await.unwrap();

    wait_until("pod record to go away", || async {
        tp.provider
            .pods
            .get_pod("default", "p1")
            .err()
            .map(|error| error.is_not_found())
            .unwrap_or(false)
    })
    .await;

    // Teardown was unconfirmed (agent dark), so the cell cycles out
    // through Cleaning rather than returning Available.
    wait_until("cell to leave Claimed", || async {
        tp.provider
            .nodes
            .get_node("n1")
            .map(|node| {
                node.status.bound_pod_name.is_empty()
                    && node.status.phase != NodePhase::Claimed
            })
            .unwrap_or(true)
    })
    .await;
    shut_down(tp).await;
}

/// Without an explicit instance type the selector shops by price: a
/// tiny request lands on the cheapest satisfying SKU, and the pool
/// boots a cell for that bucket on demand.
#[tokio::test(flavor = "multi_thread")]
async fn unpinned_pods_get_the_cheapest_sku() {
    let tp = running_provider().await;

    let mut pod = fake_pod("p4");
    pod.spec.instance_type = None;
    tp.provider.create_pod(pod).unwrap();

    wait_until("pod to bind to a fresh cell", || async {
        tp.provider
            .pods
            .get_pod("default", "p4")
            .map(|pod| !pod.status.bound_node_name.is_empty())
            .unwrap_or(false)
    })
    .await;

    let pod = tp.provider.pods.get_pod("default", "p4").unwrap();
    assert_eq!(pod.status.bound_instance_type, "t2.nano");
    shut_down(tp).await;
}

/// The standby pool self-heals: the configured warm cell is booted by
/// the controllers without any pod traffic.
#[tokio::test(flavor = "multi_thread")]
async fn standby_cells_boot_without_demand() {
    let tp = running_provider().await;

    wait_until("standby cell to become Available", || async {
        tp.provider
            .nodes
            .nodes_in_phase(NodePhase::Available)
            .map(|nodes| !nodes.is_empty())
            .unwrap_or(false)
    })
    .await;
    assert!(tp.cloud.running_count() >= 1);
    shut_down(tp).await;
}

/// A pod whose containers all exit zero moves to Succeeded and its
/// cell returns to the pool; the record survives until the garbage TTL.
#[tokio::test(flavor = "multi_thread")]
async fn finished_pods_release_their_cell() {
    let tp = fast_provider();
    tp.provider.nodes.create_node(fake_node("n1", "t2.small")).unwrap();
    start_controllers(&tp).await;

    tp.provider.create_pod(fake_pod("p1")).unwrap();

    wait_until("pod to run", || async {
        tp.provider
            .pods
            .get_pod("default", "p1")
            .map(|pod| pod.status.phase == PodPhase::Running)
            .unwrap_or(false)
    })
    .await;

    tp.agents.agent_for("n1").set_containers_exited(0);
    wait_until("pod to succeed", || async {
        tp.provider
            .pods
            .get_pod("default", "p1")
            .map(|pod| pod.status.phase == PodPhase::Succeeded)
            .unwrap_or(false)
    })
    .await;

    wait_until("cell to return to the pool", || async {
        tp.provider
            .nodes
            .get_node("n1")
            .map(|node| {
                node.status.phase == NodePhase::Available
                    && node.status.bound_pod_name.is_empty()
            })
            .unwrap_or(false)
    })
    .await;
    shut_down(tp).await;
}
