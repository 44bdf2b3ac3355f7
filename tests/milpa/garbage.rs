use chrono::Utc;

use milpa::milpa::api::types::{PodPhase, REASON_NODE_LOST};
use milpa::milpa::cloud::{CloudInstance, InstanceState};
use milpa::milpa::test_support::fake_pod;

use crate::common::{running_provider, shut_down, wait_until};

fn orphan_instance(id: &str, age_minutes: i64) -> CloudInstance {
    CloudInstance {
        id: id.to_string(),
        node_name: "forgotten".to_string(),
        instance_type: "t2.small".to_string(),
        state: InstanceState::Running,
        launch_time: Utc::now() - chrono::Duration::minutes(age_minutes),
        private_ip: "10.0.0.77".to_string(),
        public_ip: String::new(),
    }
}

/// A tagged instance with no registry node and a stale launch time is
/// terminated by the running controller set.
#[tokio::test(flavor = "multi_thread")]
async fn orphan_instances_are_reaped() {
    let tp = running_provider().await;
    tp.cloud.inject_instance(orphan_instance("i-42", 10));

    wait_until("orphan to be terminated", || async {
        tp.cloud.instance("i-42").map(|instance| instance.state)
            == Some(InstanceState::Terminated)
    })
    .await;
    shut_down(tp).await;
}

/// A pod bound to a node that vanished from the registry fails with
/// NodeLost rather than hanging forever.
#[tokio::test(flavor = "multi_thread")]
async fn pods_bound_to_vanished_nodes_fail() {
    let tp = running_provider().await;

    let mut pod = tp.provider.create_pod(fake_pod("p1")).unwrap();
    pod.status.phase = PodPhase::Running;
    pod.status.bound_node_name = "never-existed".to_string();
    tp.provider.pods.update_pod(&pod).unwrap();

    wait_until("pod to fail with NodeLost", || async {
        tp.provider
            .pods
            .get_pod("default", "p1")
            .map(|pod| {
                pod.status.phase == PodPhase::Failed && pod.status.reason == REASON_NODE_LOST
            })
            .unwrap_or(false)
    })
    .await;

    wait_until("NodeLost event", || async {
        tp.provider
            .events
            .list_events(|event| {
                event.involved_object.name == "p1" && event.reason == REASON_NODE_LOST
            })
            .map(|events| !events.is_empty())
            .unwrap_or(false)
    })
    .await;
    shut_down(tp).await;
}
