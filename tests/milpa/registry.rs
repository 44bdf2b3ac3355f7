use std::sync::Arc;

use milpa::milpa::api::codec::VersioningCodec;
use milpa::milpa::api::types::{MilpaObject, NodePhase, PodPhase};
use milpa::milpa::events::{EventSystem, Mutation};
use milpa::milpa::registry::kv::MemoryKvStore;
use milpa::milpa::registry::{NodeRegistry, PodRegistry};
use milpa::milpa::test_support::{fake_node, fake_pod};

fn registries() -> (Arc<PodRegistry>, Arc<NodeRegistry>, Arc<EventSystem>) {
    let kv: Arc<dyn milpa::milpa::registry::kv::KvStore> = Arc::new(MemoryKvStore::new());
    let events = EventSystem::new();
    (
        Arc::new(PodRegistry::new(Arc::clone(&kv), Arc::clone(&events))),
        Arc::new(NodeRegistry::new(kv, Arc::clone(&events))),
        events,
    )
}

/// Two writers race semantic changes to disjoint fields; both survive
/// through the conflict-retry path.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_semantic_updates_both_land() {
    let (pods, _, _) = registries();
    pods.create_pod(fake_pod("p1")).unwrap();

    let binder = {
        let pods = Arc::clone(&pods);
        tokio::spawn(async move {
            pods.update_pod_with_retry("default", "p1", |pod| {
                pod.status.bound_node_name = "n1".to_string();
                Ok(())
            })
            .await
        })
    };
    let phaser = {
        let pods = Arc::clone(&pods);
        tokio::spawn(async move {
            pods.update_pod_with_retry("default", "p1", |pod| {
                pod.status.phase = PodPhase::Dispatching;
                Ok(())
            })
            .await
        })
    };
    binder.await.unwrap().unwrap();
    phaser.await.unwrap().unwrap();

    let stored = pods.get_pod("default", "p1").unwrap();
    assert_eq!(stored.status.bound_node_name, "n1");
    assert_eq!(stored.status.phase, PodPhase::Dispatching);
}

/// Registry writes fan out through the event system to subscribers of
/// the written kind.
#[tokio::test]
async fn writes_fan_out_to_subscribers() {
    let (pods, nodes, events) = registries();
    let mut pod_events = events.subscribe("Pod");
    let mut node_events = events.subscribe("Node");

    pods.create_pod(fake_pod("p1")).unwrap();
    nodes.create_node(fake_node("n1", "t2.small")).unwrap();

    let seen = pod_events.next().await.expect("pod event");
    assert_eq!(seen.mutation, Mutation::Added);
    match seen.object {
        MilpaObject::Pod(pod) => assert_eq!(pod.meta.name, "p1"),
        other => panic!("unexpected kind {}", other.kind()),
    }

    let seen = node_events.next().await.expect("node event");
    match seen.object {
        MilpaObject::Node(node) => {
            assert_eq!(node.meta.name, "n1");
            assert_eq!(node.status.phase, NodePhase::Available);
        }
        other => panic!("unexpected kind {}", other.kind()),
    }
}

/// Typed watches resume from a version and replay what was missed.
#[tokio::test]
async fn pod_watch_resumes_from_a_version() {
    let (pods, _, _) = registries();
    let first = pods.create_pod(fake_pod("p1")).unwrap();
    pods.create_pod(fake_pod("p2")).unwrap();

    let mut watch = pods.watch_pods(Some(first.meta.resource_version)).unwrap();
    let replayed = watch.next().await.expect("replayed event");
    assert_eq!(replayed.object.unwrap().meta.name, "p2");
}

/// Every persisted kind survives the codec unchanged, including the
/// populated status fields controllers actually write.
#[test]
fn realistic_objects_round_trip() {
    let codec = VersioningCodec;

    let mut pod = fake_pod("p1");
    pod.status.phase = PodPhase::Running;
    pod.status.bound_node_name = "n1".to_string();
    pod.status.bound_instance_id = "i-04aa11".to_string();
    pod.status.bound_instance_type = "t2.small".to_string();

    let mut node = fake_node("n1", "t2.small");
    node.status.phase = NodePhase::Claimed;
    node.status.bound_pod_name = "p1".to_string();

    for object in [MilpaObject::Pod(pod), MilpaObject::Node(node)] {
        let bytes = codec.encode(&object).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), object);
    }
}
