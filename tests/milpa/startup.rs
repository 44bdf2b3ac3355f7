use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use milpa::milpa::cloud::mock::MockCloudClient;
use milpa::milpa::cloud::CloudClient;
use milpa::milpa::config::ProviderConfig;
use milpa::milpa::nodeclient::mock::MockNodeClientFactory;
use milpa::milpa::registry::kv::{KvStore, MemoryKvStore};
use milpa::milpa::registry::CLUSTER_REGION_KEY;
use milpa::milpa::server::{InstanceProvider, ProviderDeps};
use milpa::milpa::test_support::{test_instance_provider, test_server_config};

/// The cluster region is pinned on first boot; coming back up in a
/// different region must fail naming both regions.
#[test]
fn startup_fails_on_region_change() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    kv.put(CLUSTER_REGION_KEY, b"us-east-1").unwrap();

    let cloud = Arc::new(MockCloudClient::new("us-west-2").with_boot_image("img-1"));
    let result = InstanceProvider::new(
        "vk-node",
        "192.0.2.10",
        &test_server_config(),
        ProviderConfig::default(),
        ProviderDeps {
            kv,
            cloud: cloud as Arc<dyn CloudClient>,
            clients: MockNodeClientFactory::new(),
            quit: CancellationToken::new(),
        },
    );

    let message = result.err().expect("startup must fail").to_string();
    assert!(message.contains("us-east-1"), "saved region missing: {message}");
    assert!(message.contains("us-west-2"), "cloud region missing: {message}");
}

/// A config with no default instance type is rejected before any
/// collaborator is touched.
#[test]
fn startup_fails_on_invalid_config() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let cloud = Arc::new(MockCloudClient::new("us-east-1"));
    let result = InstanceProvider::new(
        "vk-node",
        "192.0.2.10",
        &milpa::milpa::config::ServerConfig::default(),
        ProviderConfig::default(),
        ProviderDeps {
            kv,
            cloud: cloud as Arc<dyn CloudClient>,
            clients: MockNodeClientFactory::new(),
            quit: CancellationToken::new(),
        },
    );
    let message = result.err().expect("startup must fail").to_string();
    assert!(message.contains("defaultInstanceType"));
}

/// Only one controller set runs per cluster: with the lease held, a
/// second manager over the same store never becomes leader.
#[tokio::test]
async fn second_manager_does_not_win_the_election() {
    let tp = test_instance_provider();
    assert!(tp.provider.manager.wait_for_leadership().await);

    let mut config = test_server_config();
    config.testing.controller_id = "test-controller-b".to_string();
    let cloud = Arc::new(MockCloudClient::new("us-east-1").with_boot_image("img-1"));
    let rival = InstanceProvider::new(
        "vk-node-b",
        "192.0.2.11",
        &config,
        ProviderConfig::default(),
        ProviderDeps {
            kv: Arc::clone(&tp.kv),
            cloud: cloud as Arc<dyn CloudClient>,
            clients: MockNodeClientFactory::new(),
            quit: CancellationToken::new(),
        },
    )
    .unwrap();

    assert!(!rival.manager.is_leader());
    // Cancel the rival's quit and confirm it gives up without the lease.
    rival.manager.quit_token().cancel();
    assert!(!rival.manager.wait_for_leadership().await);
}

/// The synthesized Kubernetes node advertises the configured capacity,
/// a single Ready=True condition and the detected internal address.
#[test]
fn virtual_node_status_synthesis() {
    let tp = test_instance_provider();
    let status = tp.provider.configure_node();

    assert_eq!(status.capacity.get("cpu").map(String::as_str), Some("20"));
    assert_eq!(status.capacity.get("memory").map(String::as_str), Some("100Gi"));
    assert_eq!(status.capacity.get("pods").map(String::as_str), Some("20"));
    assert_eq!(status.capacity, status.allocatable);

    let ready: Vec<_> = status
        .conditions
        .iter()
        .filter(|condition| condition.status == "True")
        .collect();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].condition_type, "Ready");

    assert_eq!(status.addresses.len(), 1);
    assert_eq!(status.addresses[0].address_type, "InternalIP");
    assert_eq!(status.addresses[0].address, "192.0.2.10");
}

/// The notifier registered through the provider surface fires on phase
/// transitions driven by the pod controller.
#[tokio::test(flavor = "multi_thread")]
async fn notifier_fires_on_status_transitions() {
    use crate::common::{fast_provider, shut_down, start_controllers, wait_until};
    use milpa::milpa::api::types::PodPhase;
    use milpa::milpa::test_support::{fake_node, fake_pod};
    use std::sync::Mutex;

    let tp = fast_provider();
    let phases: Arc<Mutex<Vec<PodPhase>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&phases);
    tp.provider.notify_pods(Arc::new(move |pod| {
        sink.lock().unwrap().push(pod.status.phase);
    }));
    tp.provider.nodes.create_node(fake_node("n1", "t2.small")).unwrap();
    start_controllers(&tp).await;

    tp.provider.create_pod(fake_pod("p1")).unwrap();

    wait_until("notifier to observe Running", || async {
        phases.lock().unwrap().contains(&PodPhase::Running)
    })
    .await;
    let seen = phases.lock().unwrap().clone();
    assert!(seen.contains(&PodPhase::Dispatching));
    shut_down(tp).await;
}
