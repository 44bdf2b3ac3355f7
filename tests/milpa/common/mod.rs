#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use milpa::milpa::config::ServerConfig;
use milpa::milpa::test_support::{test_instance_provider_with, TestProvider};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Config with sub-second pool ticks and one warm t2.small so the
/// controller loops converge quickly inside tests. The reaper stays
/// slow enough that deliberately-unreachable agents are not reaped
/// mid-assertion.
pub fn fast_server_config() -> ServerConfig {
    serde_json::from_str(
        r#"{
            "nodes": {
                "defaultInstanceType": "t2.small",
                "bootImageTags": ["img-1"],
                "standbyNodes": [{"instanceType": "t2.small", "count": 1}],
                "poolInterval": "100ms",
                "heartbeatInterval": "1s",
                "reaperInterval": "5s"
            },
            "testing": {"controllerID": "test-controller"},
            "garbage": {
                "cleanInstancesInterval": "200ms",
                "cleanTerminatedInterval": "200ms"
            }
        }"#,
    )
    .expect("fast server config")
}

/// Provider that is wired but not yet running, so tests can seed nodes
/// and script agents before the control loops observe anything.
pub fn fast_provider() -> TestProvider {
    test_instance_provider_with(&fast_server_config())
}

/// Wins leadership and starts the controller set.
pub async fn start_controllers(tp: &TestProvider) {
    assert!(tp.provider.manager.wait_for_leadership().await);
    tp.provider.manager.start_controllers();
    // Let the event subscriptions come up before tests write pods.
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Provider with controllers already running as leader.
pub async fn running_provider() -> TestProvider {
    let tp = fast_provider();
    start_controllers(&tp).await;
    tp
}

pub async fn shut_down(tp: TestProvider) {
    tp.quit.cancel();
    assert!(
        tp.provider
            .manager
            .wait_for_shutdown(Duration::from_secs(5))
            .await,
        "controllers failed to drain"
    );
}

/// Polls `check` until it returns true or the timeout passes.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
