//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::time::Duration;

use tokio::sync::broadcast;
use ua_session_core::test_bridge::TestHarness;
use ua_session_core::{Config, Credentials, SessionController, SessionControllerBuilder, UaEvent};

pub const TRANSPORT: &str = "wss://sip.example.com:8089/ws";

pub fn config() -> Config {
    Config::new(TRANSPORT, "sip:alice@example.com", Credentials::password("secret"))
        .with_display_name("Alice")
}

/// A controller driven by `harness`
pub fn controller(harness: &TestHarness, config: Config) -> SessionController {
    SessionControllerBuilder::new()
        .config(config)
        .adapter(harness.adapter())
        .build()
        .expect("controller builds")
}

/// A controller that connects and registers as soon as it is started
pub async fn registered_controller() -> (TestHarness, SessionController) {
    let harness = TestHarness::new();
    harness.auto_connect(TRANSPORT).auto_register(true);
    let controller = controller(&harness, config());
    controller.start().await.expect("start succeeds");
    (harness, controller)
}

/// Next event matching `predicate`, skipping others
pub async fn next_matching<F>(events: &mut broadcast::Receiver<UaEvent>, predicate: F) -> UaEvent
where
    F: Fn(&UaEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Everything already queued on `events`
pub fn drain(events: &mut broadcast::Receiver<UaEvent>) -> Vec<UaEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

/// Events up to and including the first one matching `predicate`
pub async fn collect_until<F>(events: &mut broadcast::Receiver<UaEvent>, predicate: F) -> Vec<UaEvent>
where
    F: Fn(&UaEvent) -> bool,
{
    let mut collected = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let done = predicate(&event);
                    collected.push(event);
                    if done {
                        return;
                    }
                }
                Err(e) => panic!("event stream failed: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for event");
    collected
}
