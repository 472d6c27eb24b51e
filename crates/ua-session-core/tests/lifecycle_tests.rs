//! Connection and registration lifecycle of the session controller

mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use ua_session_core::event_names::ALL;
use ua_session_core::test_bridge::{HarnessCommand, TestHarness};
use ua_session_core::{ClientError, ConnectionState, EngineError, UaEvent};

use common::{TRANSPORT, config, controller, drain, next_matching, registered_controller};

#[tokio::test]
async fn test_start_resolves_after_registration() {
    let harness = TestHarness::new();
    let controller = controller(&harness, config());
    let mut events = controller.subscribe_events();

    let start = tokio::spawn({
        let controller = controller.clone();
        async move { controller.start().await }
    });

    let command = harness.wait_for("start", 0).await.expect("engine started");
    match command {
        HarnessCommand::Start(engine) => {
            assert_eq!(engine.transport_address, TRANSPORT);
            assert_eq!(engine.identity_uri, "sip:alice@example.com");
            assert_eq!(engine.authorization_user, "alice");
            assert_eq!(engine.password.as_deref(), Some("secret"));
            assert_eq!(engine.display_name.as_deref(), Some("Alice"));
        }
        other => panic!("unexpected command {:?}", other),
    }

    harness.emit("connected", json!({ "address": TRANSPORT }));
    harness.wait_for("register", 0).await.expect("register sent");
    assert!(!start.is_finished());
    assert_eq!(controller.state(), ConnectionState::Registering);

    harness.emit("registered", json!({}));
    start.await.unwrap().unwrap();
    assert_eq!(controller.state(), ConnectionState::Registered);
    assert!(controller.is_registered());

    let seen = drain(&mut events);
    assert!(seen.contains(&UaEvent::Connected {
        transport_address: TRANSPORT.to_string()
    }));
    assert!(seen.contains(&UaEvent::Registered));
    assert!(seen.contains(&UaEvent::ConnectionStateChanged {
        previous: ConnectionState::Registering,
        current: ConnectionState::Registered,
    }));
}

#[tokio::test]
async fn test_concurrent_starts_share_one_attempt() {
    let harness = TestHarness::new();
    let controller = controller(&harness, config().with_auto_register(false));

    let first = tokio::spawn({
        let controller = controller.clone();
        async move { controller.start().await }
    });
    let second = tokio::spawn({
        let controller = controller.clone();
        async move { controller.start().await }
    });

    harness.wait_for("start", 0).await.expect("engine started");
    harness.emit("connected", json!({ "address": TRANSPORT }));

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(harness.count("start"), 1);
    assert_eq!(controller.stats().connect_attempts, 1);
    assert_eq!(controller.state(), ConnectionState::Connected);

    // Already connected: no new attempt
    controller.start().await.unwrap();
    assert_eq!(harness.count("start"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_leaves_failed_state() {
    let harness = TestHarness::new();
    let controller = controller(
        &harness,
        config()
            .with_auto_register(false)
            .with_connect_timeout(Duration::from_millis(200)),
    );

    let result = controller.start().await;
    assert_eq!(result.unwrap_err(), ClientError::ConnectionTimeout { duration_ms: 200 });
    assert_eq!(controller.state(), ConnectionState::Failed);
    assert_eq!(harness.count("stop"), 1);
    for name in ALL {
        assert_eq!(harness.listener_count(name), 0, "listener left on {}", name);
    }

    // A fresh start is always valid after a failure
    harness.auto_connect(TRANSPORT);
    controller.start().await.unwrap();
    assert_eq!(controller.state(), ConnectionState::Connected);
    assert_eq!(controller.stats().connect_attempts, 2);
}

#[tokio::test]
async fn test_transport_closed_while_connecting() {
    let harness = TestHarness::new();
    let controller = controller(&harness, config());

    let start = tokio::spawn({
        let controller = controller.clone();
        async move { controller.start().await }
    });
    harness.wait_for("start", 0).await.expect("engine started");
    harness.emit("disconnected", json!({ "reason": "refused", "error": true }));

    let result = start.await.unwrap();
    assert_eq!(
        result.unwrap_err(),
        ClientError::ConnectionFailed {
            reason: "refused".into()
        }
    );
    assert_eq!(controller.state(), ConnectionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_slow_engine_start_leaves_engine_stopped() {
    let harness = TestHarness::new();
    harness
        .auto_connect(TRANSPORT)
        .delay_start(Duration::from_millis(300));
    let controller = controller(&harness, config());

    let start = tokio::spawn({
        let controller = controller.clone();
        async move { controller.start().await }
    });
    harness.wait_for("start", 0).await.expect("engine started");
    tokio::time::sleep(Duration::from_millis(50)).await;
    controller.stop().await.unwrap();

    assert_eq!(
        start.await.unwrap().unwrap_err(),
        ClientError::OperationCancelled {
            operation: "start".into()
        }
    );
    assert_eq!(controller.state(), ConnectionState::Disconnected);
    assert!(!harness.adapter().is_connected());
    let operations: Vec<&str> = harness.commands().iter().map(|c| c.operation()).collect();
    assert_eq!(operations, vec!["start", "stop", "stop"]);
}

#[tokio::test]
async fn test_engine_start_error_fails_connection() {
    let harness = TestHarness::new();
    harness.fail_next("start", EngineError::Transport("no route".into()));
    let controller = controller(&harness, config());

    let result = controller.start().await;
    assert!(matches!(result, Err(ClientError::ConnectionFailed { .. })));
    assert_eq!(controller.state(), ConnectionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_registration_timeout_does_not_leave_stale_lock() {
    let harness = TestHarness::new();
    harness.auto_connect(TRANSPORT);
    let controller = controller(
        &harness,
        config()
            .with_auto_register(false)
            .with_register_timeout(Duration::from_millis(500)),
    );
    controller.start().await.unwrap();
    let mut events = controller.subscribe_events();

    let result = controller.register().await;
    assert_eq!(result.unwrap_err(), ClientError::RegistrationTimeout { duration_ms: 500 });
    assert_eq!(controller.state(), ConnectionState::Connected);
    assert!(matches!(
        next_matching(&mut events, |e| matches!(e, UaEvent::RegistrationFailed { .. })).await,
        UaEvent::RegistrationFailed { .. }
    ));

    harness.auto_register(true);
    controller.register().await.unwrap();
    assert_eq!(controller.state(), ConnectionState::Registered);
    assert_eq!(harness.count("register"), 2);
}

#[tokio::test]
async fn test_registration_rejected_by_registrar() {
    let harness = TestHarness::new();
    harness.auto_connect(TRANSPORT);
    let controller = controller(&harness, config().with_auto_register(false));
    controller.start().await.unwrap();

    let register = tokio::spawn({
        let controller = controller.clone();
        async move { controller.register().await }
    });
    harness.wait_for("register", 0).await.expect("register sent");
    harness.emit("registrationFailed", json!({ "cause": "Forbidden" }));

    assert_eq!(
        register.await.unwrap().unwrap_err(),
        ClientError::RegistrationFailed {
            reason: "Forbidden".into()
        }
    );
    assert_eq!(controller.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_engine_error_on_register_returns_to_connected() {
    let harness = TestHarness::new();
    harness
        .auto_connect(TRANSPORT)
        .fail_next("register", EngineError::Transport("socket reset".into()));
    let controller = controller(&harness, config().with_auto_register(false));
    controller.start().await.unwrap();

    assert!(matches!(
        controller.register().await,
        Err(ClientError::RegistrationFailed { .. })
    ));
    assert_eq!(controller.state(), ConnectionState::Connected);

    // Not Failed: a fresh register() is valid straight away
    harness.auto_register(true);
    controller.register().await.unwrap();
    assert_eq!(controller.state(), ConnectionState::Registered);
}

#[tokio::test]
async fn test_stop_cancels_pending_register() {
    let harness = TestHarness::new();
    harness.auto_connect(TRANSPORT);
    let controller = controller(&harness, config().with_auto_register(false));
    controller.start().await.unwrap();

    let register = tokio::spawn({
        let controller = controller.clone();
        async move { controller.register().await }
    });
    harness.wait_for("register", 0).await.expect("register sent");

    controller.stop().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(1), register)
        .await
        .expect("register settles without waiting for its timeout")
        .unwrap();
    assert_eq!(
        result.unwrap_err(),
        ClientError::OperationCancelled {
            operation: "register".into()
        }
    );
    assert_eq!(controller.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_register_requires_connection() {
    let harness = TestHarness::new();
    let controller = controller(&harness, config());

    assert_eq!(
        controller.register().await.unwrap_err(),
        ClientError::NotConnected {
            state: "Disconnected".into()
        }
    );
    assert_eq!(harness.count("register"), 0);
}

#[tokio::test]
async fn test_unregister_when_not_registered_is_noop() {
    let harness = TestHarness::new();
    let controller = controller(&harness, config());

    controller.unregister().await.unwrap();
    assert_eq!(harness.count("unregister"), 0);
    assert_eq!(controller.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_unregister_returns_to_connected() {
    let (harness, controller) = registered_controller().await;
    let mut events = controller.subscribe_events();

    controller.unregister().await.unwrap();
    assert_eq!(controller.state(), ConnectionState::Connected);
    assert_eq!(harness.count("unregister"), 1);
    next_matching(&mut events, |e| matches!(e, UaEvent::Unregistered { .. })).await;
}

#[tokio::test]
async fn test_stop_unregisters_and_detaches() {
    let (harness, controller) = registered_controller().await;
    let mut events = controller.subscribe_events();

    controller.stop().await.unwrap();
    assert_eq!(controller.state(), ConnectionState::Disconnected);

    let operations: Vec<&str> = harness.commands().iter().map(|c| c.operation()).collect();
    assert_eq!(operations, vec!["start", "register", "unregister", "stop"]);
    for name in ALL {
        assert_eq!(harness.listener_count(name), 0, "listener left on {}", name);
    }

    let seen = drain(&mut events);
    assert!(seen.contains(&UaEvent::ConnectionStateChanged {
        previous: ConnectionState::Registered,
        current: ConnectionState::Disconnecting,
    }));
    assert_eq!(seen.last(), Some(&UaEvent::Disconnected { reason: None }));

    // Stopping twice is harmless
    controller.stop().await.unwrap();
    assert_eq!(harness.count("stop"), 1);
}

#[tokio::test]
async fn test_restart_after_stop() {
    let (harness, controller) = registered_controller().await;
    controller.stop().await.unwrap();
    controller.start().await.unwrap();

    assert_eq!(controller.state(), ConnectionState::Registered);
    assert_eq!(harness.count("start"), 2);
    assert_eq!(harness.listener_count("connected"), 1);
}

#[tokio::test]
async fn test_transport_lost_after_registration() {
    let (harness, controller) = registered_controller().await;
    let mut events = controller.subscribe_events();

    harness.emit("disconnected", json!({ "reason": "network down" }));
    let event = next_matching(&mut events, |e| matches!(e, UaEvent::Disconnected { .. })).await;
    assert_eq!(
        event,
        UaEvent::Disconnected {
            reason: Some("network down".into())
        }
    );
    assert_eq!(controller.state(), ConnectionState::Disconnected);
    assert!(!controller.is_connected());
}

#[tokio::test]
async fn test_malformed_engine_event_is_dropped() {
    let (harness, controller) = registered_controller().await;
    let mut events = controller.subscribe_events();

    harness.emit("newRTCSession", json!({ "originator": "remote" }));
    harness.emit("disconnected", json!({ "reason": "after bad event" }));

    next_matching(&mut events, |e| matches!(e, UaEvent::Disconnected { .. })).await;
    assert_eq!(controller.stats().events_dropped, 1);
    assert!(controller.calls().is_empty());
}
