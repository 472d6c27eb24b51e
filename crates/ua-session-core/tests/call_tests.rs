//! Call placement, incoming sessions and in-call controls

mod common;

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::{Value, json};
use ua_session_core::test_bridge::{HarnessCommand, TestHarness};
use ua_session_core::{
    AnswerOptions, CallOptions, CallState, ClientError, EngineError, MuteOptions, Originator,
    SessionHandle, TerminateOptions, UaEvent,
};

use common::{collect_until, drain, next_matching, registered_controller};

fn initiated_options(harness: &TestHarness) -> CallOptions {
    harness
        .commands()
        .into_iter()
        .rev()
        .find_map(|c| match c {
            HarnessCommand::InitiateCall { options, .. } => Some(options),
            _ => None,
        })
        .expect("call was placed")
}

fn session_events(events: &[UaEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, UaEvent::Session { .. }))
        .count()
}

#[tokio::test]
async fn test_incoming_session_announced_once() {
    let (harness, controller) = registered_controller().await;
    let mut events = controller.subscribe_events();

    let announcement = json!({
        "handle": "remote-1",
        "originator": "remote",
        "callId": "abc@pbx",
        "remoteIdentity": { "uri": "sip:bob@example.com", "displayName": "Bob" },
    });
    harness.emit("newRTCSession", announcement.clone());
    harness.emit("newRTCSession", announcement);
    harness.emit("session:progress", json!({ "handle": "remote-1" }));
    let seen = collect_until(&mut events, |e| matches!(e, UaEvent::SessionStateChanged { .. })).await;
    assert_eq!(session_events(&seen), 1);

    let calls = controller.calls().list();
    assert_eq!(calls.len(), 1);
    let session = &calls[0];
    assert_eq!(session.call_id, "abc@pbx");
    assert_eq!(session.originator, Originator::Remote);
    assert_eq!(session.remote_identity.display_name.as_deref(), Some("Bob"));
    assert_eq!(session.state, CallState::Progress);
}

#[tokio::test]
async fn test_incoming_session_event_carries_originator() {
    let (harness, controller) = registered_controller().await;
    let mut events = controller.subscribe_events();

    harness.emit(
        "newRTCSession",
        json!({
            "handle": "remote-2",
            "originator": "remote",
            "callId": "def@pbx",
            "remoteIdentity": { "uri": "sip:carol@example.com" },
        }),
    );
    let event = next_matching(&mut events, |e| matches!(e, UaEvent::Session { .. })).await;
    match event {
        UaEvent::Session {
            originator, call_id, ..
        } => {
            assert_eq!(originator, Originator::Remote);
            assert_eq!(call_id, "def@pbx");
        }
        other => panic!("unexpected {:?}", other),
    }

    // Drive the session to its end and check nothing else announced it
    harness.emit("session:failed", json!({ "handle": "remote-2", "cause": "Canceled" }));
    let ended = next_matching(&mut events, |e| matches!(e, UaEvent::SessionStateChanged { .. })).await;
    assert_eq!(
        ended,
        UaEvent::SessionStateChanged {
            call_id: "def@pbx".into(),
            previous: CallState::Initiating,
            current: CallState::Failed,
            cause: Some("Canceled".into()),
        }
    );
    assert_eq!(session_events(&drain(&mut events)), 0);
    assert!(controller.calls().is_empty());
}

#[tokio::test]
async fn test_outgoing_call_announced_once() {
    let (harness, controller) = registered_controller().await;
    let mut events = controller.subscribe_events();

    let session = controller
        .calls()
        .call("sip:2000@example.com", CallOptions::new())
        .await
        .unwrap();
    assert_eq!(session.originator, Originator::Local);

    // Events are dispatched in order, so the engine's own announcement of
    // this call has been handled once the progress change is seen
    harness.emit("session:progress", json!({ "handle": session.handle.as_str() }));
    let seen = collect_until(&mut events, |e| matches!(e, UaEvent::SessionStateChanged { .. })).await;
    assert_eq!(session_events(&seen), 1);
    assert_eq!(controller.calls().len(), 1);
    assert_eq!(controller.calls().get(&session.call_id).unwrap().state, CallState::Progress);
}

#[tokio::test]
async fn test_outgoing_call_emits_single_session_event() {
    let (_harness, controller) = registered_controller().await;
    let mut events = controller.subscribe_events();

    let session = controller.calls().call("2000", CallOptions::new()).await.unwrap();
    assert_eq!(session.remote_identity.uri, "sip:2000@example.com");

    let event = next_matching(&mut events, |e| matches!(e, UaEvent::Session { .. })).await;
    match event {
        UaEvent::Session {
            originator, call_id, ..
        } => {
            assert_eq!(originator, Originator::Local);
            assert_eq!(call_id, session.call_id);
        }
        other => panic!("unexpected {:?}", other),
    }
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(session_events(&drain(&mut events)), 0);
}

#[tokio::test]
async fn test_call_options_reach_engine_verbatim() {
    let (harness, controller) = registered_controller().await;
    let pc_config = json!({ "iceServers": [{ "urls": "stun:stun.example.com:3478" }] });
    let sdh_options = json!({ "constraints": { "audio": true, "video": false } });
    let options = CallOptions::from_value(json!({
        "pcConfig": pc_config,
        "sessionDescriptionHandlerOptions": sdh_options,
    }))
    .unwrap();

    controller
        .calls()
        .call("sip:2000@example.com", options)
        .await
        .unwrap();

    let forwarded = initiated_options(&harness);
    assert_eq!(forwarded.pc_config, Some(pc_config));
    assert_eq!(forwarded.session_description_handler_options, Some(sdh_options));
}

/// Places a call with a single option field set and checks the engine
/// receives exactly that field, with nothing added or dropped.
macro_rules! forwards_option_field {
    ($name:ident, $field:literal, $value:expr) => {
        #[tokio::test]
        async fn $name() {
            let (harness, controller) = registered_controller().await;
            let mut fields = serde_json::Map::new();
            fields.insert($field.to_string(), $value);
            let original = Value::Object(fields);
            let options = CallOptions::from_value(original.clone()).unwrap();

            controller.calls().call("2000", options).await.unwrap();

            assert_eq!(
                serde_json::to_value(initiated_options(&harness)).unwrap(),
                original,
                "{} was not forwarded unchanged",
                $field
            );
        }
    };
}

forwards_option_field!(
    test_forwards_media_constraints,
    "mediaConstraints",
    json!({ "audio": true, "video": { "width": 640 } })
);
forwards_option_field!(
    test_forwards_rtc_configuration,
    "rtcConfiguration",
    json!({ "bundlePolicy": "max-bundle" })
);
forwards_option_field!(
    test_forwards_pc_config,
    "pcConfig",
    json!({ "iceTransportPolicy": "relay" })
);
forwards_option_field!(
    test_forwards_extra_headers,
    "extraHeaders",
    json!(["X-Account: 42", "P-Asserted-Identity: <sip:alice@example.com>"])
);
forwards_option_field!(test_forwards_anonymous, "anonymous", json!(true));
forwards_option_field!(
    test_forwards_session_timers_expires,
    "sessionTimersExpires",
    json!(1800)
);
forwards_option_field!(
    test_forwards_session_description_handler_options,
    "sessionDescriptionHandlerOptions",
    json!({ "iceGatheringTimeout": 500 })
);
forwards_option_field!(
    test_forwards_unknown_field,
    "rtcOfferConstraints",
    json!({ "offerToReceiveVideo": false })
);
forwards_option_field!(test_forwards_explicit_null, "pcConfig", Value::Null);
forwards_option_field!(test_forwards_null_anonymous, "anonymous", Value::Null);

#[tokio::test]
async fn test_malformed_option_rejects_whole_call() {
    let (harness, controller) = registered_controller().await;
    let options = CallOptions::new()
        .with_extra_header("X-Good: yes")
        .with_extra_header("X-Bad: injected\r\nVia: evil");

    let result = controller.calls().call("2000", options).await;
    assert!(matches!(
        result,
        Err(ClientError::InvalidCallOption { ref field, .. }) if field == "extraHeaders"
    ));
    assert_eq!(harness.count("initiate_call"), 0);

    // The controller and other calls are unaffected
    assert!(controller.is_registered());
    controller.calls().call("2000", CallOptions::new()).await.unwrap();
    assert_eq!(controller.calls().len(), 1);
}

#[tokio::test]
async fn test_non_object_option_is_rejected() {
    let (harness, controller) = registered_controller().await;
    let options = CallOptions::new().with_pc_config(json!("not an object"));

    let result = controller.calls().call("2000", options).await;
    assert_eq!(
        result.unwrap_err(),
        ClientError::InvalidCallOption {
            field: "pcConfig".into(),
            reason: "must be an object".into()
        }
    );
    assert_eq!(harness.count("initiate_call"), 0);
}

#[tokio::test]
async fn test_call_requires_connection() {
    let harness = TestHarness::new();
    let controller = common::controller(&harness, common::config());
    let result = controller.calls().call("2000", CallOptions::new()).await;
    assert!(matches!(result, Err(ClientError::NotConnected { .. })));
}

#[tokio::test]
async fn test_engine_rejection_fails_call() {
    let (harness, controller) = registered_controller().await;
    harness.fail_next("initiate_call", EngineError::Other("no media".into()));

    let result = controller.calls().call("2000", CallOptions::new()).await;
    assert!(matches!(result, Err(ClientError::CallFailed { .. })));
    assert!(controller.calls().is_empty());
}

#[tokio::test]
async fn test_answer_hold_mute_and_hangup() {
    let (harness, controller) = registered_controller().await;
    let mut events = controller.subscribe_events();
    harness.emit(
        "newRTCSession",
        json!({
            "handle": "in-1",
            "originator": "remote",
            "callId": "in-1@pbx",
            "remoteIdentity": { "uri": "sip:bob@example.com" },
        }),
    );
    next_matching(&mut events, |e| matches!(e, UaEvent::Session { .. })).await;
    let calls = controller.calls();

    // Hold needs an established call
    assert!(matches!(
        calls.hold("in-1@pbx").await,
        Err(ClientError::InvalidCallState { .. })
    ));

    calls.answer("in-1@pbx", AnswerOptions::default()).await.unwrap();
    harness.emit("session:accepted", json!({ "handle": "in-1" }));
    harness.emit("session:confirmed", json!({ "handle": "in-1" }));
    next_matching(&mut events, |e| {
        matches!(e, UaEvent::SessionStateChanged { current: CallState::Confirmed, .. })
    })
    .await;
    let session = calls.get("in-1@pbx").unwrap();
    assert!(session.started_at.is_some());
    assert!(session.is_active());

    calls.hold("in-1@pbx").await.unwrap();
    assert!(calls.get("in-1@pbx").unwrap().on_hold);
    calls.unhold("in-1@pbx").await.unwrap();
    assert!(!calls.get("in-1@pbx").unwrap().on_hold);

    calls.mute("in-1@pbx", MuteOptions::audio()).await.unwrap();
    let muted = calls.get("in-1@pbx").unwrap();
    assert!(muted.audio_muted && !muted.video_muted);

    harness.fail_next("unmute", EngineError::InvalidState("renegotiating".into()));
    assert!(calls.unmute("in-1@pbx", MuteOptions::audio()).await.is_err());
    assert!(calls.get("in-1@pbx").unwrap().audio_muted, "failed unmute is reverted");

    calls.hangup("in-1@pbx", TerminateOptions::default()).await.unwrap();
    assert!(harness.commands().contains(&HarnessCommand::Terminate {
        handle: SessionHandle::new("in-1"),
        options: TerminateOptions::default(),
    }));
    // Still registered until the engine reports the end
    assert_eq!(calls.len(), 1);

    harness.emit("session:ended", json!({ "handle": "in-1", "cause": "Terminated" }));
    let ended = next_matching(&mut events, |e| {
        matches!(e, UaEvent::SessionStateChanged { current: CallState::Ended, .. })
    })
    .await;
    assert!(matches!(ended, UaEvent::SessionStateChanged { previous: CallState::Confirmed, .. }));
    assert!(calls.is_empty());
}

#[tokio::test]
async fn test_engine_hold_and_mute_reports_are_reconciled() {
    let (harness, controller) = registered_controller().await;
    let mut events = controller.subscribe_events();
    let session = controller.calls().call("2000", CallOptions::new()).await.unwrap();
    let handle = session.handle.as_str();

    harness.emit("session:hold", json!({ "handle": handle }));
    harness.emit("session:muted", json!({ "handle": handle, "video": true }));
    next_matching(&mut events, |e| {
        matches!(e, UaEvent::SessionUpdated { session } if session.video_muted)
    })
    .await;

    let updated = controller.calls().get(&session.call_id).unwrap();
    assert!(updated.on_hold);
    assert!(updated.video_muted);
    assert!(!updated.audio_muted);
}

#[tokio::test]
async fn test_late_transitions_are_ignored() {
    let (harness, controller) = registered_controller().await;
    let mut events = controller.subscribe_events();
    let session = controller.calls().call("2000", CallOptions::new()).await.unwrap();
    let handle = session.handle.as_str();

    harness.emit("session:confirmed", json!({ "handle": handle }));
    harness.emit("session:progress", json!({ "handle": handle }));
    harness.emit("session:ended", json!({ "handle": handle }));
    let seen = collect_until(&mut events, |e| {
        matches!(e, UaEvent::SessionStateChanged { current: CallState::Ended, .. })
    })
    .await;

    let transitions: Vec<(CallState, CallState)> = seen
        .into_iter()
        .filter_map(|e| match e {
            UaEvent::SessionStateChanged { previous, current, .. } => Some((previous, current)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (CallState::Initiating, CallState::Confirmed),
            (CallState::Confirmed, CallState::Ended),
        ]
    );
    assert!(controller.calls().get(&session.call_id).is_none());
}

#[tokio::test]
async fn test_transfers_and_dtmf() {
    let (harness, controller) = registered_controller().await;
    let calls = controller.calls();
    let first = calls.call("2000", CallOptions::new()).await.unwrap();
    let second = calls.call("3000", CallOptions::new()).await.unwrap();

    // Not yet answered
    assert!(calls.transfer(&first.call_id, "4000").await.is_err());

    let mut events = controller.subscribe_events();
    for session in [&first, &second] {
        harness.emit("session:accepted", json!({ "handle": session.handle.as_str() }));
    }
    next_matching(&mut events, |e| {
        matches!(e, UaEvent::SessionStateChanged { call_id, .. } if *call_id == second.call_id)
    })
    .await;

    calls.transfer(&first.call_id, "4000").await.unwrap();
    assert!(harness.commands().contains(&HarnessCommand::Refer {
        handle: first.handle.clone(),
        target: "sip:4000@example.com".into(),
    }));

    calls.attended_transfer(&first.call_id, &second.call_id).await.unwrap();
    assert!(harness.commands().contains(&HarnessCommand::ReferWithReplaces {
        handle: first.handle.clone(),
        replaces: second.handle.clone(),
    }));
    assert!(calls.attended_transfer(&first.call_id, &first.call_id).await.is_err());

    calls.send_dtmf(&first.call_id, '5').await.unwrap();
    assert!(matches!(
        calls.send_dtmf(&first.call_id, 'x').await,
        Err(ClientError::InvalidCallOption { .. })
    ));
    assert_eq!(harness.count("send_dtmf"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dtmf_sequence_is_paced() {
    let (harness, controller) = registered_controller().await;
    let calls = controller.calls();
    let session = calls.call("2000", CallOptions::new()).await.unwrap();
    let mut events = controller.subscribe_events();
    harness.emit("session:confirmed", json!({ "handle": session.handle.as_str() }));
    next_matching(&mut events, |e| matches!(e, UaEvent::SessionStateChanged { .. })).await;

    let started = tokio::time::Instant::now();
    calls
        .send_dtmf_sequence(&session.call_id, "12,#", Default::default())
        .await
        .unwrap();

    let tones: Vec<String> = harness
        .commands()
        .into_iter()
        .filter_map(|c| match c {
            HarnessCommand::SendDtmf { tones, .. } => Some(tones),
            _ => None,
        })
        .collect();
    assert_eq!(tones, vec!["1", "2", "#"]);
    // Two inter-tone gaps of 170ms plus the two second pause
    assert!(started.elapsed() >= std::time::Duration::from_millis(2340));
}

fn header_strategy() -> impl Strategy<Value = String> {
    ("X-[A-Za-z]{1,8}", "[a-z0-9 ]{0,12}").prop_map(|(name, value)| format!("{}: {}", name, value))
}

fn option_strategy() -> impl Strategy<Value = Value> {
    (
        any::<bool>(),
        any::<bool>(),
        proptest::option::of("stun:[a-z]{1,10}\\.example\\.com:[0-9]{4}"),
        proptest::collection::vec(header_strategy(), 0..4),
        proptest::option::of(any::<bool>()),
        proptest::option::of(90u32..7200),
        proptest::option::of(0u32..5000),
    )
        .prop_map(|(audio, video, stun, headers, anonymous, expires, gathering)| {
            let mut options = serde_json::Map::new();
            options.insert("mediaConstraints".into(), json!({ "audio": audio, "video": video }));
            if let Some(stun) = stun {
                options.insert("pcConfig".into(), json!({ "iceServers": [{ "urls": stun }] }));
            }
            if !headers.is_empty() {
                options.insert("extraHeaders".into(), json!(headers));
            }
            if let Some(anonymous) = anonymous {
                options.insert("anonymous".into(), json!(anonymous));
            }
            if let Some(expires) = expires {
                options.insert("sessionTimersExpires".into(), json!(expires));
            }
            if let Some(gathering) = gathering {
                options.insert(
                    "sessionDescriptionHandlerOptions".into(),
                    json!({ "iceGatheringTimeout": gathering }),
                );
            }
            Value::Object(options)
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_call_options_forwarded_unmodified(original in option_strategy()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let forwarded = runtime.block_on(async {
            let (harness, controller) = registered_controller().await;
            let options = CallOptions::from_value(original.clone()).unwrap();
            controller.calls().call("2000", options).await.unwrap();
            initiated_options(&harness)
        });
        prop_assert_eq!(serde_json::to_value(&forwarded).unwrap(), original);
    }
}
