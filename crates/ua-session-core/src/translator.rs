//! Translation of engine payloads into internal signals
//!
//! This is the only module that knows what engine payloads look like. Every
//! raw event is decoded into a closed [`EngineSignal`]; anything that does not
//! decode is reported as a [`TranslateError`] and never reaches a manager.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::adapter::{RawEngineEvent, event_names as ev};
use crate::call::{Originator, RemoteIdentity, SessionHandle};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TranslateError {
    #[error("unknown engine event '{0}'")]
    UnknownEvent(String),

    #[error("malformed '{event}' payload: {reason}")]
    Malformed { event: String, reason: String },
}

/// Subscription-State of an inbound NOTIFY
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyState {
    Pending,
    Active,
    Terminated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSessionSignal {
    pub handle: SessionHandle,
    pub originator: Originator,
    pub call_id: Option<String>,
    pub remote_identity: RemoteIdentity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageSignal {
    pub originator: Originator,
    pub from: String,
    pub body: String,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotifySignal {
    pub target: String,
    pub event: String,
    pub state: NotifyState,
    pub content_type: Option<String>,
    pub body: Option<String>,
    pub expires: Option<u32>,
    pub reason: Option<String>,
}

/// Closed set of signals the controller reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum EngineSignal {
    Connecting,
    Connected { transport_address: String },
    Disconnected { reason: Option<String>, error: bool },
    Registered,
    Unregistered { cause: Option<String> },
    RegistrationFailed { cause: String },
    NewSession(NewSessionSignal),
    SessionProgress { handle: SessionHandle },
    SessionAccepted { handle: SessionHandle },
    SessionConfirmed { handle: SessionHandle },
    SessionEnded { handle: SessionHandle, cause: Option<String> },
    SessionFailed { handle: SessionHandle, cause: Option<String> },
    SessionHold { handle: SessionHandle, on_hold: bool },
    SessionMuted { handle: SessionHandle, audio: bool, video: bool, muted: bool },
    Message(MessageSignal),
    Notify(NotifySignal),
}

#[derive(Deserialize)]
struct ConnectedPayload {
    #[serde(alias = "transportAddress", alias = "url")]
    address: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DisconnectedPayload {
    reason: Option<String>,
    error: bool,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CausePayload {
    cause: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewSessionPayload {
    handle: String,
    originator: String,
    #[serde(default)]
    call_id: Option<String>,
    remote_identity: RemoteIdentityPayload,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteIdentityPayload {
    uri: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Deserialize)]
struct SessionPayload {
    handle: String,
    #[serde(default)]
    cause: Option<String>,
}

#[derive(Deserialize)]
struct MutePayload {
    handle: String,
    #[serde(default)]
    audio: bool,
    #[serde(default)]
    video: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePayload {
    #[serde(default = "remote_originator")]
    originator: String,
    from: String,
    #[serde(default)]
    body: String,
    #[serde(default = "default_content_type")]
    content_type: String,
}

fn remote_originator() -> String {
    "remote".to_string()
}

fn default_content_type() -> String {
    "text/plain".to_string()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotifyPayload {
    target: String,
    #[serde(default = "presence_event")]
    event: String,
    subscription_state: NotifyState,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    expires: Option<u32>,
    #[serde(default)]
    reason: Option<String>,
}

fn presence_event() -> String {
    "presence".to_string()
}

/// Decodes raw engine events
#[derive(Debug, Clone, Copy, Default)]
pub struct EventTranslator;

impl EventTranslator {
    pub fn new() -> Self {
        Self
    }

    pub fn translate(&self, raw: &RawEngineEvent) -> Result<EngineSignal, TranslateError> {
        let name = raw.name.as_str();
        let signal = match name {
            ev::CONNECTING => EngineSignal::Connecting,
            ev::CONNECTED => {
                let p: ConnectedPayload = decode(raw)?;
                EngineSignal::Connected {
                    transport_address: p.address,
                }
            }
            ev::DISCONNECTED => {
                let p: DisconnectedPayload = decode(raw)?;
                EngineSignal::Disconnected {
                    reason: p.reason,
                    error: p.error,
                }
            }
            ev::REGISTERED => EngineSignal::Registered,
            ev::UNREGISTERED => {
                let p: CausePayload = decode(raw)?;
                EngineSignal::Unregistered { cause: p.cause }
            }
            ev::REGISTRATION_FAILED => {
                let p: CausePayload = decode(raw)?;
                EngineSignal::RegistrationFailed {
                    cause: p.cause.unwrap_or_else(|| "unknown".to_string()),
                }
            }
            ev::NEW_SESSION => {
                let p: NewSessionPayload = decode(raw)?;
                let originator = Originator::parse(&p.originator).ok_or_else(|| {
                    malformed(name, format!("unknown originator '{}'", p.originator))
                })?;
                EngineSignal::NewSession(NewSessionSignal {
                    handle: SessionHandle(p.handle),
                    originator,
                    call_id: p.call_id,
                    remote_identity: RemoteIdentity {
                        uri: p.remote_identity.uri,
                        display_name: p.remote_identity.display_name,
                    },
                })
            }
            ev::SESSION_PROGRESS | ev::SESSION_ACCEPTED | ev::SESSION_CONFIRMED | ev::SESSION_ENDED
            | ev::SESSION_FAILED | ev::SESSION_HOLD | ev::SESSION_UNHOLD => {
                let p: SessionPayload = decode(raw)?;
                let handle = SessionHandle(p.handle);
                match name {
                    ev::SESSION_PROGRESS => EngineSignal::SessionProgress { handle },
                    ev::SESSION_ACCEPTED => EngineSignal::SessionAccepted { handle },
                    ev::SESSION_CONFIRMED => EngineSignal::SessionConfirmed { handle },
                    ev::SESSION_ENDED => EngineSignal::SessionEnded { handle, cause: p.cause },
                    ev::SESSION_FAILED => EngineSignal::SessionFailed { handle, cause: p.cause },
                    ev::SESSION_HOLD => EngineSignal::SessionHold { handle, on_hold: true },
                    _ => EngineSignal::SessionHold { handle, on_hold: false },
                }
            }
            ev::SESSION_MUTED | ev::SESSION_UNMUTED => {
                let p: MutePayload = decode(raw)?;
                EngineSignal::SessionMuted {
                    handle: SessionHandle(p.handle),
                    audio: p.audio,
                    video: p.video,
                    muted: name == ev::SESSION_MUTED,
                }
            }
            ev::NEW_MESSAGE => {
                let p: MessagePayload = decode(raw)?;
                let originator = Originator::parse(&p.originator).ok_or_else(|| {
                    malformed(name, format!("unknown originator '{}'", p.originator))
                })?;
                EngineSignal::Message(MessageSignal {
                    originator,
                    from: p.from,
                    body: p.body,
                    content_type: p.content_type,
                })
            }
            ev::NOTIFY => {
                let p: NotifyPayload = decode(raw)?;
                EngineSignal::Notify(NotifySignal {
                    target: p.target,
                    event: p.event,
                    state: p.subscription_state,
                    content_type: p.content_type,
                    body: p.body,
                    expires: p.expires,
                    reason: p.reason,
                })
            }
            other => return Err(TranslateError::UnknownEvent(other.to_string())),
        };
        Ok(signal)
    }
}

fn decode<T: DeserializeOwned>(raw: &RawEngineEvent) -> Result<T, TranslateError> {
    let payload = match &raw.payload {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(payload).map_err(|e| malformed(&raw.name, e.to_string()))
}

fn malformed(event: &str, reason: impl Into<String>) -> TranslateError {
    TranslateError::Malformed {
        event: event.to_string(),
        reason: reason.into(),
    }
}
