//! Protocol engine boundary
//!
//! The SIP transaction and dialog machinery, SDP negotiation and media live in
//! a protocol engine this crate does not implement. The controller drives the
//! engine through [`ProtocolEngineAdapter`] and listens to it through named
//! [`RawEngineEvent`]s carrying engine-shaped JSON payloads. Those payloads are
//! only ever read by the [`EventTranslator`](crate::translator::EventTranslator).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::call::{AnswerOptions, CallOptions, DtmfOptions, MuteOptions, SessionHandle, TerminateOptions};

/// Names of the events an engine emits
pub mod event_names {
    pub const CONNECTING: &str = "connecting";
    pub const CONNECTED: &str = "connected";
    pub const DISCONNECTED: &str = "disconnected";
    pub const REGISTERED: &str = "registered";
    pub const UNREGISTERED: &str = "unregistered";
    pub const REGISTRATION_FAILED: &str = "registrationFailed";
    pub const NEW_SESSION: &str = "newRTCSession";
    pub const SESSION_PROGRESS: &str = "session:progress";
    pub const SESSION_ACCEPTED: &str = "session:accepted";
    pub const SESSION_CONFIRMED: &str = "session:confirmed";
    pub const SESSION_ENDED: &str = "session:ended";
    pub const SESSION_FAILED: &str = "session:failed";
    pub const SESSION_HOLD: &str = "session:hold";
    pub const SESSION_UNHOLD: &str = "session:unhold";
    pub const SESSION_MUTED: &str = "session:muted";
    pub const SESSION_UNMUTED: &str = "session:unmuted";
    pub const NEW_MESSAGE: &str = "newMessage";
    pub const NOTIFY: &str = "notify";

    /// Every event the controller subscribes to on `start()`
    pub const ALL: &[&str] = &[
        CONNECTING,
        CONNECTED,
        DISCONNECTED,
        REGISTERED,
        UNREGISTERED,
        REGISTRATION_FAILED,
        NEW_SESSION,
        SESSION_PROGRESS,
        SESSION_ACCEPTED,
        SESSION_CONFIRMED,
        SESSION_ENDED,
        SESSION_FAILED,
        SESSION_HOLD,
        SESSION_UNHOLD,
        SESSION_MUTED,
        SESSION_UNMUTED,
        NEW_MESSAGE,
        NOTIFY,
    ];
}

/// Errors reported by an engine implementation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("engine not started")]
    NotStarted,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request rejected: {status_code} {reason}")]
    Rejected { status_code: u16, reason: String },

    #[error("unknown session handle: {0}")]
    UnknownSession(String),

    #[error("invalid engine state: {0}")]
    InvalidState(String),

    #[error("{0}")]
    Other(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Configuration handed to the engine on `start()`
///
/// Exactly one authorization shape is populated: `password`, or `ha1` with
/// `realm`, or `password` with `realm` and a distinct `authorization_user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub transport_address: String,
    pub identity_uri: String,
    pub authorization_user: String,
    pub password: Option<String>,
    pub ha1: Option<String>,
    pub realm: Option<String>,
    pub display_name: Option<String>,
    pub register_expires: u32,
    pub user_agent: String,
}

/// An event as the engine emits it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEngineEvent {
    pub name: String,
    pub payload: Value,
}

impl RawEngineEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Callback registered with [`ProtocolEngineAdapter::on`]
pub type EngineListener = Arc<dyn Fn(RawEngineEvent) + Send + Sync>;

/// Token returned by `on`/`once`, used with `off`
pub type ListenerId = u64;

/// SIP methods the core sends outside of a dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    Message,
    Publish,
    Subscribe,
}

/// An out-of-dialog request (MESSAGE, PUBLISH, SUBSCRIBE)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineRequest {
    pub method: RequestMethod,
    pub target: String,
    /// Event package for PUBLISH/SUBSCRIBE
    pub event: Option<String>,
    pub content_type: Option<String>,
    pub body: Option<String>,
    pub expires: Option<u32>,
    pub extra_headers: Vec<String>,
}

impl EngineRequest {
    pub fn new(method: RequestMethod, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            event: None,
            content_type: None,
            body: None,
            expires: None,
            extra_headers: Vec::new(),
        }
    }

    pub fn with_body(mut self, content_type: impl Into<String>, body: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self.body = Some(body.into());
        self
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn with_expires(mut self, expires: u32) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn with_headers(mut self, headers: impl IntoIterator<Item = String>) -> Self {
        self.extra_headers.extend(headers);
        self
    }
}

/// Final response to an out-of-dialog request
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub status_code: u16,
    pub reason_phrase: String,
    /// Header names are lower-cased
    pub headers: HashMap<String, String>,
}

impl RequestOutcome {
    pub fn new(status_code: u16, reason_phrase: impl Into<String>) -> Self {
        Self {
            status_code,
            reason_phrase: reason_phrase.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// The protocol engine as seen by the controller
#[async_trait]
pub trait ProtocolEngineAdapter: Send + Sync + 'static {
    /// Open the transport. Completion is signalled by a `connected` event,
    /// not by this future.
    async fn start(&self, config: EngineConfig) -> EngineResult<()>;

    async fn stop(&self) -> EngineResult<()>;

    /// Send REGISTER. The outcome arrives as `registered` or `registrationFailed`.
    async fn register(&self) -> EngineResult<()>;

    /// Send REGISTER with expires 0. Completion arrives as `unregistered`.
    async fn unregister(&self) -> EngineResult<()>;

    /// Send INVITE. The options must reach the engine untouched.
    async fn initiate_call(&self, target: &str, options: &CallOptions) -> EngineResult<SessionHandle>;

    async fn answer(&self, handle: &SessionHandle, options: &AnswerOptions) -> EngineResult<()>;

    async fn terminate(&self, handle: &SessionHandle, options: &TerminateOptions) -> EngineResult<()>;

    async fn hold(&self, handle: &SessionHandle) -> EngineResult<()>;

    async fn unhold(&self, handle: &SessionHandle) -> EngineResult<()>;

    async fn mute(&self, handle: &SessionHandle, options: MuteOptions) -> EngineResult<()>;

    async fn unmute(&self, handle: &SessionHandle, options: MuteOptions) -> EngineResult<()>;

    /// Blind transfer (REFER)
    async fn refer(&self, handle: &SessionHandle, target: &str) -> EngineResult<()>;

    /// Attended transfer (REFER with Replaces pointing at `replaces`)
    async fn refer_with_replaces(&self, handle: &SessionHandle, replaces: &SessionHandle) -> EngineResult<()>;

    async fn send_dtmf(&self, handle: &SessionHandle, tones: &str, options: DtmfOptions) -> EngineResult<()>;

    /// Send an out-of-dialog request and wait for its final response
    async fn send_request(&self, request: EngineRequest) -> EngineResult<RequestOutcome>;

    fn on(&self, event: &str, listener: EngineListener) -> ListenerId;

    fn once(&self, event: &str, listener: EngineListener) -> ListenerId;

    fn off(&self, event: &str, id: ListenerId);

    fn is_connected(&self) -> bool;

    fn is_registered(&self) -> bool;
}
