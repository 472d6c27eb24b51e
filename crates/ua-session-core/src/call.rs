//! Call session types
//!
//! A [`CallSession`] is a snapshot of one call leg as tracked by the
//! [`CallSessionManager`](crate::calls::CallSessionManager). The registry owns
//! the live record; everything handed out to consumers is a clone.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{ClientError, ClientResult};

/// Opaque identifier the protocol engine uses for one session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(pub String);

impl SessionHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side created the call leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Originator {
    /// Originated by this user agent
    Local,
    /// Originated by the remote peer
    Remote,
}

impl Originator {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(Originator::Local),
            "remote" => Some(Originator::Remote),
            _ => None,
        }
    }
}

impl fmt::Display for Originator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Originator::Local => write!(f, "local"),
            Originator::Remote => write!(f, "remote"),
        }
    }
}

/// Session lifecycle: `Initiating -> Progress -> Accepted -> Confirmed -> Ended|Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    Initiating,
    Progress,
    Accepted,
    Confirmed,
    Ended,
    Failed,
}

impl CallState {
    fn rank(self) -> u8 {
        match self {
            CallState::Initiating => 0,
            CallState::Progress => 1,
            CallState::Accepted => 2,
            CallState::Confirmed => 3,
            CallState::Ended | CallState::Failed => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }

    /// Forward-only. Intermediate states may be skipped (a call can be
    /// accepted without a provisional response) but never revisited.
    pub fn can_transition_to(self, next: CallState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Initiating => "Initiating",
            CallState::Progress => "Progress",
            CallState::Accepted => "Accepted",
            CallState::Confirmed => "Confirmed",
            CallState::Ended => "Ended",
            CallState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Identity of the other party
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteIdentity {
    pub uri: String,
    pub display_name: Option<String>,
}

/// One call leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub call_id: String,
    pub handle: SessionHandle,
    pub originator: Originator,
    pub state: CallState,
    pub remote_identity: RemoteIdentity,
    pub audio_muted: bool,
    pub video_muted: bool,
    pub on_hold: bool,
    pub created_at: DateTime<Utc>,
    /// Set when the session is confirmed
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_cause: Option<String>,
}

impl CallSession {
    pub fn new(
        call_id: impl Into<String>,
        handle: SessionHandle,
        originator: Originator,
        remote_identity: RemoteIdentity,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            handle,
            originator,
            state: CallState::Initiating,
            remote_identity,
            audio_muted: false,
            video_muted: false,
            on_hold: false,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            end_cause: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Time since the call was confirmed, if it was
    pub fn duration(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        Some(self.ended_at.unwrap_or_else(Utc::now) - started)
    }
}

/// Options for placing a call
///
/// Serialized with the engine's field names. Every field, including unknown
/// ones captured in `extra`, is handed to the engine exactly as supplied.
/// An explicit `null` on an object field is kept as `Some(Value::Null)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOptions {
    #[serde(default, deserialize_with = "present_value", skip_serializing_if = "Option::is_none")]
    pub media_constraints: Option<Value>,
    #[serde(default, deserialize_with = "present_value", skip_serializing_if = "Option::is_none")]
    pub rtc_configuration: Option<Value>,
    /// Peer-connection configuration (ICE servers, transport policy).
    /// Distinct from `rtc_configuration`.
    #[serde(
        default,
        rename = "pcConfig",
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub pc_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_headers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_timers_expires: Option<u32>,
    #[serde(default, deserialize_with = "present_value", skip_serializing_if = "Option::is_none")]
    pub session_description_handler_options: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A field that is present maps to `Some`, even when it is `null`
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Typed fields that cannot hold `null` themselves
const SCALAR_FIELDS: [&str; 3] = ["extraHeaders", "anonymous", "sessionTimersExpires"];

/// RFC 4028 minimum session interval
const MIN_SESSION_EXPIRES: u32 = 90;

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object using the engine's field names. An explicit
    /// `null` on a typed field is carried in `extra` so it still reaches the
    /// engine.
    pub fn from_value(value: Value) -> ClientResult<Self> {
        let nulls: Vec<String> = value
            .as_object()
            .map(|fields| {
                fields
                    .iter()
                    .filter(|(name, field)| field.is_null() && SCALAR_FIELDS.contains(&name.as_str()))
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default();
        let mut options: Self = serde_json::from_value(value)
            .map_err(|e| ClientError::invalid_call_option("options", e.to_string()))?;
        for name in nulls {
            options.extra.insert(name, Value::Null);
        }
        Ok(options)
    }

    pub fn with_media_constraints(mut self, constraints: Value) -> Self {
        self.media_constraints = Some(constraints);
        self
    }

    pub fn with_rtc_configuration(mut self, configuration: Value) -> Self {
        self.rtc_configuration = Some(configuration);
        self
    }

    pub fn with_pc_config(mut self, pc_config: Value) -> Self {
        self.pc_config = Some(pc_config);
        self
    }

    pub fn with_extra_header(mut self, header: impl Into<String>) -> Self {
        self.extra_headers.get_or_insert_with(Vec::new).push(header.into());
        self
    }

    pub fn with_anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = Some(anonymous);
        self
    }

    pub fn with_session_timers_expires(mut self, seconds: u32) -> Self {
        self.session_timers_expires = Some(seconds);
        self
    }

    pub fn with_session_description_handler_options(mut self, options: Value) -> Self {
        self.session_description_handler_options = Some(options);
        self
    }

    /// Check every field. A single bad field rejects the whole call; nothing
    /// is dropped or rewritten.
    pub fn validate(&self) -> ClientResult<()> {
        for (field, value) in [
            ("mediaConstraints", &self.media_constraints),
            ("rtcConfiguration", &self.rtc_configuration),
            ("pcConfig", &self.pc_config),
            (
                "sessionDescriptionHandlerOptions",
                &self.session_description_handler_options,
            ),
        ] {
            if let Some(value) = value {
                if !value.is_object() && !value.is_null() {
                    return Err(ClientError::invalid_call_option(field, "must be an object"));
                }
            }
        }

        if let Some(headers) = &self.extra_headers {
            for header in headers {
                validate_header(header)?;
            }
        }

        if let Some(expires) = self.session_timers_expires {
            if expires < MIN_SESSION_EXPIRES {
                return Err(ClientError::invalid_call_option(
                    "sessionTimersExpires",
                    format!("must be at least {} seconds", MIN_SESSION_EXPIRES),
                ));
            }
        }
        Ok(())
    }
}

/// `Name: value` with a token name and no line breaks
pub fn validate_header(header: &str) -> ClientResult<()> {
    let invalid = |reason: &str| {
        ClientError::invalid_call_option("extraHeaders", format!("'{}': {}", header, reason))
    };
    let (name, value) = header.split_once(':').ok_or_else(|| invalid("missing ':'"))?;
    let name = name.trim_end();
    if name.is_empty() {
        return Err(invalid("empty header name"));
    }
    if !name.chars().all(is_token_char) {
        return Err(invalid("header name is not a token"));
    }
    if value.contains(['\r', '\n']) {
        return Err(invalid("line break in header value"));
    }
    Ok(())
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c)
}

/// Options for answering a remote session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_constraints: Option<Value>,
    #[serde(default, rename = "pcConfig", skip_serializing_if = "Option::is_none")]
    pub pc_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_headers: Vec<String>,
}

/// Which media to mute or unmute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuteOptions {
    pub audio: bool,
    pub video: bool,
}

impl MuteOptions {
    pub fn audio() -> Self {
        Self { audio: true, video: false }
    }

    pub fn video() -> Self {
        Self { audio: false, video: true }
    }

    pub fn all() -> Self {
        Self { audio: true, video: true }
    }
}

impl Default for MuteOptions {
    fn default() -> Self {
        Self::audio()
    }
}

/// DTMF delivery parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtmfOptions {
    pub duration_ms: u64,
    pub inter_tone_gap_ms: u64,
}

impl Default for DtmfOptions {
    fn default() -> Self {
        Self {
            duration_ms: 100,
            inter_tone_gap_ms: 70,
        }
    }
}

/// Hangup parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateOptions {
    /// Final response for an unanswered incoming call (e.g. 486)
    pub status_code: Option<u16>,
    pub reason_phrase: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_headers: Vec<String>,
}
