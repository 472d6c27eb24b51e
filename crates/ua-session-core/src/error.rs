//! Error types for ua-session-core
//!
//! Every public operation returns [`ClientResult`]. Errors are grouped into
//! categories so callers can decide what to do without matching every variant:
//!
//! - **validation** - bad configuration, target or call option; fix the input
//! - **timeout** - an awaited confirmation did not arrive in its window
//! - **connection** / **registration** - the engine rejected the operation
//! - **state** - the operation is not valid in the current connection state
//! - **call** - a per-session failure
//! - **presence** / **messaging** - publish/subscribe/notify and MESSAGE failures
//! - **system** - engine or internal failures
//!
//! The core never retries on its own. Every failure leaves the controller in a
//! state from which a fresh `start()`, `register()` or `call()` is valid.
//!
//! ```rust,no_run
//! # use ua_session_core::{ClientError, SessionController};
//! # async fn example(controller: SessionController) {
//! match controller.register().await {
//!     Ok(()) => {}
//!     Err(ClientError::RegistrationTimeout { duration_ms }) => {
//!         eprintln!("registrar silent for {}ms, try again later", duration_ms);
//!     }
//!     Err(e) if e.is_recoverable() => eprintln!("transient: {}", e),
//!     Err(e) => eprintln!("registration error ({}): {}", e.category(), e),
//! }
//! # }
//! ```

use thiserror::Error;

use crate::adapter::EngineError;

/// Result type alias for session-core operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors produced by the session controller and its managers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// Configuration errors
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Missing required configuration: {field}")]
    MissingConfiguration { field: String },

    /// Target identity could not be turned into a SIP URI
    #[error("Invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    /// One field of a call's option bag was rejected; the call was not placed
    #[error("Invalid call option {field}: {reason}")]
    InvalidCallOption { field: String, reason: String },

    /// Timeouts
    #[error("Connection timeout after {duration_ms}ms")]
    ConnectionTimeout { duration_ms: u64 },

    #[error("Registration timeout after {duration_ms}ms")]
    RegistrationTimeout { duration_ms: u64 },

    #[error("Operation {operation} timed out after {duration_ms}ms")]
    OperationTimeout { operation: String, duration_ms: u64 },

    /// Engine-level rejections
    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Registration failed: {reason}")]
    RegistrationFailed { reason: String },

    /// State errors
    #[error("Not connected (state: {state})")]
    NotConnected { state: String },

    #[error("Operation already in progress: {operation}")]
    OperationInProgress { operation: String },

    #[error("Operation cancelled: {operation}")]
    OperationCancelled { operation: String },

    /// Call related errors
    #[error("Call not found: {call_id}")]
    CallNotFound { call_id: String },

    #[error("Invalid call state for call {call_id}: {reason}")]
    InvalidCallState { call_id: String, reason: String },

    #[error("Call failed: {reason}")]
    CallFailed { reason: String },

    /// Presence errors
    #[error("Presence document could not be parsed: {reason}")]
    PresenceParseFailed { reason: String },

    #[error("Presence operation failed: {reason}")]
    PresenceFailed { reason: String },

    #[error("No presence subscription for {target}")]
    SubscriptionNotFound { target: String },

    /// Messaging errors
    #[error("Message delivery failed ({status_code:?}): {reason}")]
    MessageDeliveryFailed {
        status_code: Option<u16>,
        reason: String,
    },

    /// Generic errors
    #[error("Protocol engine error: {reason}")]
    Engine { reason: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl ClientError {
    /// Create an invalid configuration error
    pub fn invalid_configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid target error
    pub fn invalid_target(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid call option error
    pub fn invalid_call_option(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCallOption {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a call failed error
    pub fn call_failed(reason: impl Into<String>) -> Self {
        Self::CallFailed { reason: reason.into() }
    }

    /// Create a cancellation error for the named operation
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::OperationCancelled { operation: operation.into() }
    }

    /// Create an internal error
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Check if retrying the same operation later can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            ClientError::ConnectionTimeout { .. }
            | ClientError::RegistrationTimeout { .. }
            | ClientError::OperationTimeout { .. }
            | ClientError::ConnectionFailed { .. }
            | ClientError::OperationCancelled { .. }
            | ClientError::OperationInProgress { .. }
            | ClientError::MessageDeliveryFailed { .. }
            | ClientError::Engine { .. } => true,

            ClientError::InvalidConfiguration { .. }
            | ClientError::MissingConfiguration { .. }
            | ClientError::InvalidTarget { .. }
            | ClientError::InvalidCallOption { .. } => false,

            _ => false,
        }
    }

    /// Check if error is a timeout of any kind
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionTimeout { .. }
                | ClientError::RegistrationTimeout { .. }
                | ClientError::OperationTimeout { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ClientError::InvalidConfiguration { .. }
            | ClientError::MissingConfiguration { .. }
            | ClientError::InvalidTarget { .. }
            | ClientError::InvalidCallOption { .. } => "validation",

            ClientError::ConnectionTimeout { .. }
            | ClientError::RegistrationTimeout { .. }
            | ClientError::OperationTimeout { .. } => "timeout",

            ClientError::ConnectionFailed { .. } => "connection",
            ClientError::RegistrationFailed { .. } => "registration",

            ClientError::NotConnected { .. }
            | ClientError::OperationInProgress { .. }
            | ClientError::OperationCancelled { .. } => "state",

            ClientError::CallNotFound { .. }
            | ClientError::InvalidCallState { .. }
            | ClientError::CallFailed { .. } => "call",

            ClientError::PresenceParseFailed { .. }
            | ClientError::PresenceFailed { .. }
            | ClientError::SubscriptionNotFound { .. } => "presence",

            ClientError::MessageDeliveryFailed { .. } => "messaging",

            ClientError::Engine { .. } | ClientError::InternalError { .. } => "system",
        }
    }
}

impl From<EngineError> for ClientError {
    fn from(err: EngineError) -> Self {
        ClientError::Engine {
            reason: err.to_string(),
        }
    }
}
