//! # ua-session-core
//!
//! Session orchestration for SIP user agents. The crate sits between an
//! application and a SIP protocol engine: it owns connection and
//! registration state, tracks call sessions, publishes and watches presence,
//! and sends and receives instant messages. The engine itself (transactions,
//! dialogs, SDP, media) stays behind [`ProtocolEngineAdapter`].
//!
//! ## Components
//!
//! - [`SessionController`]: start/stop, register/unregister, event bus
//! - [`CallSessionManager`]: outgoing and incoming calls and their controls
//! - [`PresenceManager`]: PIDF publication and presence subscriptions
//! - [`MessagingChannel`]: MESSAGE send/receive and composing indication
//! - [`test_bridge`]: an in-process engine for tests
//!
//! ## Quick Start
//!
//! ```rust
//! use serde_json::json;
//! use ua_session_core::{Config, Credentials, SessionControllerBuilder};
//! use ua_session_core::test_bridge::TestHarness;
//!
//! # tokio_test::block_on(async {
//! let harness = TestHarness::new();
//! harness.auto_connect("wss://sip.example.com/ws").auto_register(true);
//!
//! let controller = SessionControllerBuilder::new()
//!     .config(Config::new(
//!         "wss://sip.example.com/ws",
//!         "sip:alice@example.com",
//!         Credentials::password("secret"),
//!     ))
//!     .adapter(harness.adapter())
//!     .build()?;
//!
//! controller.start().await?;
//! assert!(controller.is_registered());
//!
//! controller.messaging().send_message("bob", "hello", Default::default()).await?;
//! controller.stop().await?;
//! # Ok::<(), ua_session_core::ClientError>(())
//! # }).unwrap();
//! ```

pub mod adapter;
pub mod builder;
pub mod call;
pub mod calls;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod listeners;
pub mod logging;
pub mod messaging;
pub mod pending;
pub mod presence;
pub mod state;
pub mod test_bridge;
pub mod timeout;
pub mod translator;
pub mod uri;

pub use adapter::{
    EngineConfig, EngineError, EngineListener, EngineRequest, EngineResult, ListenerId,
    ProtocolEngineAdapter, RawEngineEvent, RequestMethod, RequestOutcome, event_names,
};
pub use builder::SessionControllerBuilder;
pub use call::{
    AnswerOptions, CallOptions, CallSession, CallState, DtmfOptions, MuteOptions, Originator,
    RemoteIdentity, SessionHandle, TerminateOptions,
};
pub use calls::CallSessionManager;
pub use config::{Config, Credentials, OperationTimeouts};
pub use controller::{ControllerStats, SessionController};
pub use error::{ClientError, ClientResult};
pub use events::{EventBus, EventStream, UaEvent};
pub use logging::{LoggingConfig, parse_log_level, setup_logging};
pub use messaging::{InboundMessage, MessageOptions, MessagingChannel};
pub use presence::{
    PresenceDocument, PresenceManager, PresenceStatus, PublishOptions, SubscriptionInfo,
    SubscriptionState,
};
pub use state::ConnectionState;
pub use translator::{EngineSignal, EventTranslator};
pub use uri::SipUri;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
