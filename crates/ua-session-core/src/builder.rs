//! Builder for [`SessionController`]
//!
//! ```rust
//! use ua_session_core::{Config, Credentials, SessionControllerBuilder};
//! use ua_session_core::test_bridge::TestHarness;
//!
//! let harness = TestHarness::new();
//! let controller = SessionControllerBuilder::new()
//!     .config(Config::new(
//!         "wss://sip.example.com:8089/ws",
//!         "sip:alice@example.com",
//!         Credentials::password("secret"),
//!     ))
//!     .adapter(harness.adapter())
//!     .build()
//!     .expect("valid configuration");
//! assert!(!controller.is_connected());
//! ```

use std::sync::Arc;

use tracing::info;

use crate::adapter::ProtocolEngineAdapter;
use crate::config::Config;
use crate::controller::SessionController;
use crate::error::{ClientError, ClientResult};
use crate::test_bridge;

/// Fluent builder for a [`SessionController`]
#[derive(Default)]
pub struct SessionControllerBuilder {
    config: Option<Config>,
    adapter: Option<Arc<dyn ProtocolEngineAdapter>>,
}

impl SessionControllerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Protocol engine to drive. Ignored while a test harness is installed.
    pub fn adapter(mut self, adapter: Arc<dyn ProtocolEngineAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Validate the configuration and build the controller.
    ///
    /// The harness check happens exactly once, here.
    pub fn build(self) -> ClientResult<SessionController> {
        let config = self.config.ok_or_else(|| ClientError::MissingConfiguration {
            field: "config".to_string(),
        })?;
        config.validate()?;

        let (adapter, substituted) = match test_bridge::detect() {
            Some(harness) => {
                info!("Test harness installed; substituting protocol engine adapter");
                (harness.adapter(), true)
            }
            None => {
                let adapter = self.adapter.ok_or_else(|| ClientError::MissingConfiguration {
                    field: "adapter".to_string(),
                })?;
                (adapter, false)
            }
        };

        Ok(SessionController::new(config, adapter, substituted))
    }
}
