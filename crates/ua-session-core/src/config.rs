//! Controller configuration
//!
//! A [`Config`] is supplied once when the controller is built and is never
//! mutated afterwards. It can be assembled in code with the `with_*` setters or
//! loaded from JSON (for example from a settings store owned by the
//! application):
//!
//! ```rust
//! # use ua_session_core::{Config, Credentials};
//! let config = Config::new(
//!     "wss://sip.example.com:8089/ws",
//!     "sip:alice@example.com",
//!     Credentials::password("secret"),
//! )
//! .with_display_name("Alice")
//! .with_register_expires(300);
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapter::EngineConfig;
use crate::error::{ClientError, ClientResult};
use crate::uri::SipUri;

const TRANSPORT_SCHEMES: &[&str] = &["ws", "wss", "udp", "tcp", "tls"];

/// The credential shapes a registrar can be authenticated with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    /// Plaintext password; the authorization user is the identity's user part
    Password { password: String },
    /// Precomputed HA1 digest for `realm`
    DigestHash { ha1: String, realm: String },
    /// Separate authorization user bound to a realm
    UsernameRealm {
        username: String,
        realm: String,
        password: String,
    },
}

impl Credentials {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password { password: password.into() }
    }

    pub fn digest_hash(ha1: impl Into<String>, realm: impl Into<String>) -> Self {
        Self::DigestHash {
            ha1: ha1.into(),
            realm: realm.into(),
        }
    }

    pub fn username_realm(
        username: impl Into<String>,
        realm: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::UsernameRealm {
            username: username.into(),
            realm: realm.into(),
            password: password.into(),
        }
    }

    fn validate(&self) -> ClientResult<()> {
        match self {
            Credentials::Password { password } => {
                if password.is_empty() {
                    return Err(ClientError::invalid_configuration(
                        "credentials.password",
                        "password is empty",
                    ));
                }
            }
            Credentials::DigestHash { ha1, realm } => {
                if ha1.len() != 32 || !ha1.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(ClientError::invalid_configuration(
                        "credentials.ha1",
                        "HA1 must be 32 hexadecimal characters",
                    ));
                }
                if realm.is_empty() {
                    return Err(ClientError::invalid_configuration(
                        "credentials.realm",
                        "realm is required with a digest hash",
                    ));
                }
            }
            Credentials::UsernameRealm {
                username,
                realm,
                password,
            } => {
                if username.is_empty() || realm.is_empty() {
                    return Err(ClientError::invalid_configuration(
                        "credentials.username",
                        "username and realm are both required",
                    ));
                }
                if password.is_empty() {
                    return Err(ClientError::invalid_configuration(
                        "credentials.password",
                        "password is empty",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Timeouts for operations that wait on an engine confirmation
///
/// Connection and registration windows are independent of per-request
/// timeouts (MESSAGE, PUBLISH, SUBSCRIBE).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationTimeouts {
    pub connect_ms: u64,
    pub register_ms: u64,
    pub unregister_ms: u64,
    pub request_ms: u64,
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            register_ms: 10_000,
            unregister_ms: 5_000,
            request_ms: 15_000,
        }
    }
}

impl OperationTimeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn register(&self) -> Duration {
        Duration::from_millis(self.register_ms)
    }

    pub fn unregister(&self) -> Duration {
        Duration::from_millis(self.unregister_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }
}

/// User agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Signaling transport, e.g. `wss://sip.example.com:8089/ws`
    pub transport_address: String,
    /// Address of record, e.g. `sip:alice@example.com`
    pub identity_uri: String,
    pub credentials: Credentials,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Requested registration lifetime in seconds
    #[serde(default = "default_register_expires")]
    pub register_expires: u32,
    /// Chain `register()` after a successful `start()`
    #[serde(default = "default_true")]
    pub auto_register: bool,
    #[serde(default)]
    pub timeouts: OperationTimeouts,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Lifetime of presence publications in seconds
    #[serde(default = "default_presence_expires")]
    pub presence_expires: u32,
    /// Lifetime of presence subscriptions in seconds
    #[serde(default = "default_presence_expires")]
    pub subscribe_expires: u32,
    /// How long a peer stays "composing" without a refresh
    #[serde(default = "default_composing_idle")]
    pub composing_idle_secs: u64,
    /// Capacity of the public event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_register_expires() -> u32 {
    600
}

fn default_true() -> bool {
    true
}

fn default_user_agent() -> String {
    format!("ua-session-core/{}", env!("CARGO_PKG_VERSION"))
}

fn default_presence_expires() -> u32 {
    3600
}

fn default_composing_idle() -> u64 {
    120
}

fn default_event_capacity() -> usize {
    256
}

impl Config {
    /// Create a configuration with default timers and auto-registration on
    pub fn new(
        transport_address: impl Into<String>,
        identity_uri: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            transport_address: transport_address.into(),
            identity_uri: identity_uri.into(),
            credentials,
            display_name: None,
            register_expires: default_register_expires(),
            auto_register: true,
            timeouts: OperationTimeouts::default(),
            user_agent: default_user_agent(),
            presence_expires: default_presence_expires(),
            subscribe_expires: default_presence_expires(),
            composing_idle_secs: default_composing_idle(),
            event_capacity: default_event_capacity(),
        }
    }

    /// Load and validate a JSON document
    pub fn from_json(json: &str) -> ClientResult<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| ClientError::invalid_configuration("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_register_expires(mut self, seconds: u32) -> Self {
        self.register_expires = seconds;
        self
    }

    pub fn with_auto_register(mut self, enabled: bool) -> Self {
        self.auto_register = enabled;
        self
    }

    pub fn with_timeouts(mut self, timeouts: OperationTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connect_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_register_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.register_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_presence_expires(mut self, seconds: u32) -> Self {
        self.presence_expires = seconds;
        self
    }

    pub fn with_subscribe_expires(mut self, seconds: u32) -> Self {
        self.subscribe_expires = seconds;
        self
    }

    pub fn with_composing_idle(mut self, idle: Duration) -> Self {
        self.composing_idle_secs = idle.as_secs().max(1);
        self
    }

    /// Check every field; the first problem found is returned
    pub fn validate(&self) -> ClientResult<()> {
        validate_transport(&self.transport_address)?;

        let identity = SipUri::parse(&self.identity_uri).map_err(|e| {
            ClientError::invalid_configuration("identity_uri", e.to_string())
        })?;
        if identity.user.is_none() {
            return Err(ClientError::invalid_configuration(
                "identity_uri",
                "identity must have a user part",
            ));
        }

        self.credentials.validate()?;

        if self.register_expires == 0 {
            return Err(ClientError::invalid_configuration(
                "register_expires",
                "must be greater than zero",
            ));
        }
        if self.presence_expires == 0 || self.subscribe_expires == 0 {
            return Err(ClientError::invalid_configuration(
                "presence_expires",
                "must be greater than zero",
            ));
        }
        let t = &self.timeouts;
        if t.connect_ms == 0 || t.register_ms == 0 || t.unregister_ms == 0 || t.request_ms == 0 {
            return Err(ClientError::invalid_configuration(
                "timeouts",
                "every timeout must be greater than zero",
            ));
        }
        if self.event_capacity == 0 {
            return Err(ClientError::invalid_configuration(
                "event_capacity",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Parsed identity URI. Only valid after [`Config::validate`] succeeded.
    pub fn identity(&self) -> ClientResult<SipUri> {
        SipUri::parse(&self.identity_uri)
    }

    /// Domain used to complete bare call and message targets
    pub fn domain(&self) -> String {
        self.identity()
            .map(|uri| uri.host)
            .unwrap_or_default()
    }

    /// Build the engine-native configuration. Every credential shape maps to
    /// exactly one combination of authorization fields.
    pub fn engine_config(&self) -> ClientResult<EngineConfig> {
        let identity = self.identity()?;
        let identity_user = identity.user.clone().unwrap_or_default();

        let (authorization_user, password, ha1, realm) = match &self.credentials {
            Credentials::Password { password } => {
                (identity_user, Some(password.clone()), None, None)
            }
            Credentials::DigestHash { ha1, realm } => {
                (identity_user, None, Some(ha1.clone()), Some(realm.clone()))
            }
            Credentials::UsernameRealm {
                username,
                realm,
                password,
            } => (
                username.clone(),
                Some(password.clone()),
                None,
                Some(realm.clone()),
            ),
        };

        Ok(EngineConfig {
            transport_address: self.transport_address.clone(),
            identity_uri: identity.to_string(),
            authorization_user,
            password,
            ha1,
            realm,
            display_name: self.display_name.clone(),
            register_expires: self.register_expires,
            user_agent: self.user_agent.clone(),
        })
    }
}

fn validate_transport(address: &str) -> ClientResult<()> {
    let Some((scheme, rest)) = address.split_once("://") else {
        return Err(ClientError::invalid_configuration(
            "transport_address",
            format!("'{}' has no scheme", address),
        ));
    };
    if !TRANSPORT_SCHEMES.contains(&scheme.to_ascii_lowercase().as_str()) {
        return Err(ClientError::invalid_configuration(
            "transport_address",
            format!("unsupported transport scheme '{}'", scheme),
        ));
    }
    let host = rest.split(['/', ':']).next().unwrap_or_default();
    if host.is_empty() {
        return Err(ClientError::invalid_configuration(
            "transport_address",
            "missing host",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn base() -> Config {
        Config::new(
            "wss://sip.example.com:8089/ws",
            "sip:alice@example.com",
            Credentials::password("secret"),
        )
    }

    #[test]
    fn test_defaults_validate() {
        let config = base();
        assert!(config.validate().is_ok());
        assert!(config.auto_register);
        assert_eq!(config.timeouts.connect(), Duration::from_secs(10));
        assert_eq!(config.domain(), "example.com");
    }

    #[test]
    fn test_rejects_bad_transport_and_identity() {
        let mut config = base();
        config.transport_address = "http://sip.example.com".into();
        assert!(matches!(
            config.validate(),
            Err(ClientError::InvalidConfiguration { field, .. }) if field == "transport_address"
        ));

        let mut config = base();
        config.identity_uri = "sip:example.com".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_digest() {
        let config = Config {
            credentials: Credentials::digest_hash("not-hex", "example.com"),
            ..base()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_engine_config_per_credential_shape() {
        let engine = base().engine_config().unwrap();
        assert_eq!(engine.authorization_user, "alice");
        assert_eq!(engine.password.as_deref(), Some("secret"));
        assert_eq!(engine.ha1, None);

        let hash = "0123456789abcdef0123456789abcdef";
        let engine = Config {
            credentials: Credentials::digest_hash(hash, "example.com"),
            ..base()
        }
        .engine_config()
        .unwrap();
        assert_eq!(engine.password, None);
        assert_eq!(engine.ha1.as_deref(), Some(hash));
        assert_eq!(engine.realm.as_deref(), Some("example.com"));

        let engine = Config {
            credentials: Credentials::username_realm("1001", "pbx", "pw"),
            ..base()
        }
        .engine_config()
        .unwrap();
        assert_eq!(engine.authorization_user, "1001");
        assert_eq!(engine.realm.as_deref(), Some("pbx"));
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "transport_address": "wss://sip.example.com:8089/ws",
            "identity_uri": "sip:alice@example.com",
            "credentials": { "type": "username_realm", "username": "1001", "realm": "pbx", "password": "pw" },
            "auto_register": false,
            "timeouts": { "connect_ms": 2500 }
        }"#;
        let config = Config::from_json(json).unwrap();
        assert!(!config.auto_register);
        assert_eq!(config.timeouts.connect_ms, 2500);
        assert_eq!(config.timeouts.register_ms, 10_000);
        assert_eq!(config.register_expires, 600);

        assert!(Config::from_json("{}").is_err());
    }
}
