//! Connection and registration state
//!
//! `Failed` is only entered while a connection is being established, on an
//! engine error or timeout during `start()`. Any registration problem returns
//! to `Connected` so a fresh `register()` is always possible. A failing engine
//! stop still ends in `Disconnected`.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

/// Connection and registration state of the user agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Registering,
    Registered,
    Disconnecting,
    /// Connection attempt failed; stays here until the next `start()`.
    /// Never entered from the registration states.
    Failed,
}

impl ConnectionState {
    /// Transport is up, whether or not the user agent is registered
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Registering | ConnectionState::Registered
        )
    }

    pub fn is_registered(self) -> bool {
        self == ConnectionState::Registered
    }

    /// A fresh `start()` is needed before anything else can happen
    pub fn is_idle(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Registering => "Registering",
            ConnectionState::Registered => "Registered",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Connection state shared between the controller and its managers.
/// Only the controller writes it.
#[derive(Debug, Clone)]
pub(crate) struct StateCell(Arc<RwLock<ConnectionState>>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(Arc::new(RwLock::new(ConnectionState::Disconnected)))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.0.read()
    }

    /// Store `next` and return the state it replaced
    pub(crate) fn replace(&self, next: ConnectionState) -> ConnectionState {
        std::mem::replace(&mut *self.0.write(), next)
    }

    /// Store `next` only if the current state is one of `allowed`; returns
    /// the replaced state on success
    pub(crate) fn replace_if(&self, allowed: &[ConnectionState], next: ConnectionState) -> Option<ConnectionState> {
        let mut state = self.0.write();
        if allowed.contains(&*state) {
            Some(std::mem::replace(&mut *state, next))
        } else {
            None
        }
    }

    pub(crate) fn ensure_connected(&self) -> ClientResult<()> {
        let state = self.get();
        if state.is_connected() {
            Ok(())
        } else {
            Err(ClientError::NotConnected {
                state: state.to_string(),
            })
        }
    }
}
