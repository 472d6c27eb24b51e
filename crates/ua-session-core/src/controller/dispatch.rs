//! Engine event dispatch
//!
//! Runs on a single task per `start()`. Each raw event is translated and then
//! handled to completion before the next one is taken off the channel.

use std::sync::Weak;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::ControllerInner;
use crate::adapter::RawEngineEvent;
use crate::call::CallState;
use crate::error::ClientError;
use crate::events::UaEvent;
use crate::pending::OperationKind;
use crate::state::ConnectionState;
use crate::translator::EngineSignal;

pub(super) async fn run(controller: Weak<ControllerInner>, mut events: mpsc::UnboundedReceiver<RawEngineEvent>) {
    while let Some(event) = events.recv().await {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.dispatch(event);
    }
    debug!("Engine event dispatch finished");
}

impl ControllerInner {
    pub(super) fn dispatch(&self, event: RawEngineEvent) {
        let signal = match self.translator.translate(&event) {
            Ok(signal) => signal,
            Err(e) => {
                self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(event = %event.name, error = %e, "Dropping engine event");
                return;
            }
        };
        self.counters.events_dispatched.fetch_add(1, Ordering::Relaxed);
        trace!(event = %event.name, "Dispatching engine event");

        match signal {
            EngineSignal::Connecting => self.bus.publish(UaEvent::Connecting),
            EngineSignal::Connected { transport_address } => self.on_connected(transport_address),
            EngineSignal::Disconnected { reason, error } => self.on_disconnected(reason, error),
            EngineSignal::Registered => self.on_registered(),
            EngineSignal::Unregistered { cause } => self.on_unregistered(cause),
            EngineSignal::RegistrationFailed { cause } => self.on_registration_failed(cause),

            EngineSignal::NewSession(session) => self.calls.adopt_session(session),
            EngineSignal::SessionProgress { handle } => {
                self.calls.transition(&handle, CallState::Progress, None)
            }
            EngineSignal::SessionAccepted { handle } => {
                self.calls.transition(&handle, CallState::Accepted, None)
            }
            EngineSignal::SessionConfirmed { handle } => {
                self.calls.transition(&handle, CallState::Confirmed, None)
            }
            EngineSignal::SessionEnded { handle, cause } => {
                self.calls.transition(&handle, CallState::Ended, cause)
            }
            EngineSignal::SessionFailed { handle, cause } => {
                self.calls.transition(&handle, CallState::Failed, cause)
            }
            EngineSignal::SessionHold { handle, on_hold } => self.calls.apply_hold(&handle, on_hold),
            EngineSignal::SessionMuted {
                handle,
                audio,
                video,
                muted,
            } => self.calls.apply_mute(&handle, audio, video, muted),

            EngineSignal::Message(message) => self.messaging.handle_message(message),
            EngineSignal::Notify(notify) => self.presence.handle_notify(notify),
        }
    }

    fn on_connected(&self, transport_address: String) {
        let changed = self.transition_from(
            &[ConnectionState::Connecting, ConnectionState::Disconnected],
            ConnectionState::Connected,
        );
        if !changed {
            debug!(state = %self.state.get(), "Ignoring connected signal");
            return;
        }
        self.bus.publish(UaEvent::Connected { transport_address });
        self.pending.resolve(OperationKind::Connect, ());
    }

    fn on_disconnected(&self, reason: Option<String>, error: bool) {
        let state = self.state.get();
        match state {
            ConnectionState::Disconnecting | ConnectionState::Disconnected | ConnectionState::Failed => {
                debug!(%state, "Ignoring disconnected signal");
            }
            ConnectionState::Connecting => {
                warn!(reason = ?reason, error, "Transport closed while connecting");
                self.transition(ConnectionState::Failed);
                self.bus.publish(UaEvent::Disconnected {
                    reason: reason.clone(),
                });
                self.pending.reject(
                    OperationKind::Connect,
                    ClientError::ConnectionFailed {
                        reason: reason.unwrap_or_else(|| "transport closed".to_string()),
                    },
                );
            }
            _ => {
                warn!(reason = ?reason, error, "Transport lost");
                self.transition(ConnectionState::Disconnected);
                self.bus.publish(UaEvent::Disconnected {
                    reason: reason.clone(),
                });
                let failure = ClientError::ConnectionFailed {
                    reason: reason.unwrap_or_else(|| "transport closed".to_string()),
                };
                self.pending.reject(OperationKind::Register, failure.clone());
                self.pending.reject(OperationKind::Unregister, failure);
            }
        }
    }

    fn on_registered(&self) {
        let changed = self.transition_from(
            &[ConnectionState::Connected, ConnectionState::Registering],
            ConnectionState::Registered,
        );
        if changed {
            self.bus.publish(UaEvent::Registered);
        } else {
            trace!(state = %self.state.get(), "Registration refreshed");
        }
        self.pending.resolve(OperationKind::Register, ());
    }

    fn on_unregistered(&self, cause: Option<String>) {
        self.transition_from(&[ConnectionState::Registered], ConnectionState::Connected);
        self.bus.publish(UaEvent::Unregistered { cause });
        self.pending.resolve(OperationKind::Unregister, ());
    }

    fn on_registration_failed(&self, cause: String) {
        warn!(cause = %cause, "Registration failed");
        self.transition_from(
            &[ConnectionState::Registering, ConnectionState::Registered],
            ConnectionState::Connected,
        );
        self.bus.publish(UaEvent::RegistrationFailed {
            cause: cause.clone(),
        });
        self.pending
            .reject(OperationKind::Register, ClientError::RegistrationFailed { reason: cause });
    }
}
