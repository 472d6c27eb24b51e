//! Public event bus
//!
//! Everything the controller observes from the engine is republished here as
//! a [`UaEvent`]. Engine payloads never appear on the bus; consumers only see
//! these variants.
//!
//! ```rust,no_run
//! # use ua_session_core::{SessionController, UaEvent, Originator};
//! # async fn example(controller: SessionController) {
//! let mut events = controller.subscribe_events();
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         UaEvent::Session { session, originator: Originator::Remote, .. } => {
//!             println!("incoming call from {}", session.remote_identity.uri);
//!         }
//!         UaEvent::RegistrationFailed { cause } => eprintln!("registration failed: {}", cause),
//!         _ => {}
//!     }
//! }
//! # }
//! ```

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::call::{CallSession, CallState, Originator};
use crate::presence::PresenceStatus;
use crate::state::ConnectionState;

/// Events published by the session controller
#[derive(Debug, Clone, PartialEq)]
pub enum UaEvent {
    /// Transport connection is being opened
    Connecting,

    Connected {
        transport_address: String,
    },

    Disconnected {
        reason: Option<String>,
    },

    Registered,

    Unregistered {
        cause: Option<String>,
    },

    RegistrationFailed {
        cause: String,
    },

    ConnectionStateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },

    /// A new call leg, in either direction. Branch on `originator`.
    Session {
        session: CallSession,
        originator: Originator,
        call_id: String,
    },

    SessionStateChanged {
        call_id: String,
        previous: CallState,
        current: CallState,
        cause: Option<String>,
    },

    /// Hold or mute flags changed
    SessionUpdated {
        session: CallSession,
    },

    Message {
        from: String,
        body: String,
        content_type: String,
        timestamp: DateTime<Utc>,
    },

    /// A peer started or stopped composing a message
    Composing {
        peer: String,
        active: bool,
    },

    PresenceNotify {
        target: String,
        status: PresenceStatus,
        note: Option<String>,
        raw: Option<String>,
    },

    /// A NOTIFY body could not be parsed; the subscription stays active
    PresenceParseFailed {
        target: String,
        reason: String,
        raw: Option<String>,
    },

    SubscriptionTerminated {
        target: String,
        reason: Option<String>,
    },

    /// Our presence publication could not be kept alive and was dropped
    PresencePublishFailed {
        reason: String,
    },
}

pub type EventStream = BroadcastStream<UaEvent>;

/// Broadcast channel carrying [`UaEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<UaEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: UaEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UaEvent> {
        self.sender.subscribe()
    }

    pub fn stream(&self) -> EventStream {
        BroadcastStream::new(self.sender.subscribe())
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(UaEvent::Registered);
        assert_eq!(bus.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_delivers_in_order() {
        let bus = EventBus::new(8);
        let mut stream = bus.stream();
        bus.publish(UaEvent::Connecting);
        bus.publish(UaEvent::Registered);

        assert_eq!(stream.next().await.unwrap().unwrap(), UaEvent::Connecting);
        assert_eq!(stream.next().await.unwrap().unwrap(), UaEvent::Registered);
    }
}
