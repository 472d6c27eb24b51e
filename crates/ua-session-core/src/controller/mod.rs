//! Session controller
//!
//! The [`SessionController`] owns the protocol engine adapter and drives the
//! connection and registration lifecycle. Engine events are forwarded from the
//! adapter's listeners into a channel and handled one at a time, in arrival
//! order, by a single dispatch task. Calls, presence and messaging are exposed
//! as sub-managers sharing the controller's event bus and connection state.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Registering -> Registered
//!       ^              |             ^             |             |
//!       |              v             +-------------+-------------+
//!       |           Failed            (registration failure/unregister)
//!       +--------- Disconnecting <--- stop()
//! ```
//!
//! `start()`, `stop()` and `register()` are single-flight: concurrent callers
//! share one attempt and observe its result.

mod dispatch;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::ProtocolEngineAdapter;
use crate::calls::{CallSessionManager, CallSettings};
use crate::config::Config;
use crate::error::{ClientError, ClientResult};
use crate::events::{EventBus, EventStream, UaEvent};
use crate::listeners::ListenerArena;
use crate::messaging::{MessagingChannel, MessagingSettings};
use crate::pending::{OperationKind, PendingOperationRegistry, SingleFlight};
use crate::presence::{PresenceManager, PresenceSettings};
use crate::state::{ConnectionState, StateCell};
use crate::timeout::engine_call;
use crate::translator::EventTranslator;

/// Counters describing the controller's activity since construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerStats {
    pub connect_attempts: u64,
    pub registrations: u64,
    pub events_dispatched: u64,
    pub events_dropped: u64,
    pub active_calls: usize,
    pub presence_subscriptions: usize,
}

#[derive(Default)]
struct Counters {
    connect_attempts: AtomicU64,
    registrations: AtomicU64,
    events_dispatched: AtomicU64,
    events_dropped: AtomicU64,
}

pub(crate) struct ControllerInner {
    config: Config,
    adapter: Arc<dyn ProtocolEngineAdapter>,
    substituted: bool,
    bus: EventBus,
    state: StateCell,
    pending: PendingOperationRegistry<()>,
    start_flight: SingleFlight,
    stop_flight: SingleFlight,
    register_flight: SingleFlight,
    listeners: ListenerArena,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    /// Bumped by every `stop()`; a start attempt that sees it change gives up
    epoch: AtomicU64,
    translator: EventTranslator,
    calls: CallSessionManager,
    presence: PresenceManager,
    messaging: MessagingChannel,
    counters: Counters,
}

/// Entry point for connecting, registering and managing sessions
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    /// Build a controller around `adapter`. `config` must already be valid.
    pub(crate) fn new(config: Config, adapter: Arc<dyn ProtocolEngineAdapter>, substituted: bool) -> Self {
        let bus = EventBus::new(config.event_capacity);
        let state = StateCell::new();
        let domain = config.domain();
        let request_timeout = config.timeouts.request();

        let calls = CallSessionManager::new(
            adapter.clone(),
            bus.clone(),
            state.clone(),
            CallSettings {
                domain: domain.clone(),
                request_timeout,
            },
        );
        let presence = PresenceManager::new(
            adapter.clone(),
            bus.clone(),
            state.clone(),
            PresenceSettings {
                identity: config
                    .identity()
                    .map(|uri| uri.address_of_record())
                    .unwrap_or_else(|_| config.identity_uri.clone()),
                display_name: config.display_name.clone(),
                domain: domain.clone(),
                publish_expires: config.presence_expires,
                subscribe_expires: config.subscribe_expires,
                request_timeout,
            },
        );
        let messaging = MessagingChannel::new(
            adapter.clone(),
            bus.clone(),
            state.clone(),
            MessagingSettings {
                domain,
                request_timeout,
                composing_idle: std::time::Duration::from_secs(config.composing_idle_secs),
            },
        );

        info!(
            identity = %config.identity_uri,
            transport = %config.transport_address,
            substituted,
            "Session controller created"
        );

        Self {
            inner: Arc::new(ControllerInner {
                config,
                adapter,
                substituted,
                bus,
                state,
                pending: PendingOperationRegistry::new(),
                start_flight: SingleFlight::new("start"),
                stop_flight: SingleFlight::new("stop"),
                register_flight: SingleFlight::new("register"),
                listeners: ListenerArena::new(),
                dispatch_task: Mutex::new(None),
                epoch: AtomicU64::new(0),
                translator: EventTranslator::new(),
                calls,
                presence,
                messaging,
                counters: Counters::default(),
            }),
        }
    }

    /// Connect the engine and, with `auto_register`, register.
    ///
    /// Resolves once the engine reports `connected` (and `registered` when
    /// auto-registering). Fails with `ConnectionTimeout` if the connection is
    /// not confirmed in time, leaving the controller in `Failed`.
    pub async fn start(&self) -> ClientResult<()> {
        let inner = self.inner.clone();
        self.inner
            .start_flight
            .run(move || inner.run_start().boxed())
            .await
    }

    /// Disconnect. Pending start/register/unregister calls are rejected with
    /// `OperationCancelled` right away. Active calls are left to the engine.
    pub async fn stop(&self) -> ClientResult<()> {
        let inner = self.inner.clone();
        self.inner
            .stop_flight
            .run(move || inner.run_stop().boxed())
            .await
    }

    /// Register with the registrar. Requires a connected engine.
    pub async fn register(&self) -> ClientResult<()> {
        self.inner.clone().register_shared().await
    }

    /// Remove the registration. Does nothing when not registered.
    pub async fn unregister(&self) -> ClientResult<()> {
        self.inner.clone().run_unregister().await
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.get().is_connected()
    }

    pub fn is_registered(&self) -> bool {
        self.inner.state.get().is_registered()
    }

    /// Subscribe to controller events
    pub fn subscribe_events(&self) -> broadcast::Receiver<UaEvent> {
        self.inner.bus.subscribe()
    }

    /// Controller events as a stream
    pub fn event_stream(&self) -> EventStream {
        self.inner.bus.stream()
    }

    pub fn calls(&self) -> &CallSessionManager {
        &self.inner.calls
    }

    pub fn presence(&self) -> &PresenceManager {
        &self.inner.presence
    }

    pub fn messaging(&self) -> &MessagingChannel {
        &self.inner.messaging
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Whether an installed test harness replaced the configured adapter
    pub fn is_substituted(&self) -> bool {
        self.inner.substituted
    }

    pub fn stats(&self) -> ControllerStats {
        let counters = &self.inner.counters;
        ControllerStats {
            connect_attempts: counters.connect_attempts.load(Ordering::Relaxed),
            registrations: counters.registrations.load(Ordering::Relaxed),
            events_dispatched: counters.events_dispatched.load(Ordering::Relaxed),
            events_dropped: counters.events_dropped.load(Ordering::Relaxed),
            active_calls: self.inner.calls.len(),
            presence_subscriptions: self.inner.presence.subscriptions().len(),
        }
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("identity", &self.inner.config.identity_uri)
            .field("state", &self.inner.state.get())
            .field("substituted", &self.inner.substituted)
            .finish()
    }
}

impl ControllerInner {
    /// Move to `next`, publishing the change if there was one
    fn transition(&self, next: ConnectionState) {
        let previous = self.state.replace(next);
        self.announce(previous, next);
    }

    /// Move to `next` only from one of `allowed`
    fn transition_from(&self, allowed: &[ConnectionState], next: ConnectionState) -> bool {
        match self.state.replace_if(allowed, next) {
            Some(previous) => {
                self.announce(previous, next);
                true
            }
            None => false,
        }
    }

    fn announce(&self, previous: ConnectionState, current: ConnectionState) {
        if previous != current {
            debug!(%previous, %current, "Connection state changed");
            self.bus
                .publish(UaEvent::ConnectionStateChanged { previous, current });
        }
    }

    fn stopped_since(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) != epoch
    }

    async fn run_start(self: Arc<Self>) -> ClientResult<()> {
        if let Some(stop) = self.stop_flight.current() {
            debug!("Waiting for in-flight stop before starting");
            let _ = stop.await;
        }
        let epoch = self.epoch.load(Ordering::SeqCst);

        let state = self.state.get();
        if state.is_connected() {
            if self.config.auto_register && !state.is_registered() {
                return self.register_shared().await;
            }
            return Ok(());
        }

        let engine_config = self.config.engine_config()?;
        self.counters.connect_attempts.fetch_add(1, Ordering::Relaxed);
        info!(transport = %engine_config.transport_address, "Starting protocol engine");

        self.transition(ConnectionState::Connecting);
        self.attach_listeners();

        let connect = self
            .pending
            .create(OperationKind::Connect, self.config.timeouts.connect());

        if let Err(e) = self.adapter.start(engine_config).await {
            drop(connect);
            let error = ClientError::ConnectionFailed {
                reason: e.to_string(),
            };
            if !self.stopped_since(epoch) {
                self.abandon_connection(&error).await;
            }
            return Err(error);
        }
        if self.stopped_since(epoch) {
            // stop() ran while the engine was still starting
            debug!("Start completed after stop; stopping the engine again");
            if let Err(e) = engine_call("stop", self.config.timeouts.request(), self.adapter.stop()).await {
                debug!(error = %e, "Engine stop after cancelled start");
            }
            return Err(ClientError::cancelled("start"));
        }

        match connect.wait().await {
            Ok(()) => {}
            Err(e @ ClientError::OperationCancelled { .. }) => return Err(e),
            Err(e) => {
                if !self.stopped_since(epoch) {
                    self.abandon_connection(&e).await;
                }
                return Err(e);
            }
        }
        if self.stopped_since(epoch) {
            return Err(ClientError::cancelled("start"));
        }

        info!("Protocol engine connected");
        if self.config.auto_register {
            return self.register_shared().await;
        }
        Ok(())
    }

    /// Give up on a start attempt: settle in `Failed` and release the engine
    async fn abandon_connection(&self, error: &ClientError) {
        warn!(error = %error, "Connection attempt failed");
        if self.state.get() != ConnectionState::Failed {
            self.transition(ConnectionState::Failed);
            self.bus.publish(UaEvent::Disconnected {
                reason: Some(error.to_string()),
            });
        }
        self.detach_listeners();
        if let Err(e) = engine_call("stop", self.config.timeouts.request(), self.adapter.stop()).await {
            debug!(error = %e, "Engine stop after failed connect");
        }
    }

    async fn register_shared(self: Arc<Self>) -> ClientResult<()> {
        if self.stop_flight.is_running() {
            return Err(ClientError::OperationInProgress {
                operation: "stop".to_string(),
            });
        }
        let inner = self.clone();
        self.register_flight
            .run(move || inner.run_register().boxed())
            .await
    }

    async fn run_register(self: Arc<Self>) -> ClientResult<()> {
        match self.state.get() {
            ConnectionState::Registered => return Ok(()),
            ConnectionState::Connected | ConnectionState::Registering => {}
            other => {
                return Err(ClientError::NotConnected {
                    state: other.to_string(),
                });
            }
        }

        info!(expires = self.config.register_expires, "Registering");
        self.transition(ConnectionState::Registering);
        let registration = self
            .pending
            .create(OperationKind::Register, self.config.timeouts.register());

        if let Err(e) = self.adapter.register().await {
            drop(registration);
            let cause = e.to_string();
            self.transition_from(&[ConnectionState::Registering], ConnectionState::Connected);
            self.bus.publish(UaEvent::RegistrationFailed {
                cause: cause.clone(),
            });
            return Err(ClientError::RegistrationFailed { reason: cause });
        }

        match registration.wait().await {
            Ok(()) => {
                self.counters.registrations.fetch_add(1, Ordering::Relaxed);
                info!("Registered");
                Ok(())
            }
            Err(e @ ClientError::RegistrationTimeout { .. }) => {
                warn!(error = %e, "Registration not confirmed");
                if self.transition_from(&[ConnectionState::Registering], ConnectionState::Connected) {
                    self.bus.publish(UaEvent::RegistrationFailed {
                        cause: e.to_string(),
                    });
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_unregister(self: Arc<Self>) -> ClientResult<()> {
        if self.state.get() != ConnectionState::Registered {
            debug!("Unregister requested while not registered");
            return Ok(());
        }
        let operation = self
            .pending
            .create(OperationKind::Unregister, self.config.timeouts.unregister());
        self.adapter.unregister().await.map_err(ClientError::from)?;
        operation.wait().await
    }

    async fn run_stop(self: Arc<Self>) -> ClientResult<()> {
        let state = self.state.get();
        if state == ConnectionState::Disconnected && self.dispatch_task.lock().is_none() {
            debug!("Stop requested while already stopped");
            return Ok(());
        }
        info!(%state, "Stopping session controller");

        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.transition(ConnectionState::Disconnecting);

        let cancelled = self
            .pending
            .cancel_all(|kind| ClientError::cancelled(kind.name()));
        if cancelled > 0 {
            debug!(cancelled, "Cancelled pending operations");
        }

        self.presence.shutdown();
        self.messaging.shutdown();

        if state == ConnectionState::Registered {
            let operation = self
                .pending
                .create(OperationKind::Unregister, self.config.timeouts.unregister());
            match self.adapter.unregister().await {
                Ok(()) => {
                    if let Err(e) = operation.wait().await {
                        warn!(error = %e, "Unregister during stop did not complete");
                    }
                }
                Err(e) => warn!(error = %e, "Unregister during stop failed"),
            }
        }

        if let Err(e) = engine_call("stop", self.config.timeouts.request(), self.adapter.stop()).await {
            warn!(error = %e, "Engine stop failed");
        }
        self.detach_listeners();

        self.transition(ConnectionState::Disconnected);
        self.bus.publish(UaEvent::Disconnected { reason: None });
        info!("Session controller stopped");
        Ok(())
    }

    /// Forward every engine event into a fresh dispatch task
    fn attach_listeners(self: &Arc<Self>) {
        self.detach_listeners();

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        for &name in crate::adapter::event_names::ALL {
            let tx = tx.clone();
            let id = self.adapter.on(
                name,
                Arc::new(move |event| {
                    let _ = tx.send(event);
                }),
            );
            let adapter = self.adapter.clone();
            self.listeners.push(move || adapter.off(name, id));
        }
        debug!(listeners = self.listeners.len(), "Engine listeners attached");

        let task = tokio::spawn(dispatch::run(Arc::downgrade(self), rx));
        if let Some(previous) = self.dispatch_task.lock().replace(task) {
            previous.abort();
        }
    }

    fn detach_listeners(&self) {
        let removed = self.listeners.clear();
        if removed > 0 {
            debug!(removed, "Engine listeners detached");
        }
        if let Some(task) = self.dispatch_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        self.listeners.clear();
        if let Some(task) = self.dispatch_task.get_mut().take() {
            task.abort();
        }
    }
}
