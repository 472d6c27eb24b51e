//! In-process protocol engine for tests
//!
//! [`TestHarness`] drives a [`HarnessAdapter`] from test code: it records
//! every command the controller issues and lets the test emit engine events
//! by name with engine-shaped JSON payloads.
//!
//! A harness can also be installed process-wide with [`install`]. While one is
//! installed, [`SessionControllerBuilder::build`](crate::SessionControllerBuilder::build)
//! substitutes it for whatever adapter was configured, so application code
//! can be exercised without changes.
//!
//! ```rust
//! use serde_json::json;
//! use ua_session_core::test_bridge::TestHarness;
//!
//! # tokio_test::block_on(async {
//! let harness = TestHarness::new();
//! let _guard = ua_session_core::test_bridge::install(&harness);
//! // build a controller, call start(), then:
//! harness.emit("connected", json!({ "address": "wss://sip.example.com/ws" }));
//! # })
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tracing::debug;

use crate::adapter::{
    EngineConfig, EngineError, EngineListener, EngineRequest, EngineResult, ListenerId,
    ProtocolEngineAdapter, RawEngineEvent, RequestOutcome, event_names,
};
use crate::call::{AnswerOptions, CallOptions, DtmfOptions, MuteOptions, SessionHandle, TerminateOptions};

/// Default wait used by [`TestHarness::wait_for`]
pub const DEFAULT_WAIT: Duration = Duration::from_secs(2);

/// A command the controller issued to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum HarnessCommand {
    Start(EngineConfig),
    Stop,
    Register,
    Unregister,
    InitiateCall {
        target: String,
        options: CallOptions,
    },
    Answer {
        handle: SessionHandle,
        options: AnswerOptions,
    },
    Terminate {
        handle: SessionHandle,
        options: TerminateOptions,
    },
    Hold(SessionHandle),
    Unhold(SessionHandle),
    Mute {
        handle: SessionHandle,
        options: MuteOptions,
    },
    Unmute {
        handle: SessionHandle,
        options: MuteOptions,
    },
    Refer {
        handle: SessionHandle,
        target: String,
    },
    ReferWithReplaces {
        handle: SessionHandle,
        replaces: SessionHandle,
    },
    SendDtmf {
        handle: SessionHandle,
        tones: String,
        options: DtmfOptions,
    },
    Request(EngineRequest),
}

impl HarnessCommand {
    /// Operation name used with [`TestHarness::fail_next`]
    pub fn operation(&self) -> &'static str {
        match self {
            HarnessCommand::Start(_) => "start",
            HarnessCommand::Stop => "stop",
            HarnessCommand::Register => "register",
            HarnessCommand::Unregister => "unregister",
            HarnessCommand::InitiateCall { .. } => "initiate_call",
            HarnessCommand::Answer { .. } => "answer",
            HarnessCommand::Terminate { .. } => "terminate",
            HarnessCommand::Hold(_) => "hold",
            HarnessCommand::Unhold(_) => "unhold",
            HarnessCommand::Mute { .. } => "mute",
            HarnessCommand::Unmute { .. } => "unmute",
            HarnessCommand::Refer { .. } => "refer",
            HarnessCommand::ReferWithReplaces { .. } => "refer_with_replaces",
            HarnessCommand::SendDtmf { .. } => "send_dtmf",
            HarnessCommand::Request(_) => "send_request",
        }
    }
}

struct Registration {
    id: ListenerId,
    listener: EngineListener,
    once: bool,
}

#[derive(Default)]
struct Behavior {
    /// Emit `connected` from `start()` with this address
    auto_connect: Option<String>,
    /// Emit `registered` from `register()` and `unregistered` from `unregister()`
    auto_register: bool,
    /// Emit a local `newRTCSession` from `initiate_call()`
    announce_local_sessions: bool,
    /// How long `start()` takes after being recorded
    start_delay: Option<Duration>,
    failures: HashMap<&'static str, EngineError>,
    outcomes: Vec<RequestOutcome>,
}

/// Scripted protocol engine
pub struct HarnessAdapter {
    log: Mutex<Vec<HarnessCommand>>,
    notify: Notify,
    listeners: Mutex<HashMap<String, Vec<Registration>>>,
    next_listener: AtomicU64,
    next_session: AtomicU64,
    connected: AtomicBool,
    registered: AtomicBool,
    behavior: Mutex<Behavior>,
}

impl HarnessAdapter {
    fn new() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            notify: Notify::new(),
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
            next_session: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            behavior: Mutex::new(Behavior {
                announce_local_sessions: true,
                ..Default::default()
            }),
        }
    }

    /// Record `command` and return the scripted failure for it, if any
    fn record(&self, command: HarnessCommand) -> EngineResult<()> {
        let operation = command.operation();
        debug!(operation, "Harness received command");
        self.log.lock().push(command);
        self.notify.notify_waiters();
        match self.behavior.lock().failures.remove(operation) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn emit(&self, name: &str, payload: Value) {
        match name {
            event_names::CONNECTED => self.connected.store(true, Ordering::SeqCst),
            event_names::DISCONNECTED => {
                self.connected.store(false, Ordering::SeqCst);
                self.registered.store(false, Ordering::SeqCst);
            }
            event_names::REGISTERED => self.registered.store(true, Ordering::SeqCst),
            event_names::UNREGISTERED | event_names::REGISTRATION_FAILED => {
                self.registered.store(false, Ordering::SeqCst)
            }
            _ => {}
        }

        let targets: Vec<EngineListener> = {
            let mut listeners = self.listeners.lock();
            match listeners.get_mut(name) {
                Some(registered) => {
                    let targets = registered.iter().map(|r| r.listener.clone()).collect();
                    registered.retain(|r| !r.once);
                    targets
                }
                None => Vec::new(),
            }
        };
        for listener in targets {
            listener(RawEngineEvent::new(name, payload.clone()));
        }
    }

    fn add_listener(&self, event: &str, listener: EngineListener, once: bool) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .entry(event.to_string())
            .or_default()
            .push(Registration { id, listener, once });
        id
    }
}

#[async_trait]
impl ProtocolEngineAdapter for HarnessAdapter {
    async fn start(&self, config: EngineConfig) -> EngineResult<()> {
        self.record(HarnessCommand::Start(config))?;
        let delay = self.behavior.lock().start_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let auto_connect = self.behavior.lock().auto_connect.clone();
        if let Some(address) = auto_connect {
            self.emit(event_names::CONNECTING, Value::Null);
            self.emit(event_names::CONNECTED, json!({ "address": address }));
        }
        Ok(())
    }

    async fn stop(&self) -> EngineResult<()> {
        self.record(HarnessCommand::Stop)?;
        if self.connected.load(Ordering::SeqCst) {
            self.emit(event_names::DISCONNECTED, json!({ "reason": "stopped" }));
        }
        Ok(())
    }

    async fn register(&self) -> EngineResult<()> {
        self.record(HarnessCommand::Register)?;
        if self.behavior.lock().auto_register {
            self.emit(event_names::REGISTERED, Value::Null);
        }
        Ok(())
    }

    async fn unregister(&self) -> EngineResult<()> {
        self.record(HarnessCommand::Unregister)?;
        if self.behavior.lock().auto_register {
            self.emit(event_names::UNREGISTERED, Value::Null);
        }
        Ok(())
    }

    async fn initiate_call(&self, target: &str, options: &CallOptions) -> EngineResult<SessionHandle> {
        self.record(HarnessCommand::InitiateCall {
            target: target.to_string(),
            options: options.clone(),
        })?;
        let handle = SessionHandle::new(format!(
            "harness-session-{}",
            self.next_session.fetch_add(1, Ordering::Relaxed)
        ));
        if self.behavior.lock().announce_local_sessions {
            self.emit(
                event_names::NEW_SESSION,
                json!({
                    "handle": handle.as_str(),
                    "originator": "local",
                    "remoteIdentity": { "uri": target },
                }),
            );
        }
        Ok(handle)
    }

    async fn answer(&self, handle: &SessionHandle, options: &AnswerOptions) -> EngineResult<()> {
        self.record(HarnessCommand::Answer {
            handle: handle.clone(),
            options: options.clone(),
        })
    }

    async fn terminate(&self, handle: &SessionHandle, options: &TerminateOptions) -> EngineResult<()> {
        self.record(HarnessCommand::Terminate {
            handle: handle.clone(),
            options: options.clone(),
        })
    }

    async fn hold(&self, handle: &SessionHandle) -> EngineResult<()> {
        self.record(HarnessCommand::Hold(handle.clone()))
    }

    async fn unhold(&self, handle: &SessionHandle) -> EngineResult<()> {
        self.record(HarnessCommand::Unhold(handle.clone()))
    }

    async fn mute(&self, handle: &SessionHandle, options: MuteOptions) -> EngineResult<()> {
        self.record(HarnessCommand::Mute {
            handle: handle.clone(),
            options,
        })
    }

    async fn unmute(&self, handle: &SessionHandle, options: MuteOptions) -> EngineResult<()> {
        self.record(HarnessCommand::Unmute {
            handle: handle.clone(),
            options,
        })
    }

    async fn refer(&self, handle: &SessionHandle, target: &str) -> EngineResult<()> {
        self.record(HarnessCommand::Refer {
            handle: handle.clone(),
            target: target.to_string(),
        })
    }

    async fn refer_with_replaces(&self, handle: &SessionHandle, replaces: &SessionHandle) -> EngineResult<()> {
        self.record(HarnessCommand::ReferWithReplaces {
            handle: handle.clone(),
            replaces: replaces.clone(),
        })
    }

    async fn send_dtmf(&self, handle: &SessionHandle, tones: &str, options: DtmfOptions) -> EngineResult<()> {
        self.record(HarnessCommand::SendDtmf {
            handle: handle.clone(),
            tones: tones.to_string(),
            options,
        })
    }

    async fn send_request(&self, request: EngineRequest) -> EngineResult<RequestOutcome> {
        self.record(HarnessCommand::Request(request))?;
        let mut behavior = self.behavior.lock();
        if behavior.outcomes.is_empty() {
            Ok(RequestOutcome::new(200, "OK"))
        } else {
            Ok(behavior.outcomes.remove(0))
        }
    }

    fn on(&self, event: &str, listener: EngineListener) -> ListenerId {
        self.add_listener(event, listener, false)
    }

    fn once(&self, event: &str, listener: EngineListener) -> ListenerId {
        self.add_listener(event, listener, true)
    }

    fn off(&self, event: &str, id: ListenerId) {
        if let Some(registered) = self.listeners.lock().get_mut(event) {
            registered.retain(|r| r.id != id);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }
}

/// Test-side handle on a [`HarnessAdapter`]
#[derive(Clone)]
pub struct TestHarness {
    adapter: Arc<HarnessAdapter>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            adapter: Arc::new(HarnessAdapter::new()),
        }
    }

    /// The adapter to hand to a controller
    pub fn adapter(&self) -> Arc<dyn ProtocolEngineAdapter> {
        self.adapter.clone()
    }

    /// Emit an engine event to every registered listener
    pub fn emit(&self, name: &str, payload: Value) {
        self.adapter.emit(name, payload);
    }

    /// Answer `start()` with `connected` on the given address
    pub fn auto_connect(&self, address: impl Into<String>) -> &Self {
        self.adapter.behavior.lock().auto_connect = Some(address.into());
        self
    }

    /// Answer `register()`/`unregister()` with `registered`/`unregistered`
    pub fn auto_register(&self, enabled: bool) -> &Self {
        self.adapter.behavior.lock().auto_register = enabled;
        self
    }

    /// Whether `initiate_call()` announces its own `newRTCSession`
    pub fn announce_local_sessions(&self, enabled: bool) -> &Self {
        self.adapter.behavior.lock().announce_local_sessions = enabled;
        self
    }

    /// Make `start()` take `delay` before it returns
    pub fn delay_start(&self, delay: Duration) -> &Self {
        self.adapter.behavior.lock().start_delay = Some(delay);
        self
    }

    /// Fail the next call of `operation` (see [`HarnessCommand::operation`])
    pub fn fail_next(&self, operation: &'static str, error: EngineError) -> &Self {
        self.adapter.behavior.lock().failures.insert(operation, error);
        self
    }

    /// Queue the outcome of the next out-of-dialog request. Unqueued requests
    /// get 200 OK.
    pub fn queue_outcome(&self, outcome: RequestOutcome) -> &Self {
        self.adapter.behavior.lock().outcomes.push(outcome);
        self
    }

    /// Every command issued so far, oldest first
    pub fn commands(&self) -> Vec<HarnessCommand> {
        self.adapter.log.lock().clone()
    }

    /// Number of commands with the given operation name
    pub fn count(&self, operation: &str) -> usize {
        self.adapter
            .log
            .lock()
            .iter()
            .filter(|c| c.operation() == operation)
            .count()
    }

    /// The last out-of-dialog request issued, if any
    pub fn last_request(&self) -> Option<EngineRequest> {
        self.adapter.log.lock().iter().rev().find_map(|c| match c {
            HarnessCommand::Request(request) => Some(request.clone()),
            _ => None,
        })
    }

    /// Number of listeners currently registered for `event`
    pub fn listener_count(&self, event: &str) -> usize {
        self.adapter
            .listeners
            .lock()
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Wait up to [`DEFAULT_WAIT`] for the `nth` (0-based) command with the
    /// given operation name
    pub async fn wait_for(&self, operation: &str, nth: usize) -> Option<HarnessCommand> {
        self.wait_for_within(operation, nth, DEFAULT_WAIT).await
    }

    pub async fn wait_for_within(&self, operation: &str, nth: usize, timeout: Duration) -> Option<HarnessCommand> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.adapter.notify.notified();
            let found = self
                .adapter
                .log
                .lock()
                .iter()
                .filter(|c| c.operation() == operation)
                .nth(nth)
                .cloned();
            if found.is_some() {
                return found;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

static INSTALLED: Mutex<Option<TestHarness>> = parking_lot::const_mutex(None);

/// Uninstalls its harness when dropped
#[must_use = "the harness is uninstalled when the guard is dropped"]
pub struct InstallGuard {
    _private: (),
}

impl Drop for InstallGuard {
    fn drop(&mut self) {
        uninstall();
    }
}

/// Install `harness` process-wide, replacing any installed one
pub fn install(harness: &TestHarness) -> InstallGuard {
    *INSTALLED.lock() = Some(harness.clone());
    debug!("Test harness installed");
    InstallGuard { _private: () }
}

/// Remove the installed harness, returning it
pub fn uninstall() -> Option<TestHarness> {
    INSTALLED.lock().take()
}

/// The installed harness, if any
pub fn detect() -> Option<TestHarness> {
    INSTALLED.lock().clone()
}
