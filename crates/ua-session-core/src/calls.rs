//! Call session registry and per-session controls
//!
//! Sessions enter the registry exactly once, either from `call()` or from the
//! engine's new-session signal, whichever claims the engine handle first. A
//! single [`UaEvent::Session`] is published at that moment. Sessions leave the
//! registry only after their terminal [`UaEvent::SessionStateChanged`] has been
//! published.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::ProtocolEngineAdapter;
use crate::call::{
    AnswerOptions, CallOptions, CallSession, CallState, DtmfOptions, MuteOptions, Originator,
    RemoteIdentity, SessionHandle, TerminateOptions,
};
use crate::error::{ClientError, ClientResult};
use crate::events::{EventBus, UaEvent};
use crate::state::StateCell;
use crate::timeout::engine_call;
use crate::translator::NewSessionSignal;
use crate::uri::SipUri;

/// Pause inserted for `,` in a DTMF sequence
const DTMF_PAUSE: Duration = Duration::from_secs(2);

pub(crate) fn is_valid_dtmf(tone: char) -> bool {
    matches!(tone, '0'..='9' | 'A'..='D' | '*' | '#')
}

#[derive(Debug, Clone)]
pub(crate) struct CallSettings {
    pub domain: String,
    pub request_timeout: Duration,
}

struct CallsInner {
    adapter: Arc<dyn ProtocolEngineAdapter>,
    bus: EventBus,
    state: StateCell,
    settings: CallSettings,
    sessions: DashMap<String, CallSession>,
    handles: DashMap<SessionHandle, String>,
    /// Local sessions announced by the engine that `call()` has not picked up
    /// yet, with the time of the announcement
    unclaimed: DashMap<SessionHandle, Instant>,
    /// Local sessions that ended before `call()` returned
    retired: DashMap<SessionHandle, (Instant, CallSession)>,
}

/// Registry of active call sessions
#[derive(Clone)]
pub struct CallSessionManager {
    inner: Arc<CallsInner>,
}

impl CallSessionManager {
    pub(crate) fn new(
        adapter: Arc<dyn ProtocolEngineAdapter>,
        bus: EventBus,
        state: StateCell,
        settings: CallSettings,
    ) -> Self {
        Self {
            inner: Arc::new(CallsInner {
                adapter,
                bus,
                state,
                settings,
                sessions: DashMap::new(),
                handles: DashMap::new(),
                unclaimed: DashMap::new(),
                retired: DashMap::new(),
            }),
        }
    }

    /// Place a call. The options are validated as a whole and then handed to
    /// the engine unchanged.
    pub async fn call(&self, target: &str, options: CallOptions) -> ClientResult<CallSession> {
        self.inner.state.ensure_connected()?;
        let uri = SipUri::normalize_target(target, &self.inner.settings.domain)?;
        options.validate()?;
        let uri = uri.to_string();
        self.prune_unclaimed();

        let result = engine_call(
            "call",
            self.inner.settings.request_timeout,
            self.inner.adapter.initiate_call(&uri, &options),
        )
        .await;
        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                self.prune_unclaimed();
                return Err(match e {
                    ClientError::Engine { reason } => ClientError::call_failed(reason),
                    other => other,
                });
            }
        };

        let session = self.claim(
            handle,
            true,
            Originator::Local,
            None,
            RemoteIdentity {
                uri: uri.clone(),
                display_name: None,
            },
        );
        info!(call_id = %session.call_id, target = %uri, "Outgoing call initiated");
        Ok(session)
    }

    /// Register a session announced by the engine. Runs on the dispatch task.
    pub(crate) fn adopt_session(&self, signal: NewSessionSignal) {
        let session = self.claim(
            signal.handle,
            false,
            signal.originator,
            signal.call_id,
            signal.remote_identity,
        );
        debug!(call_id = %session.call_id, originator = %session.originator, "Session adopted");
    }

    /// Insert-if-absent keyed by engine handle. Publishes the session event
    /// only for the claimant that inserted.
    fn claim(
        &self,
        handle: SessionHandle,
        by_caller: bool,
        originator: Originator,
        call_id: Option<String>,
        remote_identity: RemoteIdentity,
    ) -> CallSession {
        if by_caller {
            if let Some((_, (_, ended))) = self.inner.retired.remove(&handle) {
                return ended;
            }
        }
        match self.inner.handles.entry(handle.clone()) {
            Entry::Occupied(existing) => {
                let call_id = existing.get().clone();
                drop(existing);
                if by_caller {
                    self.inner.unclaimed.remove(&handle);
                    if let Some((_, (_, ended))) = self.inner.retired.remove(&handle) {
                        return ended;
                    }
                }
                if let Some(session) = self.inner.sessions.get(&call_id) {
                    return session.clone();
                }
                // Terminated before the second claimant arrived
                let mut session = CallSession::new(call_id, handle, originator, remote_identity);
                session.state = CallState::Ended;
                session
            }
            Entry::Vacant(slot) => {
                let call_id = call_id.unwrap_or_else(|| Uuid::new_v4().to_string());
                if !by_caller && originator == Originator::Local {
                    self.inner.unclaimed.insert(handle.clone(), Instant::now());
                }
                let session = CallSession::new(call_id.clone(), handle, originator, remote_identity);
                self.inner.sessions.insert(call_id.clone(), session.clone());
                slot.insert(call_id.clone());
                if originator == Originator::Remote {
                    info!(call_id = %call_id, from = %session.remote_identity.uri, "Incoming call");
                }
                self.inner.bus.publish(UaEvent::Session {
                    session: session.clone(),
                    originator,
                    call_id,
                });
                session
            }
        }
    }

    /// Forget announcements that no `call()` can claim any more. A `call()`
    /// gives up after the request timeout, so older entries are orphans.
    fn prune_unclaimed(&self) {
        let window = self.inner.settings.request_timeout;
        let now = Instant::now();
        self.inner
            .unclaimed
            .retain(|_, announced| now.duration_since(*announced) <= window);
        self.inner
            .retired
            .retain(|_, (ended, _)| now.duration_since(*ended) <= window);
    }

    /// Move a session forward. Backward or repeated transitions are ignored.
    pub(crate) fn transition(&self, handle: &SessionHandle, next: CallState, cause: Option<String>) {
        let Some(call_id) = self.inner.handles.get(handle).map(|c| c.clone()) else {
            warn!(handle = %handle, state = %next, "State change for unknown session");
            return;
        };

        let (previous, snapshot) = {
            let Some(mut session) = self.inner.sessions.get_mut(&call_id) else {
                return;
            };
            let previous = session.state;
            if !previous.can_transition_to(next) {
                debug!(call_id = %call_id, from = %previous, to = %next, "Ignoring out-of-order transition");
                return;
            }
            session.state = next;
            match next {
                CallState::Confirmed => session.started_at = Some(Utc::now()),
                CallState::Ended | CallState::Failed => {
                    session.ended_at = Some(Utc::now());
                    session.end_cause = cause.clone();
                }
                _ => {}
            }
            (previous, session.clone())
        };

        debug!(call_id = %call_id, from = %previous, to = %next, "Call state changed");
        self.inner.bus.publish(UaEvent::SessionStateChanged {
            call_id: call_id.clone(),
            previous,
            current: next,
            cause,
        });

        if next.is_terminal() {
            if self.inner.unclaimed.remove(handle).is_some() {
                self.inner.retired.insert(handle.clone(), (Instant::now(), snapshot));
            }
            self.inner.sessions.remove(&call_id);
            self.inner.handles.remove(handle);
            info!(call_id = %call_id, state = %next, "Call session removed");
        }
    }

    /// Reconcile hold state reported by the engine
    pub(crate) fn apply_hold(&self, handle: &SessionHandle, on_hold: bool) {
        self.update_by_handle(handle, |session| {
            let changed = session.on_hold != on_hold;
            session.on_hold = on_hold;
            changed
        });
    }

    /// Reconcile mute state reported by the engine
    pub(crate) fn apply_mute(&self, handle: &SessionHandle, audio: bool, video: bool, muted: bool) {
        self.update_by_handle(handle, |session| {
            let before = (session.audio_muted, session.video_muted);
            if audio {
                session.audio_muted = muted;
            }
            if video {
                session.video_muted = muted;
            }
            before != (session.audio_muted, session.video_muted)
        });
    }

    fn update_by_handle(&self, handle: &SessionHandle, update: impl FnOnce(&mut CallSession) -> bool) {
        let Some(call_id) = self.inner.handles.get(handle).map(|c| c.clone()) else {
            return;
        };
        self.update(&call_id, update);
    }

    /// Apply `update`; publishes `SessionUpdated` if it reports a change
    fn update(&self, call_id: &str, update: impl FnOnce(&mut CallSession) -> bool) -> Option<CallSession> {
        let (changed, snapshot) = {
            let mut session = self.inner.sessions.get_mut(call_id)?;
            let changed = update(&mut session);
            (changed, session.clone())
        };
        if changed {
            self.inner.bus.publish(UaEvent::SessionUpdated {
                session: snapshot.clone(),
            });
        }
        Some(snapshot)
    }

    fn lookup(&self, call_id: &str) -> ClientResult<CallSession> {
        self.inner
            .sessions
            .get(call_id)
            .map(|s| s.clone())
            .ok_or_else(|| ClientError::CallNotFound {
                call_id: call_id.to_string(),
            })
    }

    fn require_established(&self, call_id: &str) -> ClientResult<CallSession> {
        let session = self.lookup(call_id)?;
        if !matches!(session.state, CallState::Accepted | CallState::Confirmed) {
            return Err(ClientError::InvalidCallState {
                call_id: call_id.to_string(),
                reason: format!("call is {}", session.state),
            });
        }
        Ok(session)
    }

    /// Answer an incoming call
    pub async fn answer(&self, call_id: &str, options: AnswerOptions) -> ClientResult<()> {
        let session = self.lookup(call_id)?;
        if session.originator != Originator::Remote
            || !matches!(session.state, CallState::Initiating | CallState::Progress)
        {
            return Err(ClientError::InvalidCallState {
                call_id: call_id.to_string(),
                reason: "only unanswered incoming calls can be answered".to_string(),
            });
        }
        for header in &options.extra_headers {
            crate::call::validate_header(header)?;
        }
        engine_call(
            "answer",
            self.inner.settings.request_timeout,
            self.inner.adapter.answer(&session.handle, &options),
        )
        .await?;
        info!(call_id = %call_id, "Call answered");
        Ok(())
    }

    /// End a call in any state. The session leaves the registry when the
    /// engine reports the end.
    pub async fn hangup(&self, call_id: &str, options: TerminateOptions) -> ClientResult<()> {
        let session = self.lookup(call_id)?;
        engine_call(
            "hangup",
            self.inner.settings.request_timeout,
            self.inner.adapter.terminate(&session.handle, &options),
        )
        .await?;
        info!(call_id = %call_id, "Hangup requested");
        Ok(())
    }

    pub async fn hold(&self, call_id: &str) -> ClientResult<()> {
        self.set_hold(call_id, true).await
    }

    pub async fn unhold(&self, call_id: &str) -> ClientResult<()> {
        self.set_hold(call_id, false).await
    }

    async fn set_hold(&self, call_id: &str, on_hold: bool) -> ClientResult<()> {
        let session = self.require_established(call_id)?;
        if session.on_hold == on_hold {
            return Ok(());
        }

        self.update(call_id, |s| {
            s.on_hold = on_hold;
            true
        });
        let timeout = self.inner.settings.request_timeout;
        let result = if on_hold {
            engine_call("hold", timeout, self.inner.adapter.hold(&session.handle)).await
        } else {
            engine_call("unhold", timeout, self.inner.adapter.unhold(&session.handle)).await
        };

        if let Err(e) = result {
            warn!(call_id = %call_id, error = %e, "Hold change rejected, reverting");
            self.update(call_id, |s| {
                s.on_hold = !on_hold;
                true
            });
            return Err(e);
        }
        info!("{} call {}", if on_hold { "Put on hold" } else { "Resumed" }, call_id);
        Ok(())
    }

    pub async fn mute(&self, call_id: &str, options: MuteOptions) -> ClientResult<()> {
        self.set_muted(call_id, options, true).await
    }

    pub async fn unmute(&self, call_id: &str, options: MuteOptions) -> ClientResult<()> {
        self.set_muted(call_id, options, false).await
    }

    async fn set_muted(&self, call_id: &str, options: MuteOptions, muted: bool) -> ClientResult<()> {
        let session = self.lookup(call_id)?;
        if session.state.is_terminal() {
            return Err(ClientError::InvalidCallState {
                call_id: call_id.to_string(),
                reason: "call has ended".to_string(),
            });
        }
        let before = (session.audio_muted, session.video_muted);

        self.update(call_id, |s| {
            if options.audio {
                s.audio_muted = muted;
            }
            if options.video {
                s.video_muted = muted;
            }
            before != (s.audio_muted, s.video_muted)
        });
        let timeout = self.inner.settings.request_timeout;
        let result = if muted {
            engine_call("mute", timeout, self.inner.adapter.mute(&session.handle, options)).await
        } else {
            engine_call("unmute", timeout, self.inner.adapter.unmute(&session.handle, options)).await
        };

        if let Err(e) = result {
            warn!(call_id = %call_id, error = %e, "Mute change rejected, reverting");
            self.update(call_id, |s| {
                let changed = (s.audio_muted, s.video_muted) != before;
                s.audio_muted = before.0;
                s.video_muted = before.1;
                changed
            });
            return Err(e);
        }
        Ok(())
    }

    /// Blind transfer to `target`
    pub async fn transfer(&self, call_id: &str, target: &str) -> ClientResult<()> {
        let session = self.require_established(call_id)?;
        let uri = SipUri::normalize_target(target, &self.inner.settings.domain)?.to_string();
        engine_call(
            "transfer",
            self.inner.settings.request_timeout,
            self.inner.adapter.refer(&session.handle, &uri),
        )
        .await?;
        info!(call_id = %call_id, target = %uri, "Blind transfer requested");
        Ok(())
    }

    /// Attended transfer: connect the peer of `call_id` with the peer of
    /// `consultation_call_id`
    pub async fn attended_transfer(&self, call_id: &str, consultation_call_id: &str) -> ClientResult<()> {
        if call_id == consultation_call_id {
            return Err(ClientError::InvalidCallState {
                call_id: call_id.to_string(),
                reason: "cannot transfer a call to itself".to_string(),
            });
        }
        let session = self.require_established(call_id)?;
        let consultation = self.require_established(consultation_call_id)?;
        engine_call(
            "attended transfer",
            self.inner.settings.request_timeout,
            self.inner
                .adapter
                .refer_with_replaces(&session.handle, &consultation.handle),
        )
        .await?;
        info!(call_id = %call_id, replaces = %consultation_call_id, "Attended transfer requested");
        Ok(())
    }

    /// Send one DTMF digit (`0-9`, `A-D`, `*`, `#`)
    pub async fn send_dtmf(&self, call_id: &str, digit: char) -> ClientResult<()> {
        let digit = digit.to_ascii_uppercase();
        if !is_valid_dtmf(digit) {
            return Err(ClientError::invalid_call_option("dtmf", format!("invalid digit '{}'", digit)));
        }
        let session = self.require_established(call_id)?;
        engine_call(
            "dtmf",
            self.inner.settings.request_timeout,
            self.inner
                .adapter
                .send_dtmf(&session.handle, &digit.to_string(), DtmfOptions::default()),
        )
        .await
    }

    /// Send a digit sequence one tone at a time, `duration + gap` apart. A
    /// comma inserts a two second pause.
    pub async fn send_dtmf_sequence(&self, call_id: &str, tones: &str, options: DtmfOptions) -> ClientResult<()> {
        let tones: Vec<char> = tones.chars().map(|c| c.to_ascii_uppercase()).collect();
        if let Some(bad) = tones.iter().find(|c| **c != ',' && !is_valid_dtmf(**c)) {
            return Err(ClientError::invalid_call_option("dtmf", format!("invalid digit '{}'", bad)));
        }
        self.require_established(call_id)?;

        let spacing = Duration::from_millis(options.duration_ms + options.inter_tone_gap_ms);
        for (index, tone) in tones.iter().enumerate() {
            if *tone == ',' {
                tokio::time::sleep(DTMF_PAUSE).await;
                continue;
            }
            // The call may have ended while we were waiting
            let session = self.require_established(call_id)?;
            engine_call(
                "dtmf",
                self.inner.settings.request_timeout,
                self.inner.adapter.send_dtmf(&session.handle, &tone.to_string(), options),
            )
            .await?;
            if index + 1 < tones.len() {
                tokio::time::sleep(spacing).await;
            }
        }
        Ok(())
    }

    pub fn get(&self, call_id: &str) -> Option<CallSession> {
        self.inner.sessions.get(call_id).map(|s| s.clone())
    }

    pub fn find_by_handle(&self, handle: &SessionHandle) -> Option<CallSession> {
        let call_id = self.inner.handles.get(handle).map(|c| c.clone())?;
        self.get(&call_id)
    }

    pub fn list(&self) -> Vec<CallSession> {
        self.inner.sessions.iter().map(|s| s.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }
}

#[cfg(test)]
impl CallSessionManager {
    fn claim_backlog(&self) -> (usize, usize) {
        (self.inner.unclaimed.len(), self.inner.retired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::EngineError;
    use crate::state::ConnectionState;
    use crate::test_bridge::TestHarness;

    fn manager(harness: &TestHarness) -> CallSessionManager {
        let state = StateCell::new();
        state.replace(ConnectionState::Registered);
        CallSessionManager::new(
            harness.adapter(),
            EventBus::default(),
            state,
            CallSettings {
                domain: "example.com".to_string(),
                request_timeout: Duration::from_secs(5),
            },
        )
    }

    fn announce(calls: &CallSessionManager, handle: &str) {
        calls.adopt_session(NewSessionSignal {
            handle: SessionHandle::new(handle),
            originator: Originator::Local,
            call_id: None,
            remote_identity: RemoteIdentity {
                uri: "sip:bob@example.com".to_string(),
                display_name: None,
            },
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_call_leaves_no_claims_behind() {
        let harness = TestHarness::new();
        let calls = manager(&harness);

        // Announced by the engine, then the INVITE is rejected
        announce(&calls, "orphan-1");
        harness.fail_next("initiate_call", EngineError::Transport("no route".into()));
        assert!(calls.call("bob", CallOptions::new()).await.is_err());
        assert_eq!(calls.claim_backlog(), (1, 0));

        // The engine ends it; nobody will ever collect the result
        calls.transition(&SessionHandle::new("orphan-1"), CallState::Failed, Some("503".into()));
        assert_eq!(calls.claim_backlog(), (0, 1));
        assert!(calls.is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        harness.fail_next("initiate_call", EngineError::Transport("no route".into()));
        assert!(calls.call("bob", CallOptions::new()).await.is_err());
        assert_eq!(calls.claim_backlog(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_announcement_is_pruned() {
        let harness = TestHarness::new();
        harness.announce_local_sessions(false);
        let calls = manager(&harness);

        announce(&calls, "orphan-2");
        tokio::time::advance(Duration::from_secs(6)).await;
        let session = calls.call("carol", CallOptions::new()).await.unwrap();
        assert_eq!(calls.claim_backlog(), (0, 0));
        assert_eq!(calls.len(), 2);
        assert_eq!(session.originator, Originator::Local);
    }

    #[test]
    fn test_dtmf_alphabet() {
        for tone in "0123456789ABCD*#".chars() {
            assert!(is_valid_dtmf(tone));
        }
        assert!(!is_valid_dtmf('E'));
        assert!(!is_valid_dtmf(' '));
        assert!(!is_valid_dtmf(','));
    }
}
