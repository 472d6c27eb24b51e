//! Presence publication and subscriptions
//!
//! [`PresenceManager::publish`] sends our own status as a PIDF document via
//! PUBLISH and keeps it alive with ETag-conditional refreshes. When the
//! entity tag is missing or rejected the full document is published again;
//! if that fails too the publication is dropped and
//! [`UaEvent::PresencePublishFailed`] is published.
//! [`PresenceManager::subscribe`] watches another identity; every NOTIFY for
//! it is decoded and republished as [`UaEvent::PresenceNotify`]. A body that
//! fails to decode is reported with [`UaEvent::PresenceParseFailed`] and the
//! subscription carries on.
//!
//! Each watched identity has its own registry entry and refresh timer.

pub mod pidf;

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{EngineRequest, ProtocolEngineAdapter, RequestMethod, RequestOutcome};
use crate::error::{ClientError, ClientResult};
use crate::events::{EventBus, UaEvent};
use crate::state::StateCell;
use crate::timeout::engine_call;
use crate::translator::{NotifySignal, NotifyState};
use crate::uri::SipUri;

pub use pidf::{PIDF_CONTENT_TYPE, PidfError, PresenceDocument, PresenceStatus};

const PRESENCE_EVENT: &str = "presence";

/// Refresh this long before expiry, or at half-life for short lifetimes
const REFRESH_MARGIN_SECS: u64 = 30;

fn refresh_delay(expires: u32) -> Duration {
    let expires = u64::from(expires);
    let secs = if expires > REFRESH_MARGIN_SECS * 2 {
        expires - REFRESH_MARGIN_SECS
    } else {
        (expires / 2).max(1)
    };
    Duration::from_secs(secs)
}

/// Options for [`PresenceManager::publish`]
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Free text shown next to the status
    pub note: Option<String>,
    /// Publication lifetime; defaults to the configured presence expiry
    pub expires: Option<u32>,
}

impl PublishOptions {
    pub fn with_note(note: impl Into<String>) -> Self {
        Self {
            note: Some(note.into()),
            expires: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Active,
    Terminated,
}

/// Snapshot of one presence subscription
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionInfo {
    pub target: String,
    pub state: SubscriptionState,
    pub last_status: Option<PresenceStatus>,
    pub last_note: Option<String>,
    pub expires: u32,
    pub updated_at: DateTime<Utc>,
}

struct PresenceSubscription {
    info: SubscriptionInfo,
    refresh: Option<JoinHandle<()>>,
}

impl Drop for PresenceSubscription {
    fn drop(&mut self) {
        if let Some(refresh) = self.refresh.take() {
            refresh.abort();
        }
    }
}

struct Publication {
    status: PresenceStatus,
    note: Option<String>,
    body: String,
    etag: Option<String>,
    expires: u32,
    refresh: Option<JoinHandle<()>>,
}

impl Drop for Publication {
    fn drop(&mut self) {
        if let Some(refresh) = self.refresh.take() {
            refresh.abort();
        }
    }
}

/// Presence settings taken from the controller configuration
#[derive(Debug, Clone)]
pub(crate) struct PresenceSettings {
    pub identity: String,
    pub display_name: Option<String>,
    pub domain: String,
    pub publish_expires: u32,
    pub subscribe_expires: u32,
    pub request_timeout: Duration,
}

struct PresenceInner {
    adapter: Arc<dyn ProtocolEngineAdapter>,
    bus: EventBus,
    state: StateCell,
    settings: PresenceSettings,
    publication: Mutex<Option<Publication>>,
    subscriptions: DashMap<String, PresenceSubscription>,
}

/// Presence publication and subscription registry
#[derive(Clone)]
pub struct PresenceManager {
    inner: Arc<PresenceInner>,
}

impl PresenceManager {
    pub(crate) fn new(
        adapter: Arc<dyn ProtocolEngineAdapter>,
        bus: EventBus,
        state: StateCell,
        settings: PresenceSettings,
    ) -> Self {
        Self {
            inner: Arc::new(PresenceInner {
                adapter,
                bus,
                state,
                settings,
                publication: Mutex::new(None),
                subscriptions: DashMap::new(),
            }),
        }
    }

    /// Publish our status. Replaces any earlier publication and keeps it
    /// refreshed until [`unpublish`](Self::unpublish) or `stop()`.
    pub async fn publish(&self, status: PresenceStatus, options: PublishOptions) -> ClientResult<()> {
        self.inner.state.ensure_connected()?;
        let inner = &self.inner;
        let expires = options.expires.unwrap_or(inner.settings.publish_expires);
        if expires == 0 {
            return Err(ClientError::invalid_configuration(
                "expires",
                "use unpublish() to withdraw a publication",
            ));
        }

        let mut document = PresenceDocument::new(inner.settings.identity.clone(), status);
        document.note = options.note.clone();
        document.display_name = inner.settings.display_name.clone();
        let body = pidf::encode(&document)
            .map_err(|e| ClientError::PresenceFailed { reason: e.to_string() })?;

        let identity = &inner.settings.identity;
        let mut etag = inner.publication.lock().as_ref().and_then(|p| p.etag.clone());
        let mut result = inner
            .send(publish_request(identity, Some(&body), expires, etag.as_deref()), "publish")
            .await;
        if etag.is_some() && matches!(&result, Err(e) if is_precondition_failed(e)) {
            // Stale entity tag: start a fresh publication
            debug!("Presence entity tag rejected; publishing without it");
            etag = None;
            if let Some(publication) = inner.publication.lock().as_mut() {
                publication.etag = None;
            }
            result = inner
                .send(publish_request(identity, Some(&body), expires, None), "publish")
                .await;
        }
        let outcome = result?;

        let new_etag = outcome.header("sip-etag").map(str::to_string);
        let granted = granted_expires(&outcome, expires);

        let refresh = spawn_publish_refresh(Arc::downgrade(&self.inner), granted);
        *inner.publication.lock() = Some(Publication {
            status,
            note: options.note,
            body,
            etag: new_etag.or(etag),
            expires: granted,
            refresh: Some(refresh),
        });
        info!(status = %status, expires = granted, "Presence published");
        Ok(())
    }

    /// Withdraw the current publication. No-op if nothing is published.
    pub async fn unpublish(&self) -> ClientResult<()> {
        let Some(publication) = self.inner.publication.lock().take() else {
            return Ok(());
        };
        let Some(etag) = publication.etag.clone() else {
            return Ok(());
        };
        drop(publication);
        if self.inner.state.ensure_connected().is_err() {
            return Ok(());
        }

        let request = publish_request(&self.inner.settings.identity, None, 0, Some(&etag));
        self.inner.send(request, "unpublish").await?;
        info!("Presence publication withdrawn");
        Ok(())
    }

    /// Status currently being published, if any
    pub fn published_status(&self) -> Option<PresenceStatus> {
        self.inner.publication.lock().as_ref().map(|p| p.status)
    }

    /// Start watching `target`. Subscribing to an identity that is already
    /// watched is a no-op.
    pub async fn subscribe(&self, target: &str) -> ClientResult<()> {
        self.inner.state.ensure_connected()?;
        let uri = SipUri::normalize_target(target, &self.inner.settings.domain)?.to_string();
        let expires = self.inner.settings.subscribe_expires;

        if self.inner.subscriptions.contains_key(&uri) {
            debug!(target = %uri, "Already subscribed");
            return Ok(());
        }
        self.inner.subscriptions.insert(
            uri.clone(),
            PresenceSubscription {
                info: SubscriptionInfo {
                    target: uri.clone(),
                    state: SubscriptionState::Pending,
                    last_status: None,
                    last_note: None,
                    expires,
                    updated_at: Utc::now(),
                },
                refresh: None,
            },
        );

        let result = self.inner.send(subscribe_request(&uri, expires), "subscribe").await;
        match result {
            Ok(outcome) => {
                let granted = granted_expires(&outcome, expires);
                let refresh = spawn_subscribe_refresh(Arc::downgrade(&self.inner), uri.clone(), granted);
                match self.inner.subscriptions.get_mut(&uri) {
                    Some(mut subscription) => {
                        subscription.info.expires = granted;
                        if let Some(old) = subscription.refresh.replace(refresh) {
                            old.abort();
                        }
                    }
                    // Terminated by a NOTIFY while the SUBSCRIBE was in flight
                    None => refresh.abort(),
                }
                info!(target = %uri, expires = granted, "Presence subscription created");
                Ok(())
            }
            Err(e) => {
                self.inner.subscriptions.remove(&uri);
                Err(e)
            }
        }
    }

    /// Stop watching `target`
    pub async fn unsubscribe(&self, target: &str) -> ClientResult<()> {
        let uri = SipUri::normalize_target(target, &self.inner.settings.domain)?.to_string();
        if self.inner.subscriptions.remove(&uri).is_none() {
            return Err(ClientError::SubscriptionNotFound { target: uri });
        }
        info!(target = %uri, "Presence subscription removed");
        if self.inner.state.ensure_connected().is_err() {
            return Ok(());
        }
        self.inner.send(subscribe_request(&uri, 0), "unsubscribe").await?;
        Ok(())
    }

    pub fn subscription(&self, target: &str) -> Option<SubscriptionInfo> {
        let uri = SipUri::normalize_target(target, &self.inner.settings.domain).ok()?.to_string();
        self.inner.subscriptions.get(&uri).map(|s| s.info.clone())
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner.subscriptions.iter().map(|s| s.info.clone()).collect()
    }

    /// Apply one NOTIFY. Runs on the dispatch task.
    pub(crate) fn handle_notify(&self, notify: NotifySignal) {
        if notify.event != PRESENCE_EVENT {
            debug!(event = %notify.event, "Ignoring NOTIFY for another event package");
            return;
        }
        let target = SipUri::parse(&notify.target)
            .map(|uri| uri.to_string())
            .unwrap_or_else(|_| notify.target.clone());

        {
            let Some(mut subscription) = self.inner.subscriptions.get_mut(&target) else {
                warn!(target = %target, "NOTIFY for unknown presence subscription");
                return;
            };
            subscription.info.updated_at = Utc::now();
            if let Some(expires) = notify.expires {
                subscription.info.expires = expires;
            }
            if notify.state != NotifyState::Terminated {
                subscription.info.state = match notify.state {
                    NotifyState::Active => SubscriptionState::Active,
                    _ => SubscriptionState::Pending,
                };
            }

            if let Some(body) = notify.body.as_deref().filter(|b| !b.trim().is_empty()) {
                match pidf::decode(body) {
                    Ok(document) => {
                        subscription.info.last_status = Some(document.status);
                        subscription.info.last_note = document.note.clone();
                        debug!(target = %target, status = %document.status, "Presence update");
                        self.inner.bus.publish(UaEvent::PresenceNotify {
                            target: target.clone(),
                            status: document.status,
                            note: document.note,
                            raw: Some(body.to_string()),
                        });
                    }
                    Err(e) => {
                        warn!(target = %target, error = %e, "Unparseable presence document");
                        self.inner.bus.publish(UaEvent::PresenceParseFailed {
                            target: target.clone(),
                            reason: e.to_string(),
                            raw: Some(body.to_string()),
                        });
                    }
                }
            }
        }

        if notify.state == NotifyState::Terminated {
            if let Some((_, mut subscription)) = self.inner.subscriptions.remove(&target) {
                subscription.info.state = SubscriptionState::Terminated;
            }
            info!(target = %target, reason = ?notify.reason, "Presence subscription terminated");
            self.inner.bus.publish(UaEvent::SubscriptionTerminated {
                target,
                reason: notify.reason,
            });
        }
    }

    /// Drop every subscription and the publication. Called by `stop()`.
    pub(crate) fn shutdown(&self) {
        self.inner.publication.lock().take();
        let targets: Vec<String> = self.inner.subscriptions.iter().map(|s| s.key().clone()).collect();
        for target in targets {
            if self.inner.subscriptions.remove(&target).is_some() {
                self.inner.bus.publish(UaEvent::SubscriptionTerminated {
                    target,
                    reason: Some("stopped".to_string()),
                });
            }
        }
    }
}

impl PresenceInner {
    async fn send(&self, request: EngineRequest, operation: &str) -> ClientResult<RequestOutcome> {
        let outcome = engine_call(operation, self.settings.request_timeout, self.adapter.send_request(request))
            .await?;
        if outcome.is_success() {
            Ok(outcome)
        } else {
            Err(ClientError::PresenceFailed {
                reason: format!("{} {}", outcome.status_code, outcome.reason_phrase),
            })
        }
    }
}

fn publish_request(identity: &str, body: Option<&str>, expires: u32, etag: Option<&str>) -> EngineRequest {
    let mut request = EngineRequest::new(RequestMethod::Publish, identity)
        .with_event(PRESENCE_EVENT)
        .with_expires(expires);
    if let Some(body) = body {
        request = request.with_body(PIDF_CONTENT_TYPE, body);
    }
    if let Some(etag) = etag {
        request.extra_headers.push(format!("SIP-If-Match: {}", etag));
    }
    request
}

/// 412 Conditional Request Failed
fn is_precondition_failed(error: &ClientError) -> bool {
    matches!(error, ClientError::PresenceFailed { reason } if reason.starts_with("412"))
}

fn subscribe_request(target: &str, expires: u32) -> EngineRequest {
    EngineRequest::new(RequestMethod::Subscribe, target)
        .with_event(PRESENCE_EVENT)
        .with_expires(expires)
        .with_headers([format!("Accept: {}", PIDF_CONTENT_TYPE)])
}

fn granted_expires(outcome: &RequestOutcome, requested: u32) -> u32 {
    outcome
        .header("expires")
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(requested)
}

fn spawn_publish_refresh(inner: Weak<PresenceInner>, expires: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut expires = expires;
        loop {
            tokio::time::sleep(refresh_delay(expires)).await;
            let Some(inner) = inner.upgrade() else { return };
            let Some((etag, body)) = inner
                .publication
                .lock()
                .as_ref()
                .map(|p| (p.etag.clone(), p.body.clone()))
            else {
                return;
            };
            let identity = &inner.settings.identity;

            // Conditional refreshes carry no body, only the entity tag
            let refreshed = match &etag {
                Some(etag) => {
                    let request = publish_request(identity, None, expires, Some(etag));
                    match inner.send(request, "publish refresh").await {
                        Ok(outcome) => Some(outcome),
                        Err(e) => {
                            warn!(error = %e, "Conditional presence refresh failed; republishing");
                            None
                        }
                    }
                }
                None => None,
            };
            let fresh = refreshed.is_none();
            let outcome = match refreshed {
                Some(outcome) => outcome,
                None => {
                    let request = publish_request(identity, Some(&body), expires, None);
                    match inner.send(request, "publish").await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!(error = %e, "Presence publication lapsed");
                            if let Some(mut publication) = inner.publication.lock().take() {
                                // Don't abort ourselves on drop
                                publication.refresh.take();
                            }
                            inner.bus.publish(UaEvent::PresencePublishFailed {
                                reason: e.to_string(),
                            });
                            return;
                        }
                    }
                }
            };

            expires = granted_expires(&outcome, expires);
            let new_etag = outcome.header("sip-etag").map(str::to_string);
            if let Some(publication) = inner.publication.lock().as_mut() {
                if fresh || new_etag.is_some() {
                    publication.etag = new_etag;
                }
                publication.expires = expires;
            }
            debug!(expires, fresh, "Presence publication refreshed");
        }
    })
}

fn spawn_subscribe_refresh(inner: Weak<PresenceInner>, target: String, expires: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut expires = expires;
        loop {
            tokio::time::sleep(refresh_delay(expires)).await;
            let Some(inner) = inner.upgrade() else { return };
            if !inner.subscriptions.contains_key(&target) {
                return;
            }
            let requested = inner.settings.subscribe_expires;
            match inner.send(subscribe_request(&target, requested), "subscribe refresh").await {
                Ok(outcome) => {
                    expires = granted_expires(&outcome, requested);
                    if let Some(mut subscription) = inner.subscriptions.get_mut(&target) {
                        subscription.info.expires = expires;
                    }
                    debug!(target = %target, expires, "Presence subscription refreshed");
                }
                Err(e) => {
                    // Keep the entry; the notifier will terminate it if it is gone
                    warn!(target = %target, error = %e, "Presence subscription refresh failed");
                }
            }
        }
    })
}
