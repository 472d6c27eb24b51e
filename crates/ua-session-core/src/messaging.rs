//! Instant messaging (SIP MESSAGE) and composing indicators (RFC 3994)

use std::any::Any;
use std::io::Cursor;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapter::{EngineError, EngineRequest, ProtocolEngineAdapter, RequestMethod};
use crate::call::validate_header;
use crate::call::Originator;
use crate::error::{ClientError, ClientResult};
use crate::events::{EventBus, UaEvent};
use crate::state::StateCell;
use crate::timeout::with_timeout;
use crate::translator::MessageSignal;
use crate::uri::SipUri;

pub const IS_COMPOSING_CONTENT_TYPE: &str = "application/im-iscomposing+xml";
const IS_COMPOSING_NS: &str = "urn:ietf:params:xml:ns:im-iscomposing";
const DEFAULT_CONTENT_TYPE: &str = "text/plain";
const COMPOSING_REFRESH_SECS: u32 = 60;

/// A message received from a peer
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub from: String,
    pub body: String,
    pub content_type: String,
    pub timestamp: DateTime<Utc>,
}

/// Options for [`MessagingChannel::send_message`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageOptions {
    /// Defaults to `text/plain`
    pub content_type: Option<String>,
    pub extra_headers: Vec<String>,
}

impl MessageOptions {
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            extra_headers: Vec::new(),
        }
    }

    pub fn header(mut self, header: impl Into<String>) -> Self {
        self.extra_headers.push(header.into());
        self
    }
}

pub type MessageHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Returned by [`MessagingChannel::on_message`]
pub type HandlerId = u64;

struct ComposingIndicator {
    generation: u64,
    expiry: Option<JoinHandle<()>>,
}

impl Drop for ComposingIndicator {
    fn drop(&mut self) {
        if let Some(expiry) = self.expiry.take() {
            expiry.abort();
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MessagingSettings {
    pub domain: String,
    pub request_timeout: Duration,
    pub composing_idle: Duration,
}

struct MessagingInner {
    adapter: Arc<dyn ProtocolEngineAdapter>,
    bus: EventBus,
    state: StateCell,
    settings: MessagingSettings,
    handlers: RwLock<Vec<(HandlerId, MessageHandler)>>,
    next_id: AtomicU64,
    composing: DashMap<String, ComposingIndicator>,
}

/// MESSAGE send/receive with any number of inbound handlers
#[derive(Clone)]
pub struct MessagingChannel {
    inner: Arc<MessagingInner>,
}

impl MessagingChannel {
    pub(crate) fn new(
        adapter: Arc<dyn ProtocolEngineAdapter>,
        bus: EventBus,
        state: StateCell,
        settings: MessagingSettings,
    ) -> Self {
        Self {
            inner: Arc::new(MessagingInner {
                adapter,
                bus,
                state,
                settings,
                handlers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                composing: DashMap::new(),
            }),
        }
    }

    /// Send a MESSAGE and wait for its final response. Succeeds only on 2xx.
    pub async fn send_message(&self, target: &str, body: &str, options: MessageOptions) -> ClientResult<()> {
        self.inner.state.ensure_connected()?;
        let uri = SipUri::normalize_target(target, &self.inner.settings.domain)?.to_string();
        for header in &options.extra_headers {
            validate_header(header)?;
        }
        let content_type = options
            .content_type
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        let request = EngineRequest::new(RequestMethod::Message, uri.clone())
            .with_body(content_type.clone(), body)
            .with_headers(options.extra_headers);
        self.send(request).await?;
        debug!(target = %uri, content_type = %content_type, "Message delivered");
        Ok(())
    }

    /// Tell `target` we started or stopped composing
    pub async fn send_composing(&self, target: &str, active: bool) -> ClientResult<()> {
        self.inner.state.ensure_connected()?;
        let uri = SipUri::normalize_target(target, &self.inner.settings.domain)?.to_string();
        let body = encode_is_composing(active, COMPOSING_REFRESH_SECS)
            .map_err(|reason| ClientError::internal_error(reason))?;
        let request = EngineRequest::new(RequestMethod::Message, uri).with_body(IS_COMPOSING_CONTENT_TYPE, body);
        self.send(request).await
    }

    /// Register a handler for inbound messages. Every registered handler sees
    /// every message, in registration order. A handler that panics is logged
    /// and skipped; the others still run.
    pub fn on_message<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.write().push((id, Arc::new(handler)));
        id
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.write();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.read().len()
    }

    pub fn is_composing(&self, peer: &str) -> bool {
        self.inner.composing.contains_key(&peer_key(peer))
    }

    pub fn composing_peers(&self) -> Vec<String> {
        self.inner.composing.iter().map(|e| e.key().clone()).collect()
    }

    /// Apply one inbound MESSAGE. Runs on the dispatch task.
    pub(crate) fn handle_message(&self, message: MessageSignal) {
        if message.originator == Originator::Local {
            return;
        }
        let peer = peer_key(&message.from);

        if is_composing_type(&message.content_type) {
            match decode_is_composing(&message.body) {
                Ok(update) => self.update_composing(peer, update),
                Err(reason) => warn!(peer = %peer, reason = %reason, "Malformed isComposing document"),
            }
            return;
        }

        // A delivered message ends the sender's composing state
        if self.inner.composing.remove(&peer).is_some() {
            self.inner.bus.publish(UaEvent::Composing {
                peer: peer.clone(),
                active: false,
            });
        }

        let inbound = InboundMessage {
            from: message.from,
            body: message.body,
            content_type: message.content_type,
            timestamp: Utc::now(),
        };
        info!(from = %inbound.from, content_type = %inbound.content_type, "Message received");

        let handlers: Vec<MessageHandler> = self
            .inner
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&inbound))) {
                error!(
                    from = %inbound.from,
                    panic = %panic_message(panic.as_ref()),
                    "Message handler panicked"
                );
            }
        }

        self.inner.bus.publish(UaEvent::Message {
            from: inbound.from,
            body: inbound.body,
            content_type: inbound.content_type,
            timestamp: inbound.timestamp,
        });
    }

    fn update_composing(&self, peer: String, update: ComposingUpdate) {
        if !update.active {
            if self.inner.composing.remove(&peer).is_some() {
                self.inner.bus.publish(UaEvent::Composing { peer, active: false });
            }
            return;
        }

        // The peer's refresh interval never extends past the configured window
        let limit = self.inner.settings.composing_idle;
        let idle = update
            .refresh
            .map(|secs| Duration::from_secs(u64::from(secs)).min(limit))
            .unwrap_or(limit);
        let generation = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let expiry = spawn_composing_expiry(Arc::downgrade(&self.inner), peer.clone(), generation, idle);
        let previous = self.inner.composing.insert(
            peer.clone(),
            ComposingIndicator {
                generation,
                expiry: Some(expiry),
            },
        );
        if previous.is_none() {
            self.inner.bus.publish(UaEvent::Composing { peer, active: true });
        }
    }

    /// Clear composing state. Called by `stop()`.
    pub(crate) fn shutdown(&self) {
        self.inner.composing.clear();
    }

    async fn send(&self, request: EngineRequest) -> ClientResult<()> {
        let adapter = self.inner.adapter.clone();
        let outcome = with_timeout("message", self.inner.settings.request_timeout, async move {
            adapter.send_request(request).await.map_err(|e| match e {
                EngineError::Rejected { status_code, reason } => ClientError::MessageDeliveryFailed {
                    status_code: Some(status_code),
                    reason,
                },
                other => ClientError::MessageDeliveryFailed {
                    status_code: None,
                    reason: other.to_string(),
                },
            })
        })
        .await?;

        if outcome.is_success() {
            Ok(())
        } else {
            Err(ClientError::MessageDeliveryFailed {
                status_code: Some(outcome.status_code),
                reason: outcome.reason_phrase,
            })
        }
    }
}

fn spawn_composing_expiry(
    inner: Weak<MessagingInner>,
    peer: String,
    generation: u64,
    idle: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(idle).await;
        let Some(inner) = inner.upgrade() else { return };
        let expired = inner
            .composing
            .remove_if(&peer, |_, indicator| indicator.generation == generation);
        if let Some((_, mut indicator)) = expired {
            // Don't abort ourselves on drop
            indicator.expiry.take();
            debug!(peer = %peer, "Composing indicator expired");
            inner.bus.publish(UaEvent::Composing { peer, active: false });
        }
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn peer_key(from: &str) -> String {
    SipUri::parse(from)
        .map(|uri| uri.to_string())
        .unwrap_or_else(|_| from.trim().to_string())
}

fn is_composing_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|t| t.trim().eq_ignore_ascii_case(IS_COMPOSING_CONTENT_TYPE))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ComposingUpdate {
    active: bool,
    refresh: Option<u32>,
}

fn encode_is_composing(active: bool, refresh: u32) -> Result<String, String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let state = if active { "active" } else { "idle" };
    let refresh = refresh.to_string();

    let mut events = vec![Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None))];
    let mut root = BytesStart::new("isComposing");
    root.push_attribute(("xmlns", IS_COMPOSING_NS));
    events.push(Event::Start(root));
    for (name, text) in [("state", state), ("contenttype", DEFAULT_CONTENT_TYPE)] {
        events.push(Event::Start(BytesStart::new(name)));
        events.push(Event::Text(BytesText::new(text)));
        events.push(Event::End(BytesEnd::new(name)));
    }
    if active {
        events.push(Event::Start(BytesStart::new("refresh")));
        events.push(Event::Text(BytesText::new(&refresh)));
        events.push(Event::End(BytesEnd::new("refresh")));
    }
    events.push(Event::End(BytesEnd::new("isComposing")));

    for event in events {
        writer.write_event(event).map_err(|e| e.to_string())?;
    }
    String::from_utf8(writer.into_inner().into_inner()).map_err(|e| e.to_string())
}

fn decode_is_composing(xml: &str) -> Result<ComposingUpdate, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut current: Option<Vec<u8>> = None;
    let mut state: Option<String> = None;
    let mut refresh: Option<u32> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => current = Some(e.local_name().as_ref().to_vec()),
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().map_err(|err| err.to_string())?;
                match current.as_deref() {
                    Some(b"state") => state = Some(text.trim().to_string()),
                    Some(b"refresh") => {
                        refresh = Some(text.trim().parse().map_err(|_| format!("bad refresh '{}'", text))?)
                    }
                    _ => {}
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }

    match state.as_deref() {
        Some("active") => Ok(ComposingUpdate {
            active: true,
            refresh: refresh.filter(|r| *r > 0),
        }),
        Some("idle") => Ok(ComposingUpdate {
            active: false,
            refresh: None,
        }),
        Some(other) => Err(format!("unknown state '{}'", other)),
        None => Err("missing state element".to_string()),
    }
}
