//! Pending operations and single-flight guards
//!
//! A [`PendingOperation`] pairs a oneshot settlement channel with a timer. The
//! registry entry is removed under its lock by whichever path settles first
//! (resolve, reject, cancellation or the timer) so an operation settles
//! exactly once, and the timer task is aborted on every path.
//!
//! [`SingleFlight`] collapses concurrent callers of one operation onto a single
//! spawned attempt whose result every caller observes.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};

/// Operations that wait on an engine confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Connect,
    Register,
    Unregister,
}

impl OperationKind {
    pub fn name(self) -> &'static str {
        match self {
            OperationKind::Connect => "connect",
            OperationKind::Register => "register",
            OperationKind::Unregister => "unregister",
        }
    }

    /// Error an operation of this kind is rejected with when its timer fires
    pub fn timeout_error(self, timeout: Duration) -> ClientError {
        let duration_ms = timeout.as_millis() as u64;
        match self {
            OperationKind::Connect => ClientError::ConnectionTimeout { duration_ms },
            OperationKind::Register => ClientError::RegistrationTimeout { duration_ms },
            OperationKind::Unregister => ClientError::OperationTimeout {
                operation: self.name().to_string(),
                duration_ms,
            },
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct Entry<T> {
    kind: OperationKind,
    tx: oneshot::Sender<ClientResult<T>>,
    timer: Option<JoinHandle<()>>,
}

struct RegistryInner<T> {
    entries: Mutex<HashMap<u64, Entry<T>>>,
    next_id: AtomicU64,
}

impl<T> RegistryInner<T> {
    /// Remove and settle one entry. Returns false if it was already settled.
    fn settle(&self, id: u64, result: ClientResult<T>) -> bool {
        let entry = self.entries.lock().remove(&id);
        match entry {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                // The waiter may be gone; settlement still counts
                let _ = entry.tx.send(result);
                true
            }
            None => false,
        }
    }

    fn take_kind(&self, kind: OperationKind) -> Vec<(u64, Entry<T>)> {
        let mut entries = self.entries.lock();
        let ids: Vec<u64> = entries
            .iter()
            .filter(|(_, e)| e.kind == kind)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| entries.remove(&id).map(|e| (id, e)))
            .collect()
    }
}

/// Registry of in-flight awaited operations
pub struct PendingOperationRegistry<T> {
    inner: Arc<RegistryInner<T>>,
}

impl<T> Clone for PendingOperationRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> PendingOperationRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register an operation that is rejected with the kind's timeout error
    /// if nothing settles it within `timeout`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn create(&self, kind: OperationKind, timeout: Duration) -> PendingOperation<T> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        // Hold the lock across spawn so the timer cannot settle before the entry exists
        let mut entries = self.inner.entries.lock();
        let weak: Weak<RegistryInner<T>> = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                if inner.settle(id, Err(kind.timeout_error(timeout))) {
                    warn!(operation = kind.name(), timeout_ms = timeout.as_millis() as u64, "Pending operation timed out");
                }
            }
        });
        entries.insert(
            id,
            Entry {
                kind,
                tx,
                timer: Some(timer),
            },
        );
        debug!(operation = kind.name(), id, "Pending operation created");

        PendingOperation {
            id,
            kind,
            rx: Some(rx),
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Resolve every pending operation of `kind`. Returns how many settled.
    pub fn resolve(&self, kind: OperationKind, value: T) -> usize {
        let taken = self.inner.take_kind(kind);
        let count = taken.len();
        for (_, entry) in taken {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            let _ = entry.tx.send(Ok(value.clone()));
        }
        count
    }

    /// Reject every pending operation of `kind`. Returns how many settled.
    pub fn reject(&self, kind: OperationKind, error: ClientError) -> usize {
        let taken = self.inner.take_kind(kind);
        let count = taken.len();
        for (_, entry) in taken {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            let _ = entry.tx.send(Err(error.clone()));
        }
        count
    }

    /// Reject everything immediately. Returns how many settled.
    pub fn cancel_all(&self, make_error: impl Fn(OperationKind) -> ClientError) -> usize {
        let drained: Vec<Entry<T>> = self.inner.entries.lock().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            let _ = entry.tx.send(Err(make_error(entry.kind)));
        }
        count
    }

    pub fn is_pending(&self, kind: OperationKind) -> bool {
        self.inner.entries.lock().values().any(|e| e.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Send + 'static> Default for PendingOperationRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller side of a pending operation
///
/// Dropping it without waiting withdraws the operation and stops its timer.
pub struct PendingOperation<T> {
    id: u64,
    kind: OperationKind,
    rx: Option<oneshot::Receiver<ClientResult<T>>>,
    registry: Weak<RegistryInner<T>>,
}

impl<T> PendingOperation<T> {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Wait for settlement
    pub async fn wait(mut self) -> ClientResult<T> {
        let Some(rx) = self.rx.take() else {
            return Err(ClientError::cancelled(self.kind.name()));
        };
        match rx.await {
            Ok(result) => result,
            // Sender dropped with the registry
            Err(_) => Err(ClientError::cancelled(self.kind.name())),
        }
    }
}

impl<T> Drop for PendingOperation<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            if let Some(entry) = inner.entries.lock().remove(&self.id) {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
            }
        }
    }
}

type SharedResult = Shared<BoxFuture<'static, ClientResult<()>>>;

/// Shares one in-flight attempt of an operation among concurrent callers
#[derive(Clone)]
pub struct SingleFlight {
    name: &'static str,
    slot: Arc<Mutex<Option<(u64, SharedResult)>>>,
    generation: Arc<AtomicU64>,
}

impl SingleFlight {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Join the in-flight attempt, or spawn a new one from `make`.
    ///
    /// The attempt runs on its own task, so it completes even if every caller
    /// stops waiting. The slot is cleared when that attempt finishes.
    pub fn run<F>(&self, make: F) -> SharedResult
    where
        F: FnOnce() -> BoxFuture<'static, ClientResult<()>>,
    {
        let mut slot = self.slot.lock();
        if let Some((_, shared)) = slot.as_ref() {
            debug!(operation = self.name, "Joining in-flight operation");
            return shared.clone();
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let work = make();
        let slot_ref = self.slot.clone();
        let name = self.name;
        let handle = tokio::spawn(async move {
            let result = work.await;
            let mut slot = slot_ref.lock();
            if matches!(slot.as_ref(), Some((g, _)) if *g == generation) {
                *slot = None;
            }
            result
        });

        let shared = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(ClientError::internal_error(format!("{} task failed: {}", name, e))),
            }
        }
        .boxed()
        .shared();

        *slot = Some((generation, shared.clone()));
        shared
    }

    /// The in-flight attempt, if any
    pub fn current(&self) -> Option<SharedResult> {
        self.slot.lock().as_ref().map(|(_, shared)| shared.clone())
    }

    pub fn is_running(&self) -> bool {
        self.slot.lock().is_some()
    }
}
