//! Arena of engine listener registrations.
//!
//! Every `on`/`once` made while the controller is running records an
//! unregister closure here. `clear()` takes the whole set out under the lock
//! and only then runs the closures, so a closure that touches the arena
//! cannot disturb the iteration.

use parking_lot::Mutex;

type Unregister = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct ListenerArena {
    entries: Mutex<Vec<Unregister>>,
}

impl ListenerArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, unregister: impl FnOnce() + Send + 'static) {
        self.entries.lock().push(Box::new(unregister));
    }

    /// Run and forget every unregister closure. Idempotent.
    pub fn clear(&self) -> usize {
        let drained: Vec<Unregister> = std::mem::take(&mut *self.entries.lock());
        let count = drained.len();
        for unregister in drained {
            unregister();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ListenerArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerArena").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_clear_runs_each_closure_once() {
        let arena = ListenerArena::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            arena.push(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(arena.clear(), 3);
        assert_eq!(arena.clear(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_closure_may_reenter_arena() {
        let arena = Arc::new(ListenerArena::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let inner = arena.clone();
        arena.push(move || {
            // Re-entrant registration lands in the next generation
            inner.push(|| {});
        });
        let c = calls.clone();
        arena.push(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(arena.clear(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(arena.len(), 1);
    }
}
