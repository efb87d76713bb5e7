use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

/// Opaque handle returned at registration, used for removal.
///
/// Identity-based: two registrations of the same closure get distinct tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Token-keyed listener registry with re-entrancy-safe emission.
///
/// `emit` calls each listener outside the lock on a snapshot taken under it,
/// so listeners may add or remove listeners from within their callback. A
/// registration made during an emit is first invoked on the next frame.
#[derive(Default)]
pub struct ListenerRegistry {
    next_token: AtomicU64,
    listeners: Mutex<Vec<(ListenerToken, Listener)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let token = ListenerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .push((token, Arc::new(listener)));
        token
    }

    /// Remove a listener. Unknown tokens are a no-op.
    pub fn remove(&self, token: ListenerToken) {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .retain(|(t, _)| *t != token);
    }

    pub fn clear(&self) {
        self.listeners.lock().expect("listener lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().expect("listener lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every registered listener with `value`, in registration order.
    pub fn emit(&self, value: &Value) {
        let snapshot: Vec<Listener> = {
            let listeners = self.listeners.lock().expect("listener lock poisoned");
            listeners.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in snapshot {
            listener(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emit_reaches_all_listeners_in_order() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second"] {
            let log = log.clone();
            registry.add(move |_| log.lock().unwrap().push(name));
        }

        registry.emit(&json!({"type": "typing"}));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn removed_listener_is_not_called() {
        let registry = ListenerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        let token = registry.add(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        registry.emit(&json!({}));
        registry.remove(token);
        registry.emit(&json!({}));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_closures_get_distinct_tokens() {
        let registry = ListenerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = count.clone();
        let t1 = registry.add(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = count.clone();
        let _t2 = registry.add(move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });

        registry.remove(t1);
        registry.emit(&json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_remove_itself_during_emit() {
        let registry = Arc::new(ListenerRegistry::new());
        let token_slot: Arc<Mutex<Option<ListenerToken>>> = Arc::new(Mutex::new(None));

        let registry_clone = registry.clone();
        let slot_clone = token_slot.clone();
        let token = registry.add(move |_| {
            if let Some(token) = *slot_clone.lock().unwrap() {
                registry_clone.remove(token);
            }
        });
        *token_slot.lock().unwrap() = Some(token);

        registry.emit(&json!({}));
        assert!(registry.is_empty());
        // A second emit must not panic or call anything
        registry.emit(&json!({}));
    }
}
