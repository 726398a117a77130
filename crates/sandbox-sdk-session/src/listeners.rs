//! Short-lived listeners waiting for a push notification about one path.
//!
//! A notification that echoes a correlation id resolves only the listener
//! registered with that id. A notification without one resolves every
//! listener whose file name is the last component of the notified path, so
//! `/a/b.txt` and `/c/b.txt` are both resolved by a write to `/x/b.txt` but
//! not by one to `/x/ab.txt`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use sandbox_sdk_core::split_remote;
use tokio::sync::oneshot;

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Entry<T> {
    id: ListenerId,
    path: String,
    correlation_id: Option<String>,
    tx: Option<oneshot::Sender<T>>,
}

impl<T> Entry<T> {
    fn matches(&self, path: &str, correlation_id: Option<&str>) -> bool {
        match correlation_id {
            Some(token) => self.correlation_id.as_deref() == Some(token),
            None => {
                let (_, name) = split_remote(&self.path);
                !name.is_empty()
                    && (path == name || path.ends_with(&format!("/{name}")))
            }
        }
    }
}

struct Inner<T> {
    next_id: u64,
    entries: Vec<Entry<T>>,
}

type Shared<T> = Arc<Mutex<Inner<T>>>;

fn lock<T>(inner: &Mutex<Inner<T>>) -> MutexGuard<'_, Inner<T>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of pending listeners keyed by generated id.
pub struct ListenerRegistry<T> {
    inner: Shared<T>,
}

impl<T> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }
}

impl<T: Clone> ListenerRegistry<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `path`. It stays registered until the guard drops.
    pub fn register(
        &self,
        path: &str,
        correlation_id: Option<String>,
    ) -> (ListenerGuard<T>, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let mut inner = lock(&self.inner);
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner.entries.push(Entry {
            id,
            path: path.to_string(),
            correlation_id,
            tx: Some(tx),
        });
        drop(inner);

        let guard = ListenerGuard {
            id,
            registry: Arc::downgrade(&self.inner),
        };
        (guard, rx)
    }

    /// Offer a notification to every listener. Returns how many were resolved.
    pub fn offer(&self, path: &str, correlation_id: Option<&str>, value: &T) -> usize {
        let mut inner = lock(&self.inner);
        let mut resolved = 0;
        for entry in &mut inner.entries {
            if !entry.matches(path, correlation_id) {
                continue;
            }
            if let Some(tx) = entry.tx.take() {
                if tx.send(value.clone()).is_ok() {
                    resolved += 1;
                }
            }
        }
        resolved
    }

    /// Number of registered listeners, resolved or not.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every listener. Their receivers see the sender closed.
    pub fn clear(&self) {
        lock(&self.inner).entries.clear();
    }
}

/// Removes its listener from the registry on drop.
pub struct ListenerGuard<T> {
    id: ListenerId,
    registry: Weak<Mutex<Inner<T>>>,
}

impl<T> ListenerGuard<T> {
    #[must_use]
    pub const fn id(&self) -> ListenerId {
        self.id
    }
}

impl<T> Drop for ListenerGuard<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            lock(&inner).entries.retain(|e| e.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_match_resolves_every_sharing_listener() {
        let registry = ListenerRegistry::<()>::new();
        let (_a, mut rx_a) = registry.register("/a/b.txt", None);
        let (_c, mut rx_c) = registry.register("/c/b.txt", None);
        let (_d, mut rx_d) = registry.register("/d.txt", None);

        assert_eq!(registry.offer("/x/b.txt", None, &()), 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_c.try_recv().is_ok());
        assert!(rx_d.try_recv().is_err());
    }

    #[test]
    fn test_unrelated_path_does_not_match() {
        let registry = ListenerRegistry::<()>::new();
        let (_a, mut rx_a) = registry.register("/src/main.py", None);

        assert_eq!(registry.offer("/code/src/util.py", None, &()), 0);
        assert_eq!(registry.offer("/code/src/main.py", None, &()), 1);
        assert!(rx_a.try_recv().is_ok());
    }

    #[test]
    fn test_file_name_must_be_a_whole_component() {
        let registry = ListenerRegistry::<()>::new();
        let (_a, mut rx_a) = registry.register("/src/main.py", None);

        assert_eq!(registry.offer("/other/not_main.py", None, &()), 0);
        assert_eq!(registry.offer("main.py.bak", None, &()), 0);
        assert!(rx_a.try_recv().is_err());

        assert_eq!(registry.offer("main.py", None, &()), 1);
        assert!(rx_a.try_recv().is_ok());
    }

    #[test]
    fn test_correlation_id_is_exact() {
        let registry = ListenerRegistry::<String>::new();
        let (_a, mut rx_a) = registry.register("/b.txt", Some("one".into()));
        let (_b, mut rx_b) = registry.register("/b.txt", Some("two".into()));

        assert_eq!(registry.offer("/code/b.txt", Some("two"), &"x".to_string()), 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), "x");
    }

    #[test]
    fn test_guard_unregisters() {
        let registry = ListenerRegistry::<()>::new();
        let (guard, _rx) = registry.register("/a", None);
        assert_eq!(registry.len(), 1);
        drop(guard);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_resolved_listener_fires_once() {
        let registry = ListenerRegistry::<u32>::new();
        let (_guard, mut rx) = registry.register("/a", None);
        assert_eq!(registry.offer("/a", None, &1), 1);
        assert_eq!(registry.offer("/a", None, &2), 0);
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(registry.len(), 1);
    }
}
