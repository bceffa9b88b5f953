//! Listener channels.
//!
//! Three independent notification channels: connection lifecycle, request
//! sent, response received.  Registries are copy-on-write so dispatch never
//! holds a lock while running listener code, and a panicking listener is
//! logged and swallowed without affecting session state.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use crate::body::Body;
use crate::error::BoshError;

/// Connection lifecycle notifications.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The session-creation response has been processed; the session is
    /// fully established.  Fires exactly once per session.
    Established,
    /// The session ended normally.
    Closed,
    /// The session ended (or was recoverably lost) because of an error.
    /// `outstanding_requests` holds the bodies that were sent but never
    /// acknowledged, so the application can replay them on a new session.
    ClosedOnError {
        cause: BoshError,
        outstanding_requests: Vec<Body>,
    },
}

/// Receives connection lifecycle events.
pub trait ConnectionListener: Send + Sync {
    fn connection_event(&self, event: &ConnectionEvent);
}

impl<F> ConnectionListener for F
where
    F: Fn(&ConnectionEvent) + Send + Sync,
{
    fn connection_event(&self, event: &ConnectionEvent) {
        self(event);
    }
}

/// Notified with each request body as it is transmitted.
pub trait RequestListener: Send + Sync {
    fn request_sent(&self, request: &Body);
}

impl<F> RequestListener for F
where
    F: Fn(&Body) + Send + Sync,
{
    fn request_sent(&self, request: &Body) {
        self(request);
    }
}

/// Notified with each response body as it is received.
pub trait ResponseListener: Send + Sync {
    fn response_received(&self, response: &Body);
}

impl<F> ResponseListener for F
where
    F: Fn(&Body) + Send + Sync,
{
    fn response_received(&self, response: &Body) {
        self(response);
    }
}

/// Copy-on-write listener registry.
///
/// `snapshot` returns a clone of the current listener set; dispatch iterates
/// the snapshot without holding the registry lock, so listeners may add or
/// remove listeners (including themselves) reentrantly.
pub(crate) struct Registry<L: ?Sized> {
    listeners: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> Registry<L> {
    pub fn new() -> Self {
        Registry {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Add a listener unless the same instance is already registered.
    pub fn add(&self, listener: Arc<L>) {
        let mut guard = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !guard.iter().any(|existing| Arc::ptr_eq(existing, &listener)) {
            guard.push(listener);
        }
    }

    /// Remove a previously added listener instance.
    pub fn remove(&self, listener: &Arc<L>) {
        let mut guard = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    pub fn snapshot(&self) -> Vec<Arc<L>> {
        match self.listeners.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Invoke a listener, logging and swallowing any panic.
pub(crate) fn dispatch<L: ?Sized>(listener: &Arc<L>, invoke: impl FnOnce(&L)) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| invoke(listener))) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::warn!(panic = %message, "unhandled panic in listener");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn add_is_idempotent_per_instance() {
        let registry: Registry<dyn ConnectionListener> = Registry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let listener: Arc<dyn ConnectionListener> = {
            let count = Arc::clone(&count);
            Arc::new(move |_: &ConnectionEvent| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        registry.add(Arc::clone(&listener));
        registry.add(Arc::clone(&listener));
        assert_eq!(registry.snapshot().len(), 1);

        registry.remove(&listener);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn distinct_instances_both_fire() {
        let registry: Registry<dyn ResponseListener> = Registry::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let count = Arc::clone(&count);
            registry.add(Arc::new(move |_: &Body| {
                count.fetch_add(1, Ordering::SeqCst);
            }) as Arc<dyn ResponseListener>);
        }

        let body = Body::empty();
        for listener in registry.snapshot() {
            dispatch(&listener, |l| l.response_received(&body));
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_listener_is_swallowed() {
        let registry: Registry<dyn RequestListener> = Registry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry.add(Arc::new(|_: &Body| -> () { panic!("listener bug") }) as Arc<dyn RequestListener>);
        {
            let count = Arc::clone(&count);
            registry.add(Arc::new(move |_: &Body| {
                count.fetch_add(1, Ordering::SeqCst);
            }) as Arc<dyn RequestListener>);
        }

        let body = Body::empty();
        for listener in registry.snapshot() {
            dispatch(&listener, |l| l.request_sent(&body));
        }
        // The second listener still ran.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
