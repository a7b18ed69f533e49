//! Server status values and the observer registry that publishes them.
//!
//! `SERVER_STATUS` is the one notification that never crosses the wire to
//! peers: it flows synchronously to in-process observers (typically the UI
//! layer hosting the relay).  Observers register through [`StatusBus`] and
//! hold a stable [`SubscriptionId`], so composing several observers never
//! requires save-and-restore of a single callback slot.

use std::sync::{Arc, Mutex};

use serde::Serialize;

/// The relay's current condition.  Recomputed whole on every transition,
/// never partially mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub running: bool,
    /// Meaningful when running, or when it names the port an attempt failed on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerStatus {
    pub fn running(port: u16) -> Self {
        ServerStatus {
            running: true,
            port: Some(port),
            error: None,
        }
    }

    pub fn stopped() -> Self {
        ServerStatus {
            running: false,
            port: None,
            error: None,
        }
    }

    pub fn error(port: u16, message: impl Into<String>) -> Self {
        ServerStatus {
            running: false,
            port: Some(port),
            error: Some(message.into()),
        }
    }
}

type Observer = Arc<dyn Fn(&ServerStatus) + Send + Sync>;

/// Stable handle for one registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Ordered registry of status observers.
///
/// Observers are invoked synchronously, in subscription order, on every
/// status transition.  Unsubscribing is by handle and never disturbs the
/// other observers.
#[derive(Clone, Default)]
pub struct StatusBus {
    inner: Arc<Mutex<BusInner>>,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    observers: Vec<(u64, Observer)>,
}

impl StatusBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer; returns a handle for later removal.
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&ServerStatus) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().expect("status bus lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.observers.push((id, Arc::new(observer)));
        SubscriptionId(id)
    }

    /// Remove an observer.  Unknown or already-removed handles are a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock().expect("status bus lock poisoned");
        inner.observers.retain(|(obs_id, _)| *obs_id != id.0);
    }

    /// Deliver `status` to every observer, in subscription order.
    ///
    /// The observer list is snapshotted before delivery, so observers may
    /// subscribe or unsubscribe from inside their callback.  An observer
    /// removed mid-publish still sees the in-flight status.
    pub fn publish(&self, status: &ServerStatus) {
        let observers: Vec<Observer> = {
            let inner = self.inner.lock().expect("status bus lock poisoned");
            inner.observers.iter().map(|(_, obs)| obs.clone()).collect()
        };
        for observer in observers {
            observer(status);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.inner
            .lock()
            .expect("status bus lock poisoned")
            .observers
            .len()
    }
}
