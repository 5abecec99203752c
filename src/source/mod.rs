//! Data source contract.
//!
//! A [`DataSource`] is one named live value provided by the control system
//! (or a simulation). Listeners registered with [`DataSource::add_listener`]
//! receive connect, disconnect and value callbacks on whatever thread the
//! source uses. A source never holds its own lock while calling a listener.
//!
//! ```text
//!             connect()                 info received
//!   Init ─────────────> Disconnected ─> GettingInfo ─> Connected
//!                            ^                              │
//!                            └──────── link lost ───────────┘
//! ```

use crate::error::AppResult;
use crate::sample::{Metadata, Sample, ValueShape};
use crate::time::Timestamp;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

pub mod mock;
pub mod sim;

/// Connection state of a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SourceState {
    /// Created, `connect` not called yet
    Init,
    /// Searching for the source or link lost
    Disconnected,
    /// Found, fetching type and metadata
    GettingInfo,
    /// Fully connected; values may arrive
    Connected,
}

/// Receiver of data source events.
///
/// Every value filter and the sampler's buffer sink implement this, so a
/// filter chain is a linear composition of listeners.
pub trait SourceListener: Send + Sync {
    /// The source connected and its shape and metadata are known.
    fn on_connect(&self, source: &dyn DataSource, when: Timestamp);

    /// The source disconnected.
    fn on_disconnect(&self, source: &dyn DataSource, when: Timestamp);

    /// A new value arrived (from a subscription or a poll).
    fn on_value(&self, source: &dyn DataSource, sample: &Sample);
}

/// One live channel value.
pub trait DataSource: Send + Sync {
    /// Channel name.
    fn name(&self) -> &str;

    /// Current connection state.
    fn state(&self) -> SourceState;

    /// Whether values can be expected.
    fn is_connected(&self) -> bool {
        self.state() == SourceState::Connected
    }

    /// Value shape, known once connected.
    fn shape(&self) -> Option<ValueShape>;

    /// Display and control information, known once connected.
    fn metadata(&self) -> Metadata;

    /// Start connecting; `on_connect` follows once the source is found.
    fn connect(&self) -> AppResult<()>;

    /// Disconnect. Fires `on_disconnect` before returning if connected.
    fn disconnect(&self);

    /// Ask for values to be pushed on every change.
    fn subscribe(&self) -> AppResult<()>;

    /// Stop pushed values.
    fn unsubscribe(&self);

    /// Whether a subscription is active.
    fn is_subscribed(&self) -> bool;

    /// Request a single value; it arrives through `on_value`.
    fn poll_once(&self) -> AppResult<()>;

    /// Register `listener` for all events.
    fn add_listener(&self, listener: Arc<dyn SourceListener>);

    /// Unregister `listener`; a no-op if it is not registered.
    fn remove_listener(&self, listener: &Arc<dyn SourceListener>);
}

/// Factory and housekeeping for data sources of one kind.
pub trait SourceContext: Send + Sync {
    /// Create a (not yet connected) source for `name`.
    fn create(&self, name: &str) -> AppResult<Arc<dyn DataSource>>;

    /// Flush pending network requests if a flush was requested.
    ///
    /// Called once per engine loop iteration. Returns whether a flush happened.
    fn flush_if_requested(&self) -> bool {
        false
    }
}

/// Whether two listener handles point at the same object.
pub fn same_listener<L: ?Sized>(a: &Arc<L>, b: &Arc<L>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Copy-on-write list of listeners.
///
/// Dispatch iterates a snapshot, so a listener may add or remove listeners
/// (itself included) while being called.
pub struct ListenerList<L: ?Sized> {
    inner: RwLock<Arc<Vec<Arc<L>>>>,
}

impl<L: ?Sized> Default for ListenerList<L> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Arc::new(Vec::new())),
        }
    }
}

impl<L: ?Sized> ListenerList<L> {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `listener`, unless it is already registered.
    pub fn add(&self, listener: Arc<L>) {
        let mut inner = self.inner.write();
        if inner.iter().any(|l| same_listener(l, &listener)) {
            return;
        }
        let mut next = Vec::with_capacity(inner.len() + 1);
        next.extend(inner.iter().cloned());
        next.push(listener);
        *inner = Arc::new(next);
    }

    /// Remove `listener`; returns whether it was registered.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut inner = self.inner.write();
        if !inner.iter().any(|l| same_listener(l, listener)) {
            return false;
        }
        let next: Vec<_> = inner
            .iter()
            .filter(|l| !same_listener(l, listener))
            .cloned()
            .collect();
        *inner = Arc::new(next);
        true
    }

    /// Current listeners.
    pub fn snapshot(&self) -> Arc<Vec<Arc<L>>> {
        Arc::clone(&self.inner.read())
    }

    /// Number of listeners.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl ListenerList<dyn SourceListener> {
    /// Call `on_connect` on every listener.
    pub fn connected(&self, source: &dyn DataSource, when: Timestamp) {
        for listener in self.snapshot().iter() {
            listener.on_connect(source, when);
        }
    }

    /// Call `on_disconnect` on every listener.
    pub fn disconnected(&self, source: &dyn DataSource, when: Timestamp) {
        for listener in self.snapshot().iter() {
            listener.on_disconnect(source, when);
        }
    }

    /// Call `on_value` on every listener.
    pub fn value(&self, source: &dyn DataSource, sample: &Sample) {
        for listener in self.snapshot().iter() {
            listener.on_value(source, sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Named: Send + Sync {
        fn name(&self) -> &str;
    }

    struct N(&'static str);

    impl Named for N {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn add_is_idempotent_and_remove_works() {
        let list: ListenerList<dyn Named> = ListenerList::new();
        let a: Arc<dyn Named> = Arc::new(N("a"));
        let b: Arc<dyn Named> = Arc::new(N("b"));
        list.add(Arc::clone(&a));
        list.add(Arc::clone(&a));
        list.add(Arc::clone(&b));
        assert_eq!(list.len(), 2);
        assert!(list.remove(&a));
        assert!(!list.remove(&a));
        let names: Vec<_> = list.snapshot().iter().map(|l| l.name().to_string()).collect();
        assert_eq!(names, vec!["b"]);
    }

    #[test]
    fn snapshot_survives_mutation() {
        let list: ListenerList<dyn Named> = ListenerList::new();
        let a: Arc<dyn Named> = Arc::new(N("a"));
        list.add(Arc::clone(&a));
        let snapshot = list.snapshot();
        list.remove(&a);
        assert_eq!(snapshot.len(), 1);
        assert!(list.is_empty());
    }
}
