//! Test-driven data sources.
//!
//! A [`MockSource`] only produces events when a test tells it to, so every
//! callback path through the filters, sampler, channel and group can be
//! exercised deterministically on the test thread.

use super::{DataSource, ListenerList, SourceContext, SourceListener, SourceState};
use crate::error::{AppResult, ArchiveError};
use crate::locks::{LockOrder, OrderedMutex};
use crate::sample::{Metadata, Sample, Value, ValueShape};
use crate::time::{SharedClock, Timestamp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
struct MockState {
    state: SourceState,
    shape: ValueShape,
    metadata: Metadata,
    subscribed: bool,
    auto_connect: bool,
    fail_connect: bool,
    poll_value: Option<Value>,
    polls: usize,
    connects: usize,
}

/// A data source driven by explicit `fire_*` calls.
pub struct MockSource {
    name: String,
    clock: SharedClock,
    state: OrderedMutex<MockState>,
    listeners: ListenerList<dyn SourceListener>,
}

impl MockSource {
    /// Source that stays disconnected until [`fire_connect`](Self::fire_connect).
    pub fn new(name: impl Into<String>, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            clock,
            state: OrderedMutex::new(
                LockOrder::DataSource,
                "mock source",
                MockState {
                    state: SourceState::Init,
                    shape: ValueShape::DEFAULT,
                    metadata: Metadata::default(),
                    subscribed: false,
                    auto_connect: false,
                    fail_connect: false,
                    poll_value: None,
                    polls: 0,
                    connects: 0,
                },
            ),
            listeners: ListenerList::new(),
        }
    }

    /// Connect as soon as `connect()` is called.
    pub fn set_auto_connect(&self, auto_connect: bool) {
        self.state.lock().auto_connect = auto_connect;
    }

    /// Make `connect()` fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.state.lock().fail_connect = fail;
    }

    /// Shape reported on the next connect.
    pub fn set_shape(&self, shape: ValueShape) {
        self.state.lock().shape = shape;
    }

    /// Value delivered by `poll_once()`.
    pub fn set_poll_value(&self, value: Value) {
        self.state.lock().poll_value = Some(value);
    }

    /// Number of successful polls.
    pub fn polls(&self) -> usize {
        self.state.lock().polls
    }

    /// Number of `connect()` calls.
    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Become connected and notify listeners.
    pub fn fire_connect(&self, when: Timestamp) {
        self.state.lock().state = SourceState::Connected;
        self.listeners.connected(self, when);
    }

    /// Lose the connection and notify listeners; a no-op unless connected.
    pub fn fire_disconnect(&self, when: Timestamp) {
        {
            let mut state = self.state.lock();
            if state.state != SourceState::Connected {
                return;
            }
            state.state = SourceState::Disconnected;
        }
        self.listeners.disconnected(self, when);
    }

    /// Deliver a value as if pushed by a subscription.
    ///
    /// Returns `false` (and delivers nothing) unless connected and subscribed.
    pub fn push(&self, time: Timestamp, value: Value) -> bool {
        {
            let state = self.state.lock();
            if state.state != SourceState::Connected || !state.subscribed {
                return false;
            }
        }
        self.listeners.value(self, &Sample::new(time, value));
        true
    }

    /// Deliver `sample` to every listener, regardless of state.
    pub fn fire_value(&self, sample: &Sample) {
        self.listeners.value(self, sample);
    }
}

impl DataSource for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> SourceState {
        self.state.lock().state
    }

    fn shape(&self) -> Option<ValueShape> {
        let state = self.state.lock();
        (state.state == SourceState::Connected).then_some(state.shape)
    }

    fn metadata(&self) -> Metadata {
        self.state.lock().metadata.clone()
    }

    fn connect(&self) -> AppResult<()> {
        let auto_connect = {
            let mut state = self.state.lock();
            if state.fail_connect {
                return Err(ArchiveError::source(&self.name, "connect refused"));
            }
            state.connects += 1;
            if state.state == SourceState::Init {
                state.state = SourceState::Disconnected;
            }
            state.auto_connect
        };
        if auto_connect {
            self.fire_connect(self.clock.now());
        }
        Ok(())
    }

    fn disconnect(&self) {
        let was_connected = {
            let mut state = self.state.lock();
            let was = state.state == SourceState::Connected;
            state.state = SourceState::Init;
            state.subscribed = false;
            was
        };
        if was_connected {
            self.listeners.disconnected(self, self.clock.now());
        }
    }

    fn subscribe(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.state != SourceState::Connected {
            return Err(ArchiveError::source(&self.name, "subscribe while not connected"));
        }
        state.subscribed = true;
        Ok(())
    }

    fn unsubscribe(&self) {
        self.state.lock().subscribed = false;
    }

    fn is_subscribed(&self) -> bool {
        self.state.lock().subscribed
    }

    fn poll_once(&self) -> AppResult<()> {
        let value = {
            let mut state = self.state.lock();
            if state.state != SourceState::Connected {
                return Err(ArchiveError::source(&self.name, "poll while not connected"));
            }
            state.polls += 1;
            state.poll_value.clone()
        };
        if let Some(value) = value {
            self.listeners.value(self, &Sample::new(self.clock.now(), value));
        }
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn SourceListener>) {
        self.listeners.add(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn SourceListener>) {
        self.listeners.remove(listener);
    }
}

/// Creates [`MockSource`]s and keeps them reachable for tests.
pub struct MockContext {
    clock: SharedClock,
    auto_connect: bool,
    sources: Mutex<HashMap<String, Arc<MockSource>>>,
    flush_requested: Mutex<bool>,
    flushes: Mutex<usize>,
}

impl MockContext {
    /// Context whose sources connect only when told to.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            auto_connect: false,
            sources: Mutex::new(HashMap::new()),
            flush_requested: Mutex::new(false),
            flushes: Mutex::new(0),
        }
    }

    /// Context whose sources connect inside `connect()`.
    pub fn auto_connecting(clock: SharedClock) -> Self {
        Self {
            auto_connect: true,
            ..Self::new(clock)
        }
    }

    /// The source created for `name`, if any.
    pub fn source(&self, name: &str) -> Option<Arc<MockSource>> {
        self.sources.lock().get(name).cloned()
    }

    /// Ask for a flush on the next housekeeping pass.
    pub fn request_flush(&self) {
        *self.flush_requested.lock() = true;
    }

    /// Number of flushes performed.
    pub fn flushes(&self) -> usize {
        *self.flushes.lock()
    }
}

impl SourceContext for MockContext {
    fn create(&self, name: &str) -> AppResult<Arc<dyn DataSource>> {
        let source = Arc::new(MockSource::new(name, Arc::clone(&self.clock)));
        source.set_auto_connect(self.auto_connect);
        self.sources
            .lock()
            .insert(name.to_string(), Arc::clone(&source));
        Ok(source)
    }

    fn flush_if_requested(&self) -> bool {
        let requested = std::mem::take(&mut *self.flush_requested.lock());
        if requested {
            *self.flushes.lock() += 1;
        }
        requested
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Listener that records everything it receives.

    use super::*;

    /// One recorded callback.
    #[derive(Debug, Clone, PartialEq)]
    pub enum Event {
        Connected(Timestamp),
        Disconnected(Timestamp),
        Value(Sample),
    }

    #[derive(Default)]
    pub struct Recorder {
        pub events: Mutex<Vec<Event>>,
    }

    impl Recorder {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn events(&self) -> Vec<Event> {
            self.events.lock().clone()
        }

        pub fn values(&self) -> Vec<Sample> {
            self.events
                .lock()
                .iter()
                .filter_map(|e| match e {
                    Event::Value(s) => Some(s.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    impl SourceListener for Recorder {
        fn on_connect(&self, _source: &dyn DataSource, when: Timestamp) {
            self.events.lock().push(Event::Connected(when));
        }

        fn on_disconnect(&self, _source: &dyn DataSource, when: Timestamp) {
            self.events.lock().push(Event::Disconnected(when));
        }

        fn on_value(&self, _source: &dyn DataSource, sample: &Sample) {
            self.events.lock().push(Event::Value(sample.clone()));
        }
    }
}
