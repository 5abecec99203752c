//! Simulated data sources for running the daemon without a control system.
//!
//! Channel names of the form `sim:<kind>:<anything>` produce:
//!
//! | kind     | value                                   |
//! |----------|-----------------------------------------|
//! | `sine`   | `10 sin(2πt/60)`                        |
//! | `ramp`   | `t mod 100`                             |
//! | `noise`  | uniform in `[0, 1)`                     |
//! | `const`  | `42`                                    |
//! | `toggle` | `1` for 30 s, then `0` for 30 s         |
//!
//! Sources connect on the first tick after `connect()`. Subscribed sources get
//! a value on every tick of the context's background thread; `poll_once`
//! answers immediately.

use super::{DataSource, ListenerList, SourceContext, SourceListener, SourceState};
use crate::error::{AppResult, ArchiveError};
use crate::locks::{LockOrder, OrderedMutex};
use crate::sample::{Metadata, Sample, Value, ValueShape};
use crate::time::{to_secs_f64, SharedClock, Timestamp};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Waveform of a simulated source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimKind {
    /// Sine wave with a 60 s period
    Sine,
    /// Sawtooth from 0 to 100
    Ramp,
    /// Uniform random numbers
    Noise,
    /// Never changes; exercises repeat compression
    Const,
    /// Square wave; useful as a disabling channel
    Toggle,
}

impl FromStr for SimKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sine" => Ok(SimKind::Sine),
            "ramp" => Ok(SimKind::Ramp),
            "noise" => Ok(SimKind::Noise),
            "const" => Ok(SimKind::Const),
            "toggle" => Ok(SimKind::Toggle),
            other => Err(format!("unknown simulation kind '{other}'")),
        }
    }
}

impl SimKind {
    /// Parse `sim:<kind>:...`.
    pub fn from_channel(name: &str) -> Option<SimKind> {
        let mut parts = name.splitn(3, ':');
        match (parts.next(), parts.next()) {
            (Some("sim"), Some(kind)) => kind.parse().ok(),
            _ => None,
        }
    }

    /// Value at time `t`.
    pub fn value_at(self, t: Timestamp) -> f64 {
        let secs = to_secs_f64(t);
        match self {
            SimKind::Sine => 10.0 * (std::f64::consts::TAU * secs / 60.0).sin(),
            SimKind::Ramp => secs.rem_euclid(100.0),
            SimKind::Noise => rand::thread_rng().gen::<f64>(),
            SimKind::Const => 42.0,
            SimKind::Toggle => {
                if secs.rem_euclid(60.0) < 30.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

#[derive(Debug)]
struct SimState {
    state: SourceState,
    subscribed: bool,
}

/// One simulated channel.
pub struct SimSource {
    name: String,
    kind: SimKind,
    clock: SharedClock,
    state: OrderedMutex<SimState>,
    listeners: ListenerList<dyn SourceListener>,
}

impl SimSource {
    fn new(name: &str, kind: SimKind, clock: SharedClock) -> Self {
        Self {
            name: name.to_string(),
            kind,
            clock,
            state: OrderedMutex::new(
                LockOrder::DataSource,
                "sim source",
                SimState {
                    state: SourceState::Init,
                    subscribed: false,
                },
            ),
            listeners: ListenerList::new(),
        }
    }

    fn sample(&self) -> Sample {
        let now = self.clock.now();
        Sample::new(now, Value::double(self.kind.value_at(now)))
    }

    /// Finish a pending connect, or emit a value when subscribed.
    fn tick(&self) {
        let (connect, emit) = {
            let mut state = self.state.lock();
            match state.state {
                SourceState::Disconnected => {
                    state.state = SourceState::Connected;
                    (true, false)
                }
                SourceState::Connected => (false, state.subscribed),
                _ => (false, false),
            }
        };
        if connect {
            tracing::debug!(channel = %self.name, "simulated source connected");
            self.listeners.connected(self, self.clock.now());
        } else if emit {
            self.listeners.value(self, &self.sample());
        }
    }
}

impl DataSource for SimSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> SourceState {
        self.state.lock().state
    }

    fn shape(&self) -> Option<ValueShape> {
        self.is_connected().then_some(ValueShape::DEFAULT)
    }

    fn metadata(&self) -> Metadata {
        Metadata {
            units: "sim".to_string(),
            precision: 3,
            display_low: -10.0,
            display_high: 100.0,
            enum_strings: Vec::new(),
        }
    }

    fn connect(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.state == SourceState::Init {
            state.state = SourceState::Disconnected;
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
            return Err(ArchiveError::source(&self.name, "not connected"));
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
        if !self.is_connected() {
            return Err(ArchiveError::source(&self.name, "not connected"));
        }
        self.listeners.value(self, &self.sample());
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn SourceListener>) {
        self.listeners.add(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn SourceListener>) {
        self.listeners.remove(listener);
    }
}

/// Creates [`SimSource`]s and drives them from a background thread.
pub struct SimContext {
    clock: SharedClock,
    sources: Arc<Mutex<HashMap<String, Arc<SimSource>>>>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SimContext {
    /// Start a context ticking every `rate`.
    pub fn start(clock: SharedClock, rate: Duration) -> AppResult<Self> {
        let sources: Arc<Mutex<HashMap<String, Arc<SimSource>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));
        let thread = {
            let sources = Arc::clone(&sources);
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("sim-sources".to_string())
                .spawn(move || {
                    while running.load(Ordering::Relaxed) {
                        let snapshot: Vec<_> = sources.lock().values().cloned().collect();
                        for source in &snapshot {
                            source.tick();
                        }
                        std::thread::sleep(rate);
                    }
                })?
        };
        tracing::info!(rate_ms = rate.as_millis() as u64, "simulated data sources started");
        Ok(Self {
            clock,
            sources,
            running,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Stop the background thread.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("simulation thread panicked");
            }
        }
    }
}

impl Drop for SimContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SourceContext for SimContext {
    fn create(&self, name: &str) -> AppResult<Arc<dyn DataSource>> {
        let kind = SimKind::from_channel(name).ok_or_else(|| {
            ArchiveError::source(name, "not a simulated channel, expected sim:<kind>:<name>")
        })?;
        let source = Arc::new(SimSource::new(name, kind, Arc::clone(&self.clock)));
        // A reconfigured channel replaces its previous source.
        self.sources
            .lock()
            .insert(name.to_string(), Arc::clone(&source));
        Ok(source)
    }
}
