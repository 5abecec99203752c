//! Sampling strategies.
//!
//! A [`Sampler`] owns the data source of one channel, the filter chain that
//! source feeds and the ring buffer at the end of that chain:
//!
//! ```text
//! Monitor       source -> Disable ->                   Time -> buffer
//! Get           source -> Disable ->          Repeat -> Time -> buffer   (polled by the scheduler)
//! MonitoredGet  source -> Disable -> TimeSlot -> Repeat -> Time -> buffer
//! ```
//!
//! The buffer side also records `Disconnected`, `Stopped` and `Disabled`
//! markers so the archive shows when and why data is missing.

use crate::data::ring_buffer::RingBuffer;
use crate::data::storage::Storage;
use crate::engine::EngineContext;
use crate::error::{AppResult, ArchiveError};
use crate::filter::{DisableFilter, RepeatFilter, TimeFilter, TimeSlotFilter};
use crate::locks::{LockOrder, OrderedMutex};
use crate::sample::{Sample, Severity, ValueShape};
use crate::scheduler::{Scannable, Scheduler};
use crate::source::{DataSource, SourceListener, SourceState};
use crate::throttle::{LogCategory, ThrottledLogger};
use crate::time::{SharedClock, Timestamp};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// How a channel is sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SamplingMode {
    /// Archive every update pushed by the source.
    Monitor,
    /// Poll once per period.
    Get,
    /// Subscribe, but keep at most one update per period.
    MonitoredGet,
}

impl SamplingMode {
    /// Pick the mode for a channel.
    ///
    /// An explicit monitor request wins; otherwise slow channels (period at or
    /// above `get_threshold`) are polled and fast ones subscribed.
    pub fn select(period: f64, monitor: bool, get_threshold: f64) -> Self {
        if monitor {
            SamplingMode::Monitor
        } else if period >= get_threshold {
            SamplingMode::Get
        } else {
            SamplingMode::MonitoredGet
        }
    }

    /// Whether the source is asked to push values.
    pub fn subscribes(self) -> bool {
        !matches!(self, SamplingMode::Get)
    }

    /// Name used in logs and status reports.
    pub fn as_str(self) -> &'static str {
        match self {
            SamplingMode::Monitor => "Monitor",
            SamplingMode::Get => "Get",
            SamplingMode::MonitoredGet => "MonitoredGet",
        }
    }
}

impl fmt::Display for SamplingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct BufferState {
    buffer: RingBuffer<Sample>,
    shape: Option<ValueShape>,
    last_stamp: Option<Timestamp>,
    have_sample_after_connection: bool,
    running: bool,
}

/// Last element of every chain: the channel's ring buffer.
struct BufferSink {
    name: String,
    mode: SamplingMode,
    capacity: usize,
    clock: SharedClock,
    throttle: Arc<ThrottledLogger>,
    state: OrderedMutex<BufferState>,
}

impl BufferSink {
    /// Add a marker sample, never earlier than the last buffered stamp.
    fn add_event(&self, severity: Severity, when: Timestamp) {
        let mut state = self.state.lock();
        if state.buffer.capacity() < 1 {
            // Type unknown before the first connect; assume a scalar double.
            state.buffer.allocate(self.capacity);
            state.shape = Some(ValueShape::DEFAULT);
        }
        let time = match state.last_stamp {
            Some(last) if when < last => last,
            _ => {
                state.last_stamp = Some(when);
                when
            }
        };
        let shape = state.shape.unwrap_or_default();
        state.buffer.push(Sample::event(severity, time, shape));
    }
}

impl SourceListener for BufferSink {
    fn on_connect(&self, source: &dyn DataSource, _when: Timestamp) {
        let shape = source.shape().unwrap_or_default();
        {
            let mut state = self.state.lock();
            state.have_sample_after_connection = false;
            if state.shape != Some(shape) || state.buffer.capacity() < 1 {
                // Keep markers gathered under the old shape, drop its data.
                let mut events = Vec::new();
                while let Some(sample) = state.buffer.pop() {
                    if sample.is_info() {
                        events.push(Sample::event(sample.severity, sample.time, shape));
                    }
                }
                if !events.is_empty() {
                    tracing::debug!(channel = %self.name, kept = events.len(), "buffer reallocated, markers kept");
                }
                state.buffer.allocate(self.capacity);
                state.shape = Some(shape);
                for event in events {
                    state.buffer.push(event);
                }
            }
        }
        if self.mode.subscribes() && !source.is_subscribed() {
            if let Err(e) = source.subscribe() {
                tracing::warn!(channel = %self.name, error = %e, "subscribe failed");
            }
        }
    }

    fn on_disconnect(&self, _source: &dyn DataSource, when: Timestamp) {
        self.add_event(Severity::Disconnected, when);
    }

    fn on_value(&self, _source: &dyn DataSource, sample: &Sample) {
        let now = self.clock.now();
        let back_in_time = {
            let mut state = self.state.lock();
            let back_in_time = state.last_stamp.is_some_and(|last| last > sample.time);
            if !back_in_time {
                state.buffer.push(sample.clone());
                state.last_stamp = Some(sample.time);
            }
            // First value after a connect is repeated with the host time, which
            // shows when a constant source came (back) online.
            if !state.have_sample_after_connection
                && now > sample.time
                && state.last_stamp.map_or(true, |last| now >= last)
            {
                state.buffer.push(sample.restamped(now));
                state.last_stamp = Some(now);
                state.have_sample_after_connection = true;
            }
            back_in_time
        };
        if back_in_time {
            self.throttle.warn(
                LogCategory::BufferBackInTime,
                &self.name,
                format_args!("back in time: {}", sample.time.to_rfc3339()),
            );
        }
    }
}

/// Issues one poll per scan.
struct PollTrigger {
    name: String,
    source: Arc<dyn DataSource>,
}

impl Scannable for PollTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    fn scan(&self) {
        if !self.source.is_connected() {
            return;
        }
        if let Err(e) = self.source.poll_once() {
            tracing::debug!(channel = %self.name, error = %e, "poll failed");
        }
    }
}

/// Data source, filter chain and buffer of one channel.
pub struct Sampler {
    name: String,
    mode: SamplingMode,
    period: f64,
    clock: SharedClock,
    throttle: Arc<ThrottledLogger>,
    scheduler: Arc<Scheduler>,
    source: Arc<dyn DataSource>,
    sink: Arc<BufferSink>,
    disable: Arc<DisableFilter>,
    repeat: Option<Arc<RepeatFilter>>,
    head: Arc<dyn SourceListener>,
    poll: Option<Arc<dyn Scannable>>,
}

impl Sampler {
    /// Create the source for `name` and build the chain for `mode`.
    pub fn new(ctx: &EngineContext, name: &str, period: f64, mode: SamplingMode) -> AppResult<Self> {
        let source = ctx.sources.create(name)?;
        let settings = &ctx.settings;
        let sink = Arc::new(BufferSink {
            name: name.to_string(),
            mode,
            capacity: settings.suggested_buffer_space(period),
            clock: Arc::clone(&ctx.clock),
            throttle: Arc::clone(&ctx.throttle),
            state: OrderedMutex::new(
                LockOrder::Sampler,
                "sampler",
                BufferState {
                    buffer: RingBuffer::new(),
                    shape: None,
                    last_stamp: None,
                    have_sample_after_connection: false,
                    running: false,
                },
            ),
        });
        let time: Arc<dyn SourceListener> = Arc::new(TimeFilter::new(
            settings.ignored_future,
            Arc::clone(&ctx.clock),
            Arc::clone(&ctx.throttle),
            sink.clone(),
        ));

        let (repeat, after_disable) = match mode {
            SamplingMode::Monitor => (None, time),
            SamplingMode::Get | SamplingMode::MonitoredGet => {
                let repeat = Arc::new(RepeatFilter::new(
                    settings.max_repeat_count,
                    Arc::clone(&ctx.clock),
                    time,
                ));
                let next: Arc<dyn SourceListener> = if mode == SamplingMode::MonitoredGet {
                    Arc::new(TimeSlotFilter::new(period, repeat.clone()))
                } else {
                    repeat.clone()
                };
                (Some(repeat), next)
            }
        };
        let disable = Arc::new(DisableFilter::new(after_disable));
        let poll = (mode == SamplingMode::Get).then(|| {
            Arc::new(PollTrigger {
                name: name.to_string(),
                source: Arc::clone(&source),
            }) as Arc<dyn Scannable>
        });

        Ok(Self {
            name: name.to_string(),
            mode,
            period,
            clock: Arc::clone(&ctx.clock),
            throttle: Arc::clone(&ctx.throttle),
            scheduler: Arc::clone(&ctx.scheduler),
            source,
            sink,
            head: disable.clone(),
            disable,
            repeat,
            poll,
        })
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How this sampler obtains values.
    pub fn mode(&self) -> SamplingMode {
        self.mode
    }

    /// Nominal period in seconds.
    pub fn period(&self) -> f64 {
        self.period
    }

    /// The underlying data source.
    pub fn source(&self) -> &Arc<dyn DataSource> {
        &self.source
    }

    /// Between `start()` and `stop()`.
    pub fn is_running(&self) -> bool {
        self.sink.state.lock().running
    }

    /// Connection state of the data source.
    pub fn source_state(&self) -> SourceState {
        self.source.state()
    }

    /// Samples waiting for the next write.
    pub fn sample_count(&self) -> usize {
        self.sink.state.lock().buffer.count()
    }

    /// Samples lost to a full buffer since the last write.
    pub fn overwrites(&self) -> usize {
        self.sink.state.lock().buffer.overwrites()
    }

    /// Whether values are currently held back.
    pub fn is_disabled(&self) -> bool {
        self.disable.is_disabled()
    }

    /// One-line description for status pages.
    pub fn info(&self) -> String {
        format!(
            "{}, {:.1} s, source {:?}",
            self.mode,
            self.period,
            self.source.state()
        )
    }

    /// Hook the chain up to the source and start connecting.
    pub fn start(&self) -> AppResult<()> {
        {
            let mut state = self.sink.state.lock();
            if state.running {
                return Err(ArchiveError::Running(self.name.clone()));
            }
            state.running = true;
        }
        tracing::debug!(channel = %self.name, mode = %self.mode, "sampler start");
        self.source.add_listener(Arc::clone(&self.head));
        if let Some(poll) = &self.poll {
            self.scheduler.add(Arc::clone(poll), self.period);
        }
        self.source.connect()
    }

    /// Disconnect, then record a `Stopped` marker.
    ///
    /// Pending repeats are flushed first; the disconnect itself adds a
    /// `Disconnected` marker if the source was connected.
    pub fn stop(&self) -> AppResult<()> {
        {
            let mut state = self.sink.state.lock();
            if !state.running {
                return Err(ArchiveError::NotRunning);
            }
            state.running = false;
        }
        tracing::debug!(channel = %self.name, "sampler stop");
        if let Some(poll) = &self.poll {
            self.scheduler.remove(poll);
        }
        if let Some(repeat) = &self.repeat {
            repeat.stop(self.source.as_ref());
        }
        self.source.disconnect();
        self.source.remove_listener(&self.head);
        self.sink.add_event(Severity::Stopped, self.clock.now());
        Ok(())
    }

    /// Record a `Disabled` marker and hold back further values.
    pub fn disable(&self, when: Timestamp) {
        self.sink.add_event(Severity::Disabled, when);
        self.disable.disable();
    }

    /// Resume; the last value seen while disabled is archived stamped `when`.
    pub fn enable(&self, when: Timestamp) {
        self.disable.enable(self.source.as_ref(), when);
    }

    /// Move all buffered samples into `storage`; returns how many were added.
    ///
    /// The buffer is unlocked while the storage works, so sources keep
    /// delivering (and at worst overwrite) during a slow write.
    pub fn write(&self, storage: &mut dyn Storage) -> AppResult<usize> {
        let (estimate, shape) = {
            let state = self.sink.state.lock();
            (state.buffer.count(), state.shape.unwrap_or_default())
        };
        if estimate == 0 {
            return Ok(0);
        }
        let metadata = self.source.metadata();
        let mut writer = storage.writer(&self.name, &metadata, shape, self.period, estimate)?;

        let overwrites = self.sink.state.lock().buffer.take_overwrites();
        if overwrites > 0 {
            self.throttle.warn(
                LogCategory::BufferOverwrite,
                &self.name,
                format_args!("{overwrites} buffer overwrites"),
            );
        }
        // One sample at a time: a sample leaves the buffer only once the
        // writer took it, so a failing add keeps the rest for the next cycle.
        // Samples arriving meanwhile wait for the next cycle as well.
        let mut written = 0;
        for _ in 0..estimate {
            let (sample, seen_overwrites) = {
                let state = self.sink.state.lock();
                match state.buffer.peek(0) {
                    Some(sample) => (sample.clone(), state.buffer.overwrites()),
                    None => break,
                }
            };
            let added = writer.add(&sample)?;
            {
                let mut state = self.sink.state.lock();
                // An overwrite meanwhile already dropped this oldest sample.
                if state.buffer.overwrites() == seen_overwrites {
                    state.buffer.pop();
                }
            }
            if !added {
                tracing::warn!(
                    channel = %self.name,
                    time = %sample.time.to_rfc3339(),
                    "back-in-time write"
                );
            }
            written += 1;
        }
        Ok(written)
    }
}

impl fmt::Debug for Sampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sampler")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::data::storage::MemoryStorage;
    use crate::sample::{Value, ValueType};
    use crate::source::mock::{MockContext, MockSource};
    use crate::time::{from_secs_f64, Clock, ManualClock};
    use tracing_test::traced_test;

    struct Fixture {
        clock: Arc<ManualClock>,
        sources: Arc<MockContext>,
        ctx: EngineContext,
    }

    impl Fixture {
        fn new(settings: EngineConfig) -> Self {
            let clock = Arc::new(ManualClock::at_secs(1000.0));
            let sources = Arc::new(MockContext::new(clock.clone()));
            let ctx = EngineContext::new(settings, clock.clone(), sources.clone());
            Self { clock, sources, ctx }
        }

        fn sampler(&self, name: &str, period: f64, mode: SamplingMode) -> (Sampler, Arc<MockSource>) {
            let sampler = Sampler::new(&self.ctx, name, period, mode).unwrap();
            let source = self.sources.source(name).unwrap();
            (sampler, source)
        }
    }

    fn t(secs: f64) -> Timestamp {
        from_secs_f64(secs)
    }

    fn drain(sampler: &Sampler) -> Vec<Sample> {
        let mut storage = MemoryStorage::new();
        let handle = storage.clone();
        sampler.write(&mut storage).unwrap();
        handle.samples(sampler.name())
    }

    #[test]
    fn mode_selection() {
        assert_eq!(SamplingMode::select(1.0, true, 20.0), SamplingMode::Monitor);
        assert_eq!(SamplingMode::select(60.0, true, 20.0), SamplingMode::Monitor);
        assert_eq!(SamplingMode::select(20.0, false, 20.0), SamplingMode::Get);
        assert_eq!(SamplingMode::select(5.0, false, 20.0), SamplingMode::MonitoredGet);
    }

    #[test]
    #[traced_test]
    fn monitor_adds_host_stamped_copy_after_connect() {
        let fx = Fixture::new(EngineConfig::default());
        let (sampler, source) = fx.sampler("pv", 1.0, SamplingMode::Monitor);
        sampler.start().unwrap();
        assert_eq!(source.connects(), 1);
        assert_eq!(source.listener_count(), 1);

        source.fire_connect(t(999.0));
        assert!(source.is_subscribed());

        assert!(source.push(t(999.0), Value::double(1.0)));
        assert_eq!(sampler.sample_count(), 2);
        // Behind the host-stamped copy, so the buffer rejects it.
        assert!(source.push(t(999.5), Value::double(2.0)));
        assert_eq!(sampler.sample_count(), 2);
        assert!(logs_contain("back in time"));
        assert!(source.push(t(1001.0), Value::double(3.0)));

        let out = drain(&sampler);
        let times: Vec<_> = out.iter().map(|s| s.time).collect();
        assert_eq!(times, vec![t(999.0), t(1000.0), t(1001.0)]);
        assert_eq!(out[1].value, Value::double(1.0));
        assert_eq!(sampler.sample_count(), 0);
    }

    #[test]
    fn get_polls_and_compresses_repeats() {
        let fx = Fixture::new(EngineConfig::default());
        let (sampler, source) = fx.sampler("slow", 1.0, SamplingMode::Get);
        source.set_poll_value(Value::double(5.0));
        sampler.start().unwrap();
        assert_eq!(fx.ctx.scheduler.len(), 1);
        source.fire_connect(t(1000.0));
        assert!(!source.is_subscribed());

        fx.clock.advance(1.0);
        fx.ctx.scheduler.scan(fx.clock.now());
        fx.clock.advance(1.0);
        fx.ctx.scheduler.scan(fx.clock.now());
        assert_eq!(source.polls(), 2);

        sampler.stop().unwrap();
        assert!(fx.ctx.scheduler.is_empty());
        assert_eq!(source.listener_count(), 0);

        let out = drain(&sampler);
        let severities: Vec<_> = out.iter().map(|s| s.severity).collect();
        assert_eq!(
            severities,
            vec![
                Severity::NoAlarm,
                Severity::Repeat,
                Severity::Disconnected,
                Severity::Stopped
            ]
        );
        assert_eq!(out[0].time, t(1001.0));
        assert_eq!(out[1].status, 1);
        assert_eq!(out[1].time, t(1002.0));
    }

    #[test]
    fn monitored_get_keeps_one_value_per_slot() {
        let fx = Fixture::new(EngineConfig::default());
        let (sampler, source) = fx.sampler("fast", 1.0, SamplingMode::MonitoredGet);
        sampler.start().unwrap();
        source.fire_connect(t(999.0));
        assert!(source.is_subscribed());

        source.push(t(1000.0), Value::double(1.0));
        source.push(t(1000.5), Value::double(2.0));
        source.push(t(1001.0), Value::double(1.0));
        source.push(t(1002.0), Value::double(3.0));

        let out = drain(&sampler);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], Sample::new(t(1000.0), Value::double(1.0)));
        assert_eq!(out[1].severity, Severity::Repeat);
        assert_eq!(out[1].time, t(1002.0));
        assert_eq!(out[2], Sample::new(t(1002.0), Value::double(3.0)));
    }

    #[test]
    fn disable_records_marker_and_holds_values() {
        let fx = Fixture::new(EngineConfig::default());
        let (sampler, source) = fx.sampler("pv", 1.0, SamplingMode::Monitor);
        sampler.start().unwrap();
        source.fire_connect(t(1000.0));

        sampler.disable(t(1000.0));
        assert!(sampler.is_disabled());
        source.push(t(1001.0), Value::double(7.0));
        source.push(t(1002.0), Value::double(8.0));
        assert_eq!(sampler.sample_count(), 1);

        sampler.enable(t(1005.0));
        let out = drain(&sampler);
        assert_eq!(out[0].severity, Severity::Disabled);
        assert_eq!(out[1], Sample::new(t(1005.0), Value::double(8.0)));
    }

    #[test]
    fn reconnect_with_new_shape_keeps_markers() {
        let fx = Fixture::new(EngineConfig::default());
        let (sampler, source) = fx.sampler("wave", 1.0, SamplingMode::Monitor);
        sampler.start().unwrap();
        // Marker before any connect allocates a scalar double buffer.
        sampler.disable(t(990.0));
        sampler.enable(t(991.0));
        assert_eq!(sampler.sample_count(), 1);

        source.set_shape(ValueShape::new(ValueType::Long, 2));
        source.fire_connect(t(995.0));
        let out = drain(&sampler);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].severity, Severity::Disabled);
        assert_eq!(out[0].value.shape(), ValueShape::new(ValueType::Long, 2));
    }

    #[test]
    fn markers_never_go_back_in_time() {
        let fx = Fixture::new(EngineConfig::default());
        let (sampler, source) = fx.sampler("pv", 1.0, SamplingMode::Monitor);
        sampler.start().unwrap();
        source.fire_connect(t(1000.0));
        source.push(t(1010.0), Value::double(1.0));
        source.fire_disconnect(t(1005.0));
        let out = drain(&sampler);
        assert_eq!(out[1].severity, Severity::Disconnected);
        assert_eq!(out[1].time, t(1010.0));
    }

    #[test]
    #[traced_test]
    fn write_reports_and_resets_overwrites() {
        let settings = EngineConfig {
            write_period: 1.0,
            ..EngineConfig::default()
        };
        let fx = Fixture::new(settings);
        let (sampler, source) = fx.sampler("busy", 1.0, SamplingMode::Monitor);
        sampler.start().unwrap();
        source.fire_connect(t(1000.0));
        for i in 1..=5 {
            source.push(t(1000.0 + f64::from(i)), Value::double(f64::from(i)));
        }
        assert_eq!(sampler.sample_count(), 3);
        assert_eq!(sampler.overwrites(), 2);

        let out = drain(&sampler);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].time, t(1003.0));
        assert_eq!(sampler.overwrites(), 0);
        assert!(logs_contain("2 buffer overwrites"));
    }

    #[test]
    fn failed_writer_keeps_buffer() {
        let fx = Fixture::new(EngineConfig::default());
        let (sampler, source) = fx.sampler("pv", 1.0, SamplingMode::Monitor);
        sampler.start().unwrap();
        source.fire_connect(t(1000.0));
        source.push(t(1001.0), Value::double(1.0));

        let mut storage = MemoryStorage::new();
        storage.fail_channel(Some("pv"));
        assert!(sampler.write(&mut storage).is_err());
        assert_eq!(sampler.sample_count(), 1);
    }

    #[test]
    fn failing_add_keeps_unwritten_samples() {
        let fx = Fixture::new(EngineConfig::default());
        let (sampler, source) = fx.sampler("pv", 1.0, SamplingMode::Monitor);
        sampler.start().unwrap();
        source.fire_connect(t(1000.0));
        for i in 1..=5 {
            source.push(t(1000.0 + f64::from(i)), Value::double(f64::from(i)));
        }
        assert_eq!(sampler.sample_count(), 5);

        let mut storage = MemoryStorage::new();
        let handle = storage.clone();
        handle.fail_adds_after(Some(1));
        assert!(sampler.write(&mut storage).is_err());
        assert_eq!(handle.samples("pv").len(), 1);
        assert_eq!(sampler.sample_count(), 4);

        handle.fail_adds_after(None);
        assert_eq!(sampler.write(&mut storage).unwrap(), 4);
        let times: Vec<_> = handle.samples("pv").iter().map(|s| s.time).collect();
        assert_eq!(times, (1..=5).map(|i| t(1000.0 + f64::from(i))).collect::<Vec<_>>());
        assert_eq!(sampler.sample_count(), 0);
    }

    #[test]
    fn start_and_stop_are_checked() {
        let fx = Fixture::new(EngineConfig::default());
        let (sampler, _source) = fx.sampler("pv", 1.0, SamplingMode::Monitor);
        assert!(matches!(sampler.stop(), Err(ArchiveError::NotRunning)));
        sampler.start().unwrap();
        assert!(sampler.is_running());
        assert!(matches!(sampler.start(), Err(ArchiveError::Running(_))));
        sampler.stop().unwrap();
        assert!(!sampler.is_running());
        // Never connected: only the stop marker.
        let out = drain(&sampler);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].severity, Severity::Stopped);
    }
}
