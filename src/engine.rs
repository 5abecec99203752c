//! The archive engine.
//!
//! [`Engine`] owns every group and channel, the shared [`Scheduler`] and the
//! [`Storage`]. One thread drives [`Engine::process`] in a loop; each pass
//! either runs due polls, writes all buffers, or sleeps until the nearer of
//! the two deadlines (never longer than [`MAX_DELAY`], so a shutdown request is
//! noticed quickly).
//!
//! # Lock order
//! Engine → Group → Channel → Sampler → filters → data source → scheduler.
//! Polls are issued with no lock held.

use crate::channel::{Channel, ChannelStatus};
use crate::config::{ChannelConfig, EngineConfig, GroupConfig};
use crate::data::storage::Storage;
use crate::error::{AppResult, ArchiveError};
use crate::group::{Group, GroupStatus};
use crate::locks::{LockOrder, OrderedMutex};
use crate::scheduler::Scheduler;
use crate::source::SourceContext;
use crate::throttle::ThrottledLogger;
use crate::time::{delay_duration, round_time_up, secs_between, SharedClock, Timestamp};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Longest sleep of one [`Engine::process`] pass, in seconds.
pub const MAX_DELAY: f64 = 0.5;

/// What every channel shares: settings, clock, throttled logging, the scan
/// list and the data source factory.
pub struct EngineContext {
    /// Engine settings (without the group list)
    pub settings: EngineConfig,
    /// Time source for every time stamp the engine makes
    pub clock: SharedClock,
    /// Rate limiter for data-quality warnings
    pub throttle: Arc<ThrottledLogger>,
    /// Scan list driving the polled samplers
    pub scheduler: Arc<Scheduler>,
    /// Factory for channel data sources
    pub sources: Arc<dyn SourceContext>,
}

impl EngineContext {
    /// Context with an empty scan list; `settings` loses its group list.
    pub fn new(settings: EngineConfig, clock: SharedClock, sources: Arc<dyn SourceContext>) -> Self {
        Self {
            settings: settings.settings(),
            scheduler: Arc::new(Scheduler::new(Arc::clone(&clock))),
            throttle: Arc::new(ThrottledLogger::new()),
            clock,
            sources,
        }
    }
}

/// Outcome of one [`Engine::step`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProcessStep {
    /// Due polls were issued.
    Scanned,
    /// All channels were written; carries the number of samples.
    Wrote(usize),
    /// Nothing due; the loop should wait this long.
    Idle(Duration),
}

/// Serialisable snapshot of the whole engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    /// Free-text description of this engine
    pub description: String,
    /// When the engine was created
    pub started: Timestamp,
    /// Channels have been started
    pub running: bool,
    /// Seconds between write cycles
    pub write_period: f64,
    /// Time of the next write cycle, `None` before the first start
    pub next_write: Option<Timestamp>,
    /// Moving average of the write duration in seconds
    pub write_duration: f64,
    /// Moving average of samples per write
    pub write_count: f64,
    /// Moving average of the idle delay per pass in seconds
    pub process_delay: f64,
    /// Number of connected channels
    pub connected: usize,
    /// Per-group snapshots
    pub groups: Vec<GroupStatus>,
    /// Per-channel snapshots
    pub channels: Vec<ChannelStatus>,
}

struct EngineState {
    running: bool,
    description: String,
    groups: Vec<Arc<Group>>,
    channels: Vec<Arc<Channel>>,
    storage: Box<dyn Storage>,
    next_write: Option<Timestamp>,
    write_duration: f64,
    write_count: f64,
    process_delay_avg: f64,
}

/// Archive engine.
pub struct Engine {
    ctx: Arc<EngineContext>,
    started: Timestamp,
    state: OrderedMutex<EngineState>,
}

impl Engine {
    /// Engine without channels.
    pub fn new(ctx: Arc<EngineContext>, storage: Box<dyn Storage>) -> Self {
        let started = ctx.clock.now();
        Self {
            ctx,
            started,
            state: OrderedMutex::new(
                LockOrder::Engine,
                "engine",
                EngineState {
                    running: false,
                    description: "Archive Engine".to_string(),
                    groups: Vec::new(),
                    channels: Vec::new(),
                    storage,
                    next_write: None,
                    write_duration: 0.0,
                    write_count: 0.0,
                    process_delay_avg: 0.0,
                },
            ),
        }
    }

    /// Engine with every group and channel of `config`.
    ///
    /// A channel whose source cannot be created is logged and skipped.
    pub fn from_config(
        config: &EngineConfig,
        clock: SharedClock,
        sources: Arc<dyn SourceContext>,
        storage: Box<dyn Storage>,
    ) -> AppResult<Self> {
        config.validate()?;
        let ctx = Arc::new(EngineContext::new(config.clone(), clock, sources));
        let engine = Self::new(ctx, storage);
        for group in &config.groups {
            engine.add_group(&group.name)?;
            for channel in &group.channels {
                if let Err(e) = engine.add_channel(
                    &group.name,
                    &channel.name,
                    channel.period,
                    channel.disable,
                    channel.monitor,
                ) {
                    tracing::error!(group = %group.name, channel = %channel.name, error = %e, "cannot add channel");
                }
            }
        }
        tracing::info!(
            groups = config.groups.len(),
            channels = engine.channels().len(),
            "configuration loaded"
        );
        Ok(engine)
    }

    /// Shared context handed to every channel.
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Replace the description reported in the status.
    pub fn set_description(&self, description: impl Into<String>) {
        self.state.lock().description = description.into();
    }

    /// Free-text engine description.
    pub fn description(&self) -> String {
        self.state.lock().description.clone()
    }

    /// Whether [`start`](Self::start) ran without a later stop.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Find or create group `name`.
    pub fn add_group(&self, name: &str) -> AppResult<Arc<Group>> {
        let mut state = self.state.lock();
        if state.running {
            return Err(ArchiveError::Running("engine".into()));
        }
        Ok(find_or_add_group(&mut state.groups, name))
    }

    /// Add `channel` to `group`, creating either as needed.
    ///
    /// A channel listed more than once is reconfigured (shortest period, any
    /// monitor request) instead of duplicated.
    pub fn add_channel(
        &self,
        group: &str,
        channel: &str,
        period: f64,
        disabling: bool,
        monitor: bool,
    ) -> AppResult<Arc<Channel>> {
        let mut state = self.state.lock();
        if state.running {
            return Err(ArchiveError::Running("engine".into()));
        }
        let group = find_or_add_group(&mut state.groups, group);
        let existing = state.channels.iter().find(|c| c.name() == channel).cloned();
        let channel = match existing {
            Some(existing) => {
                existing.configure(period, monitor)?;
                existing
            }
            None => {
                let created = Channel::new(&self.ctx, channel, period, monitor)?;
                state.channels.push(Arc::clone(&created));
                created
            }
        };
        group.add_channel(Arc::clone(&channel));
        channel.add_to_group(&group, disabling)?;
        Ok(channel)
    }

    /// Groups in configuration order.
    pub fn groups(&self) -> Vec<Arc<Group>> {
        self.state.lock().groups.clone()
    }

    /// Channels in configuration order.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.state.lock().channels.clone()
    }

    /// Look up a channel by name.
    pub fn find_channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.state
            .lock()
            .channels
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// Look up a group by name.
    pub fn find_group(&self, name: &str) -> Option<Arc<Group>> {
        self.state
            .lock()
            .groups
            .iter()
            .find(|g| g.name() == name)
            .cloned()
    }

    /// Start every channel.
    pub fn start(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.running {
            return Err(ArchiveError::Running("engine".into()));
        }
        tracing::info!(channels = state.channels.len(), "engine starts");
        for channel in &state.channels {
            if let Err(e) = channel.start() {
                tracing::error!(channel = %channel.name(), error = %e, "cannot start channel");
            }
        }
        state.running = true;
        state.next_write = Some(round_time_up(self.ctx.clock.now(), self.ctx.settings.write_period));
        Ok(())
    }

    /// Stop every channel; each records its `Stopped` marker.
    pub fn stop(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        if !state.running {
            return Err(ArchiveError::NotRunning);
        }
        tracing::info!("engine stops");
        let mut errors = Vec::new();
        for channel in &state.channels {
            if let Err(e) = channel.stop() {
                tracing::error!(channel = %channel.name(), error = %e, "cannot stop channel");
                errors.push(e);
            }
        }
        state.running = false;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ArchiveError::ShutdownFailed(errors))
        }
    }

    /// Write every channel's buffer; returns the number of samples written.
    ///
    /// Failures are logged per channel and never keep the remaining channels
    /// from being written.
    pub fn write(&self) -> usize {
        let mut state = self.state.lock();
        write_all(&mut state)
    }

    /// One pass of the main loop without sleeping.
    pub fn step(&self) -> ProcessStep {
        debug_assert!(!crate::locks::holds_any_lock(), "engine loop entered with a lock held");
        if self.ctx.sources.flush_if_requested() {
            tracing::trace!("source context flushed");
        }
        let now = self.ctx.clock.now();
        let scheduler = &self.ctx.scheduler;
        let mut delay = MAX_DELAY;
        if let Some(due) = scheduler.due_time().filter(|_| scheduler.is_due_at_all()) {
            let scan_delay = secs_between(due, now);
            if scan_delay <= 0.0 {
                scheduler.scan(now);
                self.state.lock().process_delay_avg *= 0.99;
                return ProcessStep::Scanned;
            }
            delay = delay.min(scan_delay);
        }

        let mut state = self.state.lock();
        let Some(next_write) = state.next_write else {
            // Not started: nothing to write until start() sets the first cycle.
            state.process_delay_avg = 0.99 * state.process_delay_avg + 0.01 * delay;
            return ProcessStep::Idle(delay_duration(delay));
        };
        let write_delay = secs_between(next_write, now);
        if write_delay <= 0.0 {
            let count = write_all(&mut state);
            let end = self.ctx.clock.now();
            let duration = secs_between(end, now).max(0.0);
            state.write_duration = 0.99 * state.write_duration + 0.01 * duration;
            state.write_count = 0.99 * state.write_count + 0.01 * count as f64;
            state.next_write = Some(round_time_up(end, self.ctx.settings.write_period));
            state.process_delay_avg *= 0.99;
            tracing::debug!(samples = count, duration, "write cycle");
            return ProcessStep::Wrote(count);
        }
        delay = delay.min(write_delay);
        state.process_delay_avg = 0.99 * state.process_delay_avg + 0.01 * delay;
        ProcessStep::Idle(delay_duration(delay))
    }

    /// One pass of the main loop, sleeping when nothing is due.
    pub fn process(&self) -> ProcessStep {
        let step = self.step();
        if let ProcessStep::Idle(delay) = step {
            std::thread::sleep(delay);
        }
        step
    }

    /// Run [`process`](Self::process) until `keep_running` is cleared.
    pub fn run(&self, keep_running: &AtomicBool) {
        while keep_running.load(Ordering::SeqCst) {
            self.process();
        }
    }

    /// Stop all channels and write what they buffered.
    pub fn shutdown(&self) -> AppResult<usize> {
        let stopped = self.stop();
        let count = self.write();
        stopped.map(|()| count)
    }

    /// Number of connected channels.
    pub fn connected(&self) -> usize {
        self.channels().iter().filter(|c| c.is_connected()).count()
    }

    /// Snapshot of the engine, its groups and channels.
    pub fn status(&self) -> EngineStatus {
        let state = self.state.lock();
        let channels: Vec<_> = state.channels.iter().map(|c| c.status()).collect();
        EngineStatus {
            description: state.description.clone(),
            started: self.started,
            running: state.running,
            write_period: self.ctx.settings.write_period,
            next_write: state.next_write,
            write_duration: state.write_duration,
            write_count: state.write_count,
            process_delay: state.process_delay_avg,
            connected: channels.iter().filter(|c| c.connected).count(),
            groups: state.groups.iter().map(|g| g.status()).collect(),
            channels,
        }
    }

    /// The configuration currently in effect, with merged channel settings.
    pub fn online_config(&self) -> EngineConfig {
        let groups = self.groups();
        let mut config = self.ctx.settings.clone();
        config.groups = groups
            .iter()
            .map(|group| GroupConfig {
                name: group.name().to_string(),
                channels: group
                    .channels()
                    .iter()
                    .map(|channel| {
                        let monitor = channel.monitor();
                        ChannelConfig {
                            name: channel.name().to_string(),
                            period: channel.period(),
                            monitor,
                            scan: !monitor,
                            disable: channel.disables(group),
                        }
                    })
                    .collect(),
            })
            .collect();
        config
    }

    /// Dump [`online_config`](Self::online_config) as TOML to `path`.
    pub fn write_config(&self, path: impl AsRef<Path>) -> AppResult<()> {
        let text = self.online_config().to_toml_string()?;
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }
}

fn find_or_add_group(groups: &mut Vec<Arc<Group>>, name: &str) -> Arc<Group> {
    if let Some(group) = groups.iter().find(|g| g.name() == name) {
        return Arc::clone(group);
    }
    let group = Arc::new(Group::new(name));
    groups.push(Arc::clone(&group));
    group
}

fn write_all(state: &mut EngineState) -> usize {
    let EngineState {
        storage, channels, ..
    } = state;
    let mut count = 0;
    match storage.open() {
        Ok(()) => {
            for channel in channels.iter() {
                match channel.write(&mut **storage) {
                    Ok(n) => count += n,
                    Err(e) => {
                        tracing::error!(channel = %channel.name(), error = %e, "write failed");
                    }
                }
            }
        }
        Err(e) => tracing::error!(error = %e, "cannot open storage"),
    }
    if let Err(e) = storage.close_all() {
        tracing::error!(error = %e, "cannot close storage");
    }
    count
}
