//! One archived channel.
//!
//! A [`Channel`] owns the [`Sampler`] of its data source and its group
//! bookkeeping. It watches the source for two things:
//!
//! - connect/disconnect, to keep its groups' connected counts current;
//! - values, but only when the channel disables groups: a value above zero
//!   disables every group in its disable set, a value at or below zero
//!   enables them again.
//!
//! Start, stop, configure and write mark the channel busy and then release
//! its lock, so source callbacks (which lock the channel) can run while the
//! source is connecting, disconnecting or the buffer is being written.

use crate::data::storage::Storage;
use crate::engine::EngineContext;
use crate::error::{AppResult, ArchiveError};
use crate::group::Group;
use crate::locks::{LockOrder, OrderedGuard, OrderedMutex};
use crate::sample::Sample;
use crate::sampler::{Sampler, SamplingMode};
use crate::source::{DataSource, SourceListener};
use crate::time::Timestamp;
use parking_lot::Condvar;
use serde::Serialize;
use std::sync::{Arc, Weak};

struct ChannelState {
    period: f64,
    monitor: bool,
    groups: Vec<Weak<Group>>,
    disable_groups: Vec<Weak<Group>>,
    disable_count: usize,
    currently_disabling: bool,
    busy: bool,
    sampler: Arc<Sampler>,
}

impl ChannelState {
    fn can_disable(&self) -> bool {
        !self.disable_groups.is_empty()
    }

    /// Disabled once every group it belongs to disabled it; a disabling
    /// channel never is.
    fn is_disabled(&self) -> bool {
        !self.can_disable() && !self.groups.is_empty() && self.disable_count >= self.groups.len()
    }
}

fn contains(groups: &[Weak<Group>], group: &Arc<Group>) -> bool {
    let weak = Arc::downgrade(group);
    groups.iter().any(|g| Weak::ptr_eq(g, &weak))
}

fn upgrade_all(groups: &[Weak<Group>]) -> Vec<Arc<Group>> {
    groups.iter().filter_map(Weak::upgrade).collect()
}

/// Serialisable snapshot of a channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatus {
    /// Channel name
    pub name: String,
    /// Sampling mode in effect
    pub mode: SamplingMode,
    /// Scan period (seconds)
    pub period: f64,
    /// Data source connected
    pub connected: bool,
    /// Archiving suspended by a disabled group
    pub disabled: bool,
    /// This channel is currently disabling its groups
    pub disabling: bool,
    /// Samples waiting for the next write
    pub buffered: usize,
    /// Samples lost to buffer overwrites since the last write
    pub overwrites: usize,
}

/// An archived channel.
pub struct Channel {
    name: String,
    ctx: Arc<EngineContext>,
    state: OrderedMutex<ChannelState>,
    idle: Condvar,
    state_watch: Arc<dyn SourceListener>,
    value_watch: Arc<dyn SourceListener>,
}

impl Channel {
    /// Channel sampling `name` every `period` seconds (or on change, with `monitor`).
    pub fn new(ctx: &Arc<EngineContext>, name: &str, period: f64, monitor: bool) -> AppResult<Arc<Self>> {
        let mode = SamplingMode::select(period, monitor, ctx.settings.get_threshold);
        let sampler = Arc::new(Sampler::new(ctx, name, period, mode)?);
        let channel = Arc::new_cyclic(|weak: &Weak<Channel>| Channel {
            name: name.to_string(),
            ctx: Arc::clone(ctx),
            state: OrderedMutex::new(
                LockOrder::Channel,
                "channel",
                ChannelState {
                    period,
                    monitor,
                    groups: Vec::new(),
                    disable_groups: Vec::new(),
                    disable_count: 0,
                    currently_disabling: false,
                    busy: false,
                    sampler: Arc::clone(&sampler),
                },
            ),
            idle: Condvar::new(),
            state_watch: Arc::new(StateWatch {
                channel: weak.clone(),
            }),
            value_watch: Arc::new(TriggerWatch {
                channel: weak.clone(),
            }),
        });
        sampler.source().add_listener(Arc::clone(&channel.state_watch));
        tracing::debug!(channel = %name, %mode, period, "channel created");
        Ok(channel)
    }

    /// Channel name, as known to the data source.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scan period after merging every configuration of this channel.
    pub fn period(&self) -> f64 {
        self.state.lock().period
    }

    /// Whether any configuration asked for monitoring.
    pub fn monitor(&self) -> bool {
        self.state.lock().monitor
    }

    /// Mode of the current sampler.
    pub fn mode(&self) -> SamplingMode {
        self.state.lock().sampler.mode()
    }

    /// The current sampler.
    pub fn sampler(&self) -> Arc<Sampler> {
        Arc::clone(&self.state.lock().sampler)
    }

    /// Whether the channel has been started.
    pub fn is_running(&self) -> bool {
        self.sampler().is_running()
    }

    /// Whether the data source is connected.
    pub fn is_connected(&self) -> bool {
        self.sampler().source().is_connected()
    }

    /// Whether archiving is suspended by a disabled group.
    pub fn is_disabled(&self) -> bool {
        self.state.lock().is_disabled()
    }

    /// Whether this channel disables any group.
    pub fn can_disable(&self) -> bool {
        self.state.lock().can_disable()
    }

    /// Whether this channel is disabling its groups right now.
    pub fn is_disabling(&self) -> bool {
        self.state.lock().currently_disabling
    }

    /// Number of groups that currently disable this channel.
    pub fn disable_count(&self) -> usize {
        self.state.lock().disable_count
    }

    /// Names of the groups this channel belongs to.
    pub fn group_names(&self) -> Vec<String> {
        let groups = upgrade_all(&self.state.lock().groups);
        groups.iter().map(|g| g.name().to_string()).collect()
    }

    /// Whether this channel disables `group`.
    pub fn disables(&self, group: &Arc<Group>) -> bool {
        contains(&self.state.lock().disable_groups, group)
    }

    /// Snapshot for status reports.
    pub fn status(&self) -> ChannelStatus {
        let (sampler, period, disabled, disabling) = {
            let state = self.state.lock();
            (
                Arc::clone(&state.sampler),
                state.period,
                state.is_disabled(),
                state.currently_disabling,
            )
        };
        ChannelStatus {
            name: self.name.clone(),
            mode: sampler.mode(),
            period,
            connected: sampler.source().is_connected(),
            disabled,
            disabling,
            buffered: sampler.sample_count(),
            overwrites: sampler.overwrites(),
        }
    }

    /// Join `group`; with `disabling`, this channel's value also disables it.
    ///
    /// A channel joining an already disabled group is disabled right away,
    /// and a channel that is currently disabling disables a newly added
    /// disable group right away.
    pub fn add_to_group(&self, group: &Arc<Group>, disabling: bool) -> AppResult<()> {
        let group_enabled = group.is_enabled();
        let now = self.ctx.clock.now();
        let (disable_self, disable_group) = {
            let mut state = self.state.lock();
            if state.sampler.is_running() {
                return Err(ArchiveError::Running(self.name.clone()));
            }
            let mut disable_self = false;
            if !contains(&state.groups, group) {
                state.groups.push(Arc::downgrade(group));
                if !group_enabled {
                    tracing::info!(channel = %self.name, group = %group.name(), "added to disabled group");
                    disable_self = true;
                }
            }
            let mut disable_group = false;
            if disabling {
                if !state.can_disable() {
                    state.sampler.source().add_listener(Arc::clone(&self.value_watch));
                }
                if !contains(&state.disable_groups, group) {
                    state.disable_groups.push(Arc::downgrade(group));
                    if state.currently_disabling {
                        tracing::info!(channel = %self.name, group = %group.name(), "disables group right away");
                        disable_group = true;
                    }
                }
            }
            (disable_self, disable_group)
        };
        if disable_self {
            self.disable(now)?;
        }
        if disable_group {
            group.disable(&self.name, now);
        }
        Ok(())
    }

    /// Called by a group that disables this channel.
    pub fn disable(&self, when: Timestamp) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.disable_count >= state.groups.len() {
            return Err(ArchiveError::Invariant(format!(
                "channel '{}' disabled {} times but member of {} groups",
                self.name,
                state.disable_count + 1,
                state.groups.len()
            )));
        }
        state.disable_count += 1;
        // A disabling channel keeps sampling to notice when to enable again.
        if state.can_disable() || !state.is_disabled() {
            return Ok(());
        }
        tracing::info!(channel = %self.name, "channel disabled");
        state.sampler.disable(when);
        if self.ctx.settings.disconnect_on_disable {
            self.stop_locked(&mut state)?;
        }
        Ok(())
    }

    /// Called by a group that no longer disables this channel.
    pub fn enable(&self, when: Timestamp) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.disable_count == 0 {
            return Err(ArchiveError::Invariant(format!(
                "channel '{}' enabled while not disabled",
                self.name
            )));
        }
        let was_disabled = state.is_disabled();
        state.disable_count -= 1;
        if state.can_disable() || !was_disabled {
            return Ok(());
        }
        tracing::info!(channel = %self.name, "channel enabled");
        state.sampler.enable(when);
        if self.ctx.settings.disconnect_on_disable {
            self.start_locked(&mut state)?;
        }
        Ok(())
    }

    /// Start sampling; a no-op if already running.
    pub fn start(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        self.start_locked(&mut state)
    }

    /// Stop sampling; a no-op if not running.
    pub fn stop(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        self.stop_locked(&mut state)
    }

    /// Write buffered samples; a busy channel is skipped until the next write.
    pub fn write(&self, storage: &mut dyn Storage) -> AppResult<usize> {
        let mut state = self.state.lock();
        if state.busy {
            tracing::warn!(channel = %self.name, "cannot write because sampler is busy");
            return Ok(0);
        }
        self.with_busy(&mut state, |sampler| sampler.write(storage))
    }

    /// Merge a further configuration and rebuild the sampler.
    ///
    /// The shorter period and any monitor request win. Only allowed while
    /// stopped; buffered samples of the old sampler are discarded.
    pub fn configure(&self, period: f64, monitor: bool) -> AppResult<()> {
        let mut state = self.state.lock();
        while state.busy {
            state.wait(&self.idle);
        }
        if state.sampler.is_running() {
            return Err(ArchiveError::Running(self.name.clone()));
        }
        state.monitor |= monitor;
        if state.period <= 0.0 || period < state.period {
            state.period = period;
        }
        let mode = SamplingMode::select(state.period, state.monitor, self.ctx.settings.get_threshold);
        let sampler = Arc::new(Sampler::new(&self.ctx, &self.name, state.period, mode)?);

        let old = state.sampler.source();
        old.remove_listener(&self.state_watch);
        if state.can_disable() {
            old.remove_listener(&self.value_watch);
        }
        sampler.source().add_listener(Arc::clone(&self.state_watch));
        if state.can_disable() {
            sampler.source().add_listener(Arc::clone(&self.value_watch));
        }
        tracing::info!(channel = %self.name, %mode, period = state.period, "channel reconfigured");
        state.sampler = sampler;
        Ok(())
    }

    fn start_locked(&self, state: &mut OrderedGuard<'_, ChannelState>) -> AppResult<()> {
        while state.busy {
            state.wait(&self.idle);
        }
        if state.sampler.is_running() {
            return Ok(());
        }
        self.with_busy(state, |sampler| sampler.start())
    }

    fn stop_locked(&self, state: &mut OrderedGuard<'_, ChannelState>) -> AppResult<()> {
        while state.busy {
            state.wait(&self.idle);
        }
        if !state.sampler.is_running() {
            return Ok(());
        }
        self.with_busy(state, |sampler| sampler.stop())
    }

    /// Run `f` on the sampler with the busy flag set and the channel unlocked.
    fn with_busy<R>(
        &self,
        state: &mut OrderedGuard<'_, ChannelState>,
        f: impl FnOnce(&Sampler) -> R,
    ) -> R {
        state.busy = true;
        let sampler = Arc::clone(&state.sampler);
        let result = state.unlocked(|| f(&sampler));
        state.busy = false;
        self.idle.notify_all();
        result
    }

    fn source_connected(&self) {
        tracing::info!(channel = %self.name, "connected");
        let groups = upgrade_all(&self.state.lock().groups);
        for group in groups {
            if let Err(e) = group.inc_connected(&self.name) {
                tracing::error!(channel = %self.name, error = %e, "connect count");
            }
        }
    }

    fn source_disconnected(&self) {
        tracing::info!(channel = %self.name, "disconnected");
        let groups = upgrade_all(&self.state.lock().groups);
        for group in groups {
            if let Err(e) = group.dec_connected(&self.name) {
                tracing::error!(channel = %self.name, error = %e, "connect count");
            }
        }
    }

    /// Disable or enable the disable groups on an edge of the trigger value.
    fn trigger_value(&self, sample: &Sample) {
        let should_disable = sample.value.is_above_zero();
        let groups = {
            let mut state = self.state.lock();
            if !state.can_disable() {
                tracing::warn!(channel = %self.name, "value for disable test but not disabling");
                return;
            }
            if state.currently_disabling == should_disable {
                return;
            }
            state.currently_disabling = should_disable;
            upgrade_all(&state.disable_groups)
        };
        if should_disable {
            tracing::info!(channel = %self.name, "disables its groups");
            for group in groups {
                group.disable(&self.name, sample.time);
            }
        } else {
            tracing::info!(channel = %self.name, "enables its groups");
            for group in groups {
                if let Err(e) = group.enable(&self.name, sample.time) {
                    tracing::error!(channel = %self.name, error = %e, "cannot enable group");
                }
            }
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Forwards connect/disconnect of the source to its channel.
struct StateWatch {
    channel: Weak<Channel>,
}

impl SourceListener for StateWatch {
    fn on_connect(&self, _source: &dyn DataSource, _when: Timestamp) {
        if let Some(channel) = self.channel.upgrade() {
            channel.source_connected();
        }
    }

    fn on_disconnect(&self, _source: &dyn DataSource, _when: Timestamp) {
        if let Some(channel) = self.channel.upgrade() {
            channel.source_disconnected();
        }
    }

    fn on_value(&self, _source: &dyn DataSource, _sample: &Sample) {}
}

/// Forwards raw source values to a disabling channel.
struct TriggerWatch {
    channel: Weak<Channel>,
}

impl SourceListener for TriggerWatch {
    fn on_connect(&self, _source: &dyn DataSource, _when: Timestamp) {}

    fn on_disconnect(&self, _source: &dyn DataSource, _when: Timestamp) {}

    fn on_value(&self, _source: &dyn DataSource, sample: &Sample) {
        if let Some(channel) = self.channel.upgrade() {
            channel.trigger_value(sample);
        }
    }
}
