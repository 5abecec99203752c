//! Named sets of channels that are disabled and enabled together.

use crate::channel::Channel;
use crate::error::{AppResult, ArchiveError};
use crate::locks::{LockOrder, OrderedMutex};
use crate::time::Timestamp;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct GroupState {
    channels: Vec<Arc<Channel>>,
    disable_count: usize,
}

/// A group of channels.
///
/// Disabling is reference counted: several disabling channels may disable
/// the same group, and its members resume only after every one of them has
/// enabled it again.
pub struct Group {
    name: String,
    state: OrderedMutex<GroupState>,
    // Kept outside the lock: connect callbacks may arrive while a thread
    // holds the group lock to cascade a disable.
    members: AtomicUsize,
    connected: AtomicUsize,
}

/// Serialisable snapshot of a group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStatus {
    /// Group name
    pub name: String,
    /// Number of members
    pub channels: usize,
    /// Members currently connected
    pub connected: usize,
    /// No disabling channel is active
    pub enabled: bool,
}

impl Group {
    /// Empty, enabled group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: OrderedMutex::new(LockOrder::Group, "group", GroupState::default()),
            members: AtomicUsize::new(0),
            connected: AtomicUsize::new(0),
        }
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add `channel` unless it is already a member; returns whether it was added.
    pub fn add_channel(&self, channel: Arc<Channel>) -> bool {
        let mut state = self.state.lock();
        if state.channels.iter().any(|c| Arc::ptr_eq(c, &channel)) {
            return false;
        }
        state.channels.push(channel);
        self.members.store(state.channels.len(), Ordering::SeqCst);
        true
    }

    /// Current members.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.state.lock().channels.clone()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.load(Ordering::SeqCst)
    }

    /// Whether the group has no members.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disable on behalf of `cause`; only the first cause reaches the members.
    pub fn disable(&self, cause: &str, when: Timestamp) {
        let mut state = self.state.lock();
        state.disable_count += 1;
        tracing::debug!(group = %self.name, cause, count = state.disable_count, "group disable");
        if state.disable_count != 1 {
            return;
        }
        tracing::info!(group = %self.name, cause, "group disabled");
        for channel in &state.channels {
            if let Err(e) = channel.disable(when) {
                tracing::error!(group = %self.name, channel = %channel.name(), error = %e, "cannot disable channel");
            }
        }
    }

    /// Undo one [`disable`](Self::disable); the last cause re-enables the members.
    pub fn enable(&self, cause: &str, when: Timestamp) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.disable_count == 0 {
            return Err(ArchiveError::Invariant(format!(
                "group '{}' enabled by '{cause}' while not disabled",
                self.name
            )));
        }
        state.disable_count -= 1;
        tracing::debug!(group = %self.name, cause, count = state.disable_count, "group enable");
        if state.disable_count > 0 {
            return Ok(());
        }
        tracing::info!(group = %self.name, cause, "group enabled");
        for channel in &state.channels {
            if let Err(e) = channel.enable(when) {
                tracing::error!(group = %self.name, channel = %channel.name(), error = %e, "cannot enable channel");
            }
        }
        Ok(())
    }

    /// Whether no cause disables this group.
    pub fn is_enabled(&self) -> bool {
        self.state.lock().disable_count == 0
    }

    /// Number of causes currently disabling this group.
    pub fn disable_count(&self) -> usize {
        self.state.lock().disable_count
    }

    /// Count one more connected member; returns the new count.
    pub fn inc_connected(&self, channel: &str) -> AppResult<usize> {
        let members = self.len();
        self.connected
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < members).then_some(n + 1)
            })
            .map(|n| n + 1)
            .map_err(|n| {
                ArchiveError::Invariant(format!(
                    "group '{}' connect count {} out of {members} on increment from '{channel}'",
                    self.name,
                    n + 1
                ))
            })
    }

    /// Count one connected member less; returns the new count.
    pub fn dec_connected(&self, channel: &str) -> AppResult<usize> {
        self.connected
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|n| n - 1)
            .map_err(|_| {
                ArchiveError::Invariant(format!(
                    "group '{}' connect count runs below 0 on decrement from '{channel}'",
                    self.name
                ))
            })
    }

    /// Members currently connected.
    pub fn connected(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    /// Snapshot for status reports.
    pub fn status(&self) -> GroupStatus {
        GroupStatus {
            name: self.name.clone(),
            channels: self.len(),
            connected: self.connected(),
            enabled: self.is_enabled(),
        }
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.name)
            .field("members", &self.len())
            .field("connected", &self.connected())
            .finish_non_exhaustive()
    }
}
