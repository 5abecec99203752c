use crate::locks::{LockOrder, OrderedMutex};
use crate::sample::Sample;
use crate::source::{DataSource, SourceListener};
use crate::time::Timestamp;
use std::sync::Arc;

#[derive(Debug, Default)]
struct DisableState {
    disabled: bool,
    held: Option<Sample>,
}

/// Holds back values while disabled.
///
/// The most recent value received while disabled is kept and forwarded once,
/// re-stamped with the enable time, when the filter is enabled again. A
/// disconnect while disabled discards it.
pub struct DisableFilter {
    state: OrderedMutex<DisableState>,
    downstream: Arc<dyn SourceListener>,
}

impl DisableFilter {
    /// Enabled filter forwarding to `downstream`.
    pub fn new(downstream: Arc<dyn SourceListener>) -> Self {
        Self {
            state: OrderedMutex::new(
                LockOrder::DisableFilter,
                "disable filter",
                DisableState::default(),
            ),
            downstream,
        }
    }

    /// Start holding back values.
    pub fn disable(&self) {
        self.state.lock().disabled = true;
    }

    /// Resume forwarding; the held value (if any) goes out stamped `when`.
    pub fn enable(&self, source: &dyn DataSource, when: Timestamp) {
        let held = {
            let mut state = self.state.lock();
            state.disabled = false;
            state.held.take()
        };
        if let Some(sample) = held {
            self.downstream.on_value(source, &sample.restamped(when));
        }
    }

    /// Whether values are currently held back.
    pub fn is_disabled(&self) -> bool {
        self.state.lock().disabled
    }
}

impl SourceListener for DisableFilter {
    fn on_connect(&self, source: &dyn DataSource, when: Timestamp) {
        self.downstream.on_connect(source, when);
    }

    fn on_disconnect(&self, source: &dyn DataSource, when: Timestamp) {
        {
            let mut state = self.state.lock();
            if state.disabled {
                state.held = None;
            }
        }
        self.downstream.on_disconnect(source, when);
    }

    fn on_value(&self, source: &dyn DataSource, sample: &Sample) {
        {
            let mut state = self.state.lock();
            if state.disabled {
                tracing::trace!(channel = source.name(), "value held while disabled");
                state.held = Some(sample.clone());
                return;
            }
        }
        self.downstream.on_value(source, sample);
    }
}
