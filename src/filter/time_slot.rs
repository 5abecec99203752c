use crate::locks::{LockOrder, OrderedMutex};
use crate::sample::Sample;
use crate::source::{DataSource, SourceListener};
use crate::time::{round_time_up, Timestamp};
use std::sync::Arc;

/// Passes at most one value per time slot of `period` seconds.
///
/// Slots are aligned to multiples of the period since the epoch, so channels
/// sampled this way line up with each other.
pub struct TimeSlotFilter {
    period: f64,
    next_slot: OrderedMutex<Option<Timestamp>>,
    downstream: Arc<dyn SourceListener>,
}

impl TimeSlotFilter {
    /// Filter with slots of `period` seconds.
    pub fn new(period: f64, downstream: Arc<dyn SourceListener>) -> Self {
        Self {
            period,
            next_slot: OrderedMutex::new(LockOrder::TimeSlotFilter, "time slot filter", None),
            downstream,
        }
    }
}

impl SourceListener for TimeSlotFilter {
    fn on_connect(&self, source: &dyn DataSource, when: Timestamp) {
        self.downstream.on_connect(source, when);
    }

    fn on_disconnect(&self, source: &dyn DataSource, when: Timestamp) {
        self.downstream.on_disconnect(source, when);
    }

    fn on_value(&self, source: &dyn DataSource, sample: &Sample) {
        {
            let mut next_slot = self.next_slot.lock();
            if next_slot.is_some_and(|slot| sample.time < slot) {
                return;
            }
            *next_slot = Some(round_time_up(sample.time, self.period));
        }
        self.downstream.on_value(source, sample);
    }
}
