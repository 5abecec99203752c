use crate::locks::{LockOrder, OrderedMutex};
use crate::sample::{Sample, Severity};
use crate::source::{DataSource, SourceListener};
use crate::time::{SharedClock, Timestamp};
use std::sync::Arc;

#[derive(Debug, Default)]
struct RepeatState {
    previous: Option<Sample>,
    count: u32,
}

impl RepeatState {
    /// Turn pending repeats into a marker sample stamped no earlier than `when`.
    fn flush(&mut self, when: Timestamp) -> Option<Sample> {
        if self.count == 0 {
            return None;
        }
        let previous = self.previous.as_mut()?;
        if when > previous.time {
            previous.time = when;
        }
        previous.status = self.count;
        previous.severity = Severity::Repeat;
        self.count = 0;
        Some(previous.clone())
    }
}

/// Compresses runs of identical values.
///
/// Repeats of the last forwarded value are counted instead of forwarded. The
/// count goes out as one [`Severity::Repeat`] sample (status = count) when the
/// value changes, the source disconnects, the filter is stopped or the count
/// reaches `max_repeat`.
pub struct RepeatFilter {
    max_repeat: u32,
    clock: SharedClock,
    state: OrderedMutex<RepeatState>,
    downstream: Arc<dyn SourceListener>,
}

impl RepeatFilter {
    /// Filter flushing at the latest after `max_repeat` repeats.
    pub fn new(max_repeat: u32, clock: SharedClock, downstream: Arc<dyn SourceListener>) -> Self {
        Self {
            max_repeat: max_repeat.max(1),
            clock,
            state: OrderedMutex::new(LockOrder::RepeatFilter, "repeat filter", RepeatState::default()),
            downstream,
        }
    }

    /// Flush pending repeats and forget the previous value.
    pub fn stop(&self, source: &dyn DataSource) {
        let marker = {
            let mut state = self.state.lock();
            let marker = state.flush(self.clock.now());
            state.previous = None;
            marker
        };
        if let Some(marker) = marker {
            self.downstream.on_value(source, &marker);
        }
    }

    /// Repeats counted since the last forwarded sample.
    pub fn pending(&self) -> u32 {
        self.state.lock().count
    }
}

impl SourceListener for RepeatFilter {
    fn on_connect(&self, source: &dyn DataSource, when: Timestamp) {
        {
            let mut state = self.state.lock();
            state.previous = None;
            state.count = 0;
        }
        self.downstream.on_connect(source, when);
    }

    fn on_disconnect(&self, source: &dyn DataSource, when: Timestamp) {
        let marker = {
            let mut state = self.state.lock();
            let marker = state.flush(when);
            state.previous = None;
            marker
        };
        if let Some(marker) = marker {
            self.downstream.on_value(source, &marker);
        }
        self.downstream.on_disconnect(source, when);
    }

    fn on_value(&self, source: &dyn DataSource, sample: &Sample) {
        let marker = {
            let mut state = self.state.lock();
            let repeated = state
                .previous
                .as_ref()
                .is_some_and(|previous| previous.value.same_value(&sample.value));
            if repeated {
                state.count += 1;
                if state.count < self.max_repeat {
                    return;
                }
                tracing::debug!(channel = source.name(), count = state.count, "max. repeat count reached");
                // Forced flush, stamped with host time; the value stays the reference.
                let marker = state.flush(self.clock.now());
                drop(state);
                if let Some(marker) = marker {
                    self.downstream.on_value(source, &marker);
                }
                return;
            }
            let marker = state.flush(sample.time);
            state.previous = Some(sample.clone());
            state.count = 0;
            marker
        };
        if let Some(marker) = marker {
            self.downstream.on_value(source, &marker);
        }
        self.downstream.on_value(source, sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Value;
    use crate::source::mock::testing::{Event, Recorder};
    use crate::source::mock::MockSource;
    use crate::time::{from_secs_f64, ManualClock};

    fn sample(secs: f64, v: f64) -> Sample {
        Sample::new(from_secs_f64(secs), Value::double(v))
    }

    fn setup(max_repeat: u32) -> (MockSource, Arc<Recorder>, RepeatFilter) {
        let clock: SharedClock = Arc::new(ManualClock::at_secs(100.0));
        let source = MockSource::new("pv", Arc::clone(&clock));
        let recorder = Recorder::new();
        let filter = RepeatFilter::new(max_repeat, clock, recorder.clone());
        (source, recorder, filter)
    }

    #[test]
    fn six_inputs_give_four_events() {
        let (source, recorder, filter) = setup(3);
        for (i, v) in [3.5, 3.5, 4.5, 4.5, 4.5, 4.5].iter().enumerate() {
            filter.on_value(&source, &sample(i as f64 + 1.0, *v));
        }
        let out = recorder.values();
        assert_eq!(out.len(), 4);

        assert_eq!(out[0], sample(1.0, 3.5));

        // Value change flushes one repeat, stamped with the new value's time.
        assert_eq!(out[1].severity, Severity::Repeat);
        assert_eq!(out[1].status, 1);
        assert_eq!(out[1].value, Value::double(3.5));
        assert_eq!(out[1].time, from_secs_f64(3.0));

        assert_eq!(out[2], sample(3.0, 4.5));

        // Third repeat forces a flush stamped with host time.
        assert_eq!(out[3].severity, Severity::Repeat);
        assert_eq!(out[3].status, 3);
        assert_eq!(out[3].time, from_secs_f64(100.0));
        assert_eq!(filter.pending(), 0);
    }

    #[test]
    fn disconnect_flushes_before_forwarding() {
        let (source, recorder, filter) = setup(100);
        filter.on_value(&source, &sample(1.0, 5.0));
        filter.on_value(&source, &sample(2.0, 5.0));
        filter.on_disconnect(&source, from_secs_f64(7.0));
        let events = recorder.events();
        assert_eq!(events.len(), 3);
        match &events[1] {
            Event::Value(s) => {
                assert_eq!(s.status, 1);
                assert_eq!(s.time, from_secs_f64(7.0));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(events[2], Event::Disconnected(from_secs_f64(7.0)));

        // The previous value was invalidated, so 5.0 passes again.
        filter.on_value(&source, &sample(8.0, 5.0));
        assert_eq!(recorder.values().last(), Some(&sample(8.0, 5.0)));
    }

    #[test]
    fn flush_never_moves_back_in_time() {
        let (source, recorder, filter) = setup(100);
        filter.on_value(&source, &sample(200.0, 1.0));
        filter.on_value(&source, &sample(201.0, 1.0));
        // Clock (100 s) is before the value's stamp.
        filter.stop(&source);
        let marker = recorder.values().pop().unwrap();
        assert_eq!(marker.severity, Severity::Repeat);
        assert_eq!(marker.time, from_secs_f64(200.0));
    }

    #[test]
    fn stop_without_repeats_sends_nothing() {
        let (source, recorder, filter) = setup(100);
        filter.on_value(&source, &sample(1.0, 1.0));
        filter.stop(&source);
        assert_eq!(recorder.values().len(), 1);
    }

    #[test]
    fn connect_resets_previous_value() {
        let (source, recorder, filter) = setup(100);
        filter.on_value(&source, &sample(1.0, 1.0));
        filter.on_value(&source, &sample(2.0, 1.0));
        filter.on_connect(&source, from_secs_f64(3.0));
        filter.on_value(&source, &sample(4.0, 1.0));
        // Repeat from before the connect is discarded, value passes again.
        assert_eq!(recorder.values(), vec![sample(1.0, 1.0), sample(4.0, 1.0)]);
    }
}
