use crate::locks::{LockOrder, OrderedMutex};
use crate::sample::Sample;
use crate::source::{DataSource, SourceListener};
use crate::throttle::{LogCategory, ThrottledLogger};
use crate::time::{secs_between, SharedClock, Timestamp};
use std::sync::Arc;

/// Drops values with implausible time stamps.
///
/// A value is dropped when it lies more than `ignored_future` seconds ahead of
/// the local clock, or before the last value this filter passed. Connect and
/// disconnect events always pass.
pub struct TimeFilter {
    ignored_future: f64,
    clock: SharedClock,
    throttle: Arc<ThrottledLogger>,
    last_stamp: OrderedMutex<Option<Timestamp>>,
    downstream: Arc<dyn SourceListener>,
}

impl TimeFilter {
    /// Filter rejecting stamps more than `ignored_future` seconds ahead.
    pub fn new(
        ignored_future: f64,
        clock: SharedClock,
        throttle: Arc<ThrottledLogger>,
        downstream: Arc<dyn SourceListener>,
    ) -> Self {
        Self {
            ignored_future,
            clock,
            throttle,
            last_stamp: OrderedMutex::new(LockOrder::TimeFilter, "time filter", None),
            downstream,
        }
    }
}

impl SourceListener for TimeFilter {
    fn on_connect(&self, source: &dyn DataSource, when: Timestamp) {
        self.downstream.on_connect(source, when);
    }

    fn on_disconnect(&self, source: &dyn DataSource, when: Timestamp) {
        self.downstream.on_disconnect(source, when);
    }

    fn on_value(&self, source: &dyn DataSource, sample: &Sample) {
        let future = secs_between(sample.time, self.clock.now());
        if future > self.ignored_future {
            self.throttle.warn(
                LogCategory::FutureTimestamp,
                source.name(),
                format_args!("ignoring futuristic time stamp {}", sample.time.to_rfc3339()),
            );
            return;
        }
        {
            let mut last = self.last_stamp.lock();
            if last.is_some_and(|last| sample.time < last) {
                drop(last);
                self.throttle.warn(
                    LogCategory::BackInTime,
                    source.name(),
                    format_args!("ignoring back-in-time time stamp {}", sample.time.to_rfc3339()),
                );
                return;
            }
            *last = Some(sample.time);
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
    use tracing_test::traced_test;

    fn sample(secs: f64, v: f64) -> Sample {
        Sample::new(from_secs_f64(secs), Value::double(v))
    }

    fn setup() -> (MockSource, Arc<Recorder>, TimeFilter) {
        let clock: SharedClock = Arc::new(ManualClock::at_secs(1000.0));
        let source = MockSource::new("pv", Arc::clone(&clock));
        let recorder = Recorder::new();
        let filter = TimeFilter::new(60.0, clock, Arc::new(ThrottledLogger::new()), recorder.clone());
        (source, recorder, filter)
    }

    #[test]
    #[traced_test]
    fn drops_future_stamps() {
        let (source, recorder, filter) = setup();
        filter.on_value(&source, &sample(1059.0, 1.0));
        filter.on_value(&source, &sample(1061.0, 2.0));
        assert_eq!(recorder.values(), vec![sample(1059.0, 1.0)]);
        assert!(logs_contain("futuristic"));
    }

    #[test]
    fn drops_back_in_time_but_accepts_equal() {
        let (source, recorder, filter) = setup();
        filter.on_value(&source, &sample(500.0, 1.0));
        filter.on_value(&source, &sample(499.0, 2.0));
        filter.on_value(&source, &sample(500.0, 3.0));
        assert_eq!(recorder.values(), vec![sample(500.0, 1.0), sample(500.0, 3.0)]);
    }

    #[test]
    fn state_events_always_pass() {
        let (source, recorder, filter) = setup();
        filter.on_value(&source, &sample(900.0, 1.0));
        filter.on_disconnect(&source, from_secs_f64(10.0));
        filter.on_connect(&source, from_secs_f64(11.0));
        assert_eq!(
            recorder.events()[1..],
            [
                Event::Disconnected(from_secs_f64(10.0)),
                Event::Connected(from_secs_f64(11.0))
            ]
        );
    }
}
