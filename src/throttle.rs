//! Rate-limited warnings for data-quality problems.
//!
//! A misbehaving source can produce a bad time stamp on every update. Those
//! messages go through a [`ThrottledLogger`], which lets one message per
//! [`LogCategory`] through per interval and counts the rest.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Kinds of throttled messages, each with its own interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    /// Sample stamped too far ahead of the local clock.
    FutureTimestamp,
    /// Sample older than the last one accepted by the time filter.
    BackInTime,
    /// Sample older than the last one already in a channel's buffer.
    BufferBackInTime,
    /// A ring buffer dropped samples since the last write.
    BufferOverwrite,
}

impl LogCategory {
    /// Minimum time between two emitted messages of this category.
    pub fn interval(self) -> Duration {
        match self {
            LogCategory::FutureTimestamp
            | LogCategory::BackInTime
            | LogCategory::BufferBackInTime => Duration::from_secs(60 * 60),
            LogCategory::BufferOverwrite => Duration::from_secs(60),
        }
    }

    /// Stable name used as the `category` log field.
    pub fn as_str(self) -> &'static str {
        match self {
            LogCategory::FutureTimestamp => "future_timestamp",
            LogCategory::BackInTime => "back_in_time",
            LogCategory::BufferBackInTime => "buffer_back_in_time",
            LogCategory::BufferOverwrite => "buffer_overwrite",
        }
    }
}

#[derive(Debug)]
struct Slot {
    last: Instant,
    suppressed: u64,
}

/// Logging port that emits at most one warning per category and interval.
///
/// Constructed once per engine and shared by `Arc`.
#[derive(Debug, Default)]
pub struct ThrottledLogger {
    slots: Mutex<HashMap<LogCategory, Slot>>,
    interval_override: Option<Duration>,
}

impl ThrottledLogger {
    /// Logger using each category's own interval.
    pub fn new() -> Self {
        Self::default()
    }

    /// Logger using one fixed interval for every category.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            interval_override: Some(interval),
        }
    }

    /// Emit `message` as a warning unless `category` fired within its interval.
    ///
    /// Returns whether the message was emitted.
    pub fn warn(&self, category: LogCategory, channel: &str, message: fmt::Arguments<'_>) -> bool {
        let interval = self.interval_override.unwrap_or_else(|| category.interval());
        let now = Instant::now();
        let suppressed = {
            let mut slots = self.slots.lock();
            match slots.get_mut(&category) {
                Some(slot) if now.duration_since(slot.last) < interval => {
                    slot.suppressed += 1;
                    return false;
                }
                Some(slot) => {
                    slot.last = now;
                    std::mem::take(&mut slot.suppressed)
                }
                None => {
                    slots.insert(
                        category,
                        Slot {
                            last: now,
                            suppressed: 0,
                        },
                    );
                    0
                }
            }
        };
        if suppressed > 0 {
            tracing::warn!(
                channel,
                category = category.as_str(),
                suppressed,
                "{message} ({suppressed} similar messages suppressed)"
            );
        } else {
            tracing::warn!(channel, category = category.as_str(), "{message}");
        }
        true
    }

    /// Messages of `category` suppressed since the last emitted one.
    pub fn suppressed(&self, category: LogCategory) -> u64 {
        self.slots
            .lock()
            .get(&category)
            .map_or(0, |slot| slot.suppressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn second_message_is_suppressed() {
        let logger = ThrottledLogger::new();
        assert!(logger.warn(
            LogCategory::FutureTimestamp,
            "BL:current",
            format_args!("time stamp too far in the future")
        ));
        assert!(!logger.warn(
            LogCategory::FutureTimestamp,
            "BL:current",
            format_args!("time stamp too far in the future")
        ));
        assert_eq!(logger.suppressed(LogCategory::FutureTimestamp), 1);
        assert!(logs_contain("time stamp too far in the future"));
    }

    #[test]
    fn categories_are_independent() {
        let logger = ThrottledLogger::new();
        assert!(logger.warn(LogCategory::BackInTime, "a", format_args!("back")));
        assert!(logger.warn(LogCategory::BufferOverwrite, "a", format_args!("overwrite")));
        assert_eq!(logger.suppressed(LogCategory::BackInTime), 0);
    }

    #[test]
    #[traced_test]
    fn fixed_interval_overrides_category() {
        let logger = ThrottledLogger::with_interval(Duration::from_secs(3600));
        logger.warn(LogCategory::BufferOverwrite, "x", format_args!("first"));
        logger.warn(LogCategory::BufferOverwrite, "x", format_args!("second"));
        logger.warn(LogCategory::BufferOverwrite, "x", format_args!("third"));
        assert_eq!(logger.suppressed(LogCategory::BufferOverwrite), 2);

        let logger = ThrottledLogger::with_interval(Duration::ZERO);
        assert!(logger.warn(LogCategory::BufferOverwrite, "x", format_args!("again")));
        assert!(logger.warn(LogCategory::BufferOverwrite, "x", format_args!("again")));
        assert!(logs_contain("again"));
    }

    #[test]
    fn intervals_match_categories() {
        assert_eq!(LogCategory::BufferOverwrite.interval(), Duration::from_secs(60));
        assert_eq!(LogCategory::BackInTime.interval(), Duration::from_secs(3600));
    }
}
