//! Multi-period scan list.
//!
//! Poll-driven samplers register a [`Scannable`] with the [`Scheduler`] at
//! their scan period. Items are bucketed by period (periods within 0.05 s
//! share a bucket); each bucket keeps its own next due time, aligned to
//! multiples of its period. The engine loop asks for [`Scheduler::due_time`]
//! and calls [`Scheduler::scan`] once it has passed.

use crate::locks::{LockOrder, OrderedMutex};
use crate::source::same_listener;
use crate::time::{add_secs, round_time_up, SharedClock, Timestamp};
use std::sync::Arc;

/// Periods closer than this share a bucket.
pub const PERIOD_TOLERANCE: f64 = 0.05;

/// Something that is polled periodically.
pub trait Scannable: Send + Sync {
    /// Name for diagnostics.
    fn name(&self) -> &str;

    /// Perform one poll.
    fn scan(&self);
}

struct Bucket {
    period: f64,
    items: Vec<Arc<dyn Scannable>>,
    next_scan: Option<Timestamp>,
}

impl Bucket {
    fn new(period: f64, now: Timestamp) -> Self {
        let mut bucket = Self {
            period,
            items: Vec::new(),
            next_scan: None,
        };
        bucket.compute_next_scan(now);
        bucket
    }

    /// Advance by one period, or jump to the next boundary after `now` if that passed already.
    fn compute_next_scan(&mut self, now: Timestamp) {
        let next = self
            .next_scan
            .map(|t| add_secs(t, self.period))
            .filter(|t| *t >= now)
            .unwrap_or_else(|| round_time_up(now, self.period));
        self.next_scan = Some(next);
    }
}

#[derive(Default)]
struct ScanListState {
    buckets: Vec<Bucket>,
    next_due: Option<Timestamp>,
}

impl ScanListState {
    fn recompute_due(&mut self) {
        self.next_due = self.buckets.iter().filter_map(|b| b.next_scan).min();
    }
}

/// Buckets of scannable items by period.
pub struct Scheduler {
    clock: SharedClock,
    state: OrderedMutex<ScanListState>,
}

impl Scheduler {
    /// Empty scan list.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            state: OrderedMutex::new(LockOrder::Scheduler, "scan list", ScanListState::default()),
        }
    }

    /// Scan `item` every `period` seconds, moving it if it was already registered.
    pub fn add(&self, item: Arc<dyn Scannable>, period: f64) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let first_item = state.buckets.is_empty();
        remove_item(&mut state, &item);

        let index = match state
            .buckets
            .iter()
            .position(|b| (b.period - period).abs() < PERIOD_TOLERANCE)
        {
            Some(index) => index,
            None => {
                tracing::debug!(period, "new scan bucket");
                state.buckets.push(Bucket::new(period, now));
                state.buckets.len() - 1
            }
        };
        tracing::trace!(item = item.name(), period, "added to scan list");
        state.buckets[index].items.push(item);
        let due = state.buckets[index].next_scan;
        if first_item || due < state.next_due || state.next_due.is_none() {
            state.next_due = due;
        }
    }

    /// Stop scanning `item`; a no-op if it is not registered.
    pub fn remove(&self, item: &Arc<dyn Scannable>) {
        let mut state = self.state.lock();
        remove_item(&mut state, item);
        state.recompute_due();
    }

    /// Whether any item is registered.
    pub fn is_due_at_all(&self) -> bool {
        !self.state.lock().buckets.is_empty()
    }

    /// Earliest time any bucket is due.
    pub fn due_time(&self) -> Option<Timestamp> {
        self.state.lock().next_due
    }

    /// Number of registered items.
    pub fn len(&self) -> usize {
        self.state.lock().buckets.iter().map(|b| b.items.len()).sum()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        !self.is_due_at_all()
    }

    /// Distinct scan periods in use.
    pub fn periods(&self) -> Vec<f64> {
        self.state.lock().buckets.iter().map(|b| b.period).collect()
    }

    /// Scan every bucket due at or before `deadline`.
    ///
    /// Items are scanned without the scan list locked, so they may add or
    /// remove items (themselves included).
    pub fn scan(&self, deadline: Timestamp) {
        let due: Vec<Arc<dyn Scannable>> = {
            let now = self.clock.now();
            let mut state = self.state.lock();
            let mut due = Vec::new();
            for bucket in state.buckets.iter_mut() {
                if bucket.next_scan.is_some_and(|t| t <= deadline) {
                    due.extend(bucket.items.iter().cloned());
                    bucket.compute_next_scan(now);
                }
            }
            state.recompute_due();
            due
        };
        for item in &due {
            item.scan();
        }
    }
}

fn remove_item(state: &mut ScanListState, item: &Arc<dyn Scannable>) {
    for bucket in state.buckets.iter_mut() {
        bucket.items.retain(|i| !same_listener(i, item));
    }
    state.buckets.retain(|b| {
        if b.items.is_empty() {
            tracing::debug!(period = b.period, "dropping empty scan bucket");
            false
        } else {
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{to_secs_f64, Clock, ManualClock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        name: String,
        scans: AtomicUsize,
    }

    impl Counter {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                scans: AtomicUsize::new(0),
            })
        }

        fn scans(&self) -> usize {
            self.scans.load(Ordering::SeqCst)
        }
    }

    impl Scannable for Counter {
        fn name(&self) -> &str {
            &self.name
        }

        fn scan(&self) {
            self.scans.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn first_due_time_is_next_boundary() {
        let clock = Arc::new(ManualClock::at_secs(100.3));
        let scheduler = Scheduler::new(clock);
        assert!(!scheduler.is_due_at_all());
        assert_eq!(scheduler.due_time(), None);
        scheduler.add(Counter::new("a"), 2.0);
        scheduler.add(Counter::new("b"), 0.5);
        assert!(scheduler.is_due_at_all());
        assert!((to_secs_f64(scheduler.due_time().unwrap()) - 100.5).abs() < 1e-6);
    }

    #[test]
    fn close_periods_share_a_bucket() {
        let scheduler = Scheduler::new(Arc::new(ManualClock::at_secs(0.0)));
        scheduler.add(Counter::new("a"), 1.0);
        scheduler.add(Counter::new("b"), 1.04);
        scheduler.add(Counter::new("c"), 1.1);
        assert_eq!(scheduler.periods(), vec![1.0, 1.1]);
        assert_eq!(scheduler.len(), 3);
    }

    #[test]
    fn re_adding_moves_item() {
        let scheduler = Scheduler::new(Arc::new(ManualClock::at_secs(0.0)));
        let a: Arc<dyn Scannable> = Counter::new("a");
        scheduler.add(Arc::clone(&a), 1.0);
        scheduler.add(Arc::clone(&a), 5.0);
        assert_eq!(scheduler.periods(), vec![5.0]);
        assert_eq!(scheduler.len(), 1);
        scheduler.remove(&a);
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.due_time(), None);
    }

    #[test]
    fn scan_only_runs_due_buckets() {
        let clock = Arc::new(ManualClock::at_secs(10.0));
        let scheduler = Scheduler::new(clock.clone());
        let fast = Counter::new("fast");
        let slow = Counter::new("slow");
        scheduler.add(fast.clone(), 1.0);
        scheduler.add(slow.clone(), 10.0);

        clock.advance(1.0);
        scheduler.scan(clock.now());
        assert_eq!((fast.scans(), slow.scans()), (1, 0));
        assert!((to_secs_f64(scheduler.due_time().unwrap()) - 12.0).abs() < 1e-6);

        clock.advance(9.0);
        scheduler.scan(clock.now());
        assert_eq!((fast.scans(), slow.scans()), (2, 1));
    }
}
