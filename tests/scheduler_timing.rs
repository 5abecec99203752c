//! Scan list timing over a simulated quarter minute.

use archive_engine::time::Clock;
use archive_engine::{ManualClock, Scannable, Scheduler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

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

/// Step `clock` in 0.1 s increments for `secs`, scanning whenever due.
fn run(clock: &ManualClock, scheduler: &Scheduler, secs: u32) {
    for _ in 0..secs * 10 {
        clock.advance(0.1);
        let now = clock.now();
        if scheduler.due_time().is_some_and(|due| due <= now) {
            scheduler.scan(now);
        }
    }
}

fn assert_close(actual: usize, expected: usize) {
    assert!(
        actual.abs_diff(expected) <= 1,
        "expected about {expected} scans, got {actual}"
    );
}

#[test]
fn test_scan_counts_follow_periods() {
    let clock = Arc::new(ManualClock::at_secs(0.0));
    let scheduler = Scheduler::new(clock.clone());
    let fast = Counter::new("fast");
    let normal = Counter::new("normal");
    let slow = Counter::new("slow");
    scheduler.add(fast.clone(), 0.5);
    scheduler.add(normal.clone(), 1.0);
    scheduler.add(slow.clone(), 1.5);
    assert_eq!(scheduler.periods().len(), 3);

    run(&clock, &scheduler, 15);

    assert_close(fast.scans(), 30);
    assert_close(normal.scans(), 15);
    assert_close(slow.scans(), 10);
}

#[test]
fn test_removed_item_is_no_longer_scanned() {
    let clock = Arc::new(ManualClock::at_secs(0.0));
    let scheduler = Scheduler::new(clock.clone());
    let kept = Counter::new("kept");
    let removed = Counter::new("removed");
    let removed_dyn: Arc<dyn Scannable> = removed.clone();
    scheduler.add(kept.clone(), 1.0);
    scheduler.add(Arc::clone(&removed_dyn), 1.0);

    run(&clock, &scheduler, 5);
    let before = removed.scans();
    assert_close(before, 5);

    scheduler.remove(&removed_dyn);
    assert_eq!(scheduler.len(), 1);
    run(&clock, &scheduler, 5);
    assert_eq!(removed.scans(), before);
    assert_close(kept.scans(), 10);
}

#[test]
fn test_empty_scan_list_is_never_due() {
    let clock = Arc::new(ManualClock::at_secs(0.0));
    let scheduler = Scheduler::new(clock.clone());
    let item: Arc<dyn Scannable> = Counter::new("only");
    scheduler.add(Arc::clone(&item), 2.0);
    assert!(scheduler.is_due_at_all());

    scheduler.remove(&item);
    assert!(!scheduler.is_due_at_all());
    assert_eq!(scheduler.due_time(), None);
    run(&clock, &scheduler, 3);
}
