//! Lock ordering for the engine's lockable units.
//!
//! Every engine object that can be locked (engine, group, channel, sampler,
//! the stateful filters, data sources and the scheduler) owns an
//! [`OrderedMutex`] tagged with a [`LockOrder`]. When a thread holds more
//! than one of them they must have been taken in strictly increasing order:
//!
//! ```text
//! Engine(10) -> Group(20) -> Channel(30) -> Sampler(40)
//!     -> RepeatFilter(50) -> DisableFilter(51) -> TimeFilter(52) -> TimeSlotFilter(53)
//!     -> DataSource(60) -> Scheduler(70)
//! ```
//!
//! Data source callbacks arrive in the opposite direction (source, filter,
//! sampler, channel, group). Code on those paths never calls "upwards" while
//! holding a lock: it drops its own lock with [`OrderedGuard::unlocked`],
//! makes the call and re-acquires.
//!
//! Debug builds keep a per-thread list of held ordinals and assert the order
//! on every acquisition. Release builds compile this to a plain
//! `parking_lot::Mutex`.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::ops::{Deref, DerefMut};

/// Lock order ordinals; lower values must be locked first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockOrder {
    /// The engine's channel and group lists.
    Engine = 10,
    /// One group.
    Group = 20,
    /// One channel.
    Channel = 30,
    /// A channel's sampler and its ring buffer.
    Sampler = 40,
    /// Repeat compression state.
    RepeatFilter = 50,
    /// Disable filter's held value.
    DisableFilter = 51,
    /// Last accepted time stamp.
    TimeFilter = 52,
    /// Next time slot.
    TimeSlotFilter = 53,
    /// State inside a data source implementation.
    DataSource = 60,
    /// The scan list.
    Scheduler = 70,
}

#[cfg(debug_assertions)]
mod held {
    use super::LockOrder;
    use std::cell::RefCell;

    thread_local! {
        static HELD: RefCell<Vec<(LockOrder, &'static str)>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) fn acquire(order: LockOrder, name: &'static str) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some((top, top_name)) = held.iter().max_by_key(|(o, _)| *o) {
                assert!(
                    order > *top,
                    "lock order violation: taking {name} ({order:?}) while holding {top_name} ({top:?})"
                );
            }
            held.push((order, name));
        });
    }

    pub(super) fn release(order: LockOrder) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|(o, _)| *o == order) {
                held.remove(pos);
            }
        });
    }

    pub(super) fn holds_any() -> bool {
        HELD.with(|held| !held.borrow().is_empty())
    }
}

#[cfg(not(debug_assertions))]
mod held {
    use super::LockOrder;

    #[inline]
    pub(super) fn acquire(_order: LockOrder, _name: &'static str) {}

    #[inline]
    pub(super) fn release(_order: LockOrder) {}

    #[inline]
    pub(super) fn holds_any() -> bool {
        false
    }
}

/// Whether the current thread holds any ordered lock (always `false` in release builds).
pub fn holds_any_lock() -> bool {
    held::holds_any()
}

/// A mutex that participates in the global lock order.
pub struct OrderedMutex<T> {
    order: LockOrder,
    name: &'static str,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    /// Create a mutex at `order`; `name` is used in order violation reports.
    pub fn new(order: LockOrder, name: &'static str, value: T) -> Self {
        Self {
            order,
            name,
            inner: Mutex::new(value),
        }
    }

    /// Lock, asserting the lock order in debug builds.
    pub fn lock(&self) -> OrderedGuard<'_, T> {
        held::acquire(self.order, self.name);
        OrderedGuard {
            order: self.order,
            name: self.name,
            inner: self.inner.lock(),
        }
    }

    /// This mutex's position in the lock order.
    pub fn order(&self) -> LockOrder {
        self.order
    }

    /// Consume the mutex and return the protected value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: fmt::Debug> fmt::Debug for OrderedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedMutex")
            .field("order", &self.order)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Guard returned by [`OrderedMutex::lock`].
pub struct OrderedGuard<'a, T> {
    order: LockOrder,
    name: &'static str,
    inner: MutexGuard<'a, T>,
}

impl<T> OrderedGuard<'_, T> {
    /// Release the lock while `f` runs, then re-acquire it.
    ///
    /// Use around any call that may re-enter this object or that crosses into
    /// code positioned earlier in the lock order.
    pub fn unlocked<F, R>(&mut self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        held::release(self.order);
        let name = self.name;
        let order = self.order;
        let result = MutexGuard::unlocked(&mut self.inner, f);
        held::acquire(order, name);
        result
    }

    /// Block on `condvar`, releasing the lock while waiting.
    pub fn wait(&mut self, condvar: &Condvar) {
        held::release(self.order);
        condvar.wait(&mut self.inner);
        held::acquire(self.order, self.name);
    }
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> Drop for OrderedGuard<'_, T> {
    fn drop(&mut self) {
        held::release(self.order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increasing_order_is_accepted() {
        let engine = OrderedMutex::new(LockOrder::Engine, "engine", 1);
        let channel = OrderedMutex::new(LockOrder::Channel, "channel", 2);
        let e = engine.lock();
        let c = channel.lock();
        assert_eq!(*e + *c, 3);
        drop(c);
        drop(e);
        assert!(!holds_any_lock());
    }

    #[test]
    fn guard_release_allows_inverted_call() {
        let channel = OrderedMutex::new(LockOrder::Channel, "channel", 0);
        let group = OrderedMutex::new(LockOrder::Group, "group", 0);
        let mut c = channel.lock();
        *c += 1;
        c.unlocked(|| {
            *group.lock() += 1;
        });
        *c += 1;
        assert_eq!(*c, 2);
        drop(c);
        assert_eq!(*group.lock(), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    fn inverted_order_is_detected() {
        let result = std::thread::spawn(|| {
            let channel = OrderedMutex::new(LockOrder::Channel, "channel", ());
            let group = OrderedMutex::new(LockOrder::Group, "group", ());
            let _c = channel.lock();
            let _g = group.lock();
        })
        .join();
        assert!(result.is_err());
    }

    #[test]
    fn order_is_reported() {
        let m = OrderedMutex::new(LockOrder::Scheduler, "scan list", Vec::<u8>::new());
        assert_eq!(m.order(), LockOrder::Scheduler);
        assert!(m.into_inner().is_empty());
    }
}
