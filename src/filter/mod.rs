//! Value filters.
//!
//! Each filter is a [`SourceListener`](crate::source::SourceListener) that
//! forwards to one downstream listener, possibly suppressing or rewriting
//! values. Samplers compose them into a chain ending in their buffer sink:
//!
//! ```text
//! Monitor:       Disable -> Time -> sink
//! Get:           Disable -> Repeat -> Time -> sink
//! MonitoredGet:  Disable -> TimeSlot -> Repeat -> Time -> sink
//! ```
//!
//! A filter never holds its own lock while calling downstream.

mod disable;
mod repeat;
mod time;
mod time_slot;

pub use disable::DisableFilter;
pub use repeat::RepeatFilter;
pub use time::TimeFilter;
pub use time_slot::TimeSlotFilter;
