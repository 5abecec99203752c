//! # Archive Engine
//!
//! A channel archiving daemon library. Channels (named live values provided
//! by a control system) are sampled by monitor or periodic poll, passed
//! through a chain of value filters into per-channel ring buffers, and
//! flushed to storage at a fixed write period.
//!
//! ## Crate Structure
//!
//! - **`engine`**: `Engine`, the owner of all groups and channels, and its
//!   main loop (`Engine::process`).
//! - **`channel`** / **`group`**: channel bookkeeping and reference-counted
//!   group disabling.
//! - **`sampler`**: the three sampling strategies (Monitor, Get,
//!   MonitoredGet) and their filter chains.
//! - **`filter`**: Disable, Repeat, Time and TimeSlot value filters.
//! - **`scheduler`**: the multi-period scan list driving periodic polls.
//! - **`source`**: the data source contract plus mock and simulated sources.
//! - **`data`**: the ring buffer and the storage writers.
//! - **`config`**: engine configuration loaded with Figment (TOML + env).
//! - **`logging`** / **`throttle`**: tracing setup and rate-limited warnings.
//! - **`locks`**: the global lock order, asserted in debug builds.
//! - **`error`**: `ArchiveError`, the crate-wide error type.

pub mod channel;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod filter;
pub mod group;
pub mod locks;
pub mod logging;
pub mod sample;
pub mod sampler;
pub mod scheduler;
pub mod source;
pub mod throttle;
pub mod time;

pub use channel::{Channel, ChannelStatus};
pub use config::{ChannelConfig, EngineConfig, GroupConfig};
pub use engine::{Engine, EngineContext, EngineStatus, ProcessStep};
pub use error::{AppResult, ArchiveError};
pub use group::{Group, GroupStatus};
pub use sample::{Metadata, Sample, Severity, Value, ValueShape, ValueType};
pub use sampler::{Sampler, SamplingMode};
pub use scheduler::{Scannable, Scheduler};
pub use source::{DataSource, SourceContext, SourceListener, SourceState};
pub use time::{Clock, ManualClock, SharedClock, SystemClock, Timestamp};
