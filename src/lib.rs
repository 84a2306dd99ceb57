//! In-process watchdog that samples task/thread counts and dumps runtime
//! profiles when a concurrency anomaly shows up.

pub mod config;
pub mod global;
pub mod profile;
pub mod sampler;
pub mod sink;
pub mod threshold;
pub mod throttle;
pub mod watchdog;

pub use config::{load_config, ConfigError, ProfileConfig, ProfileSpec, SinkConfig, WatchdogConfig};
pub use profile::{Profile, ProfileProducer, ProfileRegistry, TrackedProfile};
pub use sampler::{ConcurrencySampler, SamplerKind};
pub use sink::{Sink, SinkError};
pub use threshold::{RunningStats, TriggerPolicy};
pub use watchdog::{
    DumpOutcome, Lifecycle, TickReport, Watchdog, WatchdogBuilder, WatchdogError, WatchdogStatus,
};
