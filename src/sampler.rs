/// Sources of the per-tick concurrency sample.
use crate::profile::runtime::{alive_tasks, os_thread_count};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Reads the current concurrency level of the host process.
pub trait ConcurrencySampler: Send + Sync {
    fn sample(&self) -> usize;
}

impl<F> ConcurrencySampler for F
where
    F: Fn() -> usize + Send + Sync,
{
    fn sample(&self) -> usize {
        self()
    }
}

/// Built-in samplers selectable from config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    /// Alive tasks in the tokio runtime the watchdog runs on.
    #[default]
    Tasks,
    /// OS threads in this process.
    Threads,
}

impl SamplerKind {
    pub fn sampler(self) -> Arc<dyn ConcurrencySampler> {
        match self {
            SamplerKind::Tasks => Arc::new(alive_tasks),
            SamplerKind::Threads => Arc::new(os_thread_count),
        }
    }
}
