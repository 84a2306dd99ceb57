/// Trigger evaluation: decides each tick which profiles should be dumped.
///
/// The engine owns the running average of concurrency samples. It compares a
/// new sample against the average *before* folding the sample in, so a spike
/// cannot raise the baseline enough to mask itself.
use serde::Serialize;

/// Rule that decides whether a profile is dumped on a given tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TriggerPolicy {
    /// Fire when the concurrency sample is `>=` the limit.
    HardLimit(usize),
    /// Fire when `sample / prior average > ratio`.
    RelativeGrowth(f64),
    /// Fire when the profile's own entry count is `>` the threshold.
    ProfileCount(usize),
}

impl TriggerPolicy {
    fn fires(&self, sample: usize, prior: &RunningStats, profile_count: Option<usize>) -> bool {
        match *self {
            TriggerPolicy::HardLimit(limit) => sample >= limit,
            TriggerPolicy::RelativeGrowth(ratio) => {
                // No baseline yet.
                if prior.samples == 0 || prior.average <= 0.0 {
                    return false;
                }
                sample as f64 / prior.average > ratio
            }
            TriggerPolicy::ProfileCount(threshold) => {
                profile_count.is_some_and(|count| count > threshold)
            }
        }
    }
}

/// Running mean of concurrency samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RunningStats {
    pub average: f64,
    pub samples: u64,
}

impl RunningStats {
    /// Fold one sample into the mean.
    pub fn record(&mut self, sample: usize) {
        self.samples += 1;
        let n = self.samples as f64;
        self.average = (sample as f64 + self.average * (n - 1.0)) / n;
    }
}

/// Per-watchdog trigger evaluator.
#[derive(Debug, Clone)]
pub struct ThresholdEngine {
    triggers: Vec<(String, TriggerPolicy)>,
    stats: RunningStats,
}

impl ThresholdEngine {
    pub fn new(triggers: Vec<(String, TriggerPolicy)>) -> Self {
        Self {
            triggers,
            stats: RunningStats::default(),
        }
    }

    /// Evaluate all profiles against `sample` and update the running mean.
    ///
    /// `profile_count` returns a profile's live entry count, or `None` when
    /// the producer doesn't know the profile. Returns triggered profile names
    /// in configuration order.
    pub fn evaluate<F>(&mut self, sample: usize, profile_count: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<usize>,
    {
        let prior = self.stats;

        let triggered = self
            .triggers
            .iter()
            .filter(|(name, policy)| {
                let count = match policy {
                    TriggerPolicy::ProfileCount(_) => profile_count(name.as_str()),
                    _ => None,
                };
                policy.fires(sample, &prior, count)
            })
            .map(|(name, _)| name.clone())
            .collect();

        self.stats.record(sample);
        triggered
    }

    pub fn stats(&self) -> RunningStats {
        self.stats
    }
}
