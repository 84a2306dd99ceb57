/// Concurrency watchdog for the host process.
///
/// Runs as one background tokio task. Every poll interval it samples the
/// concurrency level, evaluates each configured profile's trigger, and dumps
/// triggered profiles to the sink. Dumps of the same profile are spaced at
/// least `throttle` apart; throttled dumps are dropped silently.
///
/// All mutable state (running stats, last-dump registry, lifecycle) sits
/// behind one lock per instance. The lock only covers bookkeeping: profile
/// serialization and sink I/O run outside it, so an action may call
/// `Watchdog::status` without deadlocking.
use crate::config::{ConfigError, ProfileSpec, WatchdogConfig};
use crate::profile::{Profile, ProfileProducer, ProfileRegistry};
use crate::sampler::ConcurrencySampler;
use crate::sink::{run_action, Delivery, ProfileAction, Sink, SinkError};
use crate::threshold::{RunningStats, ThresholdEngine, TriggerPolicy};
use crate::throttle::LastDumpRegistry;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a watchdog instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// What happened to one triggered profile during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpOutcome {
    Written,
    /// Dropped because the previous dump was less than `throttle` ago.
    Throttled,
    /// The producer doesn't know this profile.
    Missing,
    /// The sink or action failed; the throttle stamp still moved.
    Failed,
}

/// Result of one `check_and_dump` pass.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub sample: usize,
    pub triggered: Vec<String>,
    pub outcomes: Vec<(String, DumpOutcome)>,
}

impl TickReport {
    /// Number of dumps delivered this tick.
    pub fn written(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| *o == DumpOutcome::Written)
            .count()
    }
}

/// Point-in-time view of a watchdog, for callers inspecting it.
#[derive(Debug, Clone, Serialize)]
pub struct WatchdogStatus {
    pub state: Lifecycle,
    pub stats: RunningStats,
    pub last_dumps: BTreeMap<String, DateTime<Utc>>,
    pub dumps_written: u64,
    pub dumps_failed: u64,
}

/// Errors from `Watchdog::start` and `global::start`.
#[derive(Debug)]
pub enum WatchdogError {
    /// `start` was called outside a tokio runtime.
    NoRuntime,
    /// The loop is already running on this instance.
    AlreadyRunning,
    Config(ConfigError),
}

impl std::fmt::Display for WatchdogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchdogError::NoRuntime => {
                write!(f, "watchdog must be started from within a tokio runtime")
            }
            WatchdogError::AlreadyRunning => write!(f, "watchdog is already running"),
            WatchdogError::Config(e) => write!(f, "invalid watchdog config: {e}"),
        }
    }
}

impl std::error::Error for WatchdogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchdogError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for WatchdogError {
    fn from(e: ConfigError) -> Self {
        WatchdogError::Config(e)
    }
}

/// Assembles a `Watchdog` from config plus the parts a config file can't hold.
pub struct WatchdogBuilder {
    config: WatchdogConfig,
    sink: Option<Sink>,
    producer: Option<Arc<dyn ProfileProducer>>,
    sampler: Option<Arc<dyn ConcurrencySampler>>,
    actions: Vec<(String, ProfileAction)>,
}

impl WatchdogBuilder {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            sink: None,
            producer: None,
            sampler: None,
            actions: Vec::new(),
        }
    }

    /// Use this sink instead of the one in the config.
    pub fn sink(mut self, sink: Sink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Profile producer. Defaults to `ProfileRegistry::with_runtime_profiles`.
    pub fn producer(mut self, producer: Arc<dyn ProfileProducer>) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Concurrency sampler. Defaults to the config's `sampler` kind.
    pub fn sampler(mut self, sampler: Arc<dyn ConcurrencySampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Hand `profile` to `action` on dump instead of writing it to the sink.
    pub fn action(
        mut self,
        profile: impl Into<String>,
        action: impl Fn(&dyn Profile) + Send + Sync + 'static,
    ) -> Self {
        self.actions.push((profile.into(), Arc::new(action)));
        self
    }

    pub fn build(self) -> Result<Watchdog, ConfigError> {
        let mut profiles = self.config.resolve_profiles()?;
        for (name, action) in self.actions {
            match profiles.iter_mut().find(|p| p.name == name) {
                Some(spec) => spec.action = Some(action),
                None => return Err(ConfigError::UnknownAction { profile: name }),
            }
        }

        let sink = match (self.sink, &self.config.sink) {
            (Some(sink), _) => Some(sink),
            (None, Some(sink_config)) => Some(Sink::from_config(sink_config)?),
            (None, None) => None,
        };
        // Profiles with an action never touch the sink.
        if sink.is_none() && profiles.iter().any(|p| p.action.is_none()) {
            return Err(ConfigError::MissingSink);
        }

        let producer = self.producer.unwrap_or_else(|| {
            Arc::new(ProfileRegistry::with_runtime_profiles()) as Arc<dyn ProfileProducer>
        });
        let sampler = self
            .sampler
            .unwrap_or_else(|| self.config.sampler.sampler());

        let engine = ThresholdEngine::new(
            profiles
                .iter()
                .map(|p| (p.name.clone(), p.trigger))
                .collect(),
        );

        Ok(Watchdog {
            inner: Arc::new(Inner {
                poll_interval: self.config.poll_interval(),
                throttle: self.config.throttle(),
                profiles,
                sink,
                producer,
                sampler,
                state: Mutex::new(State {
                    engine,
                    registry: LastDumpRegistry::new(),
                    lifecycle: Lifecycle::Idle,
                    cancel: None,
                    dumps_written: 0,
                    dumps_failed: 0,
                }),
            }),
        })
    }
}

/// Handle to a watchdog. Clones share the same instance.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
}

struct Inner {
    poll_interval: Duration,
    throttle: Duration,
    profiles: Vec<ProfileSpec>,
    sink: Option<Sink>,
    producer: Arc<dyn ProfileProducer>,
    sampler: Arc<dyn ConcurrencySampler>,
    state: Mutex<State>,
}

struct State {
    engine: ThresholdEngine,
    registry: LastDumpRegistry,
    lifecycle: Lifecycle,
    cancel: Option<CancellationToken>,
    dumps_written: u64,
    dumps_failed: u64,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("poll_interval", &self.inner.poll_interval)
            .field("throttle", &self.inner.throttle)
            .field("profiles", &self.inner.profiles)
            .field("sink", &self.inner.sink)
            .finish()
    }
}

impl Watchdog {
    /// Build a watchdog from config alone, with the default producer and sampler.
    pub fn new(config: WatchdogConfig) -> Result<Self, ConfigError> {
        WatchdogBuilder::new(config).build()
    }

    pub fn builder(config: WatchdogConfig) -> WatchdogBuilder {
        WatchdogBuilder::new(config)
    }

    pub fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }

    pub fn throttle(&self) -> Duration {
        self.inner.throttle
    }

    /// Resolved profiles, sorted by name.
    pub fn profiles(&self) -> &[ProfileSpec] {
        &self.inner.profiles
    }

    /// Spawn the polling loop on the current tokio runtime.
    ///
    /// Restarting after `stop` arms a fresh cancellation token; running
    /// stats and last-dump times carry over. The loop only holds a weak
    /// reference: once every handle is dropped it exits at its next tick.
    pub fn start(&self) -> Result<(), WatchdogError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| WatchdogError::NoRuntime)?;

        let cancel = CancellationToken::new();
        {
            let mut state = self.inner.state.lock();
            if state.lifecycle == Lifecycle::Running {
                return Err(WatchdogError::AlreadyRunning);
            }
            state.lifecycle = Lifecycle::Running;
            state.cancel = Some(cancel.clone());
        }

        info!(
            poll_interval_ms = self.inner.poll_interval.as_millis() as u64,
            throttle_secs = self.inner.throttle.as_secs(),
            profiles = self.inner.profiles.len(),
            "watchdog started"
        );

        runtime.spawn(run_loop(
            Arc::downgrade(&self.inner),
            self.inner.poll_interval,
            cancel,
        ));
        Ok(())
    }

    /// Signal the loop to exit at its next wakeup.
    ///
    /// Returns immediately: a tick already in progress may still finish its
    /// dumps. Calling it again, or before `start`, does nothing.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
            state.lifecycle = Lifecycle::Stopped;
            info!("watchdog stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().lifecycle == Lifecycle::Running
    }

    /// Run one tick synchronously: sample, evaluate, dump.
    pub fn check_and_dump(&self) -> TickReport {
        self.inner.check_and_dump(Instant::now())
    }

    pub fn status(&self) -> WatchdogStatus {
        let state = self.inner.state.lock();
        WatchdogStatus {
            state: state.lifecycle,
            stats: state.engine.stats(),
            last_dumps: state.registry.wall_times(),
            dumps_written: state.dumps_written,
            dumps_failed: state.dumps_failed,
        }
    }
}

async fn run_loop(inner: Weak<Inner>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("watchdog loop exiting");
                break;
            }
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    debug!("watchdog handles dropped, loop exiting");
                    break;
                };
                // Sampler and producer are host code; a panic skips this tick only.
                let tick = catch_unwind(AssertUnwindSafe(|| inner.check_and_dump(Instant::now())));
                if tick.is_err() {
                    warn!("watchdog tick panicked, skipping");
                }
            }
        }
    }
}

impl Inner {
    fn check_and_dump(&self, now: Instant) -> TickReport {
        let sample = self.sampler.sample();

        // Looked up fresh every tick.
        let handles: HashMap<&str, Arc<dyn Profile>> = self
            .profiles
            .iter()
            .filter_map(|p| {
                self.producer
                    .lookup(&p.name)
                    .map(|handle| (p.name.as_str(), handle))
            })
            .collect();

        // Counted before locking: a profile's count may take its own locks.
        let counts: HashMap<&str, usize> = self
            .profiles
            .iter()
            .filter(|p| matches!(p.trigger, TriggerPolicy::ProfileCount(_)))
            .filter_map(|p| {
                let handle = handles.get(p.name.as_str())?;
                match catch_unwind(AssertUnwindSafe(|| handle.count())) {
                    Ok(count) => Some((p.name.as_str(), count)),
                    Err(_) => {
                        warn!(profile = %p.name, "profile count panicked");
                        None
                    }
                }
            })
            .collect();

        let triggered = {
            let mut state = self.state.lock();
            state
                .engine
                .evaluate(sample, |name| counts.get(name).copied())
        };
        debug!(sample, triggered = ?triggered, "watchdog tick");

        let mut outcomes = Vec::with_capacity(triggered.len());
        for name in &triggered {
            let Some(spec) = self.profiles.iter().find(|p| &p.name == name) else {
                continue;
            };
            let outcome = match handles.get(name.as_str()) {
                Some(handle) => self.dump(spec, handle.as_ref(), now),
                None => {
                    debug!(profile = %name, "profile not known to producer, skipping");
                    DumpOutcome::Missing
                }
            };
            outcomes.push((name.clone(), outcome));
        }

        TickReport {
            sample,
            triggered,
            outcomes,
        }
    }

    fn dump(&self, spec: &ProfileSpec, profile: &dyn Profile, now: Instant) -> DumpOutcome {
        let wall = Utc::now();
        {
            let mut state = self.state.lock();
            if !state
                .registry
                .try_acquire(&spec.name, now, wall, self.throttle)
            {
                debug!(profile = %spec.name, "dump throttled");
                return DumpOutcome::Throttled;
            }
        }

        let result = catch_unwind(AssertUnwindSafe(|| match (&spec.action, &self.sink) {
            (Some(action), _) => run_action(action, profile),
            (None, Some(sink)) => sink.deliver(profile, spec.debug, wall),
            (None, None) => Err(SinkError::NoDestination {
                profile: spec.name.clone(),
            }),
        }))
        .unwrap_or_else(|_| {
            Err(SinkError::Panicked {
                profile: spec.name.clone(),
            })
        });

        match result {
            Ok(delivery) => {
                self.state.lock().dumps_written += 1;
                match delivery {
                    Delivery::File { path, bytes } => info!(
                        profile = %spec.name,
                        path = %path.display(),
                        bytes,
                        "profile dumped"
                    ),
                    Delivery::Streamed { bytes } => {
                        info!(profile = %spec.name, bytes, "profile dumped")
                    }
                    Delivery::Handled => info!(profile = %spec.name, "profile handed to action"),
                }
                DumpOutcome::Written
            }
            Err(e) => {
                self.state.lock().dumps_failed += 1;
                warn!(profile = %spec.name, error = %e, "profile dump failed");
                DumpOutcome::Failed
            }
        }
    }
}
