/// Watchdog configuration loaded from `dumpwatch.toml` or built in code.
///
/// The raw, serde-facing settings live in `WatchdogConfig`/`ProfileConfig`.
/// `WatchdogConfig::resolve_profiles` turns them into validated `ProfileSpec`s
/// with exactly one trigger policy each.
use crate::sampler::SamplerKind;
use crate::sink::ProfileAction;
use crate::threshold::TriggerPolicy;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tick period used when `poll_interval_ms` is zero.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Spacing between dumps of one profile when `throttle_secs` is unset.
pub const DEFAULT_THROTTLE: Duration = Duration::from_secs(60);

/// Highest verbosity level a profile can be serialized at.
pub const MAX_DEBUG_LEVEL: u8 = 2;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// How often to sample concurrency. 0 means `DEFAULT_POLL_INTERVAL`.
    pub poll_interval_ms: u64,
    /// Minimum seconds between two dumps of the same profile. 0 disables throttling.
    pub throttle_secs: Option<u64>,
    /// Hard limit for profiles that don't declare their own trigger.
    pub hard_limit: Option<usize>,
    /// Growth ratio for profiles that don't declare their own trigger
    /// (only used when `hard_limit` is unset).
    pub growth_ratio: Option<f64>,
    /// Where the per-tick concurrency sample comes from.
    pub sampler: SamplerKind,
    /// Dump destination. Required unless a sink is handed to the builder.
    pub sink: Option<SinkConfig>,
    /// Profiles to watch, keyed by name.
    pub profiles: HashMap<String, ProfileConfig>,
}

/// Per-profile settings as written in the config file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfileConfig {
    /// Verbosity requested from the profile producer (0..=2).
    pub debug: u8,
    /// Dump when the concurrency sample is at or above this value.
    pub hard_limit: Option<usize>,
    /// Dump when sample / running average exceeds this ratio.
    pub growth_ratio: Option<f64>,
    /// Dump when the profile's own entry count exceeds this value.
    pub threshold: Option<usize>,
}

/// Dump destinations that can be expressed in a config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    Stdout,
    Stderr,
    /// Append every dump to one file.
    File { path: PathBuf },
    /// Write one file per dump into this directory.
    Directory { path: PathBuf },
}

/// A validated profile: name, exactly one trigger, verbosity, optional action.
#[derive(Clone)]
pub struct ProfileSpec {
    pub name: String,
    pub trigger: TriggerPolicy,
    pub debug: u8,
    pub action: Option<ProfileAction>,
}

impl std::fmt::Debug for ProfileSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileSpec")
            .field("name", &self.name)
            .field("trigger", &self.trigger)
            .field("debug", &self.debug)
            .field("action", &self.action.is_some())
            .finish()
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            throttle_secs: None,
            hard_limit: None,
            growth_ratio: None,
            sampler: SamplerKind::default(),
            sink: None,
            profiles: HashMap::new(),
        }
    }
}

impl WatchdogConfig {
    /// Effective tick period.
    pub fn poll_interval(&self) -> Duration {
        if self.poll_interval_ms == 0 {
            DEFAULT_POLL_INTERVAL
        } else {
            Duration::from_millis(self.poll_interval_ms)
        }
    }

    /// Effective throttle window.
    pub fn throttle(&self) -> Duration {
        self.throttle_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_THROTTLE)
    }

    /// Validate every profile and pick its trigger policy.
    ///
    /// A profile's own trigger wins; otherwise the global `hard_limit`, then
    /// the global `growth_ratio`. Specs come back sorted by name.
    pub fn resolve_profiles(&self) -> Result<Vec<ProfileSpec>, ConfigError> {
        if let Some(ratio) = self.growth_ratio {
            check_ratio(None, ratio)?;
        }
        if self.profiles.is_empty() {
            return Err(ConfigError::NoProfiles);
        }

        let mut specs = Vec::with_capacity(self.profiles.len());
        for (name, profile) in &self.profiles {
            if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
                return Err(ConfigError::InvalidProfileName { name: name.clone() });
            }
            if profile.debug > MAX_DEBUG_LEVEL {
                return Err(ConfigError::InvalidDebugLevel {
                    profile: name.clone(),
                    level: profile.debug,
                });
            }

            let mut explicit = Vec::new();
            if let Some(limit) = profile.hard_limit {
                explicit.push(TriggerPolicy::HardLimit(limit));
            }
            if let Some(ratio) = profile.growth_ratio {
                check_ratio(Some(name), ratio)?;
                explicit.push(TriggerPolicy::RelativeGrowth(ratio));
            }
            if let Some(threshold) = profile.threshold {
                explicit.push(TriggerPolicy::ProfileCount(threshold));
            }

            let trigger = match (explicit.len(), self.hard_limit, self.growth_ratio) {
                (1, _, _) => explicit[0],
                (0, Some(limit), _) => TriggerPolicy::HardLimit(limit),
                (0, None, Some(ratio)) => TriggerPolicy::RelativeGrowth(ratio),
                (0, None, None) => {
                    return Err(ConfigError::MissingTrigger {
                        profile: name.clone(),
                    })
                }
                _ => {
                    return Err(ConfigError::ConflictingTriggers {
                        profile: name.clone(),
                    })
                }
            };

            specs.push(ProfileSpec {
                name: name.clone(),
                trigger,
                debug: profile.debug,
                action: None,
            });
        }

        specs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(specs)
    }
}

fn check_ratio(profile: Option<&String>, ratio: f64) -> Result<(), ConfigError> {
    if ratio.is_finite() && ratio > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidGrowthRatio {
            profile: profile.cloned(),
            ratio,
        })
    }
}

/// Load a config file from disk.
pub fn load_config(path: &Path) -> Result<WatchdogConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Errors surfaced while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    MissingSink,
    OpenSink {
        path: PathBuf,
        source: std::io::Error,
    },
    NoProfiles,
    InvalidProfileName {
        name: String,
    },
    MissingTrigger {
        profile: String,
    },
    ConflictingTriggers {
        profile: String,
    },
    InvalidGrowthRatio {
        profile: Option<String>,
        ratio: f64,
    },
    InvalidDebugLevel {
        profile: String,
        level: u8,
    },
    UnknownAction {
        profile: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::MissingSink => write!(f, "no sink configured"),
            ConfigError::OpenSink { path, source } => {
                write!(f, "failed to open sink {}: {source}", path.display())
            }
            ConfigError::NoProfiles => write!(f, "no profiles configured"),
            ConfigError::InvalidProfileName { name } => {
                write!(f, "invalid profile name {name:?}")
            }
            ConfigError::MissingTrigger { profile } => write!(
                f,
                "profile {profile:?} has no trigger and no global hard_limit or growth_ratio is set"
            ),
            ConfigError::ConflictingTriggers { profile } => write!(
                f,
                "profile {profile:?} sets more than one of hard_limit, growth_ratio, threshold"
            ),
            ConfigError::InvalidGrowthRatio {
                profile: Some(profile),
                ratio,
            } => write!(
                f,
                "profile {profile:?}: growth_ratio must be a positive number, got {ratio}"
            ),
            ConfigError::InvalidGrowthRatio {
                profile: None,
                ratio,
            } => write!(f, "growth_ratio must be a positive number, got {ratio}"),
            ConfigError::InvalidDebugLevel { profile, level } => write!(
                f,
                "profile {profile:?}: debug level {level} is above {MAX_DEBUG_LEVEL}"
            ),
            ConfigError::UnknownAction { profile } => {
                write!(f, "action registered for unconfigured profile {profile:?}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::OpenSink { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn with_profiles(profiles: &[(&str, ProfileConfig)]) -> WatchdogConfig {
        WatchdogConfig {
            profiles: profiles
                .iter()
                .map(|(name, p)| (name.to_string(), p.clone()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_zero_poll_interval_uses_default() {
        let config = WatchdogConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.poll_interval(), DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn test_explicit_poll_interval() {
        let config = WatchdogConfig {
            poll_interval_ms: 250,
            ..Default::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_unset_throttle_uses_default() {
        assert_eq!(WatchdogConfig::default().throttle(), DEFAULT_THROTTLE);
    }

    #[test]
    fn test_zero_throttle_is_kept() {
        let config = WatchdogConfig {
            throttle_secs: Some(0),
            ..Default::default()
        };
        assert_eq!(config.throttle(), Duration::ZERO);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
poll_interval_ms = 250
throttle_secs = 30
hard_limit = 500
sampler = "threads"

[sink]
type = "directory"
path = "./pprof"

[profiles.tasks]
debug = 1

[profiles.threads]
debug = 2
growth_ratio = 1.5

[profiles.connections]
threshold = 100
"#;
        let config: WatchdogConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.throttle(), Duration::from_secs(30));
        assert_eq!(config.sampler, SamplerKind::Threads);
        assert_eq!(
            config.sink,
            Some(SinkConfig::Directory {
                path: PathBuf::from("./pprof")
            })
        );

        let specs = config.resolve_profiles().unwrap();
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["connections", "tasks", "threads"]);
        assert_eq!(specs[0].trigger, TriggerPolicy::ProfileCount(100));
        assert_eq!(specs[1].trigger, TriggerPolicy::HardLimit(500));
        assert_eq!(specs[1].debug, 1);
        assert_eq!(specs[2].trigger, TriggerPolicy::RelativeGrowth(1.5));
    }

    #[test]
    fn test_parse_empty_toml_gives_defaults() {
        let config: WatchdogConfig = toml::from_str("").unwrap();
        assert_eq!(config.poll_interval(), DEFAULT_POLL_INTERVAL);
        assert_eq!(config.sampler, SamplerKind::Tasks);
        assert!(config.sink.is_none());
        assert!(config.profiles.is_empty());
    }

    #[test]
    fn test_parse_stdout_sink() {
        let config: WatchdogConfig = toml::from_str("[sink]\ntype = \"stdout\"\n").unwrap();
        assert_eq!(config.sink, Some(SinkConfig::Stdout));
    }

    #[test]
    fn test_unknown_profile_field_rejected() {
        let result: Result<WatchdogConfig, _> =
            toml::from_str("[profiles.tasks]\nlimit = 3\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_global_growth_ratio_fallback() {
        let mut config = with_profiles(&[("tasks", ProfileConfig::default())]);
        config.growth_ratio = Some(2.0);
        let specs = config.resolve_profiles().unwrap();
        assert_eq!(specs[0].trigger, TriggerPolicy::RelativeGrowth(2.0));
    }

    #[test]
    fn test_global_hard_limit_preferred_over_ratio() {
        let mut config = with_profiles(&[("tasks", ProfileConfig::default())]);
        config.hard_limit = Some(10);
        config.growth_ratio = Some(2.0);
        let specs = config.resolve_profiles().unwrap();
        assert_eq!(specs[0].trigger, TriggerPolicy::HardLimit(10));
    }

    #[test]
    fn test_missing_trigger_rejected() {
        let config = with_profiles(&[("tasks", ProfileConfig::default())]);
        let err = config.resolve_profiles().unwrap_err();
        assert!(matches!(err, ConfigError::MissingTrigger { .. }));
        assert!(err.to_string().contains("tasks"));
    }

    #[test]
    fn test_conflicting_triggers_rejected() {
        let config = with_profiles(&[(
            "tasks",
            ProfileConfig {
                hard_limit: Some(5),
                threshold: Some(5),
                ..Default::default()
            },
        )]);
        assert!(matches!(
            config.resolve_profiles().unwrap_err(),
            ConfigError::ConflictingTriggers { .. }
        ));
    }

    #[test]
    fn test_bad_growth_ratio_rejected() {
        for ratio in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let config = with_profiles(&[(
                "tasks",
                ProfileConfig {
                    growth_ratio: Some(ratio),
                    ..Default::default()
                },
            )]);
            assert!(matches!(
                config.resolve_profiles().unwrap_err(),
                ConfigError::InvalidGrowthRatio { .. }
            ));
        }
    }

    #[test]
    fn test_debug_level_above_max_rejected() {
        let config = with_profiles(&[(
            "tasks",
            ProfileConfig {
                debug: 3,
                hard_limit: Some(1),
                ..Default::default()
            },
        )]);
        assert!(matches!(
            config.resolve_profiles().unwrap_err(),
            ConfigError::InvalidDebugLevel { level: 3, .. }
        ));
    }

    #[test]
    fn test_path_like_profile_name_rejected() {
        let limited = ProfileConfig {
            hard_limit: Some(1),
            ..Default::default()
        };
        for name in ["", "../etc", "a/b", ".."] {
            let config = with_profiles(&[(name, limited.clone())]);
            assert!(matches!(
                config.resolve_profiles().unwrap_err(),
                ConfigError::InvalidProfileName { .. }
            ));
        }
    }

    #[test]
    fn test_no_profiles_rejected() {
        assert!(matches!(
            WatchdogConfig::default().resolve_profiles().unwrap_err(),
            ConfigError::NoProfiles
        ));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dumpwatch.toml");
        std::fs::write(&path, "poll_interval_ms = 50\n[profiles.tasks]\nhard_limit = 3\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert_eq!(
            config.resolve_profiles().unwrap()[0].trigger,
            TriggerPolicy::HardLimit(3)
        );
    }

    #[test]
    fn test_load_config_missing_file() {
        let dir = tempdir().unwrap();
        let err = load_config(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_config_bad_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "poll_interval_ms = \"soon\"").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_example_config_resolves() {
        let config: WatchdogConfig =
            toml::from_str(include_str!("../dumpwatch.example.toml")).unwrap();
        let specs = config.resolve_profiles().unwrap();
        assert_eq!(specs[0].name, "tasks");
        assert_eq!(specs[0].trigger, TriggerPolicy::HardLimit(500));
        assert_eq!(specs[1].trigger, TriggerPolicy::RelativeGrowth(2.0));
        assert_eq!(config.sampler, SamplerKind::Tasks);
    }
}
