/// Dump destinations: a byte stream, a directory of dump files, or a callback.
use crate::config::{ConfigError, SinkConfig};
use crate::profile::Profile;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Callback handed the raw profile instead of its serialized bytes.
pub type ProfileAction = Arc<dyn Fn(&dyn Profile) + Send + Sync>;

/// Where serialized profiles go.
#[derive(Clone)]
pub enum Sink {
    /// Every dump is appended to one stream.
    Writer(Arc<Mutex<Box<dyn Write + Send>>>),
    /// One new file per dump, see `dump_file_name`.
    Directory(PathBuf),
    /// The profile handle is passed to a callback, nothing is serialized.
    Callback(ProfileAction),
}

/// What a successful delivery produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Streamed { bytes: usize },
    File { path: PathBuf, bytes: usize },
    Handled,
}

impl Sink {
    pub fn writer(w: impl Write + Send + 'static) -> Self {
        Sink::Writer(Arc::new(Mutex::new(Box::new(w))))
    }

    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Sink::Directory(path.into())
    }

    pub fn callback(f: impl Fn(&dyn Profile) + Send + Sync + 'static) -> Self {
        Sink::Callback(Arc::new(f))
    }

    /// Build the sink described by a config file. File sinks are opened
    /// here so a bad path is reported at construction.
    pub fn from_config(config: &SinkConfig) -> Result<Self, ConfigError> {
        match config {
            SinkConfig::Stdout => Ok(Sink::writer(std::io::stdout())),
            SinkConfig::Stderr => Ok(Sink::writer(std::io::stderr())),
            SinkConfig::File { path } => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| ConfigError::OpenSink {
                        path: path.clone(),
                        source: e,
                    })?;
                Ok(Sink::writer(file))
            }
            SinkConfig::Directory { path } => Ok(Sink::directory(path)),
        }
    }

    /// Serialize `profile` at `debug` verbosity and hand it to the destination.
    pub fn deliver(
        &self,
        profile: &dyn Profile,
        debug: u8,
        at: DateTime<Utc>,
    ) -> Result<Delivery, SinkError> {
        match self {
            Sink::Callback(action) => run_action(action, profile),
            Sink::Writer(writer) => {
                let buf = serialize(profile, debug)?;
                let mut writer = writer.lock();
                writer
                    .write_all(&buf)
                    .and_then(|()| writer.flush())
                    .map_err(|e| SinkError::Write {
                        path: None,
                        source: e,
                    })?;
                Ok(Delivery::Streamed { bytes: buf.len() })
            }
            Sink::Directory(dir) => {
                let buf = serialize(profile, debug)?;
                let path = write_dump_file(dir, profile.name(), at, &buf)?;
                Ok(Delivery::File {
                    path,
                    bytes: buf.len(),
                })
            }
        }
    }
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sink::Writer(_) => write!(f, "Sink::Writer"),
            Sink::Directory(dir) => write!(f, "Sink::Directory({})", dir.display()),
            Sink::Callback(_) => write!(f, "Sink::Callback"),
        }
    }
}

/// Invoke a user action, containing any panic so the watchdog loop survives.
pub fn run_action(action: &ProfileAction, profile: &dyn Profile) -> Result<Delivery, SinkError> {
    catch_unwind(AssertUnwindSafe(|| action(profile)))
        .map(|()| Delivery::Handled)
        .map_err(|_| SinkError::ActionPanicked {
            profile: profile.name().to_string(),
        })
}

fn serialize(profile: &dyn Profile, debug: u8) -> Result<Vec<u8>, SinkError> {
    let mut buf = Vec::new();
    profile
        .write_to(&mut buf, debug)
        .map_err(|e| SinkError::Serialize {
            profile: profile.name().to_string(),
            source: e,
        })?;
    Ok(buf)
}

/// File name for a dump: `{unix_secs}.{nanos:09}-{profile}`.
///
/// Sorts chronologically and stays unique at sub-second dump rates.
pub fn dump_file_name(at: DateTime<Utc>, profile: &str) -> String {
    format!(
        "{}.{:09}-{}",
        at.timestamp(),
        at.timestamp_subsec_nanos(),
        profile
    )
}

fn write_dump_file(
    dir: &Path,
    profile: &str,
    at: DateTime<Utc>,
    buf: &[u8],
) -> Result<PathBuf, SinkError> {
    std::fs::create_dir_all(dir).map_err(|e| SinkError::Create {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let path = dir.join(dump_file_name(at, profile));
    // Never clobber an earlier dump.
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| SinkError::Create {
            path: path.clone(),
            source: e,
        })?;
    file.write_all(buf).map_err(|e| SinkError::Write {
        path: Some(path.clone()),
        source: e,
    })?;
    Ok(path)
}

/// Errors from delivering one dump. Never fatal to the watchdog.
#[derive(Debug)]
pub enum SinkError {
    Serialize {
        profile: String,
        source: std::io::Error,
    },
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: Option<PathBuf>,
        source: std::io::Error,
    },
    ActionPanicked {
        profile: String,
    },
    /// The profile or the destination panicked while dumping.
    Panicked {
        profile: String,
    },
    NoDestination {
        profile: String,
    },
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Serialize { profile, source } => {
                write!(f, "failed to serialize profile {profile}: {source}")
            }
            SinkError::Create { path, source } => {
                write!(f, "failed to create {}: {source}", path.display())
            }
            SinkError::Write {
                path: Some(path),
                source,
            } => write!(f, "failed to write {}: {source}", path.display()),
            SinkError::Write { path: None, source } => {
                write!(f, "failed to write dump: {source}")
            }
            SinkError::ActionPanicked { profile } => {
                write!(f, "action for profile {profile} panicked")
            }
            SinkError::Panicked { profile } => {
                write!(f, "dump of profile {profile} panicked")
            }
            SinkError::NoDestination { profile } => {
                write!(f, "no sink or action for profile {profile}")
            }
        }
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SinkError::Serialize { source, .. } => Some(source),
            SinkError::Create { source, .. } => Some(source),
            SinkError::Write { source, .. } => Some(source),
            SinkError::ActionPanicked { .. }
            | SinkError::Panicked { .. }
            | SinkError::NoDestination { .. } => None,
        }
    }
}
