/// Process-wide convenience layer over a single `Watchdog`.
///
/// For hosts that just want `start(config)` at boot and `stop()` at exit.
/// Anything else (custom sinks, samplers, several watchdogs) should build a
/// `Watchdog` directly.
use crate::config::WatchdogConfig;
use crate::watchdog::{Watchdog, WatchdogError, WatchdogStatus};
use parking_lot::Mutex;
use std::sync::LazyLock;

static GLOBAL: LazyLock<Mutex<Option<Watchdog>>> = LazyLock::new(|| Mutex::new(None));

/// Build and start the process-wide watchdog, replacing (and stopping) any
/// previous one.
pub fn start(config: WatchdogConfig) -> Result<(), WatchdogError> {
    let watchdog = Watchdog::new(config)?;
    watchdog.start()?;
    if let Some(previous) = GLOBAL.lock().replace(watchdog) {
        previous.stop();
    }
    Ok(())
}

/// Stop the process-wide watchdog. No-op if none was started or it is
/// already stopped.
pub fn stop() {
    if let Some(watchdog) = GLOBAL.lock().as_ref() {
        watchdog.stop();
    }
}

pub fn status() -> Option<WatchdogStatus> {
    GLOBAL.lock().as_ref().map(Watchdog::status)
}
