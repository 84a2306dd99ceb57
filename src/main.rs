use clap::Parser;
use dumpwatch::{load_config, ProfileConfig, SinkConfig, Watchdog, WatchdogConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Hard limit used when no config file exists.
const FALLBACK_HARD_LIMIT: usize = 500;
/// Dump directory used when no config file exists.
const FALLBACK_DUMP_DIR: &str = "pprof";

/// Watch this process's task count and dump runtime profiles when it spikes.
///
/// Doubles as a demo: `--spawn` parks that many tasks to simulate a leak.
#[derive(Parser, Debug)]
#[command(name = "dumpwatch", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "dumpwatch.toml")]
    config: PathBuf,

    /// Poll interval in milliseconds (overrides config)
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Global hard limit on the concurrency sample (overrides config)
    #[arg(long)]
    hard_limit: Option<usize>,

    /// Write one dump file per trigger into this directory (overrides config)
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Park this many idle tasks to simulate a leak
    #[arg(long, default_value_t = 0)]
    spawn: usize,

    /// Seconds to keep watching before exiting
    #[arg(long, default_value_t = 1)]
    run_secs: u64,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (every tick, throttle decisions)
    #[arg(short, long)]
    verbose: bool,
}

fn resolve_config(cli: &Cli) -> Result<WatchdogConfig, dumpwatch::ConfigError> {
    let mut config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        tracing::info!(path = %cli.config.display(), "config file not found, using defaults");
        WatchdogConfig {
            hard_limit: Some(FALLBACK_HARD_LIMIT),
            sink: Some(SinkConfig::Directory {
                path: PathBuf::from(FALLBACK_DUMP_DIR),
            }),
            ..Default::default()
        }
    };

    if let Some(ms) = cli.interval_ms {
        config.poll_interval_ms = ms;
    }
    if let Some(limit) = cli.hard_limit {
        config.hard_limit = Some(limit);
    }
    if let Some(dir) = &cli.dir {
        config.sink = Some(SinkConfig::Directory { path: dir.clone() });
    }
    if config.profiles.is_empty() {
        config.profiles.insert(
            "tasks".to_string(),
            ProfileConfig {
                debug: 1,
                ..Default::default()
            },
        );
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let watchdog = match resolve_config(&cli).and_then(Watchdog::new) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.dry_run {
        println!("dumpwatch v{}", env!("CARGO_PKG_VERSION"));
        println!("Poll interval: {:?}", watchdog.poll_interval());
        println!("Throttle:      {:?}", watchdog.throttle());
        for spec in watchdog.profiles() {
            println!(
                "Profile {:<12} trigger={:?} debug={}",
                spec.name, spec.trigger, spec.debug
            );
        }
        return ExitCode::SUCCESS;
    }

    if let Err(e) = watchdog.start() {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    let run_for = Duration::from_secs(cli.run_secs);
    let parked: Vec<_> = (0..cli.spawn)
        .map(|_| tokio::spawn(tokio::time::sleep(run_for + Duration::from_secs(5))))
        .collect();
    if !parked.is_empty() {
        tracing::info!(tasks = parked.len(), "parked idle tasks");
    }

    tokio::time::sleep(run_for).await;
    watchdog.stop();

    match serde_json::to_string_pretty(&watchdog.status()) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::warn!(error = %e, "failed to serialize status"),
    }

    for task in parked {
        task.abort();
    }
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use dumpwatch::TriggerPolicy;

    #[test]
    fn test_defaults_without_config_file_are_runnable() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let cli = Cli::parse_from(["dumpwatch", "--config", missing.to_str().unwrap()]);

        let config = resolve_config(&cli).unwrap();
        assert_eq!(
            config.sink,
            Some(SinkConfig::Directory {
                path: PathBuf::from("pprof")
            })
        );
        let watchdog = Watchdog::new(config).unwrap();
        assert_eq!(watchdog.profiles()[0].name, "tasks");
        assert_eq!(watchdog.profiles()[0].trigger, TriggerPolicy::HardLimit(500));
    }

    #[test]
    fn test_cli_overrides_fallback_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let cli = Cli::parse_from([
            "dumpwatch",
            "--config",
            missing.to_str().unwrap(),
            "--hard-limit",
            "50",
            "--dir",
            "dumps",
        ]);

        let config = resolve_config(&cli).unwrap();
        assert_eq!(config.hard_limit, Some(50));
        assert_eq!(
            config.sink,
            Some(SinkConfig::Directory {
                path: PathBuf::from("dumps")
            })
        );
    }
}
