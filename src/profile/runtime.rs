/// Built-in profiles over the host runtime: alive tokio tasks and OS threads.
use super::{write_header, Profile};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;

/// Alive tasks in the tokio runtime of the calling context, 0 outside one.
pub fn alive_tasks() -> usize {
    tokio::runtime::Handle::try_current()
        .map(|handle| handle.metrics().num_alive_tasks())
        .unwrap_or(0)
}

/// One OS thread of this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadInfo {
    pub tid: u32,
    pub name: String,
    /// Scheduler state letter from `/proc` (`R`, `S`, `D`, ...).
    pub state: String,
}

/// Number of OS threads in this process.
#[cfg(target_os = "linux")]
pub fn os_thread_count() -> usize {
    match std::fs::read_dir("/proc/self/task") {
        Ok(entries) => entries.filter(|e| e.is_ok()).count(),
        Err(e) => {
            tracing::debug!(error = %e, "failed to list /proc/self/task");
            0
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn os_thread_count() -> usize {
    0
}

/// Name and state of every OS thread in this process.
///
/// Threads that exit while the listing is read are left out.
#[cfg(target_os = "linux")]
pub fn os_threads() -> Vec<ThreadInfo> {
    let entries = match std::fs::read_dir("/proc/self/task") {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(error = %e, "failed to list /proc/self/task");
            return Vec::new();
        }
    };

    let mut threads: Vec<ThreadInfo> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let tid: u32 = entry.file_name().to_str()?.parse().ok()?;
            let stat = std::fs::read_to_string(entry.path().join("stat")).ok()?;
            let (name, state) = parse_stat(&stat)?;
            Some(ThreadInfo { tid, name, state })
        })
        .collect();
    threads.sort_by_key(|t| t.tid);
    threads
}

#[cfg(not(target_os = "linux"))]
pub fn os_threads() -> Vec<ThreadInfo> {
    Vec::new()
}

/// Extract `(comm, state)` from a `/proc/<pid>/task/<tid>/stat` line.
///
/// The name sits between the first `(` and the last `)` and may itself
/// contain spaces or parentheses.
fn parse_stat(stat: &str) -> Option<(String, String)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    if close <= open {
        return None;
    }
    let name = stat[open + 1..close].to_string();
    let state = stat[close + 1..].split_whitespace().next()?.to_string();
    Some((name, state))
}

#[derive(Debug, Serialize)]
struct TasksSnapshot {
    profile: &'static str,
    count: usize,
    workers: usize,
    flavor: Option<String>,
}

impl TasksSnapshot {
    fn capture() -> Self {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let metrics = handle.metrics();
                Self {
                    profile: "tasks",
                    count: metrics.num_alive_tasks(),
                    workers: metrics.num_workers(),
                    flavor: Some(format!("{:?}", handle.runtime_flavor())),
                }
            }
            Err(_) => Self {
                profile: "tasks",
                count: 0,
                workers: 0,
                flavor: None,
            },
        }
    }
}

/// Alive tokio tasks of the runtime the watchdog runs on.
#[derive(Debug, Clone, Copy, Default)]
pub struct TasksProfile;

impl Profile for TasksProfile {
    fn name(&self) -> &str {
        "tasks"
    }

    fn count(&self) -> usize {
        alive_tasks()
    }

    fn write_to(&self, w: &mut dyn Write, debug: u8) -> std::io::Result<()> {
        let snapshot = TasksSnapshot::capture();
        if debug == 0 {
            serde_json::to_writer(&mut *w, &snapshot)?;
            return writeln!(w);
        }

        write_header(w, "tasks", snapshot.count)?;
        writeln!(w, "workers: {}", snapshot.workers)?;
        match snapshot.flavor {
            Some(flavor) => writeln!(w, "runtime: {flavor}"),
            None => writeln!(w, "runtime: none"),
        }
    }
}

/// OS threads of this process, read from `/proc/self/task`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadsProfile;

impl Profile for ThreadsProfile {
    fn name(&self) -> &str {
        "threads"
    }

    fn count(&self) -> usize {
        os_thread_count()
    }

    fn write_to(&self, w: &mut dyn Write, debug: u8) -> std::io::Result<()> {
        let threads = os_threads();
        match debug {
            0 => {
                let doc = serde_json::json!({
                    "profile": "threads",
                    "count": threads.len(),
                    "threads": threads,
                });
                serde_json::to_writer(&mut *w, &doc)?;
                writeln!(w)
            }
            1 => {
                write_header(w, "threads", threads.len())?;
                let mut by_name: BTreeMap<&str, usize> = BTreeMap::new();
                for t in &threads {
                    *by_name.entry(t.name.as_str()).or_default() += 1;
                }
                let mut groups: Vec<(&str, usize)> = by_name.into_iter().collect();
                groups.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
                for (name, n) in groups {
                    writeln!(w, "{n:>6} {name}")?;
                }
                Ok(())
            }
            _ => {
                write_header(w, "threads", threads.len())?;
                for t in &threads {
                    writeln!(w, "{:>8} {} {}", t.tid, t.state, t.name)?;
                }
                Ok(())
            }
        }
    }
}
