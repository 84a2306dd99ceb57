use super::{write_header, Profile};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::backtrace::Backtrace;
use std::collections::BTreeMap;
use std::io::Write;

#[derive(Debug, Clone)]
struct Entry {
    added: DateTime<Utc>,
    backtrace: String,
}

#[derive(Serialize)]
struct EntryRecord<'a> {
    key: &'a str,
    added: DateTime<Utc>,
}

/// A profile the host fills itself: one entry per live resource.
///
/// Call `add` when a resource is acquired and `remove` when it is released;
/// the entry count then tracks live resources and can drive a
/// `threshold` trigger. Each entry keeps the backtrace of its `add` call,
/// captured according to `RUST_BACKTRACE`/`RUST_LIB_BACKTRACE`.
#[derive(Debug)]
pub struct TrackedProfile {
    name: String,
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl TrackedProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record a live entry. Returns `false` and keeps the original entry if
    /// `key` is already present.
    pub fn add(&self, key: impl Into<String>) -> bool {
        let key = key.into();
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            tracing::debug!(profile = %self.name, key = %key, "duplicate profile entry ignored");
            return false;
        }
        let entry = Entry {
            added: Utc::now(),
            backtrace: Backtrace::capture().to_string(),
        };
        entries.insert(key, entry);
        true
    }

    /// Drop an entry. Returns `false` if it wasn't present.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }
}

impl Profile for TrackedProfile {
    fn name(&self) -> &str {
        &self.name
    }

    fn count(&self) -> usize {
        self.entries.lock().len()
    }

    fn write_to(&self, w: &mut dyn Write, debug: u8) -> std::io::Result<()> {
        let entries = self.entries.lock().clone();

        match debug {
            0 => {
                let records: Vec<EntryRecord<'_>> = entries
                    .iter()
                    .map(|(key, e)| EntryRecord {
                        key,
                        added: e.added,
                    })
                    .collect();
                let doc = serde_json::json!({
                    "profile": self.name,
                    "count": entries.len(),
                    "entries": records,
                });
                serde_json::to_writer(&mut *w, &doc)?;
                writeln!(w)
            }
            1 => {
                write_header(w, &self.name, entries.len())?;
                let mut groups: BTreeMap<&str, usize> = BTreeMap::new();
                for e in entries.values() {
                    *groups.entry(e.backtrace.as_str()).or_default() += 1;
                }
                let mut groups: Vec<(&str, usize)> = groups.into_iter().collect();
                groups.sort_by(|a, b| b.1.cmp(&a.1));
                for (backtrace, n) in groups {
                    writeln!(w, "\n{n} @")?;
                    writeln!(w, "{}", backtrace.trim_end())?;
                }
                Ok(())
            }
            _ => {
                write_header(w, &self.name, entries.len())?;
                for (key, e) in &entries {
                    writeln!(w, "\n{key} added {}", e.added.to_rfc3339())?;
                    writeln!(w, "{}", e.backtrace.trim_end())?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_remove_track_count() {
        let p = TrackedProfile::new("conns");
        assert_eq!(p.count(), 0);
        assert!(p.add("a"));
        assert!(p.add("b"));
        assert_eq!(p.count(), 2);
        assert!(p.remove("a"));
        assert_eq!(p.count(), 1);
        assert!(!p.remove("a"));
    }

    #[test]
    fn test_duplicate_add_ignored() {
        let p = TrackedProfile::new("conns");
        assert!(p.add("a"));
        assert!(!p.add("a"));
        assert_eq!(p.count(), 1);
    }

    #[test]
    fn test_json_lists_keys() {
        let p = TrackedProfile::new("conns");
        p.add("10.0.0.1:443");
        p.add("10.0.0.2:443");
        let mut buf = Vec::new();
        p.write_to(&mut buf, 0).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["profile"], "conns");
        assert_eq!(value["count"], 2);
        assert_eq!(value["entries"][0]["key"], "10.0.0.1:443");
    }

    #[test]
    fn test_grouped_text_counts_identical_backtraces() {
        let p = TrackedProfile::new("conns");
        for i in 0..3 {
            p.add(format!("c{i}"));
        }
        let mut buf = Vec::new();
        p.write_to(&mut buf, 1).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("conns profile: total 3\n"));
        // Same call site, so either one group of 3 or (with backtraces
        // enabled) groups whose sizes add up to 3.
        let total: usize = text
            .lines()
            .filter_map(|l| l.strip_suffix(" @"))
            .map(|n| n.parse::<usize>().unwrap())
            .sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn test_detailed_text_one_record_per_entry() {
        let p = TrackedProfile::new("conns");
        p.add("first");
        p.add("second");
        let mut buf = Vec::new();
        p.write_to(&mut buf, 2).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("\nfirst added "));
        assert!(text.contains("\nsecond added "));
    }
}
