/// Last-dump bookkeeping per profile.
///
/// Entries are created on a profile's first accepted dump and overwritten on
/// each later one; they are never removed.
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct DumpStamp {
    at: Instant,
    wall: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct LastDumpRegistry {
    stamps: HashMap<String, DumpStamp>,
}

impl LastDumpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a dump of `profile` at `now` unless the previous one was less
    /// than `throttle` ago. Accepted dumps are recorded immediately.
    pub fn try_acquire(
        &mut self,
        profile: &str,
        now: Instant,
        wall: DateTime<Utc>,
        throttle: Duration,
    ) -> bool {
        if let Some(prev) = self.stamps.get(profile) {
            let open = match prev.at.checked_add(throttle) {
                Some(next) => now >= next,
                None => false,
            };
            if !open {
                return false;
            }
        }
        self.stamps
            .insert(profile.to_string(), DumpStamp { at: now, wall });
        true
    }

    #[cfg(test)]
    fn last_dump(&self, profile: &str) -> Option<Instant> {
        self.stamps.get(profile).map(|s| s.at)
    }

    /// Wall-clock time of every profile's last accepted dump.
    pub fn wall_times(&self) -> BTreeMap<String, DateTime<Utc>> {
        self.stamps
            .iter()
            .map(|(name, stamp)| (name.clone(), stamp.wall))
            .collect()
    }
}
