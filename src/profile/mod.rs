pub mod runtime;
pub mod tracked;

pub use runtime::{TasksProfile, ThreadsProfile};
pub use tracked::TrackedProfile;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

/// A named source of runtime state that can be counted and serialized.
///
/// Implementations compute their state on demand; the watchdog looks
/// profiles up fresh every tick and never caches a count across ticks.
pub trait Profile: Send + Sync {
    /// Profile name, used as the config key and in dump file names.
    fn name(&self) -> &str;

    /// Number of entries currently in the profile.
    fn count(&self) -> usize;

    /// Serialize a snapshot of the profile.
    ///
    /// `debug` selects the format: 0 is compact JSON, 1 is a text summary
    /// grouping identical entries, 2 is one text record per entry.
    fn write_to(&self, w: &mut dyn Write, debug: u8) -> std::io::Result<()>;
}

/// Resolves profile names to live profile handles.
pub trait ProfileProducer: Send + Sync {
    fn lookup(&self, name: &str) -> Option<Arc<dyn Profile>>;
}

/// Name-keyed set of profiles. Safe to register into while a watchdog reads it.
#[derive(Default)]
pub struct ProfileRegistry {
    profiles: RwLock<HashMap<String, Arc<dyn Profile>>>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the `tasks` and `threads` profiles.
    pub fn with_runtime_profiles() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(TasksProfile));
        registry.register(Arc::new(ThreadsProfile));
        registry
    }

    /// Add a profile under its own name, returning the one it replaced.
    pub fn register(&self, profile: Arc<dyn Profile>) -> Option<Arc<dyn Profile>> {
        let name = profile.name().to_string();
        self.profiles.write().insert(name, profile)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn Profile>> {
        self.profiles.write().remove(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl ProfileProducer for ProfileRegistry {
    fn lookup(&self, name: &str) -> Option<Arc<dyn Profile>> {
        self.profiles.read().get(name).cloned()
    }
}

impl std::fmt::Debug for ProfileRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileRegistry")
            .field("profiles", &self.names())
            .finish()
    }
}

/// First line of every text-format profile.
fn write_header(w: &mut dyn Write, name: &str, total: usize) -> std::io::Result<()> {
    writeln!(w, "{name} profile: total {total}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_profiles_registered() {
        let registry = ProfileRegistry::with_runtime_profiles();
        assert_eq!(registry.names(), vec!["tasks", "threads"]);
        assert!(registry.lookup("tasks").is_some());
        assert!(registry.lookup("threads").is_some());
    }

    #[test]
    fn test_lookup_unknown_profile() {
        let registry = ProfileRegistry::with_runtime_profiles();
        assert!(registry.lookup("heap").is_none());
    }

    #[test]
    fn test_register_replaces_same_name() {
        let registry = ProfileRegistry::new();
        assert!(registry
            .register(Arc::new(TrackedProfile::new("conns")))
            .is_none());
        let replacement = Arc::new(TrackedProfile::new("conns"));
        replacement.add("a");
        let previous = registry.register(replacement);
        assert!(previous.is_some());
        assert_eq!(registry.lookup("conns").unwrap().count(), 1);
    }

    #[test]
    fn test_remove_profile() {
        let registry = ProfileRegistry::with_runtime_profiles();
        assert!(registry.remove("threads").is_some());
        assert!(registry.lookup("threads").is_none());
        assert!(registry.remove("threads").is_none());
    }

    #[test]
    fn test_header_format() {
        let mut buf = Vec::new();
        write_header(&mut buf, "tasks", 12).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "tasks profile: total 12\n");
    }
}
