//! Tracks the unique owner of monitored well-known bus names.
//!
//! The cache itself does no I/O and has no lock; the bus manager keeps it
//! inside its own mutex, seeds owners with `GetNameOwner` and feeds it
//! `NameOwnerChanged` signals. Callbacks are returned to the caller
//! instead of being invoked, so they can run after the lock is released.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Receives `(name, new_owner)`. The owner is empty when the name was
/// released.
pub type OwnerChangedCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct NameOwnerEntry {
    owner: String,
    subscribers: Vec<(SubscriptionId, OwnerChangedCallback)>,
}

#[derive(Default)]
pub struct NameOwnerCache {
    names: HashMap<String, NameOwnerEntry>,
    /// Reverse index: unique owner -> names it holds
    owners: HashMap<String, BTreeSet<String>>,
    next_id: u64,
}

impl NameOwnerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber. The flag is `true` for the first subscriber of
    /// `name`, which is when the caller should look the owner up.
    pub fn monitor_name(&mut self, name: &str, callback: OwnerChangedCallback) -> (SubscriptionId, bool) {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        let mut first = false;
        let entry = self.names.entry(name.to_string()).or_insert_with(|| {
            first = true;
            NameOwnerEntry {
                owner: String::new(),
                subscribers: Vec::new(),
            }
        });
        entry.subscribers.push((id, callback));
        (id, first)
    }

    /// Drop a subscriber. Returns `true` when it was the last one and the
    /// name is forgotten.
    pub fn unmonitor_name(&mut self, name: &str, id: SubscriptionId) -> bool {
        let Some(entry) = self.names.get_mut(name) else {
            return false;
        };
        entry.subscribers.retain(|(sub, _)| *sub != id);
        if !entry.subscribers.is_empty() {
            return false;
        }
        if let Some(entry) = self.names.remove(name) {
            self.unindex(name, &entry.owner);
        }
        true
    }

    fn unindex(&mut self, name: &str, owner: &str) {
        if owner.is_empty() {
            return;
        }
        if let Some(names) = self.owners.get_mut(owner) {
            names.remove(name);
            if names.is_empty() {
                self.owners.remove(owner);
            }
        }
    }

    /// Record a new owner for a monitored name. Unmonitored names are
    /// ignored. When `emit` is set the callbacks to notify are returned,
    /// even if the owner is unchanged: a `NameOwnerChanged` carrying the
    /// same owner still means the service went through a restart.
    pub fn set_name_owner(&mut self, name: &str, owner: &str, emit: bool) -> Vec<OwnerChangedCallback> {
        let Some(entry) = self.names.get_mut(name) else {
            return Vec::new();
        };
        let previous = std::mem::replace(&mut entry.owner, owner.to_string());
        let callbacks = if emit {
            entry.subscribers.iter().map(|(_, cb)| cb.clone()).collect()
        } else {
            Vec::new()
        };
        self.unindex(name, &previous);
        if !owner.is_empty() {
            self.owners
                .entry(owner.to_string())
                .or_default()
                .insert(name.to_string());
        }
        callbacks
    }

    /// Well-known names currently held by a unique owner.
    pub fn owner_names(&self, owner: &str) -> Vec<String> {
        self.owners
            .get(owner)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn owner_of(&self, name: &str) -> Option<&str> {
        self.names
            .get(name)
            .map(|entry| entry.owner.as_str())
            .filter(|owner| !owner.is_empty())
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        self.names.get(name).map_or(0, |entry| entry.subscribers.len())
    }

    pub fn is_monitored(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn monitored_names(&self) -> Vec<String> {
        self.names.keys().cloned().collect()
    }

    /// Forget every owner while keeping the subscribers, as after a
    /// reconnect.
    pub fn reset_owners(&mut self) {
        self.owners.clear();
        for entry in self.names.values_mut() {
            entry.owner.clear();
        }
    }

    pub fn clear(&mut self) {
        self.names.clear();
        self.owners.clear();
    }
}

impl std::fmt::Debug for NameOwnerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameOwnerCache")
            .field("names", &self.names.len())
            .field("owners", &self.owners)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn noop() -> OwnerChangedCallback {
        Arc::new(|_, _| {})
    }

    #[test]
    fn test_refcounting() {
        let mut cache = NameOwnerCache::new();
        let (a, first) = cache.monitor_name("x", noop());
        assert!(first);
        let (b, first) = cache.monitor_name("x", noop());
        assert!(!first);
        assert_eq!(cache.subscriber_count("x"), 2);

        assert!(!cache.unmonitor_name("x", a));
        assert!(cache.is_monitored("x"));
        assert_eq!(cache.subscriber_count("x"), 1);

        assert!(cache.unmonitor_name("x", b));
        assert!(!cache.is_monitored("x"));
        assert_eq!(cache.subscriber_count("x"), 0);
    }

    #[test]
    fn test_reverse_index() {
        let mut cache = NameOwnerCache::new();
        let (a, _) = cache.monitor_name("org.example.A", noop());
        cache.monitor_name("org.example.B", noop());
        cache.set_name_owner("org.example.A", ":1.5", false);
        cache.set_name_owner("org.example.B", ":1.5", false);
        assert_eq!(cache.owner_names(":1.5"), vec!["org.example.A", "org.example.B"]);

        cache.set_name_owner("org.example.B", ":1.9", false);
        assert_eq!(cache.owner_names(":1.5"), vec!["org.example.A"]);
        assert_eq!(cache.owner_of("org.example.B"), Some(":1.9"));

        cache.unmonitor_name("org.example.A", a);
        assert!(cache.owner_names(":1.5").is_empty());

        cache.set_name_owner("org.example.Unwatched", ":1.5", true);
        assert!(!cache.is_monitored("org.example.Unwatched"));
    }

    #[test]
    fn test_emit_on_every_report() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut cache = NameOwnerCache::new();
        cache.monitor_name(
            "x",
            Arc::new(move |name: &str, owner: &str| sink.lock().push(format!("{}={}", name, owner))),
        );

        assert!(cache.set_name_owner("x", ":1.1", false).is_empty());
        for cb in cache.set_name_owner("x", ":1.1", true) {
            cb("x", ":1.1");
        }
        for cb in cache.set_name_owner("x", "", true) {
            cb("x", "");
        }
        assert_eq!(seen.lock().as_slice(), &["x=:1.1".to_string(), "x=".to_string()]);
        assert_eq!(cache.owner_of("x"), None);
        assert!(cache.owner_names(":1.1").is_empty());
    }
}
