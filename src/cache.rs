use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const POISON_PREFIXES: [&str; 5] = [
    "Error:",
    "Failed:",
    "Action Blocked:",
    "ACTION CANCELLED:",
    "ACTION BLOCKED:",
];

const DEFAULT_CAPACITY: usize = 100;
const DEFAULT_TTL_S: u64 = 300;

struct Entry {
    value: String,
    expires_at: Instant,
    /// recency counter; the smallest value is the oldest on an LRU eviction.
    touched: u64,
}

/// Fixed-capacity LRU keyed on `tool_name + "\0" + canonical_json_args`,
/// with a per-tool TTL table and poison-prevention on `set` (tool errors
/// are never cached, so a transient failure doesn't get replayed for the
/// TTL window).
pub struct ToolCache {
    capacity: usize,
    default_ttl: Duration,
    ttls: HashMap<String, Duration>,
    entries: HashMap<String, Entry>,
    clock: u64,
}

impl ToolCache {
    pub fn new() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            default_ttl: Duration::from_secs(DEFAULT_TTL_S),
            ttls: HashMap::new(),
            entries: HashMap::new(),
            clock: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::new()
        }
    }

    pub fn set_ttl(&mut self, tool_name: impl Into<String>, ttl: Duration) {
        self.ttls.insert(tool_name.into(), ttl);
    }

    fn key_for(tool_name: &str, args: &serde_json::Map<String, Value>) -> String {
        let canonical = canonical_json(args);
        format!("{tool_name}\0{canonical}")
    }

    pub fn get(&mut self, tool_name: &str, args: &serde_json::Map<String, Value>) -> Option<String> {
        let key = Self::key_for(tool_name, args);
        let now = Instant::now();
        let expired = match self.entries.get(&key) {
            Some(entry) => now >= entry.expires_at,
            None => return None,
        };
        if expired {
            self.entries.remove(&key);
            return None;
        }
        self.clock += 1;
        let clock = self.clock;
        let entry = self.entries.get_mut(&key)?;
        entry.touched = clock;
        Some(entry.value.clone())
    }

    pub fn set(&mut self, tool_name: &str, args: &serde_json::Map<String, Value>, value: &str) {
        if POISON_PREFIXES.iter().any(|p| value.starts_with(p)) {
            return;
        }
        let key = Self::key_for(tool_name, args);
        let ttl = self
            .ttls
            .get(tool_name)
            .copied()
            .unwrap_or(self.default_ttl);

        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }

        self.clock += 1;
        self.entries.insert(
            key,
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
                touched: self.clock,
            },
        );
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest_key) = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.touched)
            .map(|(key, _)| key.clone())
        {
            self.entries.remove(&oldest_key);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ToolCache {
    fn default() -> Self {
        Self::new()
    }
}

/// `serde_json::Value` already serializes object keys in insertion order;
/// sort them here so two semantically-equal argument maps with differently
/// ordered keys hash to the same cache entry.
fn canonical_json(args: &serde_json::Map<String, Value>) -> String {
    let mut keys: Vec<&String> = args.keys().collect();
    keys.sort();
    let ordered: serde_json::Map<String, Value> = keys
        .into_iter()
        .map(|k| (k.clone(), args[k].clone()))
        .collect();
    serde_json::to_string(&ordered).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(v: Value) -> serde_json::Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn get_returns_none_for_missing_key() {
        let mut cache = ToolCache::new();
        assert_eq!(cache.get("read_file", &args(json!({"path": "a"}))), None);
    }

    #[test]
    fn set_then_get_roundtrips() {
        let mut cache = ToolCache::new();
        let a = args(json!({"path": "a.txt"}));
        cache.set("read_file", &a, "contents");
        assert_eq!(cache.get("read_file", &a), Some("contents".to_string()));
    }

    #[test]
    fn key_is_insensitive_to_argument_order() {
        let mut cache = ToolCache::new();
        cache.set("web_search", &args(json!({"q": "rust", "n": 5})), "hit");
        assert_eq!(
            cache.get("web_search", &args(json!({"n": 5, "q": "rust"}))),
            Some("hit".to_string())
        );
    }

    #[test]
    fn poisoned_values_are_never_cached() {
        let mut cache = ToolCache::new();
        let a = args(json!({"path": "a"}));
        cache.set("read_file", &a, "Error: file not found");
        assert_eq!(cache.get("read_file", &a), None);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let mut cache = ToolCache::with_capacity(2);
        let a = args(json!({"id": 1}));
        let b = args(json!({"id": 2}));
        let c = args(json!({"id": 3}));
        cache.set("t", &a, "a");
        cache.set("t", &b, "b");
        cache.set("t", &c, "c");
        assert_eq!(cache.get("t", &a), None);
        assert_eq!(cache.get("t", &b), Some("b".to_string()));
        assert_eq!(cache.get("t", &c), Some("c".to_string()));
    }

    #[test]
    fn per_tool_ttl_expires_entries() {
        let mut cache = ToolCache::new();
        cache.set_ttl("fast", Duration::from_millis(0));
        let a = args(json!({"x": 1}));
        cache.set("fast", &a, "value");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("fast", &a), None);
    }
}
