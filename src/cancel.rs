use crate::utils::get_data_path;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CancelRequest {
    session_key: String,
    requested_at_ms: i64,
}

/// File-backed so the `cancel` CLI subcommand (a separate process from the
/// running gateway) can ask the agent loop to abandon an in-flight turn.
/// The agent loop polls [`Self::is_cancelled`] between tool-use iterations
/// and clears the request with [`Self::clear`] once it has stopped.
pub struct CancelStore {
    path: PathBuf,
    cache: Mutex<HashMap<String, CancelRequest>>,
}

impl CancelStore {
    pub fn new() -> anyhow::Result<Self> {
        let path = get_data_path()?.join("cancellations.json");
        Self::at_path(path)
    }

    fn at_path(path: PathBuf) -> anyhow::Result<Self> {
        let store = Self {
            path,
            cache: Mutex::new(HashMap::new()),
        };
        store.reload()?;
        Ok(store)
    }

    fn reload(&self) -> anyhow::Result<()> {
        let mut map = HashMap::new();
        if self.path.exists() {
            let raw = std::fs::read_to_string(&self.path)?;
            if !raw.trim().is_empty() {
                let entries: Vec<CancelRequest> = serde_json::from_str(&raw)?;
                for entry in entries {
                    map.insert(entry.session_key.clone(), entry);
                }
            }
        }
        *self.cache.lock().unwrap() = map;
        Ok(())
    }

    fn persist(&self) -> anyhow::Result<()> {
        let entries: Vec<CancelRequest> = self.cache.lock().unwrap().values().cloned().collect();
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn request(&self, session_key: &str) -> anyhow::Result<()> {
        self.cache.lock().unwrap().insert(
            session_key.to_string(),
            CancelRequest {
                session_key: session_key.to_string(),
                requested_at_ms: now_ms(),
            },
        );
        self.persist()
    }

    pub fn is_cancelled(&self, session_key: &str) -> anyhow::Result<bool> {
        self.reload()?;
        Ok(self.cache.lock().unwrap().contains_key(session_key))
    }

    pub fn clear(&self, session_key: &str) -> anyhow::Result<()> {
        self.cache.lock().unwrap().remove(session_key);
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_then_is_cancelled_roundtrips() {
        let mut path = std::env::temp_dir();
        path.push(format!("nanobot-cancel-test-{}.json", now_ms()));
        let store = CancelStore::at_path(path.clone()).unwrap();
        assert!(!store.is_cancelled("s1").unwrap());
        store.request("s1").unwrap();
        assert!(store.is_cancelled("s1").unwrap());
        store.clear("s1").unwrap();
        assert!(!store.is_cancelled("s1").unwrap());
        let _ = std::fs::remove_file(&path);
    }
}
