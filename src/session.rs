use crate::utils::{get_data_path, safe_filename, timestamp};
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub key: String,
    pub messages: Vec<Value>,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
    pub metadata: Map<String, Value>,
}

impl Session {
    pub fn new(key: impl Into<String>) -> Self {
        let now = Local::now();
        Self {
            key: key.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: Map::new(),
        }
    }

    pub fn add_message(&mut self, role: &str, content: &str) {
        self.add_message_with_tools(role, content, None);
    }

    pub fn add_message_with_tools(
        &mut self,
        role: &str,
        content: &str,
        tools_used: Option<&[String]>,
    ) {
        let mut message = json!({
            "role": role,
            "content": content,
            "timestamp": timestamp(),
        });
        if let Some(tools) = tools_used
            && !tools.is_empty()
        {
            message["tools_used"] = Value::Array(
                tools
                    .iter()
                    .map(|tool| Value::String(tool.clone()))
                    .collect(),
            );
        }
        self.messages.push(message);
        self.updated_at = Local::now();
    }

    fn to_llm_message(m: &Value) -> Value {
        json!({
            "role": m.get("role").and_then(Value::as_str).unwrap_or("user"),
            "content": m.get("content").and_then(Value::as_str).unwrap_or(""),
        })
    }

    pub fn get_history(&self, max_messages: usize) -> Vec<Value> {
        // Guard against model self-contamination:
        // only replay user-side history back into context.
        let user_messages = self
            .messages
            .iter()
            .filter(|m| m.get("role").and_then(Value::as_str) == Some("user"))
            .collect::<Vec<_>>();

        let start = user_messages.len().saturating_sub(max_messages);
        user_messages[start..]
            .iter()
            .map(|m| Self::to_llm_message(m))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::Session;

    #[test]
    fn history_excludes_assistant_messages() {
        let mut session = Session::new("cli:test");
        session.add_message("user", "u1");
        session.add_message("assistant", "a1");
        session.add_message("user", "u2");

        let history = session.get_history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["role"], "user");
        assert_eq!(history[0]["content"], "u1");
        assert_eq!(history[1]["role"], "user");
        assert_eq!(history[1]["content"], "u2");
    }
}

/// Debounce window for `index.json` rewrites: metadata/timestamp-only
/// changes are common (every turn touches `updated_at`) and don't need a
/// disk write on every single one.
const INDEX_DEBOUNCE_MS: i64 = 2_000;

/// Per-session bookkeeping the cache needs beyond the `Session` itself:
/// how many messages are already durable in `log.jsonl` (so `save` only
/// appends the delta) and when `index.json` was last actually written.
struct CacheEntry {
    session: Session,
    persisted_messages: usize,
    index_written_at: Option<DateTime<Local>>,
}

/// Three artifacts per session, stored under its own directory:
/// - `index.json` — small metadata (timestamps, arbitrary `metadata`
///   map), rewritten on a debounce so a chatty session doesn't hammer it.
/// - `log.jsonl` — append-only message log, one JSON object per line;
///   never rewritten, only appended to, so a crash mid-write loses at
///   most a trailing partial line rather than corrupting history.
/// - `snapshot.json` — the full message array, written atomically
///   (temp file + rename) on every save. This is the file reads trust.
pub struct SessionManager {
    sessions_dir: PathBuf,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl SessionManager {
    pub fn new() -> Result<Self> {
        let sessions_dir = get_data_path()?.join("sessions");
        std::fs::create_dir_all(&sessions_dir)?;
        Ok(Self {
            sessions_dir,
            cache: Mutex::new(HashMap::new()),
        })
    }

    #[cfg(test)]
    fn with_sessions_dir(sessions_dir: PathBuf) -> Self {
        std::fs::create_dir_all(&sessions_dir).unwrap();
        Self {
            sessions_dir,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn session_dir(&self, key: &str) -> PathBuf {
        let safe_key = safe_filename(&key.replace(':', "_"));
        self.sessions_dir.join(safe_key)
    }

    fn index_path(dir: &std::path::Path) -> PathBuf {
        dir.join("index.json")
    }

    fn log_path(dir: &std::path::Path) -> PathBuf {
        dir.join("log.jsonl")
    }

    fn snapshot_path(dir: &std::path::Path) -> PathBuf {
        dir.join("snapshot.json")
    }

    pub fn get_or_create(&self, key: &str) -> Session {
        if let Some(cached) = self
            .cache
            .lock()
            .ok()
            .and_then(|c| c.get(key).map(|e| e.session.clone()))
        {
            return cached;
        }

        let loaded = self.load(key).unwrap_or_else(|_| Session::new(key));
        if let Ok(mut cache) = self.cache.lock() {
            let persisted_messages = loaded.messages.len();
            cache.insert(
                key.to_string(),
                CacheEntry {
                    session: loaded.clone(),
                    persisted_messages,
                    index_written_at: None,
                },
            );
        }
        loaded
    }

    pub fn save(&self, session: &Session) -> Result<()> {
        let dir = self.session_dir(&session.key);
        std::fs::create_dir_all(&dir)?;

        atomic_write(
            &Self::snapshot_path(&dir),
            &serde_json::to_string(&session.messages)?,
        )?;

        let mut cache = self.cache.lock().ok();
        let persisted_messages = cache
            .as_ref()
            .and_then(|c| c.get(&session.key))
            .map(|e| e.persisted_messages)
            .unwrap_or(0);
        if session.messages.len() > persisted_messages {
            append_log(&Self::log_path(&dir), &session.messages[persisted_messages..])?;
        }

        let last_index_write = cache
            .as_ref()
            .and_then(|c| c.get(&session.key))
            .and_then(|e| e.index_written_at);
        let due = match last_index_write {
            Some(t) => (Local::now() - t).num_milliseconds() >= INDEX_DEBOUNCE_MS,
            None => true,
        };
        let index_written_at = if due || !Self::index_path(&dir).exists() {
            atomic_write(
                &Self::index_path(&dir),
                &serde_json::to_string(&json!({
                    "key": session.key,
                    "created_at": session.created_at.to_rfc3339(),
                    "updated_at": session.updated_at.to_rfc3339(),
                    "metadata": session.metadata,
                }))?,
            )?;
            Some(Local::now())
        } else {
            last_index_write
        };

        if let Some(cache) = cache.as_mut() {
            cache.insert(
                session.key.clone(),
                CacheEntry {
                    session: session.clone(),
                    persisted_messages: session.messages.len(),
                    index_written_at,
                },
            );
        }
        Ok(())
    }

    /// Forces the debounced `index.json` write regardless of the 2s
    /// window, for callers (shutdown, explicit flush) that need the
    /// on-disk index to reflect the latest metadata immediately.
    pub fn flush(&self, session: &Session) -> Result<()> {
        let dir = self.session_dir(&session.key);
        std::fs::create_dir_all(&dir)?;
        atomic_write(
            &Self::index_path(&dir),
            &serde_json::to_string(&json!({
                "key": session.key,
                "created_at": session.created_at.to_rfc3339(),
                "updated_at": session.updated_at.to_rfc3339(),
                "metadata": session.metadata,
            }))?,
        )?;
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(entry) = cache.get_mut(&session.key) {
                entry.index_written_at = Some(Local::now());
            }
        }
        Ok(())
    }

    /// Session ids as they exist on disk (the sanitized directory name),
    /// for the `sessions list`/`history`/`delete` control-surface commands.
    pub fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        if self.sessions_dir.exists() {
            for entry in std::fs::read_dir(&self.sessions_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// The original `channel:chat_id` keys for every session on disk, read
    /// back out of each session's `index.json` (the sanitized directory
    /// name alone can't be un-escaped back to the original key).
    pub fn list_session_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for id in self.list_ids()? {
            let index_path = Self::index_path(&self.sessions_dir.join(&id));
            let key = std::fs::read_to_string(&index_path)
                .ok()
                .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
                .and_then(|v| v.get("key").and_then(Value::as_str).map(str::to_string))
                .unwrap_or(id);
            keys.push(key);
        }
        keys.sort();
        Ok(keys)
    }

    /// Load a session by its in-memory `channel:chat_id` key. Unlike
    /// [`Self::get_or_create`], this does not fall back to a fresh empty
    /// session — it errors if nothing has been persisted for the key yet.
    pub fn load_session(&self, key: &str) -> Result<Session> {
        if let Some(cached) = self
            .cache
            .lock()
            .ok()
            .and_then(|c| c.get(key).map(|e| e.session.clone()))
        {
            return Ok(cached);
        }
        self.load(key)
    }

    /// Load a session by its on-disk id (as returned by [`Self::list_ids`]),
    /// bypassing the `session_dir` sanitization applied to in-memory keys.
    pub fn load_by_id(&self, id: &str) -> Result<Session> {
        self.load_from_dir(id, &self.sessions_dir.join(id))
    }

    pub fn delete(&self, key: &str) -> bool {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(key);
        }
        let dir = self.session_dir(key);
        if dir.exists() {
            std::fs::remove_dir_all(dir).is_ok()
        } else {
            false
        }
    }

    /// Remove a session by its on-disk id (as returned by [`Self::list_ids`]).
    pub fn delete_by_id(&self, id: &str) -> bool {
        let dir = self.sessions_dir.join(id);
        if dir.exists() {
            std::fs::remove_dir_all(dir).is_ok()
        } else {
            false
        }
    }

    fn load(&self, key: &str) -> Result<Session> {
        let dir = self.session_dir(key);
        self.load_from_dir(key, &dir)
    }

    /// Reconstructs a session from its three artifacts. `snapshot.json` is
    /// the trusted full history when present; `log.jsonl` (tolerant of a
    /// truncated trailing line) is the fallback for a session that never
    /// completed its first snapshot write. `index.json` supplies the
    /// timestamps and metadata either way.
    fn load_from_dir(&self, key: &str, dir: &std::path::Path) -> Result<Session> {
        if !dir.exists() {
            anyhow::bail!("no session directory at {}", dir.display());
        }
        let mut session = Session::new(key);

        if let Ok(raw) = std::fs::read_to_string(Self::index_path(dir)) {
            if let Ok(index) = serde_json::from_str::<Value>(&raw) {
                if let Some(ts) = index.get("created_at").and_then(Value::as_str) {
                    if let Ok(parsed) = DateTime::parse_from_rfc3339(ts) {
                        session.created_at = parsed.with_timezone(&Local);
                    }
                }
                if let Some(ts) = index.get("updated_at").and_then(Value::as_str) {
                    if let Ok(parsed) = DateTime::parse_from_rfc3339(ts) {
                        session.updated_at = parsed.with_timezone(&Local);
                    }
                }
                session.metadata = index
                    .get("metadata")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
            }
        }

        session.messages = match std::fs::read_to_string(Self::snapshot_path(dir)) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("corrupt snapshot at {}", dir.display()))?,
            Err(_) => read_log_messages(&Self::log_path(dir))?,
        };

        Ok(session)
    }
}

fn atomic_write(path: &std::path::Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn append_log(path: &std::path::Path, messages: &[Value]) -> Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    for msg in messages {
        writeln!(file, "{}", serde_json::to_string(msg)?)?;
    }
    Ok(())
}

/// Parses the append-only log, silently dropping an unparsable trailing
/// line (a process killed mid-`writeln!` leaves a partial last line, not
/// a corrupt file).
fn read_log_messages(path: &std::path::Path) -> Result<Vec<Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Ok(Vec::new()),
    };
    let lines: Vec<&str> = content.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let mut messages = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        match serde_json::from_str(line) {
            Ok(value) => messages.push(value),
            Err(_) if i == lines.len() - 1 => break,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(messages)
}

#[cfg(test)]
mod store_tests {
    use super::*;

    struct TempWorkspace {
        path: PathBuf,
    }

    impl TempWorkspace {
        fn new(name: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "nanobot-session-test-{name}-{}-{:?}",
                std::process::id(),
                std::thread::current().id()
            ));
            let _ = std::fs::remove_dir_all(&path);
            Self { path }
        }
    }

    impl Drop for TempWorkspace {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn save_writes_all_three_artifacts() {
        let ws = TempWorkspace::new("three-artifacts");
        let manager = SessionManager::with_sessions_dir(ws.path.clone());
        let mut session = Session::new("telegram:chat1");
        session.add_message("user", "hi");
        manager.save(&session).unwrap();

        let dir = manager.session_dir("telegram:chat1");
        assert!(dir.join("index.json").exists());
        assert!(dir.join("log.jsonl").exists());
        assert!(dir.join("snapshot.json").exists());

        let snapshot: Vec<Value> =
            serde_json::from_str(&std::fs::read_to_string(dir.join("snapshot.json")).unwrap())
                .unwrap();
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn log_only_appends_the_new_delta_on_each_save() {
        let ws = TempWorkspace::new("log-delta");
        let manager = SessionManager::with_sessions_dir(ws.path.clone());
        let mut session = Session::new("telegram:chat2");
        session.add_message("user", "first");
        manager.save(&session).unwrap();
        session.add_message("user", "second");
        manager.save(&session).unwrap();

        let dir = manager.session_dir("telegram:chat2");
        let log = std::fs::read_to_string(dir.join("log.jsonl")).unwrap();
        assert_eq!(log.lines().count(), 2);
    }

    #[test]
    fn index_write_is_debounced_within_the_window() {
        let ws = TempWorkspace::new("index-debounce");
        let manager = SessionManager::with_sessions_dir(ws.path.clone());
        let mut session = Session::new("telegram:chat3");
        session.add_message("user", "hi");
        manager.save(&session).unwrap();

        let dir = manager.session_dir("telegram:chat3");
        let first_write = std::fs::metadata(dir.join("index.json")).unwrap().modified().unwrap();

        session.metadata.insert("note".into(), Value::String("x".into()));
        manager.save(&session).unwrap();
        let second_write = std::fs::metadata(dir.join("index.json")).unwrap().modified().unwrap();

        assert_eq!(first_write, second_write);
    }

    #[test]
    fn flush_forces_index_write_immediately() {
        let ws = TempWorkspace::new("flush");
        let manager = SessionManager::with_sessions_dir(ws.path.clone());
        let mut session = Session::new("telegram:chat4");
        session.add_message("user", "hi");
        manager.save(&session).unwrap();
        session.metadata.insert("note".into(), Value::String("y".into()));
        manager.flush(&session).unwrap();

        let dir = manager.session_dir("telegram:chat4");
        let raw = std::fs::read_to_string(dir.join("index.json")).unwrap();
        assert!(raw.contains("\"note\":\"y\""));
    }

    #[test]
    fn reloading_reconstructs_messages_and_metadata() {
        let ws = TempWorkspace::new("reload");
        let manager = SessionManager::with_sessions_dir(ws.path.clone());
        let mut session = Session::new("telegram:chat5");
        session.add_message("user", "hi");
        session.add_message("assistant", "hello");
        session
            .metadata
            .insert("persona".into(), Value::String("default".into()));
        manager.save(&session).unwrap();

        let reloaded = manager.load("telegram:chat5").unwrap();
        assert_eq!(reloaded.messages.len(), 2);
        assert_eq!(reloaded.metadata.get("persona").unwrap(), "default");
    }

    #[test]
    fn reload_falls_back_to_log_when_snapshot_is_missing() {
        let ws = TempWorkspace::new("snapshot-missing");
        let manager = SessionManager::with_sessions_dir(ws.path.clone());
        let mut session = Session::new("telegram:chat6");
        session.add_message("user", "one");
        session.add_message("user", "two");
        manager.save(&session).unwrap();

        let dir = manager.session_dir("telegram:chat6");
        std::fs::remove_file(dir.join("snapshot.json")).unwrap();

        let reloaded = manager.load_from_dir("telegram:chat6", &dir).unwrap();
        assert_eq!(reloaded.messages.len(), 2);
    }

    #[test]
    fn log_tolerates_a_truncated_trailing_line() {
        let ws = TempWorkspace::new("truncated-log");
        let manager = SessionManager::with_sessions_dir(ws.path.clone());
        let dir = manager.session_dir("telegram:chat7");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("log.jsonl"),
            "{\"role\":\"user\",\"content\":\"ok\"}\n{\"role\":\"user\",\"cont",
        )
        .unwrap();

        let messages = read_log_messages(&dir.join("log.jsonl")).unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn list_and_delete_by_id_operate_on_session_directories() {
        let ws = TempWorkspace::new("list-delete");
        let manager = SessionManager::with_sessions_dir(ws.path.clone());
        let mut session = Session::new("telegram:chat8");
        session.add_message("user", "hi");
        manager.save(&session).unwrap();

        let ids = manager.list_ids().unwrap();
        assert_eq!(ids.len(), 1);
        assert!(manager.delete_by_id(&ids[0]));
        assert!(manager.list_ids().unwrap().is_empty());
    }
}
