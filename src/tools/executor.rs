use crate::cache::ToolCache;
use crate::config::Config;
use crate::providers::ToolCallRequest;
use crate::tools::registry::ToolRegistry;
use crate::utils::get_data_path;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tools that require explicit user confirmation before running, unless the
/// channel's confirmation policy auto-approves them (spec §4.4).
pub const SENSITIVE_TOOLS: [&str; 4] = ["delete_file", "run_command", "write_file", "cron_remove"];

const DEFAULT_TOOL_TIMEOUT_S: u64 = 120;
const CONFIRMATION_POLL_MS: u64 = 250;

fn truncation_limit(tool_name: &str) -> usize {
    match tool_name {
        "read_file" => 8000,
        "memory_search" => 3000,
        "browser_extract" => 5000,
        _ => 2000,
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub conf_id: String,
    pub tool_name: String,
    pub params: Value,
    pub session_key: String,
    pub channel: Option<String>,
    pub created_at_ms: i64,
    pub ttl_s: u64,
    pub decision: Option<bool>,
}

impl PendingConfirmation {
    fn is_expired(&self) -> bool {
        now_ms() - self.created_at_ms > (self.ttl_s as i64) * 1000
    }
}

/// File-backed so the `confirm approve/deny` CLI subcommand (a separate
/// process invocation) can resolve a confirmation the running gateway is
/// waiting on.
pub struct ConfirmationStore {
    path: PathBuf,
    cache: StdMutex<HashMap<String, PendingConfirmation>>,
}

impl ConfirmationStore {
    pub fn new() -> anyhow::Result<Self> {
        let path = get_data_path()?.join("confirmations.json");
        let store = Self {
            path,
            cache: StdMutex::new(HashMap::new()),
        };
        store.reload()?;
        Ok(store)
    }

    fn reload(&self) -> anyhow::Result<()> {
        let mut map = HashMap::new();
        if self.path.exists() {
            let raw = std::fs::read_to_string(&self.path)?;
            if !raw.trim().is_empty() {
                let entries: Vec<PendingConfirmation> = serde_json::from_str(&raw)?;
                for entry in entries {
                    if !entry.is_expired() {
                        map.insert(entry.conf_id.clone(), entry);
                    }
                }
            }
        }
        *self.cache.lock().unwrap() = map;
        Ok(())
    }

    fn persist(&self) -> anyhow::Result<()> {
        let entries: Vec<PendingConfirmation> = self.cache.lock().unwrap().values().cloned().collect();
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn create(
        &self,
        tool_name: &str,
        params: &Value,
        session_key: &str,
        channel: Option<&str>,
        ttl_s: u64,
    ) -> anyhow::Result<PendingConfirmation> {
        let entry = PendingConfirmation {
            conf_id: Uuid::new_v4().to_string(),
            tool_name: tool_name.to_string(),
            params: params.clone(),
            session_key: session_key.to_string(),
            channel: channel.map(ToOwned::to_owned),
            created_at_ms: now_ms(),
            ttl_s,
            decision: None,
        };
        self.cache
            .lock()
            .unwrap()
            .insert(entry.conf_id.clone(), entry.clone());
        self.persist()?;
        Ok(entry)
    }

    pub fn list(&self) -> anyhow::Result<Vec<PendingConfirmation>> {
        self.reload()?;
        Ok(self.cache.lock().unwrap().values().cloned().collect())
    }

    /// Resolve every still-pending confirmation for `session_key` (used by
    /// the agent loop's confirmation-intercept step, which matches a whole
    /// word rather than a specific `conf_id`).
    pub fn resolve_for_session(&self, session_key: &str, approve: bool) -> anyhow::Result<usize> {
        self.reload()?;
        let mut resolved = 0;
        let mut guard = self.cache.lock().unwrap();
        for entry in guard.values_mut() {
            if entry.session_key == session_key && entry.decision.is_none() {
                entry.decision = Some(approve);
                resolved += 1;
            }
        }
        drop(guard);
        if resolved > 0 {
            self.persist()?;
        }
        Ok(resolved)
    }

    pub fn resolve(&self, conf_id: &str, approve: bool) -> anyhow::Result<bool> {
        self.reload()?;
        let mut guard = self.cache.lock().unwrap();
        let Some(entry) = guard.get_mut(conf_id) else {
            return Ok(false);
        };
        entry.decision = Some(approve);
        drop(guard);
        self.persist()?;
        Ok(true)
    }

    fn poll_decision(&self, conf_id: &str) -> anyhow::Result<Option<bool>> {
        self.reload()?;
        Ok(self
            .cache
            .lock()
            .unwrap()
            .get(conf_id)
            .and_then(|e| e.decision))
    }

    fn remove(&self, conf_id: &str) -> anyhow::Result<()> {
        self.cache.lock().unwrap().remove(conf_id);
        self.persist()
    }
}

/// Outcome of a single dispatched tool call, in the order the LLM emitted
/// the calls (spec §5: "tool history turns are appended in the order the
/// LLM emitted them, regardless of completion order").
pub struct ToolCallOutcome {
    pub id: String,
    pub name: String,
    pub output: String,
}

/// Parallel batch dispatcher for a turn's tool calls: sensitivity gating
/// via [`ConfirmationStore`], cache lookups via [`ToolCache`], per-call
/// timeout, and per-tool output truncation.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    cache: Mutex<ToolCache>,
    confirmations: Arc<ConfirmationStore>,
    sensitive: HashSet<String>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, confirmations: Arc<ConfirmationStore>) -> Self {
        Self {
            registry,
            cache: Mutex::new(ToolCache::new()),
            confirmations,
            sensitive: SENSITIVE_TOOLS.iter().map(|s| s.to_string()).collect(),
            timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_S),
        }
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }

    pub async fn execute_batch(
        &self,
        calls: Vec<ToolCallRequest>,
        session_key: &str,
        channel: &str,
        config: &Config,
    ) -> Vec<ToolCallOutcome> {
        let mut set = JoinSet::new();
        for (position, call) in calls.into_iter().enumerate() {
            let registry = self.registry.clone();
            let confirmations = self.confirmations.clone();
            let is_sensitive = self.sensitive.contains(&call.name);
            let auto_approved = config.channel_auto_approves(channel, &call.name);
            let confirmation_timeout_s = config.tools.sensitive.confirmation_timeout_s;
            let session_key = session_key.to_string();
            let channel = channel.to_string();
            let timeout = self.timeout;
            let params = Value::Object(call.arguments.clone());
            let cached = self.cache.lock().await.get(&call.name, &call.arguments);
            let from_cache = cached.is_some();

            set.spawn(async move {
                let output = if let Some(hit) = cached {
                    debug!(tool = %call.name, "tool cache hit");
                    hit
                } else if is_sensitive && !auto_approved {
                    match run_confirmation_gate(
                        &confirmations,
                        &call.name,
                        &params,
                        &session_key,
                        &channel,
                        confirmation_timeout_s,
                    )
                    .await
                    {
                        Ok(true) => {
                            run_tool(&registry, &call.name, &call.arguments, timeout).await
                        }
                        Ok(false) => format!("ACTION CANCELLED: user denied '{}'", call.name),
                        Err(err) => format!("ACTION BLOCKED: {err}"),
                    }
                } else {
                    run_tool(&registry, &call.name, &call.arguments, timeout).await
                };
                (position, call.id, call.name, call.arguments, output, from_cache)
            });
        }

        let mut results: Vec<Option<ToolCallOutcome>> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((position, id, name, arguments, output, from_cache)) => {
                    if !from_cache && !output.starts_with("Error:") {
                        self.cache.lock().await.set(&name, &arguments, &output);
                    }
                    if results.len() <= position {
                        results.resize_with(position + 1, || None);
                    }
                    results[position] = Some(ToolCallOutcome { id, name, output });
                }
                Err(err) => warn!(error = %err, "tool task panicked"),
            }
        }
        results.into_iter().flatten().collect()
    }
}

async fn run_tool(
    registry: &ToolRegistry,
    name: &str,
    arguments: &serde_json::Map<String, Value>,
    timeout: Duration,
) -> String {
    let fut = registry.execute(name, arguments);
    let output = match tokio::time::timeout(timeout, fut).await {
        Ok(output) => output,
        Err(_) => format!("Error: tool '{name}' timed out after {}s", timeout.as_secs()),
    };
    let limit = truncation_limit(name);
    if output.len() > limit {
        let mut truncated = output.chars().take(limit).collect::<String>();
        truncated.push_str("... [truncated]");
        truncated
    } else {
        output
    }
}

async fn run_confirmation_gate(
    confirmations: &ConfirmationStore,
    tool_name: &str,
    params: &Value,
    session_key: &str,
    channel: &str,
    confirmation_timeout_s: u64,
) -> anyhow::Result<bool> {
    let entry = confirmations.create(
        tool_name,
        params,
        session_key,
        Some(channel),
        confirmation_timeout_s,
    )?;
    info!(conf_id = %entry.conf_id, tool = %tool_name, "awaiting confirmation");

    let deadline = Duration::from_secs(confirmation_timeout_s);
    let start = tokio::time::Instant::now();
    loop {
        if let Some(decision) = confirmations.poll_decision(&entry.conf_id)? {
            confirmations.remove(&entry.conf_id)?;
            return Ok(decision);
        }
        if start.elapsed() >= deadline {
            confirmations.remove(&entry.conf_id)?;
            anyhow::bail!("confirmation for '{tool_name}' timed out");
        }
        sleep(Duration::from_millis(CONFIRMATION_POLL_MS)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_limits_match_spec_table() {
        assert_eq!(truncation_limit("read_file"), 8000);
        assert_eq!(truncation_limit("memory_search"), 3000);
        assert_eq!(truncation_limit("browser_extract"), 5000);
        assert_eq!(truncation_limit("shell"), 2000);
    }

    #[test]
    fn sensitive_tools_match_spec_set() {
        assert!(SENSITIVE_TOOLS.contains(&"delete_file"));
        assert!(SENSITIVE_TOOLS.contains(&"run_command"));
        assert!(SENSITIVE_TOOLS.contains(&"write_file"));
        assert!(SENSITIVE_TOOLS.contains(&"cron_remove"));
        assert!(!SENSITIVE_TOOLS.contains(&"read_file"));
    }
}
