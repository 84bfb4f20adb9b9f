use crate::agent::context::ContextBuilder;
use crate::agent::subagent::SubagentManager;
use crate::agent::turn_guard::TurnGuard;
use crate::bus::{InboundMessage, MessageBus, OutboundMessage};
use crate::cancel::CancelStore;
use crate::config::{Config, WebSearchConfig};
use crate::cron::CronService;
use crate::memory::MemoryStore;
use crate::providers::base::LLMProvider;
use crate::session::{Session, SessionManager};
use crate::tagparser::TagParser;
use crate::tools::cron::CronTools;
use crate::tools::executor::{ConfirmationStore, ToolExecutor};
use crate::tools::filesystem::{DeleteFileTool, EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
use crate::tools::http::HttpRequestTool;
use crate::tools::message::MessageTool;
use crate::tools::registry::ToolRegistry;
use crate::tools::shell::ExecTool;
use crate::tools::spawn::SpawnTool;
use crate::tools::web::{WebFetchTool, WebSearchTool};
use anyhow::{Context, Result};
use chrono::Local;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{Duration, timeout};

/// Words that close out a pending sensitive-tool confirmation when they
/// appear as the leading token of a reply on a non-web channel (spec §4.8
/// step 2). Checked before any other processing so an approval/denial never
/// reaches the model as a normal chat turn.
const APPROVE_WORDS: [&str; 5] = ["yes", "y", "approve", "confirm", "ok"];
const DENY_WORDS: [&str; 5] = ["no", "n", "deny", "cancel", "reject"];

/// Inbound messages with the same `(session_key, content hash)` arriving
/// within this window are treated as a duplicate delivery and dropped
/// (spec §4.8 step 1 — deliberately content-only/media-blind, see SPEC_FULL
/// §9).
const DEDUP_WINDOW: Duration = Duration::from_secs(2);

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Rough token estimate (~4 chars/token) used to decide when the in-turn
/// message list needs summarizing (spec §4.8 step 7).
fn estimate_tokens(messages: &[Value]) -> usize {
    let chars: usize = messages
        .iter()
        .map(|m| match m.get("content") {
            Some(Value::String(s)) => s.len(),
            Some(other) => other.to_string().len(),
            None => 0,
        })
        .sum();
    chars / 4
}

pub struct AgentLoop {
    bus: Arc<MessageBus>,
    provider: Arc<dyn LLMProvider>,
    workspace: PathBuf,
    model: String,
    max_iterations: u32,
    memory_window: usize,
    history_token_budget: usize,
    context: ContextBuilder,
    sessions: Arc<SessionManager>,
    tools: Arc<ToolRegistry>,
    tool_executor: Arc<ToolExecutor>,
    confirmations: Arc<ConfirmationStore>,
    cancellations: Arc<CancelStore>,
    tagparser: TagParser,
    config: Config,
    message_tool: Arc<MessageTool>,
    spawn_tool: Arc<SpawnTool>,
    cron_tool: Option<Arc<CronTools>>,
    subagents: Arc<SubagentManager>,
    running: AtomicBool,
    session_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    recent_inbound: StdMutex<HashMap<String, (String, Instant)>>,
}

impl AgentLoop {
    fn available_tools_text(&self) -> String {
        let mut tool_names = self.tools.tool_names();
        tool_names.sort();
        if tool_names.is_empty() {
            "(none)".to_string()
        } else {
            tool_names.join(", ")
        }
    }

    fn runtime_facts_message(&self) -> serde_json::Value {
        let tools_text = self.available_tools_text();

        json!({
            "role": "system",
            "content": format!(
                "Runtime facts (authoritative): active model is '{model}'; available tools are: {tools}. \
        If a user asks for external actions (network/file/command/scheduling), do not claim tools are unavailable; call the matching tool directly. \
        Focus on the current user message only; do not summarize prior tasks unless explicitly requested.",
                model = self.model,
                tools = tools_text
            )
        })
    }

    fn build_turn_messages(
        &self,
        history: &[Value],
        current_message: &str,
        channel: &str,
        chat_id: &str,
        media: Option<&[String]>,
    ) -> Vec<Value> {
        let mut messages = self.context.build_messages(
            history,
            current_message,
            None,
            Some(channel),
            Some(chat_id),
            media,
        );
        messages.insert(1, self.runtime_facts_message());
        messages
    }

    fn extract_json_object(text: &str) -> Option<Value> {
        let trimmed = text.trim();
        if let Ok(value) = serde_json::from_str::<Value>(trimmed)
            && value.is_object()
        {
            return Some(value);
        }
        if trimmed.starts_with("```") {
            let mut lines = trimmed.lines();
            let _ = lines.next();
            let body = lines.collect::<Vec<_>>().join("\n");
            let stripped = body.rsplit_once("```").map(|(v, _)| v).unwrap_or(&body);
            if let Ok(value) = serde_json::from_str::<Value>(stripped.trim())
                && value.is_object()
            {
                return Some(value);
            }
        }
        None
    }

    pub fn new(
        bus: Arc<MessageBus>,
        provider: Arc<dyn LLMProvider>,
        workspace: PathBuf,
        model: Option<String>,
        max_iterations: u32,
        memory_window: usize,
        web_search: WebSearchConfig,
        exec_timeout_s: u64,
        restrict_to_workspace: bool,
        allow_unsafe_commands: bool,
        cron_service: Option<Arc<CronService>>,
        session_manager: Option<Arc<SessionManager>>,
        config: Config,
    ) -> Result<Self> {
        let context = ContextBuilder::new(workspace.clone())?;
        let sessions = session_manager.unwrap_or(Arc::new(SessionManager::new()?));
        let mut tools = ToolRegistry::new();
        let model_name = model.unwrap_or_else(|| provider.default_model().to_string());

        let allowed_dir = if restrict_to_workspace {
            Some(workspace.clone())
        } else {
            None
        };

        tools.register(Arc::new(ReadFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(WriteFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(EditFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(DeleteFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(ListDirTool::new(allowed_dir.clone())));
        tools.register(Arc::new(ExecTool::with_unsafe_flag(
            exec_timeout_s,
            Some(workspace.clone()),
            None,
            None,
            restrict_to_workspace,
            allow_unsafe_commands,
        )));
        tools.register(Arc::new(WebSearchTool::from_config(web_search.clone())));
        tools.register(Arc::new(WebFetchTool::new(50_000)));
        tools.register(Arc::new(HttpRequestTool::new(30, 50_000)));

        let message_tool = Arc::new(MessageTool::new(bus.outbound_sender()));
        tools.register(message_tool.clone());

        let subagents = Arc::new(SubagentManager::new(
            provider.clone(),
            workspace.clone(),
            bus.clone(),
            model_name.clone(),
            web_search,
            exec_timeout_s,
            restrict_to_workspace,
        ));
        let spawn_tool = Arc::new(SpawnTool::new(subagents.clone()));
        tools.register(spawn_tool.clone());

        let cron_tool = if let Some(cron_service) = cron_service {
            let tool = Arc::new(CronTools::new(cron_service));
            tools.register(tool.add.clone());
            tools.register(tool.list.clone());
            tools.register(tool.remove.clone());
            Some(tool)
        } else {
            None
        };

        let tools = Arc::new(tools);
        let confirmations = Arc::new(ConfirmationStore::new()?);
        let cancellations = Arc::new(CancelStore::new()?);
        let tool_executor = Arc::new(ToolExecutor::new(tools.clone(), confirmations.clone()));
        let tagparser = TagParser::new(workspace.clone());
        let history_token_budget = config.agents.defaults.history_token_budget;

        Ok(Self {
            bus,
            provider: provider.clone(),
            workspace,
            model: model_name,
            max_iterations,
            memory_window,
            history_token_budget,
            context,
            sessions,
            tools,
            tool_executor,
            confirmations,
            cancellations,
            tagparser,
            config,
            message_tool,
            spawn_tool,
            cron_tool,
            subagents,
            running: AtomicBool::new(false),
            session_locks: StdMutex::new(HashMap::new()),
            recent_inbound: StdMutex::new(HashMap::new()),
        })
    }

    pub async fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::Relaxed);
        while self.running.load(Ordering::Relaxed) {
            let message = timeout(Duration::from_secs(1), self.bus.consume_inbound()).await;
            let Some(msg) = (match message {
                Ok(v) => v,
                Err(_) => continue,
            }) else {
                continue;
            };

            if msg.channel != "system" && self.is_duplicate_inbound(&msg) {
                continue;
            }

            let response = match self.process_message(msg.clone(), None).await {
                Ok(resp) => resp,
                Err(err) => {
                    let mut out = OutboundMessage::new(
                        msg.channel.clone(),
                        msg.chat_id.clone(),
                        format!("Sorry, I encountered an error: {err}"),
                    );
                    out.metadata = msg.metadata.clone();
                    out
                }
            };
            let _ = self.bus.publish_outbound(response).await;
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Drops a message whose content hash repeats the previous message on the
    /// same session key within [`DEDUP_WINDOW`] — a duplicate delivery from a
    /// retrying channel transport, not a second user turn.
    fn is_duplicate_inbound(&self, msg: &InboundMessage) -> bool {
        let key = msg.session_key();
        let hash = content_hash(&msg.content);
        let mut map = self
            .recent_inbound
            .lock()
            .expect("recent_inbound mutex poisoned");
        map.retain(|_, (_, seen_at)| seen_at.elapsed() < DEDUP_WINDOW);
        if let Some((last_hash, seen_at)) = map.get(&key)
            && *last_hash == hash
            && seen_at.elapsed() < DEDUP_WINDOW
        {
            return true;
        }
        map.insert(key, (hash, Instant::now()));
        false
    }

    /// Per-session-key serialization for the fetch-through-save critical
    /// section, so two inbound messages for the same session never
    /// interleave their history reads and writes.
    async fn session_lock(&self, session_key: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self
            .session_locks
            .lock()
            .expect("session_locks mutex poisoned");
        map.entry(session_key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Matches a leading approve/deny word against any confirmation still
    /// pending for this session (spec §4.8 step 2). Web channels are
    /// excluded since their UI resolves confirmations through a dedicated
    /// control, not free text.
    async fn try_confirmation_intercept(
        &self,
        msg: &InboundMessage,
        session_key: &str,
    ) -> Option<OutboundMessage> {
        if msg.channel == "web" {
            return None;
        }
        let word = msg
            .content
            .trim()
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        let approve = APPROVE_WORDS.contains(&word.as_str());
        let deny = DENY_WORDS.contains(&word.as_str());
        if !approve && !deny {
            return None;
        }
        let resolved = self
            .confirmations
            .resolve_for_session(session_key, approve)
            .ok()?;
        if resolved == 0 {
            return None;
        }
        let text = if approve {
            "Confirmed. Proceeding."
        } else {
            "Cancelled."
        };
        Some(OutboundMessage::new(
            msg.channel.clone(),
            msg.chat_id.clone(),
            text,
        ))
    }

    /// Applies the tag-parser side effects of a finished reply: persona file
    /// writes invalidate the cached system prompt, and `discord_send`/
    /// `discord_embed` tags become outbound bus messages to the `discord`
    /// channel (spec §4.5).
    async fn apply_tag_effects(&self, raw_answer: &str, sender_id: &str) -> Result<String> {
        let result = self.tagparser.process(
            raw_answer,
            sender_id,
            self.config.agents.defaults.enable_dynamic_personality,
        )?;

        if result.soul_updated || result.identity_updated {
            self.context.invalidate_stable_prompt(Some(sender_id));
        }

        for send in &result.discord_sends {
            let _ = self
                .bus
                .publish_outbound(OutboundMessage::new(
                    "discord",
                    send.channel_id.clone(),
                    send.message.clone(),
                ))
                .await;
        }
        for embed in &result.discord_embeds {
            let _ = self
                .bus
                .publish_outbound(
                    OutboundMessage::new(
                        "discord",
                        embed.channel_id.clone(),
                        format!("**{}**\n{}", embed.title, embed.description),
                    )
                    .with_type("embed"),
                )
                .await;
        }

        Ok(result.clean_text)
    }

    /// Condenses the turn's message list once it crosses
    /// [`Self::history_token_budget`], keeping a fixed leading trio (system
    /// prompt, runtime facts, initial user message) and a recent tail intact
    /// and replacing everything between with one "CONTEXT SUMMARY" system
    /// message (spec §4.8 step 7). Falls back to dropping whole messages from
    /// the oldest end if the summarization call itself fails.
    async fn maybe_summarize(&self, messages: &mut Vec<Value>) {
        const HEAD: usize = 3;
        const TAIL_KEEP: usize = 6;

        if estimate_tokens(messages) <= self.history_token_budget {
            return;
        }
        if messages.len() <= HEAD + TAIL_KEEP + 1 {
            return;
        }

        let tail_start = messages.len() - TAIL_KEEP;
        let middle = messages[HEAD..tail_start].to_vec();
        match self.summarize_middle(&middle).await {
            Ok(summary) => {
                let summary_msg = json!({
                    "role": "system",
                    "content": format!("CONTEXT SUMMARY (earlier turns, condensed): {summary}"),
                });
                let tail = messages[tail_start..].to_vec();
                messages.truncate(HEAD);
                messages.push(summary_msg);
                messages.extend(tail);
            }
            Err(err) => {
                eprintln!("Warning: context summarization failed, falling back to FIFO trim: {err}");
                self.fifo_trim(messages, HEAD);
            }
        }
    }

    async fn summarize_middle(&self, middle: &[Value]) -> Result<String> {
        let transcript = middle
            .iter()
            .map(|m| {
                let role = m.get("role").and_then(Value::as_str).unwrap_or("?");
                let content = match m.get("content") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                format!("{role}: {content}")
            })
            .collect::<Vec<_>>()
            .join("\n");

        let response = self
            .provider
            .chat(
                &[
                    json!({
                        "role": "system",
                        "content": "Summarize the following conversation turns in 200 words or fewer. Preserve concrete facts, decisions, and open threads; drop pleasantries."
                    }),
                    json!({ "role": "user", "content": transcript }),
                ],
                None,
                Some(&self.model),
                400,
                0.0,
            )
            .await?;
        Ok(response.content.unwrap_or_default())
    }

    /// Drops whole messages from just after the kept head, oldest first,
    /// until the turn is back under budget or nothing more can be dropped.
    fn fifo_trim(&self, messages: &mut Vec<Value>, head: usize) {
        while estimate_tokens(messages) > self.history_token_budget && messages.len() > head + 1 {
            messages.remove(head);
        }
    }

    /// Dispatches a turn's tool calls through [`ToolExecutor`] (parallel,
    /// cache-aware, confirmation-gated, timed out, truncated) and emits
    /// `tool_execution` progress events on the bus.
    async fn run_tool_calls(
        &self,
        calls: Vec<crate::providers::ToolCallRequest>,
        session_key: &str,
        channel: &str,
        chat_id: &str,
        messages: &mut Vec<Value>,
        tools_used: &mut Vec<String>,
    ) {
        if calls.is_empty() {
            return;
        }
        let names = calls.iter().map(|c| c.name.clone()).collect::<Vec<_>>().join(", ");
        let _ = self
            .bus
            .publish_outbound(
                OutboundMessage::new(channel, chat_id, format!("Running tool(s): {names}"))
                    .with_type("tool_execution"),
            )
            .await;

        let outcomes = self
            .tool_executor
            .execute_batch(calls, session_key, channel, &self.config)
            .await;

        for outcome in outcomes {
            tools_used.push(outcome.name.clone());
            self.context
                .add_tool_result(messages, &outcome.id, &outcome.name, &outcome.output);
            let _ = self
                .bus
                .publish_outbound(
                    OutboundMessage::new(
                        channel,
                        chat_id,
                        format!("{}: {}", outcome.name, outcome.output),
                    )
                    .with_type("tool_execution"),
                )
                .await;
        }
    }

    async fn process_message(
        &self,
        msg: InboundMessage,
        session_key: Option<&str>,
    ) -> Result<OutboundMessage> {
        if msg.channel == "system" {
            return self.process_system_message(msg).await;
        }

        let session_key = session_key
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| msg.session_key());

        if let Some(ack) = self.try_confirmation_intercept(&msg, &session_key).await {
            return Ok(ack);
        }

        let lock = self.session_lock(&session_key).await;
        let _guard = lock.lock().await;

        let _ = self
            .bus
            .publish_outbound(
                OutboundMessage::new(msg.channel.clone(), msg.chat_id.clone(), "")
                    .with_type("typing"),
            )
            .await;

        let mut session = self.sessions.get_or_create(&session_key);
        if session.messages.len() > self.memory_window {
            if let Err(err) = self.consolidate_memory(&mut session).await {
                eprintln!("Warning: memory consolidation failed: {err}");
            }
        }
        self.message_tool
            .set_context(msg.channel.clone(), msg.chat_id.clone());
        self.spawn_tool
            .set_context(msg.channel.clone(), msg.chat_id.clone());
        if let Some(cron_tool) = &self.cron_tool {
            cron_tool.set_context(msg.channel.clone(), msg.chat_id.clone());
        }

        let media = if msg.media.is_empty() {
            None
        } else {
            Some(msg.media.as_slice())
        };
        // Deterministic anti-contamination: only current turn is sent to the model.
        let history = session.get_history(0);
        let mut messages =
            self.build_turn_messages(&history, &msg.content, &msg.channel, &msg.chat_id, media);

        let mut final_content: Option<String> = None;
        let mut retried_with_fresh_context = false;
        let mut tools_used: Vec<String> = Vec::new();
        let turn_guard = TurnGuard::new(
            self.provider.as_ref(),
            &self.model,
            self.available_tools_text(),
            self.max_iterations,
        );
        for iteration in 1..=self.max_iterations {
            if self.cancellations.is_cancelled(&session_key).unwrap_or(false) {
                let _ = self.cancellations.clear(&session_key);
                final_content = Some("Cancelled.".to_string());
                break;
            }

            self.maybe_summarize(&mut messages).await;

            let tool_defs = self.tools.get_definitions();
            let response = self
                .provider
                .chat(&messages, Some(&tool_defs), Some(&self.model), 4096, 0.7)
                .await?;

            if response.has_tool_calls() {
                let tool_call_dicts = response
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": serde_json::to_string(&tc.arguments).unwrap_or_else(|_| "{}".to_string()),
                            }
                        })
                    })
                    .collect::<Vec<_>>();
                self.context.add_assistant_message(
                    &mut messages,
                    response.content.as_deref(),
                    Some(tool_call_dicts),
                    response.reasoning_content.as_deref(),
                );

                self.run_tool_calls(
                    response.tool_calls,
                    &session_key,
                    &msg.channel,
                    &msg.chat_id,
                    &mut messages,
                    &mut tools_used,
                )
                .await;
                messages.push(json!({
                    "role": "user",
                    "content": "Reflect on the results and decide next steps."
                }));
            } else {
                if turn_guard
                    .should_retry_after_false_no_tools_claim(response.content.as_deref(), iteration)
                    .await
                {
                    if !retried_with_fresh_context {
                        messages = self.build_turn_messages(
                            &[],
                            &msg.content,
                            &msg.channel,
                            &msg.chat_id,
                            media,
                        );
                        messages.push(turn_guard.correction_message());
                        retried_with_fresh_context = true;
                        continue;
                    }
                    final_content = Some(turn_guard.tools_available_response());
                    break;
                }
                final_content = response.content;
                break;
            }
        }

        let raw_answer = final_content.unwrap_or_else(|| {
            "I've completed processing but have no response to give.".to_string()
        });
        let answer = match self.apply_tag_effects(&raw_answer, &msg.sender_id).await {
            Ok(clean) => clean,
            Err(err) => {
                eprintln!("Warning: tag processing failed: {err}");
                raw_answer
            }
        };

        session.add_message("user", &msg.content);
        session.add_message_with_tools("assistant", &answer, Some(&tools_used));
        self.sessions.save(&session)?;

        let _ = self
            .bus
            .publish_outbound(
                OutboundMessage::new(msg.channel.clone(), msg.chat_id.clone(), "")
                    .with_type("stop_typing"),
            )
            .await;

        let mut outbound = OutboundMessage::new(msg.channel, msg.chat_id, answer);
        outbound.metadata = msg.metadata;
        Ok(outbound)
    }

    async fn process_system_message(&self, msg: InboundMessage) -> Result<OutboundMessage> {
        let (origin_channel, origin_chat_id) = msg
            .chat_id
            .split_once(':')
            .map(|(c, id)| (c.to_string(), id.to_string()))
            .unwrap_or_else(|| ("cli".to_string(), msg.chat_id.clone()));

        self.message_tool
            .set_context(origin_channel.clone(), origin_chat_id.clone());
        self.spawn_tool
            .set_context(origin_channel.clone(), origin_chat_id.clone());
        if let Some(cron_tool) = &self.cron_tool {
            cron_tool.set_context(origin_channel.clone(), origin_chat_id.clone());
        }

        let session_key = format!("{origin_channel}:{origin_chat_id}");
        let lock = self.session_lock(&session_key).await;
        let _guard = lock.lock().await;

        let mut session = self.sessions.get_or_create(&session_key);
        // Deterministic anti-contamination: only current turn is sent to the model.
        let history = session.get_history(0);
        let mut messages = self.build_turn_messages(
            &history,
            &msg.content,
            &origin_channel,
            &origin_chat_id,
            None,
        );

        let mut final_content: Option<String> = None;
        let mut retried_with_fresh_context = false;
        let mut tools_used: Vec<String> = Vec::new();
        let turn_guard = TurnGuard::new(
            self.provider.as_ref(),
            &self.model,
            self.available_tools_text(),
            self.max_iterations,
        );
        for iteration in 1..=self.max_iterations {
            if self.cancellations.is_cancelled(&session_key).unwrap_or(false) {
                let _ = self.cancellations.clear(&session_key);
                final_content = Some("Cancelled.".to_string());
                break;
            }

            self.maybe_summarize(&mut messages).await;

            let tool_defs = self.tools.get_definitions();
            let response = self
                .provider
                .chat(&messages, Some(&tool_defs), Some(&self.model), 4096, 0.7)
                .await?;

            if response.has_tool_calls() {
                let tool_call_dicts = response
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": serde_json::to_string(&tc.arguments).unwrap_or_else(|_| "{}".to_string()),
                            }
                        })
                    })
                    .collect::<Vec<_>>();
                self.context.add_assistant_message(
                    &mut messages,
                    response.content.as_deref(),
                    Some(tool_call_dicts),
                    response.reasoning_content.as_deref(),
                );

                self.run_tool_calls(
                    response.tool_calls,
                    &session_key,
                    &origin_channel,
                    &origin_chat_id,
                    &mut messages,
                    &mut tools_used,
                )
                .await;
                messages.push(json!({
                    "role": "user",
                    "content": "Reflect on the results and decide next steps."
                }));
            } else {
                if turn_guard
                    .should_retry_after_false_no_tools_claim(response.content.as_deref(), iteration)
                    .await
                {
                    if !retried_with_fresh_context {
                        messages = self.build_turn_messages(
                            &[],
                            &msg.content,
                            &origin_channel,
                            &origin_chat_id,
                            None,
                        );
                        messages.push(turn_guard.correction_message());
                        retried_with_fresh_context = true;
                        continue;
                    }
                    final_content = Some(turn_guard.tools_available_response());
                    break;
                }
                final_content = response.content;
                break;
            }
        }

        let raw_answer = final_content.unwrap_or_else(|| "Background task completed.".to_string());
        let answer = match self.apply_tag_effects(&raw_answer, &msg.sender_id).await {
            Ok(clean) => clean,
            Err(err) => {
                eprintln!("Warning: tag processing failed: {err}");
                raw_answer
            }
        };
        session.add_message(
            "user",
            &format!("[System: {}] {}", msg.sender_id, msg.content),
        );
        session.add_message_with_tools("assistant", &answer, Some(&tools_used));
        self.sessions.save(&session)?;

        Ok(OutboundMessage::new(origin_channel, origin_chat_id, answer))
    }

    async fn consolidate_memory(&self, session: &mut Session) -> Result<()> {
        let memory = MemoryStore::new(self.workspace.clone())?;
        let keep_count = usize::min(10, usize::max(2, self.memory_window / 2));
        if session.messages.len() <= keep_count {
            return Ok(());
        }

        let split_idx = session.messages.len() - keep_count;
        let old_messages = &session.messages[..split_idx];
        let mut lines = Vec::new();
        for msg in old_messages {
            let Some(content) = msg.get("content").and_then(Value::as_str) else {
                continue;
            };
            if content.trim().is_empty() {
                continue;
            }
            let timestamp = msg
                .get("timestamp")
                .and_then(Value::as_str)
                .unwrap_or("?")
                .chars()
                .take(16)
                .collect::<String>();
            let role = msg
                .get("role")
                .and_then(Value::as_str)
                .unwrap_or("user")
                .to_ascii_uppercase();
            let tools_suffix = msg
                .get("tools_used")
                .and_then(Value::as_array)
                .filter(|tools| !tools.is_empty())
                .map(|tools| {
                    let list = tools
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(", ");
                    if list.is_empty() {
                        String::new()
                    } else {
                        format!(" [tools: {list}]")
                    }
                })
                .unwrap_or_default();
            lines.push(format!(
                "[{timestamp}] {role}{tools_suffix}: {content}",
                content = content.trim()
            ));
        }

        if lines.is_empty() {
            session.messages = session.messages[split_idx..].to_vec();
            self.sessions.save(session)?;
            return Ok(());
        }

        let current_memory = memory.read_long_term();
        let now = Local::now().format("%Y-%m-%d %H:%M").to_string();
        let prompt = format!(
            "You are a memory consolidation agent. Process this conversation and return a JSON object with exactly two keys:\n\n\
1. \"history_entry\": A paragraph (2-5 sentences) summarizing the key events/decisions/topics. Start with a timestamp like [{now}]. Include enough detail to be useful when found by grep search later.\n\n\
2. \"memory_update\": The updated long-term memory content. Add any new facts: user preferences, personal info, habits, project context, technical decisions, tools/services used. If nothing new, return the existing content unchanged.\n\n\
## Current Long-term Memory\n{current_memory}\n\n\
## Conversation to Process\n{conversation}\n\n\
Respond with ONLY valid JSON, no markdown fences.",
            current_memory = if current_memory.trim().is_empty() {
                "(empty)"
            } else {
                current_memory.trim()
            },
            conversation = lines.join("\n")
        );

        let response = self
            .provider
            .chat(
                &[
                    json!({
                        "role": "system",
                        "content": "You are a memory consolidation agent. Respond only with valid JSON."
                    }),
                    json!({
                        "role": "user",
                        "content": prompt
                    }),
                ],
                None,
                Some(&self.model),
                1200,
                0.0,
            )
            .await?;

        let parsed = response
            .content
            .as_deref()
            .and_then(Self::extract_json_object)
            .context("memory consolidation returned non-JSON content")?;

        if let Some(entry) = parsed.get("history_entry").and_then(Value::as_str)
            && !entry.trim().is_empty()
        {
            memory.append_history(entry)?;
        }
        if let Some(update) = parsed.get("memory_update").and_then(Value::as_str)
            && update.trim() != current_memory.trim()
        {
            memory.write_long_term(update)?;
        }

        session.messages = session.messages[split_idx..].to_vec();
        self.sessions.save(session)?;
        Ok(())
    }

    pub async fn process_direct(
        &self,
        content: &str,
        session_key: Option<&str>,
        channel: Option<&str>,
        chat_id: Option<&str>,
    ) -> Result<String> {
        let session_key = session_key.unwrap_or("cli:direct");
        let (default_channel, default_chat_id) = session_key
            .split_once(':')
            .map(|(c, id)| (c.to_string(), id.to_string()))
            .unwrap_or_else(|| ("cli".to_string(), "direct".to_string()));
        let channel = channel.unwrap_or(&default_channel);
        let chat_id = chat_id.unwrap_or(&default_chat_id);

        let msg = InboundMessage::new(channel, "user", chat_id, content);
        let response = self.process_message(msg, Some(session_key)).await?;
        Ok(response.content)
    }

    pub fn workspace(&self) -> &PathBuf {
        &self.workspace
    }

    pub async fn running_subagents(&self) -> usize {
        self.subagents.get_running_count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_deterministic_and_content_sensitive() {
        assert_eq!(content_hash("hi"), content_hash("hi"));
        assert_ne!(content_hash("hi"), content_hash("hi "));
    }

    #[test]
    fn estimate_tokens_counts_string_content_only() {
        let messages = vec![
            json!({"role": "system", "content": "a".repeat(40)}),
            json!({"role": "user", "content": "b".repeat(20)}),
            json!({"role": "assistant", "tool_calls": []}),
        ];
        assert_eq!(estimate_tokens(&messages), (40 + 20) / 4);
    }

    #[test]
    fn estimate_tokens_serializes_non_string_content() {
        let messages = vec![json!({"role": "user", "content": {"nested": "x"}})];
        let expected = json!({"nested": "x"}).to_string().len() / 4;
        assert_eq!(estimate_tokens(&messages), expected);
    }
}
