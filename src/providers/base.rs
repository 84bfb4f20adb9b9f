use async_trait::async_trait;
use serde_json::{Map, Value};

/// A single reassembled tool call, produced either from a provider's native
/// function-calling fields or from one of the two fallback encodings the
/// stream consumer recognizes (raw `{name, arguments|parameters}` JSON or a
/// `<|tool_call_begin|>...<|tool_call_end|>` envelope).
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct LLMResponse {
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: String,
    pub usage: Map<String, Value>,
}

impl LLMResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// One unit of a streamed turn, in emission order. The stream consumer
/// (`agent::loop_`) turns these into outbound `chunk`/`thinking`/`activity`
/// events and reassembles tool-call fragments by index.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A fragment of assistant-visible text.
    ContentDelta(String),
    /// A fragment of provider reasoning/thinking text (never shown to the user).
    ThinkingDelta(String),
    /// A fragment of a tool call's arguments, addressed by its position in
    /// the response (tool calls may arrive interleaved across chunks).
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_fragment: Option<String>,
    },
    /// Terminal event: the stream is done.
    Done {
        finish_reason: String,
        usage: Map<String, Value>,
    },
}

#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn chat(
        &self,
        messages: &[Value],
        tools: Option<&[Value]>,
        model: Option<&str>,
        max_tokens: u32,
        temperature: f32,
    ) -> anyhow::Result<LLMResponse>;

    /// Streaming variant (spec §4.8.1). The default implementation falls
    /// back to a single non-streaming call and replays it as one content
    /// event followed by `Done` — sufficient for providers fronted by
    /// `litellm-rs` that don't expose a native streaming transport here.
    async fn chat_stream(
        &self,
        messages: &[Value],
        tools: Option<&[Value]>,
        model: Option<&str>,
        max_tokens: u32,
        temperature: f32,
    ) -> anyhow::Result<Vec<StreamEvent>> {
        let response = self
            .chat(messages, tools, model, max_tokens, temperature)
            .await?;
        let mut events = Vec::new();
        if let Some(content) = response.content {
            events.push(StreamEvent::ContentDelta(content));
        }
        for (index, call) in response.tool_calls.into_iter().enumerate() {
            events.push(StreamEvent::ToolCallDelta {
                index,
                id: Some(call.id),
                name: Some(call.name),
                arguments_fragment: Some(
                    serde_json::to_string(&call.arguments).unwrap_or_default(),
                ),
            });
        }
        events.push(StreamEvent::Done {
            finish_reason: response.finish_reason,
            usage: response.usage,
        });
        Ok(events)
    }

    fn default_model(&self) -> &str;
}
