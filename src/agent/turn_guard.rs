use crate::providers::base::LLMProvider;
use serde_json::{Value, json};

/// Phrases an LLM sometimes emits when it forgets the tools it was just
/// handed the definitions for. Matching one of these is a cheap first
/// filter before asking the model itself to confirm the refusal is false.
const REFUSAL_MARKERS: [&str; 6] = [
    "i don't have access",
    "i do not have access",
    "i cannot execute",
    "i can't execute",
    "no tools available",
    "i don't have the ability",
];

/// Catches a model falsely claiming it has no tools available when the
/// turn's tool definitions say otherwise, and steers one retry with a
/// fresh, tool-reminding context before giving up and telling the user
/// directly.
pub struct TurnGuard<'a> {
    provider: &'a dyn LLMProvider,
    model: String,
    tools_text: String,
    max_iterations: u32,
}

impl<'a> TurnGuard<'a> {
    pub fn new(
        provider: &'a dyn LLMProvider,
        model: &str,
        tools_text: String,
        max_iterations: u32,
    ) -> Self {
        Self {
            provider,
            model: model.to_string(),
            tools_text,
            max_iterations,
        }
    }

    fn looks_like_false_refusal(&self, content: &str) -> bool {
        if self.tools_text.is_empty() || self.tools_text == "(none)" {
            return false;
        }
        let lower = content.to_lowercase();
        REFUSAL_MARKERS.iter().any(|marker| lower.contains(marker))
    }

    /// Only called once a turn ends without tool calls. `iteration` is the
    /// 1-based loop counter so the last iteration never retries (there'd be
    /// no budget left to act on the retry anyway).
    pub async fn should_retry_after_false_no_tools_claim(
        &self,
        content: Option<&str>,
        iteration: u32,
    ) -> bool {
        let Some(content) = content else {
            return false;
        };
        if iteration >= self.max_iterations || !self.looks_like_false_refusal(content) {
            return false;
        }

        let classifier_prompt = format!(
            "A tool-using assistant replied with the message below, claiming it lacks access to \
             tools. It actually has these tools available: {}.\n\nReply with exactly one word, \
             YES or NO: is the assistant incorrectly claiming it has no tool access?\n\nMessage:\n{content}",
            self.tools_text
        );
        let messages = vec![json!({"role": "user", "content": classifier_prompt})];
        match self
            .provider
            .chat(&messages, None, Some(&self.model), 16, 0.0)
            .await
        {
            Ok(response) => response
                .content
                .map(|text| text.trim().to_uppercase().starts_with("YES"))
                .unwrap_or(true),
            // Provider hiccup: trust the heuristic match rather than silently giving up the retry.
            Err(_) => true,
        }
    }

    pub fn correction_message(&self) -> Value {
        json!({
            "role": "user",
            "content": format!(
                "You do have tools available: {}. Please use the appropriate tool to complete \
                 the request instead of saying you cannot.",
                self.tools_text
            )
        })
    }

    pub fn tools_available_response(&self) -> String {
        format!(
            "I have access to the following tools and should be able to help: {}. Let me know \
             if you'd like me to try again.",
            self.tools_text
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::base::{LLMResponse, StreamEvent};
    use async_trait::async_trait;

    struct StubProvider;

    #[async_trait]
    impl LLMProvider for StubProvider {
        async fn chat(
            &self,
            _messages: &[Value],
            _tools: Option<&[Value]>,
            _model: Option<&str>,
            _max_tokens: u32,
            _temperature: f32,
        ) -> anyhow::Result<LLMResponse> {
            Ok(LLMResponse {
                content: Some("YES".to_string()),
                ..Default::default()
            })
        }

        fn default_model(&self) -> &str {
            "stub"
        }
    }

    #[allow(dead_code)]
    fn _stream_event_is_unused_here(_e: StreamEvent) {}

    #[tokio::test]
    async fn detects_false_refusal_and_asks_classifier() {
        let provider = StubProvider;
        let guard = TurnGuard::new(&provider, "stub", "read_file, write_file".to_string(), 10);
        assert!(
            guard
                .should_retry_after_false_no_tools_claim(
                    Some("I don't have access to any tools."),
                    1
                )
                .await
        );
    }

    #[tokio::test]
    async fn ignores_normal_replies() {
        let provider = StubProvider;
        let guard = TurnGuard::new(&provider, "stub", "read_file".to_string(), 10);
        assert!(
            !guard
                .should_retry_after_false_no_tools_claim(Some("Here is your answer."), 1)
                .await
        );
    }

    #[tokio::test]
    async fn never_retries_on_final_iteration() {
        let provider = StubProvider;
        let guard = TurnGuard::new(&provider, "stub", "read_file".to_string(), 10);
        assert!(
            !guard
                .should_retry_after_false_no_tools_claim(
                    Some("I don't have access to any tools."),
                    10
                )
                .await
        );
    }
}
