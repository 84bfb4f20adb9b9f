pub mod base;
pub mod litellm;
pub mod openai;
pub mod transcription;

pub use base::{LLMProvider, LLMResponse, StreamEvent, ToolCallRequest};
pub use litellm::LiteLLMProvider;
pub use openai::OpenAIProvider;
pub use transcription::GroqTranscriptionProvider;
