//! Provider-agnostic LLM gateway with tool-use semantics

pub mod anthropic;
pub mod gateway;
pub mod provider;
pub mod replay;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use gateway::{LlmGateway, TelemetrySnapshot};
pub use provider::{LlmError, LlmProvider, LlmResult};
pub use replay::{ReplayCache, ReplayMode};
pub use types::{
    validate_tool_pairing, Completion, CompletionRequest, ContentBlock, Message, Role,
    StopReason, Tool, ToolChoice, Usage,
};
