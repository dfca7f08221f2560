//! Shared types for the appforge generation server.

pub mod config;
pub mod error;
pub mod event;
pub mod settings;

pub use config::ServerConfig;
pub use error::{Error, Result};
pub use event::{
    AgentMessage, AgentRequest, AgentSseEvent, AgentStatus, ConversationMessage, EventBlock,
    FileEntry, MessageKind, UserMessage,
};
pub use settings::{EngineSettings, InteractionMode};
