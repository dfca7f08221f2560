//! Client-facing wire model - requests in, streamed events out
//!
//! Wire format:
//!
//! Client → Server (single POST, streaming response):
//!   { "allMessages": [...], "applicationId": "...", "traceId": "...",
//!     "agentState": {...}, "allFiles": [{"path": ..., "content": ...}],
//!     "settings": {...} }
//!
//! Server → Client (zero or more running events, one terminal idle event):
//!   { "status": "running", "traceId": "...", "message": { "kind": "StageResult",
//!     "messages": [{"content": "...", "ts": "..."}], ... } }

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Outbound events
// ---------------------------------------------------------------------------

/// Status of the agent while a turn is being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Running,
    Idle,
}

/// Kind of message carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    StageResult,
    ReviewResult,
    RefinementRequest,
    RuntimeError,
}

/// One formatted content block with its emission timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBlock {
    pub content: String,
    pub ts: DateTime<Utc>,
}

impl EventBlock {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ts: Utc::now(),
        }
    }
}

/// The detailed message payload of an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Fixed to "assistant" so clients can tell agent messages apart in history.
    pub role: String,
    pub kind: MessageKind,
    pub messages: Vec<EventBlock>,
    /// Updated state of the agent for the next request. Opaque to the client.
    #[serde(rename = "agentState", skip_serializing_if = "Option::is_none")]
    pub agent_state: Option<serde_json::Value>,
    /// Unified diff of the code changes made by the agent this turn.
    #[serde(rename = "unifiedDiff", skip_serializing_if = "Option::is_none")]
    pub unified_diff: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
}

/// One event on the outbound stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSseEvent {
    pub status: AgentStatus,
    #[serde(rename = "traceId")]
    pub trace_id: String,
    /// Position in the session's stream. Strictly increasing.
    pub seq: u64,
    pub message: AgentMessage,
}

impl AgentSseEvent {
    /// A running progress event carrying a single text block.
    pub fn running(trace_id: &str, kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            status: AgentStatus::Running,
            trace_id: trace_id.to_string(),
            seq: 0,
            message: AgentMessage {
                role: "assistant".to_string(),
                kind,
                messages: vec![EventBlock::new(content)],
                agent_state: None,
                unified_diff: None,
                app_name: None,
                commit_message: None,
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status == AgentStatus::Idle
    }
}

// ---------------------------------------------------------------------------
// Inbound request
// ---------------------------------------------------------------------------

/// A message from the user in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub role: String,
    pub content: String,
}

/// One entry of the conversation history. User entries carry a content
/// string; assistant entries carry previously emitted block sequences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConversationMessage {
    User(UserMessage),
    Agent(AgentMessage),
}

impl ConversationMessage {
    pub fn is_user(&self) -> bool {
        matches!(self, ConversationMessage::User(_))
    }
}

/// A file of the source tree as the client sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub content: String,
}

/// Request body for initiating or continuing a generation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    #[serde(rename = "allMessages")]
    pub all_messages: Vec<ConversationMessage>,
    #[serde(rename = "applicationId")]
    pub application_id: String,
    #[serde(rename = "traceId")]
    pub trace_id: String,
    /// Prior session state to restore from, emitted verbatim on a previous turn.
    #[serde(rename = "agentState", default)]
    pub agent_state: Option<serde_json::Value>,
    #[serde(rename = "allFiles", default)]
    pub all_files: Option<Vec<FileEntry>>,
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
}

impl AgentRequest {
    /// Content of the last user message, if the history ends with one.
    pub fn last_user_content(&self) -> Option<&str> {
        match self.all_messages.last() {
            Some(ConversationMessage::User(m)) => Some(m.content.as_str()),
            _ => None,
        }
    }

    /// Provided files as a path → content map.
    pub fn files_map(&self) -> std::collections::BTreeMap<String, String> {
        self.all_files
            .iter()
            .flatten()
            .map(|f| (f.path.clone(), f.content.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_camel_case() {
        let mut event = AgentSseEvent::running("t-1", MessageKind::StageResult, "working");
        event.message.unified_diff = Some("--- a\n+++ b\n".to_string());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["traceId"], "t-1");
        assert_eq!(json["status"], "running");
        assert_eq!(json["message"]["kind"], "StageResult");
        assert_eq!(json["message"]["unifiedDiff"], "--- a\n+++ b\n");
        assert!(json["message"].get("agentState").is_none());
    }

    #[test]
    fn request_parses_user_and_agent_history() {
        let body = serde_json::json!({
            "allMessages": [
                {"role": "user", "content": "Build a counter app"},
                {"role": "assistant", "kind": "StageResult", "messages": [
                    {"content": "done", "ts": "2024-01-01T00:00:00Z"}
                ]},
                {"role": "user", "content": "Add a reset button"},
            ],
            "applicationId": "app-1",
            "traceId": "trace-1",
        });
        let request: AgentRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.all_messages.len(), 3);
        assert_eq!(request.last_user_content(), Some("Add a reset button"));
        assert!(request.agent_state.is_none());
        assert!(request.files_map().is_empty());
    }

    #[test]
    fn files_map_collects_entries() {
        let request = AgentRequest {
            all_messages: vec![],
            application_id: "a".into(),
            trace_id: "t".into(),
            agent_state: None,
            all_files: Some(vec![FileEntry {
                path: "server/src/index.ts".into(),
                content: "export {}".into(),
            }]),
            settings: None,
        };
        let files = request.files_map();
        assert_eq!(files.get("server/src/index.ts").map(String::as_str), Some("export {}"));
    }
}
