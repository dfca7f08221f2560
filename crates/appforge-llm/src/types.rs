//! Message and completion types shared by all providers

use serde::{Deserialize, Serialize};

/// Role of a message in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Content block types - the common vocabulary every provider normalizes to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: None,
        }
    }

    pub fn tool_error(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: Some(true),
        }
    }
}

/// Message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &serde_json::Value)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => {
                Some((id.as_str(), name.as_str(), input))
            }
            _ => None,
        })
    }
}

/// Every tool_use block must be answered, in order, by a matching
/// tool_result in the next user message.
pub fn validate_tool_pairing(messages: &[Message]) -> bool {
    for (i, message) in messages.iter().enumerate() {
        if message.role != Role::Assistant {
            continue;
        }
        let uses: Vec<&str> = message.tool_uses().map(|(id, _, _)| id).collect();
        if uses.is_empty() {
            continue;
        }
        let Some(next) = messages.get(i + 1) else {
            return false;
        };
        let results: Vec<&str> = next
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect();
        if next.role != Role::User || results != uses {
            return false;
        }
    }
    true
}

/// Tool definition offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Tool selection constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolChoice {
    Auto,
    Any,
    Tool { name: String },
}

/// Completion request accepted by every provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    /// Extended-thinking token budget, when the provider supports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u32>,
}

impl Default for CompletionRequest {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            messages: Vec::new(),
            tools: None,
            system_prompt: None,
            max_tokens: 8192,
            temperature: None,
            tool_choice: None,
            thinking_budget: None,
        }
    }
}

/// Why the model stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

/// Token usage for one call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Normalized completion returned by every provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub usage: Usage,
    pub stop_reason: StopReason,
}

impl Completion {
    pub fn into_message(self) -> Message {
        Message {
            role: self.role,
            content: self.content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_block_serde_tags() {
        let block = ContentBlock::ToolUse {
            id: "tu-1".into(),
            name: "write_file".into(),
            input: serde_json::json!({"path": "a.ts"}),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_use");
        assert_eq!(json["name"], "write_file");

        let round: ContentBlock = serde_json::from_value(json).unwrap();
        assert_eq!(round, block);
    }

    #[test]
    fn tool_pairing_holds_for_matched_sequences() {
        let messages = vec![
            Message::user_text("go"),
            Message::assistant(vec![
                ContentBlock::text("writing"),
                ContentBlock::ToolUse {
                    id: "tu-1".into(),
                    name: "write_file".into(),
                    input: serde_json::json!({}),
                },
            ]),
            Message::user(vec![ContentBlock::tool_result("tu-1", "success")]),
        ];
        assert!(validate_tool_pairing(&messages));
    }

    #[test]
    fn tool_pairing_rejects_missing_results() {
        let messages = vec![
            Message::assistant(vec![ContentBlock::ToolUse {
                id: "tu-1".into(),
                name: "write_file".into(),
                input: serde_json::json!({}),
            }]),
            Message::user_text("not a tool result"),
        ];
        assert!(!validate_tool_pairing(&messages));
    }

    #[test]
    fn tool_pairing_rejects_reordered_results() {
        let messages = vec![
            Message::assistant(vec![
                ContentBlock::ToolUse {
                    id: "tu-1".into(),
                    name: "a".into(),
                    input: serde_json::json!({}),
                },
                ContentBlock::ToolUse {
                    id: "tu-2".into(),
                    name: "b".into(),
                    input: serde_json::json!({}),
                },
            ]),
            Message::user(vec![
                ContentBlock::tool_result("tu-2", "x"),
                ContentBlock::tool_result("tu-1", "y"),
            ]),
        ];
        assert!(!validate_tool_pairing(&messages));
    }
}
