//! Tool runtime - interprets the fixed tool vocabulary against one node

use crate::node::{NodeId, NodeTree};
use crate::validators::StageChecks;
use appforge_llm::{ContentBlock, Message, Tool};
use appforge_workspace::{Workspace, WorkspaceError};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Parsed tool-use input. The fixed vocabulary is a closed sum; anything
/// else is dispatched to the stage's registered custom tools.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolRequest {
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        content: String,
    },
    EditFile {
        path: String,
        search: String,
        replace: String,
        replace_all: bool,
    },
    DeleteFile {
        path: String,
    },
    Complete,
    Custom {
        name: String,
        input: Value,
    },
}

fn require_str(input: &Value, key: &str) -> Result<String, String> {
    input
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("Missing required parameter: {}", key))
}

impl ToolRequest {
    /// Parse a tool-use block. Malformed input for a known tool is an
    /// error string reported back to the model.
    pub fn parse(name: &str, input: &Value) -> Result<Self, String> {
        match name {
            "read_file" => Ok(Self::ReadFile {
                path: require_str(input, "path")?,
            }),
            "write_file" => Ok(Self::WriteFile {
                path: require_str(input, "path")?,
                content: require_str(input, "content")?,
            }),
            "edit_file" => Ok(Self::EditFile {
                path: require_str(input, "path")?,
                search: require_str(input, "search")?,
                replace: require_str(input, "replace")?,
                replace_all: input
                    .get("replace_all")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            "delete_file" => Ok(Self::DeleteFile {
                path: require_str(input, "path")?,
            }),
            "complete" => Ok(Self::Complete),
            other => Ok(Self::Custom {
                name: other.to_string(),
                input: input.clone(),
            }),
        }
    }
}

/// The file-operation tools every sub-agent exposes.
pub fn base_tool_definitions() -> Vec<Tool> {
    vec![
        Tool {
            name: "read_file".to_string(),
            description: "Read file content".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"],
            }),
        },
        Tool {
            name: "write_file".to_string(),
            description: "Write content to a file".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"},
                },
                "required": ["path", "content"],
            }),
        },
        Tool {
            name: "edit_file".to_string(),
            description: "Edit a file by searching and replacing text".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "search": {"type": "string"},
                    "replace": {"type": "string"},
                    "replace_all": {"type": "boolean", "default": false},
                },
                "required": ["path", "search", "replace"],
            }),
        },
        Tool {
            name: "delete_file".to_string(),
            description: "Delete a file".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"],
            }),
        },
        Tool {
            name: "complete".to_string(),
            description: "Mark the task as complete. This will run tests and type checks to ensure the changes are correct.".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        },
    ]
}

/// A stage-registered tool beyond the fixed vocabulary. Returns the
/// result text plus the file deltas to record on the node.
#[async_trait::async_trait]
pub trait CustomTool: Send + Sync {
    fn definition(&self) -> Tool;

    async fn run(
        &self,
        input: &Value,
        workspace: &mut Workspace,
    ) -> Result<(String, BTreeMap<String, Option<String>>), String>;
}

/// Outcome of interpreting one assistant message.
pub struct ToolPassOutcome {
    /// Whether a `complete` tool ran and its validators passed.
    pub completed: bool,
    /// Number of tool-use blocks answered.
    pub answered: usize,
}

/// Interprets tool-use blocks against a node's workspace and file map.
pub struct ToolRuntime {
    custom: Vec<Arc<dyn CustomTool>>,
}

impl Default for ToolRuntime {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ToolRuntime {
    pub fn new(custom: Vec<Arc<dyn CustomTool>>) -> Self {
        Self { custom }
    }

    /// Full vocabulary: the fixed tools unioned with the stage's custom tools.
    pub fn tool_definitions(&self) -> Vec<Tool> {
        let mut tools = base_tool_definitions();
        tools.extend(self.custom.iter().map(|t| t.definition()));
        tools
    }

    fn custom_tool(&self, name: &str) -> Option<Arc<dyn CustomTool>> {
        self.custom
            .iter()
            .find(|t| t.definition().name == name)
            .cloned()
    }

    /// Run every tool-use block of the node's head assistant message, in
    /// order, and append the matching tool results (or the synthetic
    /// continue message) as the next user message.
    pub async fn run_node(
        &self,
        tree: &mut NodeTree,
        id: NodeId,
        checks: &dyn StageChecks,
    ) -> ToolPassOutcome {
        let blocks: Vec<(String, String, Value)> = match tree.data(id).head() {
            Some(head) => head
                .tool_uses()
                .map(|(use_id, name, input)| {
                    (use_id.to_string(), name.to_string(), input.clone())
                })
                .collect(),
            None => Vec::new(),
        };

        let mut results: Vec<ContentBlock> = Vec::new();
        let mut completed = false;

        for (use_id, name, input) in &blocks {
            let request = match ToolRequest::parse(name, input) {
                Ok(request) => request,
                Err(message) => {
                    results.push(ContentBlock::tool_error(use_id.clone(), message));
                    continue;
                }
            };
            debug!("Running tool {} on node {}", name, id.0);
            let block = self.run_tool(tree, id, use_id, request, checks).await;
            if let ContentBlock::ToolResult {
                content, is_error, ..
            } = &block
            {
                if content == "success" && name == "complete" && is_error.is_none() {
                    completed = true;
                }
            }
            results.push(block);
        }

        let answered = results.len();
        let message = if results.is_empty() {
            // No tool use and no completion - nudge the model forward.
            Message::user_text("Continue or mark completed via tool call")
        } else {
            Message::user(results)
        };
        tree.data_mut(id).messages.push(message);

        ToolPassOutcome { completed, answered }
    }

    async fn run_tool(
        &self,
        tree: &mut NodeTree,
        id: NodeId,
        use_id: &str,
        request: ToolRequest,
        checks: &dyn StageChecks,
    ) -> ContentBlock {
        match request {
            ToolRequest::ReadFile { path } => match tree.data(id).workspace.read_file(&path) {
                Ok(content) => ContentBlock::tool_result(use_id, content),
                Err(e) => ContentBlock::tool_error(use_id, e.to_string()),
            },

            ToolRequest::WriteFile { path, content } => {
                let data = tree.data_mut(id);
                match data.workspace.write_file(&path, &content) {
                    Ok(()) => {
                        data.files.insert(path.clone(), Some(content));
                        debug!("Written file: {}", path);
                        ContentBlock::tool_result(use_id, "success")
                    }
                    Err(e) => ContentBlock::tool_error(use_id, write_error_text(&path, e)),
                }
            }

            ToolRequest::EditFile {
                path,
                search,
                replace,
                replace_all,
            } => {
                let data = tree.data_mut(id);
                match data.workspace.edit_file(&path, &search, &replace, replace_all) {
                    Ok(count) => {
                        // Record the post-edit content as this node's delta.
                        match data.workspace.read_file(&path) {
                            Ok(updated) => {
                                data.files.insert(path.clone(), Some(updated));
                            }
                            Err(_) => {}
                        }
                        debug!("Applied edit to file: {} ({} occurrences)", path, count);
                        if count > 1 {
                            ContentBlock::tool_result(
                                use_id,
                                format!("success - replaced {} occurrences", count),
                            )
                        } else {
                            ContentBlock::tool_result(use_id, "success")
                        }
                    }
                    Err(WorkspaceError::NotFound { path }) => ContentBlock::tool_error(
                        use_id,
                        format!("File '{}' not found for editing", path),
                    ),
                    Err(e @ WorkspaceError::PermissionDenied { .. }) => {
                        ContentBlock::tool_error(
                            use_id,
                            format!(
                                "{}. Probably this file is out of scope for this particular task.",
                                e
                            ),
                        )
                    }
                    Err(e) => ContentBlock::tool_error(use_id, e.to_string()),
                }
            }

            ToolRequest::DeleteFile { path } => {
                let data = tree.data_mut(id);
                match data.workspace.delete_file(&path) {
                    Ok(()) => {
                        data.files.insert(path.clone(), None);
                        ContentBlock::tool_result(use_id, "success")
                    }
                    Err(e @ WorkspaceError::PermissionDenied { .. }) => {
                        ContentBlock::tool_error(
                            use_id,
                            format!(
                                "{}. Probably this file is out of scope for this particular task.",
                                e
                            ),
                        )
                    }
                    Err(e) => ContentBlock::tool_error(use_id, e.to_string()),
                }
            }

            ToolRequest::Complete => {
                if !tree.has_modifications(id) {
                    return ContentBlock::tool_error(
                        use_id,
                        "Can not complete without writing any changes.",
                    );
                }
                let check_err = checks.run(&tree.data(id).workspace).await;
                tree.data_mut(id).should_branch = true;
                match check_err {
                    Some(error) => {
                        info!("Failed to complete: {} chars of validator output", error.len());
                        ContentBlock::tool_result(use_id, error)
                    }
                    None => ContentBlock::tool_result(use_id, "success"),
                }
            }

            ToolRequest::Custom { name, input } => match self.custom_tool(&name) {
                Some(tool) => {
                    let data = tree.data_mut(id);
                    match tool.run(&input, &mut data.workspace).await {
                        Ok((text, deltas)) => {
                            data.files.extend(deltas);
                            ContentBlock::tool_result(use_id, text)
                        }
                        Err(message) => ContentBlock::tool_error(use_id, message),
                    }
                }
                None => ContentBlock::tool_error(use_id, format!("Unknown tool: {}", name)),
            },
        }
    }
}

fn write_error_text(path: &str, error: WorkspaceError) -> String {
    match error {
        WorkspaceError::NotFound { .. } => {
            format!("Directory not found for file '{}'", path)
        }
        e @ WorkspaceError::PermissionDenied { .. } => format!(
            "{}. Probably this file is out of scope for this particular task.",
            e
        ),
        e => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_covers_fixed_vocabulary() {
        let request =
            ToolRequest::parse("edit_file", &json!({"path": "a", "search": "x", "replace": "y"}))
                .unwrap();
        assert_eq!(
            request,
            ToolRequest::EditFile {
                path: "a".into(),
                search: "x".into(),
                replace: "y".into(),
                replace_all: false,
            }
        );
        assert_eq!(ToolRequest::parse("complete", &json!({})).unwrap(), ToolRequest::Complete);
        assert!(matches!(
            ToolRequest::parse("npm_install", &json!({"packages": ["zod"]})).unwrap(),
            ToolRequest::Custom { .. }
        ));
    }

    #[test]
    fn parse_reports_malformed_input() {
        let err = ToolRequest::parse("write_file", &json!({"path": "a"})).unwrap_err();
        assert_eq!(err, "Missing required parameter: content");
    }

    #[test]
    fn vocabulary_unions_custom_tools() {
        struct Dummy;

        #[async_trait::async_trait]
        impl CustomTool for Dummy {
            fn definition(&self) -> Tool {
                Tool {
                    name: "npm_install".into(),
                    description: "install packages".into(),
                    input_schema: json!({"type": "object"}),
                }
            }

            async fn run(
                &self,
                _input: &Value,
                _workspace: &mut Workspace,
            ) -> Result<(String, BTreeMap<String, Option<String>>), String> {
                Ok(("ok".into(), BTreeMap::new()))
            }
        }

        let runtime = ToolRuntime::new(vec![Arc::new(Dummy)]);
        let names: Vec<String> = runtime
            .tool_definitions()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert!(names.contains(&"write_file".to_string()));
        assert!(names.contains(&"npm_install".to_string()));
    }
}
