//! Validator suite - per-context compile/lint/test/schema checks
//!
//! Checks run inside the node's workspace and feed their error text back
//! to the agent as the next user message. Oversized output is compacted
//! through a fast LLM before it reaches the conversation.

use appforge_llm::{CompletionRequest, LlmGateway, Message};
use appforge_workspace::Workspace;
use tracing::{info, warn};

/// Combined validator output above this many characters goes through the
/// compaction model.
pub const COMPACTION_THRESHOLD: usize = 4096;

/// Context-specific validation. `run` returns the feedback text on
/// failure and `None` on success.
#[async_trait::async_trait]
pub trait StageChecks: Send + Sync {
    async fn run(&self, workspace: &Workspace) -> Option<String>;
}

/// Checks that always pass. Used by tests and the edit stage's dry mode.
pub struct NoChecks;

#[async_trait::async_trait]
impl StageChecks for NoChecks {
    async fn run(&self, _workspace: &Workspace) -> Option<String> {
        None
    }
}

/// Fast-LLM error compaction shared by every check set.
#[derive(Clone)]
pub struct Compactor {
    gateway: LlmGateway,
    model: String,
}

impl Compactor {
    pub fn new(gateway: LlmGateway, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
        }
    }
}

/// Compact an error message through the fast LLM when it exceeds the
/// threshold. Any compaction failure falls back to the raw text.
pub async fn compact_error(compactor: Option<&Compactor>, error_msg: String) -> String {
    if error_msg.len() <= COMPACTION_THRESHOLD {
        return error_msg;
    }
    let Some(compactor) = compactor else {
        return error_msg;
    };
    let original_length = error_msg.len();

    let prompt = format!(
        "You need to compact an error message to be concise while keeping the most \
         important information.\n\
         The error message is expected to be reduced to less than {} characters approximately.\n\
         Keep the key error type, file paths, line numbers, and the core issue.\n\
         Remove verbose stack traces, repeated information, and non-essential details not \
         helping to understand the root cause.\n\n\
         Output the compacted error message wrapped in <error> tags.\n\n\
         The error message to compact is:\n<message>\n{}\n</message>",
        COMPACTION_THRESHOLD, error_msg
    );

    let request = CompletionRequest {
        model: compactor.model.clone(),
        messages: vec![Message::user_text(prompt)],
        max_tokens: 1024,
        ..Default::default()
    };

    match compactor.gateway.complete(&request).await {
        Ok(completion) => {
            let text = completion.into_message().text();
            match extract_tag(&text, "error") {
                Some(compacted) => {
                    info!(
                        "Compacted error message size: {}, original size: {}",
                        compacted.len(),
                        original_length
                    );
                    compacted
                }
                None => error_msg,
            }
        }
        Err(e) => {
            warn!("Failed to compact error message using LLM: {}", e);
            error_msg
        }
    }
}

/// First `<tag>...</tag>` span of a response, trimmed.
pub fn extract_tag(text: &str, tag: &str) -> Option<String> {
    let pattern = regex::Regex::new(&format!(r"(?s)<{tag}>(.*?)</{tag}>")).ok()?;
    pattern
        .captures(text)
        .map(|captures| captures[1].trim().to_string())
}

async fn combine(compactor: Option<&Compactor>, errors: Vec<Option<String>>) -> Option<String> {
    let collected: Vec<String> = errors.into_iter().flatten().collect();
    if collected.is_empty() {
        return None;
    }
    Some(compact_error(compactor, collected.join("\n\n")).await)
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn backend_typecheck(workspace: &Workspace) -> Option<String> {
    let result = workspace
        .exec(
            vec![
                "bun".to_string(),
                "run".to_string(),
                "tsc".to_string(),
                "--noEmit".to_string(),
            ],
            Some("server"),
        )
        .await;
    match result {
        Ok(result) if result.ok() => None,
        Ok(result) => Some(format!("TypeScript errors:\n{}", result.combined_output())),
        Err(e) => Some(format!("TypeScript errors:\n{}", e)),
    }
}

async fn schema_push(workspace: &Workspace) -> Option<String> {
    let result = workspace
        .exec_with_pg(vec![
            "bun".to_string(),
            "run".to_string(),
            "drizzle-kit".to_string(),
            "push".to_string(),
        ])
        .await;
    match result {
        Ok(result) if result.ok() && result.stderr.is_empty() => None,
        Ok(result) => Some(format!("Error running drizzle: {}", result.combined_output())),
        Err(e) => Some(format!("Error running drizzle: {}", e)),
    }
}

async fn handler_tests(workspace: &Workspace, handler: &str) -> Option<String> {
    let result = workspace
        .exec_with_pg(vec![
            "bun".to_string(),
            "test".to_string(),
            format!("src/tests/{}.test.ts", handler),
        ])
        .await;
    match result {
        Ok(result) if result.ok() => None,
        Ok(result) => Some(format!("Test failures:\n{}", result.combined_output())),
        Err(e) => Some(format!("Test failures:\n{}", e)),
    }
}

async fn all_tests(workspace: &Workspace) -> Option<String> {
    let result = workspace
        .exec_with_pg(vec!["bun".to_string(), "test".to_string()])
        .await;
    match result {
        Ok(result) if result.ok() => None,
        Ok(result) => Some(format!("Test failures:\n{}", result.combined_output())),
        Err(e) => Some(format!("Test failures:\n{}", e)),
    }
}

async fn frontend_typecheck(workspace: &Workspace) -> Option<String> {
    let result = workspace
        .exec(
            vec![
                "bun".to_string(),
                "run".to_string(),
                "tsc".to_string(),
                "-p".to_string(),
                "tsconfig.app.json".to_string(),
                "--noEmit".to_string(),
            ],
            Some("client"),
        )
        .await;
    match result {
        Ok(result) if result.ok() => None,
        Ok(result) => Some(format!("TypeScript errors:\n{}", result.combined_output())),
        Err(e) => Some(format!("TypeScript errors:\n{}", e)),
    }
}

async fn frontend_build(workspace: &Workspace) -> Option<String> {
    let result = workspace
        .exec(
            vec!["bun".to_string(), "run".to_string(), "build".to_string()],
            Some("client"),
        )
        .await;
    match result {
        Ok(result) if result.ok() => None,
        Ok(result) => Some(format!("Build errors:\n{}", result.combined_output())),
        Err(e) => Some(format!("Build errors:\n{}", e)),
    }
}

async fn frontend_lint(workspace: &Workspace) -> Option<String> {
    let result = workspace
        .exec(
            vec!["bun".to_string(), "run".to_string(), "lint".to_string()],
            Some("client"),
        )
        .await;
    match result {
        Ok(result) if result.ok() => None,
        Ok(result) => Some(format!("Lint errors:\n{}", result.combined_output())),
        Err(e) => Some(format!("Lint errors:\n{}", e)),
    }
}

// ---------------------------------------------------------------------------
// Per-context suites
// ---------------------------------------------------------------------------

/// Draft: type-check the backend and push the ORM schema against a live
/// Postgres.
pub struct DraftChecks {
    pub compactor: Option<Compactor>,
}

#[async_trait::async_trait]
impl StageChecks for DraftChecks {
    async fn run(&self, workspace: &Workspace) -> Option<String> {
        let (tsc, drizzle) = tokio::join!(backend_typecheck(workspace), schema_push(workspace));
        combine(self.compactor.as_ref(), vec![tsc, drizzle]).await
    }
}

/// Handler: type-check the backend and run that handler's tests.
pub struct HandlerChecks {
    pub handler: String,
    pub compactor: Option<Compactor>,
}

#[async_trait::async_trait]
impl StageChecks for HandlerChecks {
    async fn run(&self, workspace: &Workspace) -> Option<String> {
        let (tsc, tests) = tokio::join!(
            backend_typecheck(workspace),
            handler_tests(workspace, &self.handler)
        );
        combine(self.compactor.as_ref(), vec![tsc, tests]).await
    }
}

/// Frontend: type-check, build, and lint the client. The visual
/// inspection pass is configuration-gated and off by default.
pub struct FrontendChecks {
    pub compactor: Option<Compactor>,
    pub inspect_ui: bool,
}

#[async_trait::async_trait]
impl StageChecks for FrontendChecks {
    async fn run(&self, workspace: &Workspace) -> Option<String> {
        let (tsc, build, lint) = tokio::join!(
            frontend_typecheck(workspace),
            frontend_build(workspace),
            frontend_lint(workspace)
        );
        if self.inspect_ui {
            info!("UI inspection pass requested but no inspector is configured");
        }
        combine(self.compactor.as_ref(), vec![tsc, build, lint]).await
    }
}

/// Edit: the full battery across backend and frontend.
pub struct EditChecks {
    pub compactor: Option<Compactor>,
}

#[async_trait::async_trait]
impl StageChecks for EditChecks {
    async fn run(&self, workspace: &Workspace) -> Option<String> {
        let (backend, schema, tests) = tokio::join!(
            backend_typecheck(workspace),
            schema_push(workspace),
            all_tests(workspace)
        );
        let (client_tsc, build, lint) = tokio::join!(
            frontend_typecheck(workspace),
            frontend_build(workspace),
            frontend_lint(workspace)
        );
        combine(
            self.compactor.as_ref(),
            vec![backend, schema, tests, client_tsc, build, lint],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_tag_finds_first_span() {
        let text = "noise <error>the core issue</error> trailing";
        assert_eq!(extract_tag(text, "error").unwrap(), "the core issue");
        assert!(extract_tag("no tags here", "error").is_none());
    }

    #[test]
    fn extract_tag_spans_newlines() {
        let text = "<error>line one\nline two</error>";
        assert_eq!(extract_tag(text, "error").unwrap(), "line one\nline two");
    }

    #[tokio::test]
    async fn short_errors_skip_compaction() {
        let compacted = compact_error(None, "short error".to_string()).await;
        assert_eq!(compacted, "short error");
    }

    #[tokio::test]
    async fn long_errors_without_compactor_pass_through() {
        let long = "x".repeat(COMPACTION_THRESHOLD + 1);
        let compacted = compact_error(None, long.clone()).await;
        assert_eq!(compacted, long);
    }
}
