//! Sub-agent - iterated LLM expansion with bounded beam search
//!
//! One sub-agent owns a node tree rooted at a context-specific prompt and
//! exposes `execute`, which returns the first node whose evaluation
//! passed the stage's validators. Sibling candidates expand concurrently,
//! each against its own workspace clone.

use crate::node::{NodeData, NodeId, NodeTree};
use crate::tools::ToolRuntime;
use crate::validators::StageChecks;
use appforge_llm::{CompletionRequest, LlmError, LlmGateway};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct SearchConfig {
    pub beam_width: usize,
    pub max_depth: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            beam_width: 1,
            max_depth: 20,
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("The {agent} encountered an issue: {message}. This typically happens when the agent reaches its maximum search depth or cannot find valid solutions. Please try refining your request or providing more specific details.")]
    SearchFailed { agent: String, message: String },

    #[error("llm error: {0}")]
    Llm(#[from] LlmError),

    #[error("cancelled")]
    Cancelled,
}

impl SearchError {
    pub fn exhausted(agent: impl Into<String>) -> Self {
        Self::SearchFailed {
            agent: agent.into(),
            message: "No candidates to evaluate, search terminated".to_string(),
        }
    }
}

/// What a sub-agent context contributes: its prompt, its extra tools, and
/// its validator set.
pub trait StageSpec: Send + Sync {
    /// Context label, e.g. "draft agent" or "handler agent (create_task)".
    fn name(&self) -> String;

    fn system_prompt(&self) -> String;

    fn custom_tools(&self) -> Vec<Arc<dyn crate::tools::CustomTool>> {
        Vec::new()
    }

    fn checks(&self) -> Arc<dyn StageChecks>;
}

pub struct SubAgent {
    gateway: LlmGateway,
    model: String,
    spec: Arc<dyn StageSpec>,
    config: SearchConfig,
    thinking_budget: Option<u32>,
    cancel: CancellationToken,
}

impl SubAgent {
    pub fn new(
        gateway: LlmGateway,
        model: impl Into<String>,
        spec: Arc<dyn StageSpec>,
        config: SearchConfig,
    ) -> Self {
        Self {
            gateway,
            model: model.into(),
            spec,
            config,
            thinking_budget: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_thinking_budget(mut self, budget: Option<u32>) -> Self {
        self.thinking_budget = budget;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the bounded search. Returns the solution node or search-failed.
    pub async fn execute(&self, tree: &mut NodeTree) -> Result<NodeId, SearchError> {
        let runtime = ToolRuntime::new(self.spec.custom_tools());
        let checks = self.spec.checks();
        let mut iteration = 0usize;

        info!(
            agent = self.spec.name(),
            beam_width = self.config.beam_width,
            max_depth = self.config.max_depth,
            "Starting search"
        );

        loop {
            if self.cancel.is_cancelled() {
                return Err(SearchError::Cancelled);
            }

            let candidates = self.select(tree);
            if candidates.is_empty() {
                info!(agent = self.spec.name(), "No candidates to evaluate, search terminated");
                return Err(SearchError::exhausted(self.spec.name()));
            }

            iteration += 1;
            info!(
                agent = self.spec.name(),
                iteration,
                candidates = candidates.len(),
                "Running LLM on candidates"
            );

            let children = self.expand(tree, &candidates, &runtime).await?;
            debug!("Received {} nodes from LLM", children.len());

            for (i, child) in children.iter().enumerate() {
                debug!("Evaluating node {}/{}", i + 1, children.len());
                let outcome = runtime.run_node(tree, *child, checks.as_ref()).await;
                if outcome.completed {
                    info!(
                        agent = self.spec.name(),
                        depth = tree.depth(*child),
                        "Found solution"
                    );
                    return Ok(*child);
                }
            }
        }
    }

    /// Candidate selection. A fresh branchable root is replicated
    /// `beam_width` times; otherwise every leaf within the depth budget is
    /// a candidate, multiplied by an effective beam width of 1 once the
    /// tree already holds enough siblings at its depth.
    fn select(&self, tree: &NodeTree) -> Vec<NodeId> {
        let root = tree.root();
        if tree.is_leaf(root) && tree.data(root).should_branch {
            debug!("Selecting root node {} times (beam search)", self.config.beam_width);
            return vec![root; self.config.beam_width];
        }

        let all = tree.descendants(root);
        let mut candidates = Vec::new();
        for &node in &all {
            if !tree.is_leaf(node) || tree.depth(node) as usize > self.config.max_depth {
                continue;
            }
            if tree.data(node).should_branch {
                let effective = if all.len() > tree.depth(node) as usize + 1 {
                    1
                } else {
                    self.config.beam_width
                };
                debug!(
                    "Selecting candidate with effective beam width {} at depth {}/{}",
                    effective,
                    tree.depth(node),
                    self.config.max_depth
                );
                candidates.extend(std::iter::repeat(node).take(effective));
            } else {
                candidates.push(node);
            }
        }
        debug!("Selected {} leaf candidates", candidates.len());
        candidates
    }

    /// Expand every candidate concurrently; one child node per completion.
    async fn expand(
        &self,
        tree: &mut NodeTree,
        candidates: &[NodeId],
        runtime: &ToolRuntime,
    ) -> Result<Vec<NodeId>, SearchError> {
        let tools = runtime.tool_definitions();
        let system_prompt = self.spec.system_prompt();

        let mut set: JoinSet<(NodeId, Result<appforge_llm::Completion, LlmError>)> =
            JoinSet::new();
        for &candidate in candidates {
            let request = CompletionRequest {
                model: self.model.clone(),
                messages: tree.trajectory_messages(candidate),
                tools: Some(tools.clone()),
                system_prompt: Some(system_prompt.clone()),
                max_tokens: 8192,
                thinking_budget: self.thinking_budget,
                ..Default::default()
            };
            let gateway = self.gateway.clone();
            let cancel = self.cancel.clone();
            set.spawn(async move {
                let result = gateway.complete_cancellable(&request, &cancel).await;
                (candidate, result)
            });
        }

        let mut children = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (candidate, result) = joined.map_err(|e| {
                SearchError::Llm(LlmError::RequestFailed(format!("expansion task: {}", e)))
            })?;
            match result {
                Ok(completion) => {
                    let parent = tree.data(candidate);
                    let data = NodeData::new(
                        parent.workspace.clone(),
                        vec![completion.into_message()],
                        parent.context.clone(),
                    );
                    children.push(tree.add_child(candidate, data));
                }
                Err(LlmError::Cancelled) => {
                    set.abort_all();
                    return Err(SearchError::Cancelled);
                }
                Err(e) => {
                    set.abort_all();
                    return Err(SearchError::Llm(e));
                }
            }
        }
        Ok(children)
    }
}
