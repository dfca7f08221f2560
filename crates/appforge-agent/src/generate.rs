//! The generation application - stage graph, context, and actor adapters
//!
//! Two fixed graphs per template: the fresh-build graph
//! `draft → handlers → frontend → complete` (frontend optionally folded
//! into a concurrent handlers stage) and the continuation graph
//! `edit → complete`. Interaction modes insert review states between
//! work states.

use crate::namegen;
use crate::node::NodeTree;
use crate::search::{SearchConfig, StageSpec, SubAgent};
use crate::stages::{
    draft_root, edit_root, frontend_root, handler_files, handler_root, DraftStage, EditStage,
    FrontendStage, HandlerStage,
};
use crate::validators::Compactor;
use appforge_core::{EngineSettings, InteractionMode};
use appforge_fsm::{
    ErrorTransition, InvokeDef, MachineCheckpoint, MachineDef, MachineError, MachineObserver,
    StageActor, StateDef, StateMachine, Transition,
};
use appforge_llm::LlmGateway;
use appforge_workspace::Workspace;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const EVENT_CONFIRM: &str = "CONFIRM";
pub const EVENT_REVISE_DRAFT: &str = "REVISE_DRAFT";
pub const EVENT_REVISE_HANDLERS: &str = "REVISE_HANDLERS";
pub const EVENT_REVISE_FRONTEND: &str = "REVISE_FRONTEND";
pub const EVENT_REVISE_EDIT: &str = "REVISE_EDIT";

/// Everything a stage actor needs besides the context.
#[derive(Clone)]
pub struct GenDeps {
    pub workspace: Workspace,
    pub gateway: LlmGateway,
    pub fast_gateway: LlmGateway,
    pub model: String,
    pub fast_model: String,
    pub settings: EngineSettings,
    pub progress: Option<mpsc::Sender<String>>,
    pub cancel: CancellationToken,
}

impl GenDeps {
    fn compactor(&self) -> Option<Compactor> {
        Some(Compactor::new(
            self.fast_gateway.clone(),
            self.fast_model.clone(),
        ))
    }

    fn search_config(&self, default_beam: usize) -> SearchConfig {
        SearchConfig {
            beam_width: self.settings.beam_width_or(default_beam),
            max_depth: self.settings.max_depth_or(20),
        }
    }

    fn agent(&self, spec: Arc<dyn StageSpec>, default_beam: usize) -> SubAgent {
        SubAgent::new(
            self.gateway.clone(),
            self.model.clone(),
            spec,
            self.search_config(default_beam),
        )
        .with_thinking_budget(self.settings.thinking_budget)
        .with_cancel(self.cancel.clone())
    }
}

async fn notify(progress: &Option<mpsc::Sender<String>>, message: impl Into<String>) {
    if let Some(tx) = progress {
        let _ = tx.send(message.into()).await;
    }
}

/// State machine context. Holds everything a checkpoint needs: the
/// prompt, the per-stage feedback, the accumulated outputs, and the
/// sub-agent dumps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenContext {
    /// Which graph this context belongs to: "generate" or "edit".
    pub graph: String,
    pub user_prompt: String,
    pub draft_feedback: Option<String>,
    pub handlers_feedback: BTreeMap<String, String>,
    pub frontend_feedback: Option<String>,
    pub edit_feedback: Option<String>,
    /// Files provided by the client at session start.
    pub files: BTreeMap<String, String>,
    pub server_files: BTreeMap<String, String>,
    pub frontend_files: BTreeMap<String, String>,
    pub error: Option<String>,
    /// Node-tree dumps per stage, for offline inspection and restore.
    pub agent_dumps: BTreeMap<String, Value>,
}

/// What one stage hands back to the machine.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub server_files: BTreeMap<String, Option<String>>,
    pub frontend_files: BTreeMap<String, Option<String>>,
    pub dumps: BTreeMap<String, Value>,
}

fn apply_deltas(target: &mut BTreeMap<String, String>, deltas: &BTreeMap<String, Option<String>>) {
    for (path, content) in deltas {
        match content {
            Some(content) => {
                target.insert(path.clone(), content.clone());
            }
            None => {
                target.remove(path);
            }
        }
    }
}

fn fold_output(ctx: &mut GenContext, output: &StageOutput) {
    apply_deltas(&mut ctx.server_files, &output.server_files);
    apply_deltas(&mut ctx.frontend_files, &output.frontend_files);
    for (stage, dump) in &output.dumps {
        ctx.agent_dumps.insert(stage.clone(), dump.clone());
    }
}

fn set_error(ctx: &mut GenContext, error: &str) {
    ctx.error = Some(error.to_string());
}

/// Session workspace with the context's accumulated outputs applied.
fn stage_workspace(deps: &GenDeps, ctx: &GenContext) -> Workspace {
    let mut ws = deps.workspace.clone();
    for (path, content) in ctx.server_files.iter().chain(ctx.frontend_files.iter()) {
        ws.seed_file(path, content);
    }
    ws
}

// ---------------------------------------------------------------------------
// Stage actors
// ---------------------------------------------------------------------------

struct DraftActor {
    deps: GenDeps,
}

#[async_trait::async_trait]
impl StageActor<GenContext, StageOutput> for DraftActor {
    async fn execute(&self, ctx: &GenContext) -> Result<StageOutput, String> {
        notify(&self.deps.progress, "Designing the backend draft...").await;
        let ws = stage_workspace(&self.deps, ctx);
        let prompt = ctx.draft_feedback.as_deref().unwrap_or(&ctx.user_prompt);
        let mut tree = NodeTree::new(draft_root(&ws, prompt));

        let spec = Arc::new(DraftStage {
            compactor: self.deps.compactor(),
        });
        let agent = self.deps.agent(spec, 1);
        let solution = agent.execute(&mut tree).await.map_err(|e| e.to_string())?;

        let mut output = StageOutput {
            server_files: tree.trajectory_files(solution),
            ..Default::default()
        };
        output.dumps.insert(
            "draft".to_string(),
            serde_json::to_value(tree.dump()).unwrap_or(Value::Null),
        );
        notify(
            &self.deps.progress,
            format!(
                "Backend draft complete ({} files)",
                output.server_files.len()
            ),
        )
        .await;
        Ok(output)
    }
}

struct HandlersActor {
    deps: GenDeps,
}

impl HandlersActor {
    async fn run_one(
        deps: GenDeps,
        ws: Workspace,
        name: String,
        path: String,
        feedback: Option<String>,
    ) -> (String, Result<StageOutput, String>) {
        let mut tree = NodeTree::new(handler_root(&ws, &name, &path, feedback.as_deref()));
        let spec = Arc::new(HandlerStage {
            handler: name.clone(),
            compactor: deps.compactor(),
        });
        let agent = deps.agent(spec, 3);
        let result = match agent.execute(&mut tree).await {
            Ok(solution) => {
                let mut output = StageOutput {
                    server_files: tree.trajectory_files(solution),
                    ..Default::default()
                };
                output.dumps.insert(
                    format!("handler:{}", name),
                    serde_json::to_value(tree.dump()).unwrap_or(Value::Null),
                );
                Ok(output)
            }
            Err(e) => Err(e.to_string()),
        };
        (name, result)
    }
}

#[async_trait::async_trait]
impl StageActor<GenContext, StageOutput> for HandlersActor {
    async fn execute(&self, ctx: &GenContext) -> Result<StageOutput, String> {
        let handlers = handler_files(&ctx.server_files);
        if handlers.is_empty() {
            return Err("no handler files found in the draft output".to_string());
        }
        notify(
            &self.deps.progress,
            format!("Implementing {} handlers...", handlers.len()),
        )
        .await;

        let ws = stage_workspace(&self.deps, ctx);
        let mut set = tokio::task::JoinSet::new();
        for (name, path) in handlers {
            let feedback = ctx
                .handlers_feedback
                .get(&name)
                .or_else(|| ctx.handlers_feedback.get("general"))
                .cloned();
            set.spawn(Self::run_one(
                self.deps.clone(),
                ws.clone(),
                name,
                path,
                feedback,
            ));
        }

        let mut output = StageOutput::default();
        while let Some(joined) = set.join_next().await {
            let (name, result) = joined.map_err(|e| format!("handler task failed: {}", e))?;
            match result {
                Ok(one) => {
                    info!("Received solution for handler: {}", name);
                    notify(&self.deps.progress, format!("Handler {} complete", name)).await;
                    apply_stage_output(&mut output, one);
                }
                Err(e) => {
                    set.abort_all();
                    return Err(format!("handler {}: {}", name, e));
                }
            }
        }
        Ok(output)
    }
}

fn apply_stage_output(target: &mut StageOutput, source: StageOutput) {
    target.server_files.extend(source.server_files);
    target.frontend_files.extend(source.frontend_files);
    target.dumps.extend(source.dumps);
}

struct FrontendActor {
    deps: GenDeps,
}

#[async_trait::async_trait]
impl StageActor<GenContext, StageOutput> for FrontendActor {
    async fn execute(&self, ctx: &GenContext) -> Result<StageOutput, String> {
        notify(&self.deps.progress, "Building the frontend...").await;
        let ws = stage_workspace(&self.deps, ctx);
        let prompt = ctx.frontend_feedback.as_deref().unwrap_or(&ctx.user_prompt);
        let mut tree = NodeTree::new(frontend_root(&ws, prompt));

        let spec = Arc::new(FrontendStage {
            compactor: self.deps.compactor(),
            inspect_ui: false,
        });
        let agent = self.deps.agent(spec, 1);
        let solution = agent.execute(&mut tree).await.map_err(|e| e.to_string())?;

        let mut output = StageOutput {
            frontend_files: tree.trajectory_files(solution),
            ..Default::default()
        };
        output.dumps.insert(
            "frontend".to_string(),
            serde_json::to_value(tree.dump()).unwrap_or(Value::Null),
        );
        notify(&self.deps.progress, "Frontend complete").await;
        Ok(output)
    }
}

/// Handlers and frontend in one stage, running concurrently against the
/// shared draft output.
struct ConcurrentActor {
    handlers: HandlersActor,
    frontend: FrontendActor,
}

#[async_trait::async_trait]
impl StageActor<GenContext, StageOutput> for ConcurrentActor {
    async fn execute(&self, ctx: &GenContext) -> Result<StageOutput, String> {
        let (handlers, frontend) =
            tokio::join!(self.handlers.execute(ctx), self.frontend.execute(ctx));
        let mut output = handlers?;
        apply_stage_output(&mut output, frontend?);
        Ok(output)
    }
}

struct EditActor {
    deps: GenDeps,
}

#[async_trait::async_trait]
impl StageActor<GenContext, StageOutput> for EditActor {
    async fn execute(&self, ctx: &GenContext) -> Result<StageOutput, String> {
        notify(&self.deps.progress, "Applying the requested changes...").await;
        let ws = stage_workspace(&self.deps, ctx);
        let prompt = ctx.edit_feedback.as_deref().unwrap_or(&ctx.user_prompt);
        let mut tree = NodeTree::new(edit_root(&ws, prompt));

        let spec = Arc::new(EditStage {
            compactor: self.deps.compactor(),
        });
        let agent = self.deps.agent(spec, 1);
        let solution = agent.execute(&mut tree).await.map_err(|e| e.to_string())?;

        let mut output = StageOutput::default();
        for (path, content) in tree.trajectory_files(solution) {
            if path.starts_with("client/") {
                output.frontend_files.insert(path, content);
            } else {
                output.server_files.insert(path, content);
            }
        }
        output.dumps.insert(
            "edit".to_string(),
            serde_json::to_value(tree.dump()).unwrap_or(Value::Null),
        );
        notify(&self.deps.progress, "Changes applied").await;
        Ok(output)
    }
}

// ---------------------------------------------------------------------------
// Stage graphs
// ---------------------------------------------------------------------------

fn invoke(
    actor: Arc<dyn StageActor<GenContext, StageOutput>>,
    done_target: &str,
) -> InvokeDef<GenContext, StageOutput> {
    InvokeDef {
        actor,
        on_done: Transition::to(done_target).action(fold_output),
        on_error: ErrorTransition::to("failure", set_error),
    }
}

fn build_generate_graph(deps: &GenDeps) -> Arc<MachineDef<GenContext, StageOutput>> {
    let mode = deps.settings.interaction_mode;
    let concurrent = deps.settings.concurrent_frontend;
    let pause_after_draft = matches!(
        mode,
        InteractionMode::Interactive | InteractionMode::TypespecOnly
    );
    let pause_after_rest = mode == InteractionMode::Interactive;

    let mut states: HashMap<String, StateDef<GenContext, StageOutput>> = HashMap::new();

    let draft_done = if pause_after_draft {
        "review_draft"
    } else {
        "handlers"
    };
    states.insert(
        "draft".to_string(),
        StateDef::invoke(invoke(Arc::new(DraftActor { deps: deps.clone() }), draft_done)),
    );
    states.insert(
        "review_draft".to_string(),
        StateDef::events([(EVENT_CONFIRM, "handlers"), (EVENT_REVISE_DRAFT, "draft")]),
    );

    let after_handlers = if concurrent { "complete" } else { "frontend" };
    let handlers_done = if pause_after_rest {
        "review_handlers"
    } else {
        after_handlers
    };
    let handlers_actor: Arc<dyn StageActor<GenContext, StageOutput>> = if concurrent {
        Arc::new(ConcurrentActor {
            handlers: HandlersActor { deps: deps.clone() },
            frontend: FrontendActor { deps: deps.clone() },
        })
    } else {
        Arc::new(HandlersActor { deps: deps.clone() })
    };
    states.insert(
        "handlers".to_string(),
        StateDef::invoke(invoke(handlers_actor, handlers_done)),
    );
    states.insert(
        "review_handlers".to_string(),
        StateDef::events([
            (EVENT_CONFIRM, after_handlers),
            (EVENT_REVISE_HANDLERS, "handlers"),
        ]),
    );

    if !concurrent {
        let frontend_done = if pause_after_rest {
            "review_frontend"
        } else {
            "complete"
        };
        states.insert(
            "frontend".to_string(),
            StateDef::invoke(invoke(
                Arc::new(FrontendActor { deps: deps.clone() }),
                frontend_done,
            )),
        );
        states.insert(
            "review_frontend".to_string(),
            StateDef::events([
                (EVENT_CONFIRM, "complete"),
                (EVENT_REVISE_FRONTEND, "frontend"),
            ]),
        );
    }

    states.insert("complete".to_string(), StateDef::terminal());
    states.insert("failure".to_string(), StateDef::terminal());

    Arc::new(MachineDef {
        initial: "draft".to_string(),
        states,
        on: HashMap::new(),
    })
}

fn build_edit_graph(deps: &GenDeps) -> Arc<MachineDef<GenContext, StageOutput>> {
    let interactive = deps.settings.interaction_mode == InteractionMode::Interactive;
    let mut states: HashMap<String, StateDef<GenContext, StageOutput>> = HashMap::new();

    let edit_done = if interactive { "review_edit" } else { "complete" };
    states.insert(
        "edit".to_string(),
        StateDef::invoke(invoke(Arc::new(EditActor { deps: deps.clone() }), edit_done)),
    );
    states.insert(
        "review_edit".to_string(),
        StateDef::events([(EVENT_CONFIRM, "complete"), (EVENT_REVISE_EDIT, "edit")]),
    );
    states.insert("complete".to_string(), StateDef::terminal());
    states.insert("failure".to_string(), StateDef::terminal());

    Arc::new(MachineDef {
        initial: "edit".to_string(),
        states,
        on: HashMap::new(),
    })
}

// ---------------------------------------------------------------------------
// GenApp
// ---------------------------------------------------------------------------

/// One generation application: a stage machine plus its dependencies.
pub struct GenApp {
    machine: StateMachine<GenContext, StageOutput>,
    deps: GenDeps,
}

impl GenApp {
    /// Fresh build from a user prompt.
    pub fn new_draft(deps: GenDeps, user_prompt: &str, files: BTreeMap<String, String>) -> Self {
        let context = GenContext {
            graph: "generate".to_string(),
            user_prompt: user_prompt.to_string(),
            files,
            ..Default::default()
        };
        let def = build_generate_graph(&deps);
        Self {
            machine: StateMachine::new(def, context),
            deps,
        }
    }

    /// Continuation turn over an existing application.
    pub fn new_edit(deps: GenDeps, feedback: &str, files: BTreeMap<String, String>) -> Self {
        let context = GenContext {
            graph: "edit".to_string(),
            user_prompt: feedback.to_string(),
            edit_feedback: Some(feedback.to_string()),
            files,
            ..Default::default()
        };
        let def = build_edit_graph(&deps);
        Self {
            machine: StateMachine::new(def, context),
            deps,
        }
    }

    /// Rebuild from a prior checkpoint. The graph is chosen by the
    /// context's `graph` marker.
    pub fn restore(deps: GenDeps, checkpoint: &MachineCheckpoint) -> Result<Self, MachineError> {
        let context: GenContext = serde_json::from_value(checkpoint.context.clone())?;
        let def = if context.graph == "edit" {
            build_edit_graph(&deps)
        } else {
            build_generate_graph(&deps)
        };
        let machine = StateMachine::restore(def, checkpoint)?;
        Ok(Self { machine, deps })
    }

    pub fn with_observer(mut self, observer: Arc<dyn MachineObserver>) -> Self {
        self.machine = self.machine.with_observer(observer);
        self
    }

    pub async fn start(&mut self) -> Result<(), MachineError> {
        self.machine.start().await
    }

    pub async fn resume(&mut self) -> Result<(), MachineError> {
        self.machine.resume().await
    }

    pub async fn send(&mut self, event: &str) -> Result<(), MachineError> {
        self.machine.send(event).await
    }

    /// Map a new user message onto the pending review state: stash the
    /// feedback and fire the matching revise event.
    pub async fn apply_feedback(&mut self, message: &str) -> Result<(), MachineError> {
        let event = match self.machine.current() {
            Some("review_draft") => {
                self.machine.context_mut().draft_feedback = Some(message.to_string());
                EVENT_REVISE_DRAFT
            }
            Some("review_handlers") => {
                self.machine
                    .context_mut()
                    .handlers_feedback
                    .insert("general".to_string(), message.to_string());
                EVENT_REVISE_HANDLERS
            }
            Some("review_frontend") => {
                self.machine.context_mut().frontend_feedback = Some(message.to_string());
                EVENT_REVISE_FRONTEND
            }
            Some("review_edit") => {
                self.machine.context_mut().edit_feedback = Some(message.to_string());
                EVENT_REVISE_EDIT
            }
            _ => {
                info!("No review state pending, ignoring feedback mapping");
                return Ok(());
            }
        };
        self.machine.send(event).await
    }

    pub fn current(&self) -> Option<&str> {
        self.machine.current()
    }

    pub fn is_terminal(&self) -> bool {
        self.machine.is_terminal()
    }

    pub fn is_failure(&self) -> bool {
        self.machine.current() == Some("failure")
    }

    /// Whether the machine is parked on a review state awaiting input.
    pub fn is_review(&self) -> bool {
        matches!(
            self.machine.current(),
            Some("review_draft")
                | Some("review_handlers")
                | Some("review_frontend")
                | Some("review_edit")
        )
    }

    pub fn context(&self) -> &GenContext {
        self.machine.context()
    }

    pub fn checkpoint(&self) -> Result<MachineCheckpoint, MachineError> {
        self.machine.dump()
    }

    /// The final workspace state: template ⊕ provided files ⊕ generated
    /// outputs.
    pub fn final_files(&self) -> BTreeMap<String, String> {
        let mut files = self.deps.workspace.view();
        let ctx = self.machine.context();
        for (path, content) in ctx.server_files.iter().chain(ctx.frontend_files.iter()) {
            files.insert(path.clone(), content.clone());
        }
        files
    }

    /// Generate the app name for this session via the fast model.
    pub async fn generate_app_name(&self) -> String {
        namegen::generate_app_name(
            &self.deps.fast_gateway,
            &self.deps.fast_model,
            &self.machine.context().user_prompt,
        )
        .await
    }

    /// Generate a commit message for this turn via the fast model.
    pub async fn generate_commit_message(&self, user_request: &str) -> String {
        namegen::generate_commit_message(&self.deps.fast_gateway, &self.deps.fast_model, user_request)
            .await
    }
}
