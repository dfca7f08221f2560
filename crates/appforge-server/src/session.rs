//! Session coordinator - one instance per request/response turn
//!
//! Converts a request into a stream of events: seeds or restores the
//! stage machine, forwards sub-agent progress as running StageResult
//! events, emits the first-turn template diff, and closes the turn with
//! exactly one idle event carrying the final diff, a refinement request,
//! or a runtime error.

use crate::diff::unified_diff;
use crate::snapshot::SnapshotStore;
use appforge_agent::{GenApp, GenDeps};
use appforge_core::{
    AgentMessage, AgentRequest, AgentSseEvent, AgentStatus, EngineSettings, Error, EventBlock,
    MessageKind,
};
use appforge_fsm::{MachineCheckpoint, MachineObserver};
use appforge_llm::{LlmGateway, Message};
use appforge_workspace::{BaseImage, ContainerRuntime, PostgresProvisioner, Workspace};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const RUNTIME_ERROR_TEXT: &str =
    "Runtime error occurred, please try again. If the problem persists, please create an issue on GitHub.";
const NO_CHANGES_TEXT: &str =
    "No changes were generated by the agent. Please refine your request.";
const AWAITING_INPUT_TEXT: &str = "Agent is waiting for user input...";

/// Session-level metadata carried across turns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateMetadata {
    pub app_name: Option<String>,
    pub template_diff_sent: bool,
}

/// The opaque `agent_state` payload: machine checkpoint, conversation
/// thread, and metadata. Reconstructed on each turn from the request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionState {
    pub fsm_state: Option<appforge_fsm::MachineCheckpoint>,
    pub fsm_messages: Vec<Message>,
    pub metadata: StateMetadata,
}

/// Shared collaborators every session draws from.
pub struct SessionDeps {
    pub base_image: Arc<BaseImage>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub postgres: Arc<dyn PostgresProvisioner>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub gateway: LlmGateway,
    pub fast_gateway: LlmGateway,
    pub model: String,
    pub fast_model: String,
    pub turn_budget: Duration,
}

/// Monotonic event emitter. The sequence number is assigned and the
/// event is sent under one lock, so the stream order always matches seq.
struct Emitter {
    trace_id: String,
    tx: mpsc::Sender<AgentSseEvent>,
    snapshots: Arc<dyn SnapshotStore>,
    seq: Mutex<u64>,
    closed: Mutex<bool>,
}

impl Emitter {
    #[allow(clippy::too_many_arguments)]
    async fn emit(
        &self,
        status: AgentStatus,
        kind: MessageKind,
        content: String,
        agent_state: Option<serde_json::Value>,
        unified_diff: Option<String>,
        app_name: Option<String>,
        commit_message: Option<String>,
    ) {
        let mut seq = self.seq.lock().await;
        let closed = *self.closed.lock().await;
        let event = AgentSseEvent {
            status,
            trace_id: self.trace_id.clone(),
            seq: *seq,
            message: AgentMessage {
                role: "assistant".to_string(),
                kind,
                messages: vec![EventBlock::new(content)],
                agent_state,
                unified_diff,
                app_name,
                commit_message,
            },
        };
        self.snapshots
            .save(
                &self.trace_id,
                &format!("sse_events/{}", *seq),
                &serde_json::to_value(&event).unwrap_or_default(),
            )
            .await;
        *seq += 1;
        if !closed && self.tx.send(event).await.is_err() {
            // Client gone - keep snapshotting, stop streaming.
            *self.closed.lock().await = true;
        }
    }

    async fn stage(&self, content: String, app_name: Option<String>) {
        self.emit(
            AgentStatus::Running,
            MessageKind::StageResult,
            content,
            None,
            None,
            app_name,
            None,
        )
        .await;
    }
}

enum TurnOutcome {
    Finished,
    Cancelled,
    TimedOut,
    MachineError(String),
}

/// Machine observer: every state entry becomes a running StageResult and
/// every completed transition refreshes the durable checkpoint, so a
/// crashed session can resume from its last stable state.
struct MachineWatch {
    emitter: Arc<Emitter>,
    snapshots: Arc<dyn SnapshotStore>,
    trace_id: String,
    app_name: Option<String>,
}

#[async_trait::async_trait]
impl MachineObserver for MachineWatch {
    async fn on_enter(&self, state: &str) {
        self.emitter
            .stage(format!("Stage: {}", state), self.app_name.clone())
            .await;
    }

    async fn on_checkpoint(&self, checkpoint: &MachineCheckpoint) {
        self.snapshots
            .save(
                &self.trace_id,
                "fsm_exit",
                &serde_json::to_value(checkpoint).unwrap_or_default(),
            )
            .await;
    }
}

pub struct SessionCoordinator {
    deps: Arc<SessionDeps>,
    cancel: CancellationToken,
}

impl SessionCoordinator {
    pub fn new(deps: Arc<SessionDeps>, cancel: CancellationToken) -> Self {
        Self { deps, cancel }
    }

    /// Process one turn, emitting events into `event_tx`. The stream
    /// always ends with exactly one idle event; the channel closes when
    /// this returns.
    pub async fn process(&self, request: AgentRequest, event_tx: mpsc::Sender<AgentSseEvent>) {
        info!(
            "Processing request for {}:{}",
            request.application_id, request.trace_id
        );

        let emitter = Arc::new(Emitter {
            trace_id: request.trace_id.clone(),
            tx: event_tx,
            snapshots: self.deps.snapshots.clone(),
            seq: Mutex::new(0),
            closed: Mutex::new(false),
        });

        let settings = EngineSettings::from_value(request.settings.as_ref());
        let provided_files = request.files_map();
        let user_message = request.last_user_content().map(str::to_string);

        // Reconstruct prior state; a malformed payload degrades to fresh.
        let mut state: SessionState = match &request.agent_state {
            Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|e| {
                warn!("Could not parse agent_state, starting fresh: {}", e);
                SessionState::default()
            }),
            None => SessionState::default(),
        };
        if let Some(message) = &user_message {
            state.fsm_messages.push(Message::user_text(message));
        }

        // Root workspace: template base seeded with the provided tree.
        let mut workspace = Workspace::new(
            self.deps.base_image.clone(),
            self.deps.runtime.clone(),
            self.deps.postgres.clone(),
        );
        for (path, content) in &provided_files {
            workspace.seed_file(path, content);
        }

        let (progress_tx, progress_rx) = mpsc::channel::<String>(16);
        let gen_deps = GenDeps {
            workspace: workspace.clone(),
            gateway: self.deps.gateway.clone(),
            fast_gateway: self.deps.fast_gateway.clone(),
            model: self.deps.model.clone(),
            fast_model: self.deps.fast_model.clone(),
            settings,
            progress: Some(progress_tx),
            cancel: self.cancel.clone(),
        };

        let built = self.build_app(gen_deps, &mut state, &provided_files, &user_message);
        let mut app = match built {
            Ok(app) => app,
            Err(e) => {
                error!("Could not build generation app: {}", e);
                self.emit_runtime_error(&emitter, &e.to_string()).await;
                return;
            }
        };

        if let Some(checkpoint) = &state.fsm_state {
            self.deps
                .snapshots
                .save(
                    &request.trace_id,
                    "fsm_enter",
                    &serde_json::to_value(checkpoint).unwrap_or_default(),
                )
                .await;
        }

        // First turn: announce the app and send the template diff.
        if !state.metadata.template_diff_sent {
            let app_name = app.generate_app_name().await;
            emitter
                .stage("Initializing application...".to_string(), Some(app_name.clone()))
                .await;
            let template_diff = unified_diff(&BTreeMap::new(), &workspace.view());
            emitter
                .emit(
                    AgentStatus::Running,
                    MessageKind::ReviewResult,
                    "Application initialized".to_string(),
                    None,
                    Some(template_diff),
                    Some(app_name.clone()),
                    Some("Initial commit".to_string()),
                )
                .await;
            state.metadata.app_name = Some(app_name);
            state.metadata.template_diff_sent = true;
        }

        app = app.with_observer(Arc::new(MachineWatch {
            emitter: emitter.clone(),
            snapshots: self.deps.snapshots.clone(),
            trace_id: request.trace_id.clone(),
            app_name: state.metadata.app_name.clone(),
        }));

        let outcome = self
            .drive(&mut app, &mut state, &emitter, progress_rx, &user_message)
            .await;

        self.finish(
            &mut app,
            &mut state,
            &emitter,
            outcome,
            &provided_files,
            &user_message,
        )
        .await;

        if let Ok(checkpoint) = app.checkpoint() {
            self.deps
                .snapshots
                .save(
                    &request.trace_id,
                    "fsm_exit",
                    &serde_json::to_value(&checkpoint).unwrap_or_default(),
                )
                .await;
        }
    }

    /// Decide which app drives this turn: a restored machine, a fresh
    /// draft, or an edit continuation over a completed session.
    fn build_app(
        &self,
        gen_deps: GenDeps,
        state: &mut SessionState,
        provided_files: &BTreeMap<String, String>,
        user_message: &Option<String>,
    ) -> Result<GenApp, Error> {
        match &mut state.fsm_state {
            Some(checkpoint) => {
                // The client's current tree wins over the checkpointed one.
                if let Some(files) = checkpoint
                    .context
                    .get_mut("files")
                    .and_then(|v| v.as_object_mut())
                {
                    for (path, content) in provided_files {
                        files.insert(
                            path.clone(),
                            serde_json::Value::String(content.clone()),
                        );
                    }
                }
                let app = GenApp::restore(gen_deps.clone(), checkpoint)
                    .map_err(|e| Error::Internal(format!("could not restore checkpoint: {}", e)))?;
                if app.current() == Some("complete") {
                    // Prior session finished; a new message opens an edit turn.
                    match user_message {
                        Some(message) => {
                            Ok(GenApp::new_edit(gen_deps, message, provided_files.clone()))
                        }
                        None => Ok(app),
                    }
                } else {
                    Ok(app)
                }
            }
            None => {
                let prompt = user_message.as_deref().ok_or_else(|| {
                    Error::InvalidRequest("request carries no user message".to_string())
                })?;
                Ok(GenApp::new_draft(
                    gen_deps,
                    prompt,
                    provided_files.clone(),
                ))
            }
        }
    }

    /// Drive the machine while forwarding sub-agent progress, under the
    /// wall-clock budget and the cancellation token.
    async fn drive(
        &self,
        app: &mut GenApp,
        state: &mut SessionState,
        emitter: &Arc<Emitter>,
        mut progress_rx: mpsc::Receiver<String>,
        user_message: &Option<String>,
    ) -> TurnOutcome {
        let deadline = tokio::time::Instant::now() + self.deps.turn_budget;
        let app_name = state.metadata.app_name.clone();

        let run = async {
            if app.current().is_none() {
                app.start().await
            } else if app.is_review() && user_message.is_some() {
                app.apply_feedback(user_message.as_deref().unwrap_or_default())
                    .await
            } else if app.is_terminal() {
                Ok(())
            } else {
                app.resume().await
            }
        };
        tokio::pin!(run);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Session cancelled");
                    return TurnOutcome::Cancelled;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("Session exceeded its wall-clock budget");
                    return TurnOutcome::TimedOut;
                }
                Some(message) = progress_rx.recv() => {
                    emitter.stage(message, app_name.clone()).await;
                }
                result = &mut run => {
                    // Drain progress emitted just before completion.
                    while let Ok(message) = progress_rx.try_recv() {
                        emitter.stage(message, app_name.clone()).await;
                    }
                    return match result {
                        Ok(()) => TurnOutcome::Finished,
                        Err(e) => TurnOutcome::MachineError(e.to_string()),
                    };
                }
            }
        }
    }

    /// Emit the single terminal event for this turn.
    async fn finish(
        &self,
        app: &mut GenApp,
        state: &mut SessionState,
        emitter: &Arc<Emitter>,
        outcome: TurnOutcome,
        provided_files: &BTreeMap<String, String>,
        user_message: &Option<String>,
    ) {
        match outcome {
            TurnOutcome::Cancelled => {
                self.emit_runtime_error(emitter, "Generation was cancelled.")
                    .await;
            }
            TurnOutcome::TimedOut => {
                self.emit_runtime_error(
                    emitter,
                    "Generation exceeded the session time budget. Please try again.",
                )
                .await;
            }
            TurnOutcome::MachineError(message) => {
                error!("Stage machine error: {}", message);
                self.emit_runtime_error(emitter, RUNTIME_ERROR_TEXT).await;
            }
            TurnOutcome::Finished => {
                if app.is_failure() {
                    let detail = app
                        .context()
                        .error
                        .clone()
                        .unwrap_or_else(|| "Unknown error".to_string());
                    error!("Generation failed: {}", detail);
                    self.emit_runtime_error(emitter, RUNTIME_ERROR_TEXT).await;
                } else if app.is_review() {
                    let agent_state = self.serialize_state(app, state);
                    emitter
                        .emit(
                            AgentStatus::Idle,
                            MessageKind::RefinementRequest,
                            AWAITING_INPUT_TEXT.to_string(),
                            agent_state,
                            None,
                            state.metadata.app_name.clone(),
                            None,
                        )
                        .await;
                } else {
                    self.finish_complete(app, state, emitter, provided_files, user_message)
                        .await;
                }
            }
        }
    }

    async fn finish_complete(
        &self,
        app: &mut GenApp,
        state: &mut SessionState,
        emitter: &Arc<Emitter>,
        provided_files: &BTreeMap<String, String>,
        user_message: &Option<String>,
    ) {
        let final_files = app.final_files();
        let final_diff = unified_diff(provided_files, &final_files);
        info!("Sending completion event with diff (length: {})", final_diff.len());

        if final_diff.trim().is_empty() {
            let agent_state = self.serialize_state(app, state);
            emitter
                .emit(
                    AgentStatus::Idle,
                    MessageKind::StageResult,
                    NO_CHANGES_TEXT.to_string(),
                    agent_state,
                    None,
                    state.metadata.app_name.clone(),
                    None,
                )
                .await;
            return;
        }

        let user_request = user_message
            .clone()
            .unwrap_or_else(|| app.context().user_prompt.clone());
        let commit_message = app.generate_commit_message(&user_request).await;
        state
            .fsm_messages
            .push(Message::assistant(vec![appforge_llm::ContentBlock::text(
                format!("Changes generated: \n{}", commit_message),
            )]));
        let agent_state = self.serialize_state(app, state);
        emitter
            .emit(
                AgentStatus::Idle,
                MessageKind::ReviewResult,
                format!("Changes generated: \n{}", commit_message),
                agent_state,
                Some(final_diff),
                state.metadata.app_name.clone(),
                Some(commit_message),
            )
            .await;
    }

    fn serialize_state(&self, app: &GenApp, state: &SessionState) -> Option<serde_json::Value> {
        let checkpoint = app.checkpoint().ok();
        let session_state = SessionState {
            fsm_state: checkpoint,
            fsm_messages: state.fsm_messages.clone(),
            metadata: state.metadata.clone(),
        };
        serde_json::to_value(&session_state).ok()
    }

    async fn emit_runtime_error(&self, emitter: &Arc<Emitter>, message: &str) {
        emitter
            .emit(
                AgentStatus::Idle,
                MessageKind::RuntimeError,
                message.to_string(),
                None,
                None,
                None,
                None,
            )
            .await;
    }
}
