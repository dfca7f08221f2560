//! HTTP entry - single streaming endpoint plus health

use crate::session::{SessionCoordinator, SessionDeps};
use crate::snapshot::{FsSnapshotStore, SnapshotStore};
use appforge_core::{AgentRequest, AgentSseEvent, ServerConfig};
use appforge_llm::{AnthropicProvider, LlmGateway, LlmProvider, ReplayCache};
use appforge_workspace::{BaseImage, DisabledPostgres, DockerPostgres, ProcessRuntime};
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use futures::Stream;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct AppState {
    pub deps: Arc<SessionDeps>,
    /// Live sessions by trace id, for health reporting.
    pub active: DashMap<String, std::time::Instant>,
    pub started_at: std::time::Instant,
}

/// Build the provider stack from the environment: Anthropic, optionally
/// wrapped in the replay cache.
fn build_provider(config: &ServerConfig) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let replay_mode = std::env::var("APPFORGE_REPLAY_MODE").ok();
    if let (Some(dir), Some("replay")) = (&config.replay_cache, replay_mode.as_deref()) {
        info!("LLM replay mode: serving from {}", dir.display());
        return Ok(Arc::new(ReplayCache::replay(dir.clone())));
    }

    let api_key = std::env::var("ANTHROPIC_API_KEY")
        .map_err(|_| anyhow::anyhow!("ANTHROPIC_API_KEY not set"))?;
    let mut provider = AnthropicProvider::new(&api_key);
    if let Ok(api_url) = std::env::var("ANTHROPIC_API_URL") {
        info!("Using custom API URL: {}/v1/messages", api_url);
        provider = provider.with_base_url(format!("{}/v1/messages", api_url));
    }
    let provider: Arc<dyn LlmProvider> = Arc::new(provider);

    if let Some(dir) = &config.replay_cache {
        info!("LLM record mode: caching into {}", dir.display());
        return Ok(Arc::new(ReplayCache::record(provider, dir.clone())));
    }
    Ok(provider)
}

pub fn build_deps(config: &ServerConfig) -> anyhow::Result<Arc<SessionDeps>> {
    let template_dir = config.template_root.join("trpc_fullstack");
    let base_image = Arc::new(BaseImage::load(&config.base_image, &template_dir)?);
    info!(
        "Loaded template '{}' ({} files)",
        template_dir.display(),
        base_image.files().len()
    );

    let provider = build_provider(config)?;
    let gateway = LlmGateway::new(provider.clone());
    let fast_gateway = LlmGateway::new(provider);

    let postgres: Arc<dyn appforge_workspace::PostgresProvisioner> =
        if std::env::var("APPFORGE_DISABLE_PG").is_ok() {
            Arc::new(DisabledPostgres)
        } else {
            Arc::new(DockerPostgres::default())
        };

    let snapshots: Arc<dyn SnapshotStore> =
        Arc::new(FsSnapshotStore::new(config.snapshot_root.clone()));

    Ok(Arc::new(SessionDeps {
        base_image,
        runtime: Arc::new(ProcessRuntime::new()),
        postgres,
        snapshots,
        gateway,
        fast_gateway,
        model: std::env::var("APPFORGE_MODEL")
            .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string()),
        fast_model: std::env::var("APPFORGE_FAST_MODEL")
            .unwrap_or_else(|_| "claude-3-5-haiku-20241022".to_string()),
        turn_budget: Duration::from_secs(config.turn_budget_secs),
    }))
}

pub async fn start_server(config: ServerConfig) -> anyhow::Result<()> {
    let deps = build_deps(&config)?;
    let state = Arc::new(AppState {
        deps,
        active: DashMap::new(),
        started_at: std::time::Instant::now(),
    });

    let app = Router::new()
        .route("/message", post(message_handler))
        .route("/health", get(health_handler))
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .with_state(state);

    let bind_addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address: {}", e))?;

    info!("appforge server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("  Listening on: {}", bind_addr);
    info!("  Endpoint:  POST http://{}/message", bind_addr);
    info!("  Templates: {:?}", config.template_root);
    info!("  Snapshots: {:?}", config.snapshot_root);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn message_handler(
    State(state): State<Arc<AppState>>,
    Json(mut request): Json<AgentRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    if request.trace_id.is_empty() {
        request.trace_id = uuid::Uuid::new_v4().simple().to_string();
    }
    let trace_id = request.trace_id.clone();
    state
        .active
        .insert(trace_id.clone(), std::time::Instant::now());

    let cancel = CancellationToken::new();
    let (event_tx, event_rx) = mpsc::channel::<AgentSseEvent>(16);

    let deps = state.deps.clone();
    let session_cancel = cancel.clone();
    let session_state = state.clone();
    let session_trace = trace_id.clone();
    tokio::spawn(async move {
        let coordinator = SessionCoordinator::new(deps, session_cancel);
        coordinator.process(request, event_tx).await;
        session_state.active.remove(&session_trace);
    });

    // Dropping the response stream (client disconnect) trips the guard,
    // which cancels every in-flight LLM call and workspace exec.
    let stream = async_stream::stream! {
        let _guard = cancel.drop_guard();
        let mut event_rx = event_rx;
        while let Some(event) = event_rx.recv().await {
            let terminal = event.is_terminal();
            let data = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(Event::default().data(data));
            if terminal {
                break;
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "active_sessions": state.active.len(),
        "template_files": state.deps.base_image.files().len(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}
