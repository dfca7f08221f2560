//! Replay cache - deterministic record/replay keyed by request payload

use crate::provider::{LlmError, LlmProvider, LlmResult};
use crate::types::{Completion, CompletionRequest};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// Call through and record every completion.
    Record,
    /// Serve exclusively from the cache; a miss is an error.
    Replay,
}

/// Provider wrapper that persists completions under
/// `<dir>/<sha256(request)>.json`.
pub struct ReplayCache {
    inner: Option<Arc<dyn LlmProvider>>,
    dir: PathBuf,
    mode: ReplayMode,
}

impl ReplayCache {
    pub fn record(inner: Arc<dyn LlmProvider>, dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Some(inner),
            dir: dir.into(),
            mode: ReplayMode::Record,
        }
    }

    pub fn replay(dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: None,
            dir: dir.into(),
            mode: ReplayMode::Replay,
        }
    }

    fn key(request: &CompletionRequest) -> String {
        let payload = serde_json::to_vec(request).unwrap_or_default();
        let digest = Sha256::digest(&payload);
        format!("{:x}", digest)
    }

    fn path_for(&self, request: &CompletionRequest) -> PathBuf {
        self.dir.join(format!("{}.json", Self::key(request)))
    }
}

#[async_trait::async_trait]
impl LlmProvider for ReplayCache {
    fn name(&self) -> &str {
        match self.mode {
            ReplayMode::Record => "replay-record",
            ReplayMode::Replay => "replay",
        }
    }

    async fn complete(&self, request: &CompletionRequest) -> LlmResult<Completion> {
        let path = self.path_for(request);

        if let Ok(bytes) = tokio::fs::read(&path).await {
            let completion: Completion = serde_json::from_slice(&bytes)
                .map_err(|e| LlmError::InvalidResponse(format!("corrupt cache entry: {}", e)))?;
            debug!("Replay cache hit: {}", path.display());
            return Ok(completion);
        }

        match self.mode {
            ReplayMode::Replay => Err(LlmError::ReplayMiss(path.display().to_string())),
            ReplayMode::Record => {
                let inner = self
                    .inner
                    .as_ref()
                    .ok_or_else(|| LlmError::RequestFailed("no inner provider".to_string()))?;
                let completion = inner.complete(request).await?;
                tokio::fs::create_dir_all(&self.dir)
                    .await
                    .map_err(|e| LlmError::RequestFailed(e.to_string()))?;
                let bytes = serde_json::to_vec_pretty(&completion)
                    .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
                tokio::fs::write(&path, bytes)
                    .await
                    .map_err(|e| LlmError::RequestFailed(e.to_string()))?;
                debug!("Replay cache recorded: {}", path.display());
                Ok(completion)
            }
        }
    }
}
