//! Snapshot persistence - checkpoints and emitted events, keyed by
//! `(trace_id, key)` with `key ∈ {fsm_enter, fsm_exit, sse_events/<seq>}`

use serde_json::Value;
use std::path::PathBuf;
use tracing::warn;

/// Persistence seam. Saving is best-effort: a failing store must never
/// take a session down, so errors are logged, not returned.
#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, trace_id: &str, key: &str, data: &Value);
}

/// Filesystem store: `<root>/<trace_id>/<key>.json`.
pub struct FsSnapshotStore {
    root: PathBuf,
}

impl FsSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait::async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn save(&self, trace_id: &str, key: &str, data: &Value) {
        let path = self.root.join(trace_id).join(format!("{}.json", key));
        let result: std::io::Result<()> = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let bytes = serde_json::to_vec_pretty(data)?;
            tokio::fs::write(&path, bytes).await
        }
        .await;
        if let Err(e) = result {
            warn!("Failed to save snapshot {}/{}: {}", trace_id, key, e);
        }
    }
}

/// Store for tests and diskless deployments.
pub struct NullSnapshotStore;

#[async_trait::async_trait]
impl SnapshotStore for NullSnapshotStore {
    async fn save(&self, _trace_id: &str, _key: &str, _data: &Value) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_store_writes_nested_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSnapshotStore::new(dir.path());
        store
            .save("trace-1", "sse_events/0", &serde_json::json!({"seq": 0}))
            .await;
        let written = dir.path().join("trace-1").join("sse_events").join("0.json");
        let content = std::fs::read_to_string(written).unwrap();
        assert!(content.contains("\"seq\""));
    }
}
