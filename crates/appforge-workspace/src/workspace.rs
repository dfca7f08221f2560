//! Forkable workspace - staged overlay + permission policy over a base image

use crate::postgres::PostgresProvisioner;
use crate::runtime::{ContainerRuntime, ExecRequest, ExecResult};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("file not found: '{path}'")]
    NotFound { path: String },

    #[error("Permission denied writing file '{path}'")]
    PermissionDenied { path: String },

    #[error("Search text not found in file '{path}'. Search:\n{search}")]
    SearchNotFound { path: String, search: String },

    #[error("Search text found {count} times in file '{path}' (expected exactly 1). Use replace_all=true to replace all occurrences. Search:\n{search}")]
    AmbiguousEdit {
        path: String,
        count: usize,
        search: String,
    },

    #[error("database unavailable: {0}")]
    DatabaseUnavailable(String),

    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Immutable template snapshot a session's workspaces are forked from.
pub struct BaseImage {
    pub image_ref: String,
    files: BTreeMap<String, String>,
}

impl BaseImage {
    pub fn from_files(image_ref: impl Into<String>, files: BTreeMap<String, String>) -> Self {
        Self {
            image_ref: image_ref.into(),
            files,
        }
    }

    /// Load every UTF-8 file under a template directory.
    pub fn load(image_ref: impl Into<String>, dir: &Path) -> std::io::Result<Self> {
        let mut files = BTreeMap::new();
        for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(dir) else {
                continue;
            };
            if let Ok(content) = std::fs::read_to_string(entry.path()) {
                files.insert(rel.to_string_lossy().replace('\\', "/"), content);
            }
        }
        Ok(Self {
            image_ref: image_ref.into(),
            files,
        })
    }

    pub fn files(&self) -> &BTreeMap<String, String> {
        &self.files
    }
}

/// A forkable handle to the base image plus a staged overlay and a
/// permission policy. `clone()` yields an independent overlay referencing
/// the same base.
#[derive(Clone)]
pub struct Workspace {
    base: Arc<BaseImage>,
    runtime: Arc<dyn ContainerRuntime>,
    postgres: Arc<dyn PostgresProvisioner>,
    overlay: BTreeMap<String, Option<String>>,
    cwd: String,
    allowed: Vec<String>,
    protected: Vec<String>,
}

impl Workspace {
    pub fn new(
        base: Arc<BaseImage>,
        runtime: Arc<dyn ContainerRuntime>,
        postgres: Arc<dyn PostgresProvisioner>,
    ) -> Self {
        Self {
            base,
            runtime,
            postgres,
            overlay: BTreeMap::new(),
            cwd: String::new(),
            allowed: Vec::new(),
            protected: Vec::new(),
        }
    }

    /// Replace the permission policy. An empty allowed set means every
    /// path is writable; protected prefixes always win.
    pub fn permissions(mut self, allowed: Vec<String>, protected: Vec<String>) -> Self {
        self.allowed = allowed;
        self.protected = protected;
        self
    }

    pub fn cwd(mut self, dir: impl Into<String>) -> Self {
        self.cwd = dir.into();
        self
    }

    pub fn allowed_paths(&self) -> &[String] {
        &self.allowed
    }

    pub fn protected_paths(&self) -> &[String] {
        &self.protected
    }

    pub fn overlay(&self) -> &BTreeMap<String, Option<String>> {
        &self.overlay
    }

    fn under_prefix(path: &str, prefix: &str) -> bool {
        let prefix = prefix.trim_end_matches('/');
        path == prefix || path.starts_with(&format!("{}/", prefix))
    }

    fn check_writable(&self, path: &str) -> WorkspaceResult<()> {
        if self
            .protected
            .iter()
            .any(|prefix| Self::under_prefix(path, prefix))
        {
            return Err(WorkspaceError::PermissionDenied {
                path: path.to_string(),
            });
        }
        if !self.allowed.is_empty()
            && !self
                .allowed
                .iter()
                .any(|prefix| Self::under_prefix(path, prefix))
        {
            return Err(WorkspaceError::PermissionDenied {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    pub fn read_file(&self, path: &str) -> WorkspaceResult<String> {
        match self.overlay.get(path) {
            Some(Some(content)) => Ok(content.clone()),
            Some(None) => Err(WorkspaceError::NotFound {
                path: path.to_string(),
            }),
            None => self
                .base
                .files
                .get(path)
                .cloned()
                .ok_or_else(|| WorkspaceError::NotFound {
                    path: path.to_string(),
                }),
        }
    }

    /// Whether `dir` is materialized: some base or overlay entry lives
    /// under it. Tombstones count - a deleted file still proves its
    /// directory existed.
    fn dir_exists(&self, dir: &str) -> bool {
        let prefix = format!("{}/", dir);
        self.base
            .files
            .keys()
            .chain(self.overlay.keys())
            .any(|p| p.starts_with(&prefix))
    }

    fn check_parent_dir(&self, path: &str) -> WorkspaceResult<()> {
        let Some((dir, _)) = path.rsplit_once('/') else {
            return Ok(());
        };
        if self.dir_exists(dir) {
            return Ok(());
        }
        Err(WorkspaceError::NotFound {
            path: dir.to_string(),
        })
    }

    pub fn write_file(&mut self, path: &str, content: &str) -> WorkspaceResult<()> {
        self.check_writable(path)?;
        self.check_parent_dir(path)?;
        self.overlay
            .insert(path.to_string(), Some(content.to_string()));
        Ok(())
    }

    /// Seed a file bypassing the policy - used when the coordinator loads
    /// client-provided files before any agent runs.
    pub fn seed_file(&mut self, path: &str, content: &str) {
        self.overlay
            .insert(path.to_string(), Some(content.to_string()));
    }

    /// Search/replace with occurrence policy: 0 matches is an error, 1
    /// replaces, N>1 requires `replace_all`. Returns the replacement count.
    pub fn edit_file(
        &mut self,
        path: &str,
        search: &str,
        replace: &str,
        replace_all: bool,
    ) -> WorkspaceResult<usize> {
        let original = self.read_file(path)?;
        let count = original.matches(search).count();
        match count {
            0 => Err(WorkspaceError::SearchNotFound {
                path: path.to_string(),
                search: search.to_string(),
            }),
            1 => {
                let updated = original.replacen(search, replace, 1);
                self.write_file(path, &updated)?;
                Ok(1)
            }
            n if replace_all => {
                let updated = original.replace(search, replace);
                self.write_file(path, &updated)?;
                Ok(n)
            }
            n => Err(WorkspaceError::AmbiguousEdit {
                path: path.to_string(),
                count: n,
                search: search.to_string(),
            }),
        }
    }

    pub fn delete_file(&mut self, path: &str) -> WorkspaceResult<()> {
        self.check_writable(path)?;
        // Deleting something invisible is a NotFound, not a silent no-op.
        self.read_file(path)?;
        self.overlay.insert(path.to_string(), None);
        Ok(())
    }

    /// Paths visible through the overlay under a prefix.
    pub fn ls(&self, prefix: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .base
            .files
            .keys()
            .filter(|path| prefix.is_empty() || Self::under_prefix(path, prefix))
            .filter(|path| !matches!(self.overlay.get(*path), Some(None)))
            .cloned()
            .collect();
        for (path, content) in &self.overlay {
            if content.is_some()
                && (prefix.is_empty() || Self::under_prefix(path, prefix))
                && !self.base.files.contains_key(path)
            {
                paths.push(path.clone());
            }
        }
        paths.sort();
        paths
    }

    /// Fully materialized base ⊕ overlay view.
    pub fn view(&self) -> BTreeMap<String, String> {
        let mut files = self.base.files.clone();
        for (path, content) in &self.overlay {
            match content {
                Some(content) => {
                    files.insert(path.clone(), content.clone());
                }
                None => {
                    files.remove(path);
                }
            }
        }
        files
    }

    fn request(&self, cmd: Vec<String>, cwd: Option<&str>) -> ExecRequest {
        let mut request = ExecRequest::new(cmd);
        let cwd = cwd.unwrap_or(self.cwd.as_str());
        if !cwd.is_empty() {
            request = request.cwd(cwd);
        }
        request
    }

    /// Run a command against the current view. Read-only: modifications
    /// made inside the container are discarded.
    pub async fn exec(&self, cmd: Vec<String>, cwd: Option<&str>) -> WorkspaceResult<ExecResult> {
        let outcome = self
            .runtime
            .exec(&self.base.image_ref, &self.view(), self.request(cmd, cwd))
            .await?;
        Ok(outcome.result)
    }

    /// Run a command and fold filesystem modifications back into the
    /// overlay. Used for dependency installs.
    pub async fn exec_mut(
        &mut self,
        cmd: Vec<String>,
        cwd: Option<&str>,
    ) -> WorkspaceResult<ExecResult> {
        let request = self.request(cmd, cwd).capture_writes();
        let outcome = self
            .runtime
            .exec(&self.base.image_ref, &self.view(), request)
            .await?;
        if outcome.result.ok() {
            if let Some(writes) = outcome.writes {
                debug!("exec_mut captured {} changed paths", writes.len());
                self.overlay.extend(writes);
            }
        }
        Ok(outcome.result)
    }

    /// Run a command with a transient PostgreSQL attached via
    /// `APP_DATABASE_URL`. The instance is discarded on return.
    pub async fn exec_with_pg(&self, cmd: Vec<String>) -> WorkspaceResult<ExecResult> {
        let handle = self
            .postgres
            .acquire()
            .await
            .map_err(|e| WorkspaceError::DatabaseUnavailable(e.to_string()))?;
        let request = self
            .request(cmd, None)
            .env("APP_DATABASE_URL", handle.url.clone());
        let outcome = self
            .runtime
            .exec(&self.base.image_ref, &self.view(), request)
            .await?;
        drop(handle);
        Ok(outcome.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgres::DisabledPostgres;
    use crate::runtime::ProcessRuntime;

    fn workspace() -> Workspace {
        let mut files = BTreeMap::new();
        files.insert("server/src/index.ts".to_string(), "export {};\n".to_string());
        files.insert(
            "server/src/handlers/index.ts".to_string(),
            "export {};\n".to_string(),
        );
        files.insert(
            "client/src/components/ui/button.tsx".to_string(),
            "export const Button = null;\n".to_string(),
        );
        Workspace::new(
            Arc::new(BaseImage::from_files("test:latest", files)),
            Arc::new(ProcessRuntime::new()),
            Arc::new(DisabledPostgres),
        )
    }

    #[test]
    fn read_falls_through_to_base() {
        let ws = workspace();
        assert_eq!(ws.read_file("server/src/index.ts").unwrap(), "export {};\n");
        assert!(matches!(
            ws.read_file("missing.ts"),
            Err(WorkspaceError::NotFound { .. })
        ));
    }

    #[test]
    fn overlay_shadows_base_and_tombstones_hide() {
        let mut ws = workspace();
        ws.write_file("server/src/index.ts", "changed").unwrap();
        assert_eq!(ws.read_file("server/src/index.ts").unwrap(), "changed");

        ws.delete_file("server/src/index.ts").unwrap();
        assert!(matches!(
            ws.read_file("server/src/index.ts"),
            Err(WorkspaceError::NotFound { .. })
        ));
        assert!(!ws.ls("server").contains(&"server/src/index.ts".to_string()));
    }

    #[test]
    fn clone_is_independent() {
        let mut ws = workspace();
        let fork = ws.clone();
        ws.write_file("server/src/new.ts", "a").unwrap();
        assert!(fork.read_file("server/src/new.ts").is_err());
        assert!(ws.read_file("server/src/new.ts").is_ok());
    }

    #[test]
    fn protected_prefix_rejects_writes() {
        let mut ws = workspace().permissions(
            vec!["client/src/".to_string()],
            vec!["client/src/components/ui/".to_string()],
        );
        let err = ws
            .write_file("client/src/components/ui/button.tsx", "x")
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::PermissionDenied { .. }));
        ws.write_file("client/src/App.tsx", "x").unwrap();
    }

    #[test]
    fn allowed_prefixes_scope_writes() {
        let mut ws = workspace().permissions(vec!["server/src/handlers/".to_string()], vec![]);
        assert!(ws.write_file("server/src/handlers/foo.ts", "x").is_ok());
        assert!(matches!(
            ws.write_file("server/src/index.ts", "x"),
            Err(WorkspaceError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn write_into_missing_directory_is_rejected() {
        let mut ws = workspace();
        let err = ws
            .write_file("server/src/migrations/0001_init.sql", "create table t ();")
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::NotFound { .. }));

        // Top-level files need no directory.
        assert!(ws.write_file("README.md", "hello").is_ok());

        // Seeding a file materializes its directory for later writes.
        ws.seed_file("server/src/migrations/meta.json", "{}");
        assert!(ws
            .write_file("server/src/migrations/0001_init.sql", "create table t ();")
            .is_ok());
    }

    #[test]
    fn edit_occurrence_policy() {
        let mut ws = workspace();
        ws.write_file("a.txt", "one two two three").unwrap();

        assert!(matches!(
            ws.edit_file("a.txt", "missing", "x", false),
            Err(WorkspaceError::SearchNotFound { .. })
        ));
        assert_eq!(ws.edit_file("a.txt", "one", "1", false).unwrap(), 1);
        assert!(matches!(
            ws.edit_file("a.txt", "two", "2", false),
            Err(WorkspaceError::AmbiguousEdit { count: 2, .. })
        ));
        assert_eq!(ws.edit_file("a.txt", "two", "2", true).unwrap(), 2);
        assert_eq!(ws.read_file("a.txt").unwrap(), "1 2 2 three");
    }

    #[test]
    fn view_folds_overlay_over_base() {
        let mut ws = workspace();
        ws.write_file("extra.txt", "new").unwrap();
        ws.delete_file("server/src/index.ts").unwrap();
        let view = ws.view();
        assert!(view.contains_key("extra.txt"));
        assert!(!view.contains_key("server/src/index.ts"));
        assert!(view.contains_key("client/src/components/ui/button.tsx"));
    }

    #[tokio::test]
    async fn exec_runs_against_materialized_view() {
        let mut ws = workspace();
        ws.write_file("note.txt", "hello from overlay").unwrap();
        let result = ws
            .exec(vec!["cat".to_string(), "note.txt".to_string()], None)
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hello from overlay");
    }

    #[tokio::test]
    async fn exec_mut_captures_modifications() {
        let mut ws = workspace();
        let result = ws
            .exec_mut(
                vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "echo generated > lockfile.lock".to_string(),
                ],
                None,
            )
            .await
            .unwrap();
        assert!(result.ok());
        assert_eq!(ws.read_file("lockfile.lock").unwrap(), "generated\n");
    }

    #[tokio::test]
    async fn exec_does_not_capture_modifications() {
        let ws = workspace();
        let result = ws
            .exec(
                vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "echo generated > lockfile.lock".to_string(),
                ],
                None,
            )
            .await
            .unwrap();
        assert!(result.ok());
        assert!(ws.read_file("lockfile.lock").is_err());
    }

    #[tokio::test]
    async fn exec_timeout_returns_nonzero_with_stderr() {
        let ws = workspace();
        let mut request = ExecRequest::new(vec!["sleep".to_string(), "5".to_string()]);
        request.timeout = std::time::Duration::from_millis(100);
        let outcome = ProcessRuntime::new()
            .exec(&ws.base.image_ref, &ws.view(), request)
            .await
            .unwrap();
        assert_eq!(outcome.result.exit_code, 124);
        assert!(outcome.result.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn exec_with_pg_surfaces_missing_provisioner() {
        let ws = workspace();
        let err = ws
            .exec_with_pg(vec!["true".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::DatabaseUnavailable(_)));
    }
}
