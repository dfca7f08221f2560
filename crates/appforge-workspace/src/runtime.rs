//! Command execution seam - container runtime trait + process-backed impl

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};
use walkdir::WalkDir;

const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(300);

/// Outcome of one command.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }

    /// Combined output, stdout first. Used for validator feedback.
    pub fn combined_output(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// One request against the runtime. `files` is the fully materialized
/// base ⊕ overlay view; permission policy never reaches this layer.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
    /// Capture filesystem modifications back as an overlay delta.
    pub capture_writes: bool,
    pub timeout: Duration,
}

impl ExecRequest {
    pub fn new(cmd: Vec<String>) -> Self {
        Self {
            cmd,
            cwd: None,
            env: Vec::new(),
            capture_writes: false,
            timeout: DEFAULT_EXEC_TIMEOUT,
        }
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn capture_writes(mut self) -> Self {
        self.capture_writes = true;
        self
    }
}

/// Result plus any captured writes (path → content, None = deleted).
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub result: ExecResult,
    pub writes: Option<BTreeMap<String, Option<String>>>,
}

/// Seam to the container backend. The production deployment plugs a real
/// container engine in here; [`ProcessRuntime`] is the dev/test backend.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn exec(
        &self,
        image_ref: &str,
        files: &BTreeMap<String, String>,
        request: ExecRequest,
    ) -> std::io::Result<ExecOutcome>;
}

/// Runs commands as host processes against a scratch materialization of
/// the workspace view. The image ref is informational only.
pub struct ProcessRuntime {
    capture_ignore: GlobSet,
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRuntime {
    pub fn new() -> Self {
        let mut builder = GlobSetBuilder::new();
        for pattern in [".git/**", "**/.cache/**"] {
            if let Ok(glob) = Glob::new(pattern) {
                builder.add(glob);
            }
        }
        let capture_ignore = builder.build().unwrap_or_else(|_| GlobSet::empty());
        Self { capture_ignore }
    }

    fn materialize(
        files: &BTreeMap<String, String>,
        root: &Path,
    ) -> std::io::Result<()> {
        for (path, content) in files {
            let full = root.join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&full, content)?;
        }
        Ok(())
    }

    fn collect(root: &Path, ignore: &GlobSet) -> BTreeMap<String, String> {
        let mut files = BTreeMap::new();
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(root) else {
                continue;
            };
            let rel = rel.to_string_lossy().replace('\\', "/");
            if ignore.is_match(&rel) {
                continue;
            }
            match std::fs::read_to_string(entry.path()) {
                Ok(content) => {
                    files.insert(rel, content);
                }
                // Binary artifacts are invisible to the overlay.
                Err(_) => continue,
            }
        }
        files
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for ProcessRuntime {
    async fn exec(
        &self,
        image_ref: &str,
        files: &BTreeMap<String, String>,
        request: ExecRequest,
    ) -> std::io::Result<ExecOutcome> {
        if request.cmd.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command",
            ));
        }

        let scratch = tempfile::tempdir()?;
        Self::materialize(files, scratch.path())?;

        let cwd = match &request.cwd {
            Some(dir) => {
                let joined = scratch.path().join(dir);
                std::fs::create_dir_all(&joined)?;
                joined
            }
            None => scratch.path().to_path_buf(),
        };

        debug!(
            image = image_ref,
            cmd = request.cmd.join(" "),
            cwd = %cwd.display(),
            "exec"
        );

        let mut command = Command::new(&request.cmd[0]);
        command
            .args(&request.cmd[1..])
            .current_dir(&cwd)
            .kill_on_drop(true);
        for (key, value) in &request.env {
            command.env(key, value);
        }

        let output = tokio::time::timeout(request.timeout, command.output()).await;
        let result = match output {
            Ok(Ok(output)) => ExecResult {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Ok(Err(e)) => ExecResult {
                exit_code: 127,
                stdout: String::new(),
                stderr: format!("failed to spawn '{}': {}", request.cmd[0], e),
            },
            Err(_) => {
                warn!(cmd = request.cmd.join(" "), "exec timed out");
                ExecResult {
                    exit_code: 124,
                    stdout: String::new(),
                    stderr: format!(
                        "command timed out after {}s: {}",
                        request.timeout.as_secs(),
                        request.cmd.join(" ")
                    ),
                }
            }
        };

        let writes = if request.capture_writes {
            let after = Self::collect(scratch.path(), &self.capture_ignore);
            let mut delta: BTreeMap<String, Option<String>> = BTreeMap::new();
            for (path, content) in &after {
                if files.get(path) != Some(content) {
                    delta.insert(path.clone(), Some(content.clone()));
                }
            }
            for path in files.keys() {
                if !after.contains_key(path) {
                    delta.insert(path.clone(), None);
                }
            }
            Some(delta)
        } else {
            None
        };

        Ok(ExecOutcome { result, writes })
    }
}
