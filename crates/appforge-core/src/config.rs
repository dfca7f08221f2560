//! Server configuration with environment fallbacks

use std::path::PathBuf;

/// Host-facing knobs for the generation server. The CLI fills these from
/// flags; anything left unset falls back to `APPFORGE_*` environment
/// variables and then to defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    /// Directory holding the template trees, one subdirectory per template.
    pub template_root: PathBuf,
    /// Container image ref the template workspaces are based on.
    pub base_image: String,
    /// Directory snapshots are persisted under.
    pub snapshot_root: PathBuf,
    /// Replay-cache directory; None disables record/replay.
    pub replay_cache: Option<PathBuf>,
    /// Soft wall-clock budget for one turn, in seconds.
    pub turn_budget_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8001,
            bind: "0.0.0.0".to_string(),
            template_root: PathBuf::from("./templates"),
            base_image: "oven/bun:1.2.5-alpine".to_string(),
            snapshot_root: PathBuf::from("./snapshots"),
            replay_cache: None,
            turn_budget_secs: 1800,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `APPFORGE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(port) = std::env::var("APPFORGE_PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        if let Ok(bind) = std::env::var("APPFORGE_BIND") {
            config.bind = bind;
        }
        if let Ok(root) = std::env::var("APPFORGE_TEMPLATE_ROOT") {
            config.template_root = PathBuf::from(root);
        }
        if let Ok(image) = std::env::var("APPFORGE_BASE_IMAGE") {
            config.base_image = image;
        }
        if let Ok(root) = std::env::var("APPFORGE_SNAPSHOT_ROOT") {
            config.snapshot_root = PathBuf::from(root);
        }
        if let Ok(dir) = std::env::var("APPFORGE_REPLAY_CACHE") {
            config.replay_cache = Some(PathBuf::from(dir));
        }
        if let Ok(budget) = std::env::var("APPFORGE_TURN_BUDGET_SECS") {
            if let Ok(budget) = budget.parse() {
                config.turn_budget_secs = budget;
            }
        }
        config
    }
}
