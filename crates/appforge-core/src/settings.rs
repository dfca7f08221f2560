//! Engine settings parsed from the request's `settings` map

use serde::{Deserialize, Serialize};

/// How the stage machine interleaves review pauses between work stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InteractionMode {
    /// Every stage cascades into the next; the machine only stops at
    /// complete or failure.
    #[default]
    NonInteractive,
    /// Every work stage is followed by a review stage awaiting CONFIRM
    /// or a stage-specific revise event.
    Interactive,
    /// Only the first stage pauses for review; the rest cascade.
    TypespecOnly,
}

/// Engine knobs recognized by the trpc template.
///
/// Unknown keys are ignored so older clients keep working when the set
/// grows. Per-stage defaults apply when a knob is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Sub-agent branching factor. Overrides the per-stage default.
    pub beam_width: Option<usize>,
    /// Per-sub-agent step budget.
    pub max_depth: Option<usize>,
    pub interaction_mode: InteractionMode,
    /// Extended-thinking token budget forwarded to the provider.
    pub thinking_budget: Option<u32>,
    /// Run the frontend sub-agent concurrently with the handler fan-out.
    pub concurrent_frontend: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            beam_width: None,
            max_depth: None,
            interaction_mode: InteractionMode::NonInteractive,
            thinking_budget: None,
            concurrent_frontend: true,
        }
    }
}

impl EngineSettings {
    /// Parse from the request's settings value. Absent or null means defaults.
    pub fn from_value(value: Option<&serde_json::Value>) -> Self {
        match value {
            Some(v) if !v.is_null() => {
                serde_json::from_value(v.clone()).unwrap_or_else(|e| {
                    tracing::warn!("Unrecognized settings shape, using defaults: {}", e);
                    Self::default()
                })
            }
            _ => Self::default(),
        }
    }

    pub fn beam_width_or(&self, default: usize) -> usize {
        self.beam_width.unwrap_or(default)
    }

    pub fn max_depth_or(&self, default: usize) -> usize {
        self.max_depth.unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_absent() {
        let settings = EngineSettings::from_value(None);
        assert_eq!(settings.interaction_mode, InteractionMode::NonInteractive);
        assert!(settings.concurrent_frontend);
        assert_eq!(settings.beam_width_or(3), 3);
    }

    #[test]
    fn parses_known_keys() {
        let value = serde_json::json!({
            "beam_width": 5,
            "max_depth": 10,
            "interaction_mode": "interactive",
            "thinking_budget": 2048,
        });
        let settings = EngineSettings::from_value(Some(&value));
        assert_eq!(settings.beam_width, Some(5));
        assert_eq!(settings.max_depth, Some(10));
        assert_eq!(settings.interaction_mode, InteractionMode::Interactive);
        assert_eq!(settings.thinking_budget, Some(2048));
    }

    #[test]
    fn ignores_unknown_keys() {
        let value = serde_json::json!({"beam_width": 2, "future_knob": true});
        let settings = EngineSettings::from_value(Some(&value));
        assert_eq!(settings.beam_width, Some(2));
    }
}
