//! Gateway wrapper - bounded retries with jitter, telemetry, cancellation

use crate::provider::{LlmError, LlmProvider, LlmResult};
use crate::types::{Completion, CompletionRequest};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Exponential back-off schedule: 200ms → 400ms → 800ms → ..., with
/// 0.8–1.2 jitter.
fn backoff(attempt: u32) -> Duration {
    let base_delay_ms = 200u64 * (1u64 << (attempt - 1).min(6));
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_millis((base_delay_ms as f64 * jitter) as u64)
}

/// Cumulative call telemetry.
#[derive(Debug, Clone, Copy, Default)]
pub struct TelemetrySnapshot {
    pub calls: u64,
    pub retries: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Default)]
struct Telemetry {
    calls: AtomicU64,
    retries: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

/// Stateless, shareable completion API. One instance serves every
/// sub-agent of a session.
#[derive(Clone)]
pub struct LlmGateway {
    provider: Arc<dyn LlmProvider>,
    max_attempts: u32,
    telemetry: Arc<Telemetry>,
}

impl LlmGateway {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            telemetry: Arc::new(Telemetry::default()),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            calls: self.telemetry.calls.load(Ordering::Relaxed),
            retries: self.telemetry.retries.load(Ordering::Relaxed),
            input_tokens: self.telemetry.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.telemetry.output_tokens.load(Ordering::Relaxed),
        }
    }

    /// Complete with bounded retries on transient errors.
    pub async fn complete(&self, request: &CompletionRequest) -> LlmResult<Completion> {
        let mut attempt = 1u32;
        loop {
            self.telemetry.calls.fetch_add(1, Ordering::Relaxed);
            match self.provider.complete(request).await {
                Ok(completion) => {
                    self.telemetry
                        .input_tokens
                        .fetch_add(completion.usage.input_tokens, Ordering::Relaxed);
                    self.telemetry
                        .output_tokens
                        .fetch_add(completion.usage.output_tokens, Ordering::Relaxed);
                    debug!(
                        provider = self.provider.name(),
                        model = request.model.as_str(),
                        input_tokens = completion.usage.input_tokens,
                        output_tokens = completion.usage.output_tokens,
                        "LLM call complete"
                    );
                    return Ok(completion);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = match &e {
                        LlmError::RateLimited { retry_after_ms } => {
                            Duration::from_millis(*retry_after_ms).max(backoff(attempt))
                        }
                        _ => backoff(attempt),
                    };
                    warn!(
                        provider = self.provider.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient LLM error, retrying: {}",
                        e
                    );
                    self.telemetry.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(LlmError::RetriesExhausted {
                        attempts: attempt,
                        last: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Complete, aborting when `cancel` is triggered.
    pub async fn complete_cancellable(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> LlmResult<Completion> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LlmError::Cancelled),
            result = self.complete(request) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_jitters() {
        let first = backoff(1);
        let third = backoff(3);
        assert!(first >= Duration::from_millis(160) && first <= Duration::from_millis(240));
        assert!(third >= Duration::from_millis(640) && third <= Duration::from_millis(960));
    }
}
