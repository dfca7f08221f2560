//! Tests for appforge-llm: gateway retries, replay cache, request shapes

use appforge_llm::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Provider that fails with transient errors N times, then succeeds.
struct FlakyProvider {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyProvider {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for FlakyProvider {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn complete(&self, _request: &CompletionRequest) -> LlmResult<Completion> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(LlmError::ServerError {
                status: 529,
                message: "overloaded".to_string(),
            });
        }
        Ok(Completion {
            role: Role::Assistant,
            content: vec![ContentBlock::text("ok")],
            usage: Usage {
                input_tokens: 10,
                output_tokens: 2,
            },
            stop_reason: StopReason::EndTurn,
        })
    }
}

struct AuthFailProvider;

#[async_trait::async_trait]
impl LlmProvider for AuthFailProvider {
    fn name(&self) -> &str {
        "authfail"
    }

    async fn complete(&self, _request: &CompletionRequest) -> LlmResult<Completion> {
        Err(LlmError::AuthFailed("bad key".to_string()))
    }
}

fn request() -> CompletionRequest {
    CompletionRequest {
        messages: vec![Message::user_text("hello")],
        ..Default::default()
    }
}

#[tokio::test]
async fn gateway_retries_transient_errors() {
    let gateway = LlmGateway::new(Arc::new(FlakyProvider::new(2)));
    let completion = gateway.complete(&request()).await.unwrap();
    assert_eq!(completion.content, vec![ContentBlock::text("ok")]);

    let telemetry = gateway.telemetry();
    assert_eq!(telemetry.calls, 3);
    assert_eq!(telemetry.retries, 2);
    assert_eq!(telemetry.input_tokens, 10);
}

#[tokio::test]
async fn gateway_gives_up_after_max_attempts() {
    let gateway = LlmGateway::new(Arc::new(FlakyProvider::new(10))).with_max_attempts(3);
    let err = gateway.complete(&request()).await.unwrap_err();
    assert!(matches!(err, LlmError::RetriesExhausted { attempts: 3, .. }));
}

#[tokio::test]
async fn gateway_does_not_retry_fatal_errors() {
    let gateway = LlmGateway::new(Arc::new(AuthFailProvider));
    let err = gateway.complete(&request()).await.unwrap_err();
    assert!(matches!(err, LlmError::AuthFailed(_)));
    assert_eq!(gateway.telemetry().calls, 1);
}

#[tokio::test]
async fn gateway_cancellation_interrupts_call() {
    struct HangingProvider;

    #[async_trait::async_trait]
    impl LlmProvider for HangingProvider {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn complete(&self, _request: &CompletionRequest) -> LlmResult<Completion> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            unreachable!()
        }
    }

    let gateway = LlmGateway::new(Arc::new(HangingProvider));
    let cancel = tokio_util::sync::CancellationToken::new();
    cancel.cancel();
    let err = gateway
        .complete_cancellable(&request(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::Cancelled));
}

#[tokio::test]
async fn replay_cache_round_trips() {
    let dir = tempfile::tempdir().unwrap();

    let recorder = ReplayCache::record(Arc::new(FlakyProvider::new(0)), dir.path());
    let recorded = recorder.complete(&request()).await.unwrap();

    // Replay mode serves the same completion without any provider.
    let replayer = ReplayCache::replay(dir.path());
    let replayed = replayer.complete(&request()).await.unwrap();
    assert_eq!(replayed.content, recorded.content);

    // A different request misses.
    let mut other = request();
    other.messages.push(Message::user_text("something else"));
    let err = replayer.complete(&other).await.unwrap_err();
    assert!(matches!(err, LlmError::ReplayMiss(_)));
}

#[test]
fn completion_request_defaults() {
    let request = CompletionRequest::default();
    assert_eq!(request.max_tokens, 8192);
    assert!(request.tools.is_none());
    assert!(request.thinking_budget.is_none());
}
