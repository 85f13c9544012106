//! HTTP-level tests for the invocation engine against a mock provider.
//!
//! Uses wiremock to stand in for both wire formats, so retry, timeout and
//! classification behaviour is exercised through real requests.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use ledgerlens::extract::client::{create_http_client, InvocationOutcome};
use ledgerlens::extract::validate::{Repairs, ValidationResult};
use ledgerlens::extract::{
    plan, Attempt, ErrorClass, HttpInvoker, InvocationRequest, Invoke, Orchestrator,
    ProviderSpec, RetryPolicy, Topology,
};

const HOSTED: &str = "primary-hosted";
const AGGREGATOR: &str = "aggregator";

fn invoker(base: &str, timeout: Duration) -> HttpInvoker {
    let topology = Topology::new(
        vec![ProviderSpec::hosted(base), ProviderSpec::aggregator(base)],
        HOSTED,
    );
    let credentials = HashMap::from([
        (HOSTED.to_string(), "test-hosted-key".to_string()),
        (AGGREGATOR.to_string(), "test-aggregator-key".to_string()),
    ]);
    HttpInvoker::new(
        create_http_client().unwrap(),
        Arc::new(topology),
        credentials,
        timeout,
        RetryPolicy {
            base_ms: 1,
            cap_ms: 4,
            max_attempts: 6,
        },
    )
}

fn attempt(provider: &str, model: &str) -> Attempt {
    Attempt {
        provider: provider.to_string(),
        model: model.to_string(),
    }
}

fn request() -> InvocationRequest {
    InvocationRequest::new("extract", "quotes", json!({"type": "object"}))
}

fn gemini_text(text: &str) -> serde_json::Value {
    json!({
        "candidates": [{"content": {"parts": [{"text": text}]}, "finishReason": "STOP"}],
        "usageMetadata": {"promptTokenCount": 120, "candidatesTokenCount": 30, "totalTokenCount": 150}
    })
}

fn chat_text(text: &str) -> serde_json::Value {
    json!({
        "choices": [{"message": {"role": "assistant", "content": text}}],
        "usage": {"prompt_tokens": 80, "completion_tokens": 20, "total_tokens": 100}
    })
}

#[tokio::test]
async fn hosted_fenced_json_is_parsed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-2.5-flash:generateContent"))
        .and(header("x-goog-api-key", "test-hosted-key"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(gemini_text("```json\n{\"quotes\": [{\"quote\": \"hi\"}]}\n```")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let outcome = invoker(&server.uri(), Duration::from_secs(5))
        .invoke(&attempt(HOSTED, "gemini-2.5-flash"), &request())
        .await;

    match outcome {
        InvocationOutcome::Success(success) => {
            assert_eq!(success.value, json!({"quotes": [{"quote": "hi"}]}));
            assert_eq!(success.usage.unwrap().total_tokens, 150);
        }
        other => panic!("expected success, got {other:?}"),
    }
}

#[tokio::test]
async fn hosted_retries_overload_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-2.5-flash:generateContent"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "error": {"code": 503, "message": "The model is overloaded. Please try again later.", "status": "UNAVAILABLE"}
        })))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-2.5-flash:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_text("{\"ok\": true}")))
        .with_priority(2)
        .mount(&server)
        .await;

    let outcome = invoker(&server.uri(), Duration::from_secs(5))
        .invoke(&attempt(HOSTED, "gemini-2.5-flash"), &request())
        .await;

    assert!(matches!(outcome, InvocationOutcome::Success(_)), "{outcome:?}");
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn hosted_inner_retry_stops_at_its_bound() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-2.5-flash:generateContent"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "error": {"code": 503, "message": "The model is overloaded. Please try again later.", "status": "UNAVAILABLE"}
        })))
        .mount(&server)
        .await;

    let invoker = invoker(&server.uri(), Duration::from_secs(5));
    let expected = RetryPolicy {
        base_ms: 1,
        cap_ms: 4,
        max_attempts: 6,
    }
    .attempts_for(&ProviderSpec::hosted(&server.uri()));
    assert_eq!(expected, 6);

    let outcome = invoker
        .invoke(&attempt(HOSTED, "gemini-2.5-flash"), &request())
        .await;

    assert_eq!(outcome.class(), Some(ErrorClass::Overloaded));
    assert_eq!(
        server.received_requests().await.unwrap().len(),
        expected as usize
    );
}

#[tokio::test]
async fn aggregator_makes_one_request_on_overload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("service unavailable"))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = invoker(&server.uri(), Duration::from_secs(5))
        .invoke(&attempt(AGGREGATOR, "google/gemini-2.5-flash"), &request())
        .await;

    assert_eq!(outcome.class(), Some(ErrorClass::Overloaded));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn hosted_does_not_retry_rate_limits() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": {"code": 429, "message": "Resource has been exhausted (e.g. check quota). Please retry in 12.5s.", "status": "RESOURCE_EXHAUSTED"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = invoker(&server.uri(), Duration::from_secs(5))
        .invoke(&attempt(HOSTED, "gemini-2.5-pro"), &request())
        .await;

    match outcome {
        InvocationOutcome::Failure(failure) => {
            assert_eq!(failure.class, ErrorClass::RateLimited);
            assert_eq!(failure.retry_after, Some(13));
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn retry_after_header_wins_over_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "42")
                .set_body_string("Too Many Requests"),
        )
        .mount(&server)
        .await;

    let outcome = invoker(&server.uri(), Duration::from_secs(5))
        .invoke(&attempt(AGGREGATOR, "google/gemini-2.5-flash"), &request())
        .await;

    assert_eq!(outcome.class(), Some(ErrorClass::RateLimited));
    if let InvocationOutcome::Failure(failure) = outcome {
        assert_eq!(failure.retry_after, Some(42));
    }
}

#[tokio::test]
async fn slow_provider_is_classified_as_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(chat_text("{}"))
                .set_delay(Duration::from_millis(800)),
        )
        .mount(&server)
        .await;

    let outcome = invoker(&server.uri(), Duration::from_millis(50))
        .invoke(&attempt(AGGREGATOR, "google/gemini-2.5-flash"), &request())
        .await;

    assert_eq!(outcome.class(), Some(ErrorClass::Timeout));
}

#[tokio::test]
async fn aggregator_error_body_with_ok_status_is_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-aggregator-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": {"message": "Provider returned error: model is unavailable", "code": 502}
        })))
        .mount(&server)
        .await;

    let outcome = invoker(&server.uri(), Duration::from_secs(5))
        .invoke(&attempt(AGGREGATOR, "google/gemini-2.5-flash"), &request())
        .await;

    assert_eq!(outcome.class(), Some(ErrorClass::Overloaded));
}

#[tokio::test]
async fn unparseable_answer_is_structured_output_invalid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(chat_text("I could not find any quotes.")),
        )
        .mount(&server)
        .await;

    let outcome = invoker(&server.uri(), Duration::from_secs(5))
        .invoke(&attempt(AGGREGATOR, "google/gemini-2.5-flash"), &request())
        .await;

    assert_eq!(outcome.class(), Some(ErrorClass::StructuredOutputInvalid));
}

#[tokio::test]
async fn aggregator_plan_falls_back_to_backup_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "google/gemini-2.5-flash"})))
        .respond_with(ResponseTemplate::new(503).set_body_string("service unavailable"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "openai/gpt-4.1-mini"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_text("{\"quotes\": []}")))
        .expect(1)
        .mount(&server)
        .await;

    let invoker = invoker(&server.uri(), Duration::from_secs(5));
    let aggregator = ProviderSpec::aggregator(&server.uri());
    let plan = plan(None, &aggregator).unwrap();
    let orchestrator = Orchestrator::new(invoker);
    let validated = orchestrator
        .run(&plan, &request(), |value| ValidationResult {
            error: None,
            value: value.clone(),
            repairs: Repairs::default(),
        })
        .await
        .unwrap();

    assert_eq!(validated.attempt.model, "openai/gpt-4.1-mini");
    assert_eq!(validated.attempts_used, 2);
    assert_eq!(validated.value, json!({"quotes": []}));
}
