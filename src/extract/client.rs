//! Invocation engine: one provider call per plan element, with the
//! provider-level retry loop nested inside it.

use super::errors::{parse_retry_after, ErrorClass, ErrorClassifier};
use super::models::{ProviderSpec, Topology, Usage, WireFormat};
use super::planner::Attempt;
use crate::util::truncate_str;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use uuid::Uuid;

/// Maximum length for error content in error messages
const MAX_ERROR_CONTENT_LEN: usize = 200;

/// Sanitize API response content for error messages to prevent credential leakage.
pub(crate) fn sanitize_api_response(content: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "api_key",
        "apikey",
        "api key",
        "secret",
        "password",
        "credential",
        "bearer",
        "sk-",
        "aiza", // Google API key prefix
    ];

    let truncated = truncate_str(content, MAX_ERROR_CONTENT_LEN);

    let lower = truncated.to_lowercase();
    for pattern in SECRET_PATTERNS {
        if lower.contains(pattern) {
            return "(response details redacted - may contain sensitive data)".to_string();
        }
    }

    truncated.to_string()
}

// ═══════════════════════════════════════════════════════════════════════════
//  REQUEST / OUTCOME
// ═══════════════════════════════════════════════════════════════════════════

/// A piece of request content besides the prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    Inline { mime_type: String, data: Vec<u8> },
}

/// Everything needed to issue one structured-extraction call.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub prompt: String,
    pub parts: Vec<ContentPart>,
    pub schema_name: String,
    pub schema: Value,
    pub max_output_tokens: u32,
    /// Correlates log lines across retries and provider switches.
    pub correlation_id: Uuid,
}

impl InvocationRequest {
    pub fn new(prompt: impl Into<String>, schema_name: &str, schema: Value) -> Self {
        Self {
            prompt: prompt.into(),
            parts: Vec::new(),
            schema_name: schema_name.to_string(),
            schema,
            max_output_tokens: 8_192,
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn with_parts(mut self, parts: Vec<ContentPart>) -> Self {
        self.parts = parts;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvocationSuccess {
    pub value: Value,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvocationFailure {
    pub class: ErrorClass,
    pub message: String,
    /// Seconds the provider asked us to wait, when it said so.
    pub retry_after: Option<u64>,
}

/// Either a parsed JSON value or a classified failure. Never both.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    Success(InvocationSuccess),
    Failure(InvocationFailure),
}

impl InvocationOutcome {
    pub fn failure(class: ErrorClass, message: impl Into<String>) -> Self {
        InvocationOutcome::Failure(InvocationFailure {
            class,
            message: message.into(),
            retry_after: None,
        })
    }

    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            InvocationOutcome::Success(_) => None,
            InvocationOutcome::Failure(f) => Some(f.class),
        }
    }
}

/// Seam between the orchestrator and the network.
pub trait Invoke {
    fn invoke(
        &self,
        attempt: &Attempt,
        request: &InvocationRequest,
    ) -> impl Future<Output = InvocationOutcome> + Send;
}

// ═══════════════════════════════════════════════════════════════════════════
//  RETRY POLICY
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    /// Upper bound on inner attempts, regardless of the provider's own setting.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 16_000,
            max_attempts: 6,
        }
    }
}

impl RetryPolicy {
    /// Deterministic part of the delay before retry number `attempt` (1-based).
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(32);
        self.base_ms
            .saturating_mul(1u64 << exp)
            .min(self.cap_ms)
    }

    /// Base delay plus up to a third of it as random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms(attempt);
        let jitter = if base >= 3 {
            rand::thread_rng().gen_range(0..=base / 3)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }

    pub fn attempts_for(&self, provider: &ProviderSpec) -> u32 {
        provider.max_attempts.clamp(1, self.max_attempts.max(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  STRUCTURED CONTENT SALVAGE
// ═══════════════════════════════════════════════════════════════════════════

fn push_unique_candidate(candidates: &mut Vec<String>, candidate: impl Into<String>) {
    let candidate = candidate.into();
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return;
    }
    if !candidates.iter().any(|existing| existing == trimmed) {
        candidates.push(trimmed.to_string());
    }
}

pub(crate) fn strip_markdown_fences(content: &str) -> Option<String> {
    let trimmed = content.trim();
    let without_open = trimmed.strip_prefix("```")?;
    let after_header = match without_open.find('\n') {
        Some(newline_idx) => &without_open[newline_idx + 1..],
        None => without_open,
    };
    let end_idx = after_header.rfind("```")?;
    Some(after_header[..end_idx].trim().to_string())
}

fn unwrap_outer_wrapper(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.len() < 3 {
        return None;
    }
    let inner = if trimmed.starts_with('{') && trimmed.ends_with('}') {
        &trimmed[1..trimmed.len() - 1]
    } else {
        return None;
    };
    let inner_trimmed = inner.trim_start();
    (inner_trimmed.starts_with('{') || inner_trimmed.starts_with('['))
        .then(|| inner.trim().to_string())
}

fn extract_balanced_json_from(content: &str, start: usize) -> Option<String> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in content[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(ch) {
                    return None;
                }
                if stack.is_empty() {
                    let end = start + offset + ch.len_utf8();
                    return Some(content[start..end].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn extract_json_candidates(content: &str, max_candidates: usize) -> Vec<String> {
    let mut out = Vec::new();
    for (idx, ch) in content.char_indices() {
        if out.len() >= max_candidates {
            break;
        }
        if ch == '{' || ch == '[' {
            if let Some(candidate) = extract_balanced_json_from(content, idx) {
                push_unique_candidate(&mut out, candidate);
            }
        }
    }
    out
}

/// Decode a model's text answer into JSON, tolerating markdown fences,
/// leading chatter and a doubled outer object.
pub fn parse_structured_content(content: &str) -> Result<Value, String> {
    let mut candidates = Vec::new();
    push_unique_candidate(&mut candidates, content);
    if let Some(stripped) = strip_markdown_fences(content) {
        push_unique_candidate(&mut candidates, stripped);
    }

    let mut idx = 0usize;
    while idx < candidates.len() && idx < 8 {
        let current = candidates[idx].clone();
        for extracted in extract_json_candidates(&current, 4) {
            push_unique_candidate(&mut candidates, extracted);
        }
        if let Some(unwrapped) = unwrap_outer_wrapper(&current) {
            push_unique_candidate(&mut candidates, unwrapped);
        }
        idx += 1;
    }

    let mut last_err: Option<String> = None;
    for candidate in candidates {
        match serde_json::from_str::<Value>(&candidate) {
            Ok(value) if value.is_object() || value.is_array() => return Ok(value),
            Ok(_) => last_err = Some("top-level value is not an object".to_string()),
            Err(err) => last_err = Some(err.to_string()),
        }
    }

    Err(format!(
        "Unable to parse JSON from model output: {}. Content: {}",
        last_err.unwrap_or_else(|| "empty response".to_string()),
        sanitize_api_response(content)
    ))
}

// ═══════════════════════════════════════════════════════════════════════════
//  WIRE FORMATS
// ═══════════════════════════════════════════════════════════════════════════

fn generate_content_body(request: &InvocationRequest) -> Value {
    let mut parts = vec![json!({ "text": request.prompt })];
    for part in &request.parts {
        parts.push(match part {
            ContentPart::Text(text) => json!({ "text": text }),
            ContentPart::Inline { mime_type, data } => json!({
                "inline_data": {
                    "mime_type": mime_type,
                    "data": BASE64_STANDARD.encode(data),
                }
            }),
        });
    }
    json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": {
            "responseMimeType": "application/json",
            "responseJsonSchema": request.schema,
            "maxOutputTokens": request.max_output_tokens,
            "temperature": 0.2,
        }
    })
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    stream: bool,
    response_format: ResponseFormat<'a>,
    provider: ProviderRouting,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Vec<ChatContentPart>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChatContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    format_type: &'static str,
    json_schema: JsonSchemaWrapper<'a>,
}

#[derive(Serialize)]
struct JsonSchemaWrapper<'a> {
    name: &'a str,
    strict: bool,
    schema: &'a Value,
}

/// Aggregator routing preferences: only route to upstreams that honour the
/// structured-output parameters.
#[derive(Serialize)]
struct ProviderRouting {
    require_parameters: bool,
    allow_fallbacks: bool,
}

fn chat_completions_body<'a>(model: &'a str, request: &'a InvocationRequest) -> ChatRequest<'a> {
    let mut content = vec![ChatContentPart::Text {
        text: request.prompt.clone(),
    }];
    for part in &request.parts {
        content.push(match part {
            ContentPart::Text(text) => ChatContentPart::Text { text: text.clone() },
            ContentPart::Inline { mime_type, data } => ChatContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{};base64,{}", mime_type, BASE64_STANDARD.encode(data)),
                },
            },
        });
    }
    ChatRequest {
        model,
        messages: vec![ChatMessage {
            role: "user",
            content,
        }],
        max_tokens: request.max_output_tokens,
        stream: false,
        response_format: ResponseFormat {
            format_type: "json_schema",
            json_schema: JsonSchemaWrapper {
                name: &request.schema_name,
                strict: true,
                schema: &request.schema,
            },
        },
        provider: ProviderRouting {
            require_parameters: true,
            allow_fallbacks: true,
        },
    }
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<GenerateCandidate>,
    #[serde(default, rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default, rename = "promptFeedback")]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
struct GenerateCandidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default, rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct UsageMetadata {
    #[serde(default, rename = "promptTokenCount")]
    prompt_token_count: u32,
    #[serde(default, rename = "candidatesTokenCount")]
    candidates_token_count: u32,
    #[serde(default, rename = "totalTokenCount")]
    total_token_count: u32,
}

#[derive(Deserialize)]
struct PromptFeedback {
    #[serde(default, rename = "blockReason")]
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    /// Content can be null in some API responses (e.g., when refusal or error occurs)
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

/// Error body shared by both dialects (`{"error": {...}}`), which the
/// aggregator may also send with a 200 status.
#[derive(Deserialize)]
struct UpstreamErrorBody {
    error: UpstreamError,
}

#[derive(Deserialize)]
struct UpstreamError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    details: Option<Value>,
}

impl UpstreamError {
    fn numeric_code(&self) -> Option<u16> {
        self.code
            .as_ref()
            .and_then(Value::as_u64)
            .and_then(|c| u16::try_from(c).ok())
    }

    fn describe(&self) -> String {
        let mut text = self.message.clone();
        if let Some(status) = &self.status {
            text.push_str(&format!(" ({status})"));
        }
        if let Some(details) = &self.details {
            // Retry hints ride along in the details array.
            text.push(' ');
            text.push_str(&details.to_string());
        }
        text
    }
}

/// Raw text and usage pulled from a successful body.
struct ExtractedAnswer {
    text: String,
    usage: Option<Usage>,
}

fn extract_answer(
    wire: WireFormat,
    body: &str,
    classifier: &ErrorClassifier,
) -> Result<ExtractedAnswer, InvocationFailure> {
    let fail = |class: ErrorClass, message: String| InvocationFailure {
        class,
        message,
        retry_after: None,
    };

    match wire {
        WireFormat::GenerateContent => {
            let parsed: GenerateContentResponse = serde_json::from_str(body).map_err(|e| {
                fail(
                    ErrorClass::StructuredOutputInvalid,
                    format!(
                        "Unable to parse JSON envelope from provider: {}. {}",
                        e,
                        sanitize_api_response(body)
                    ),
                )
            })?;
            if let Some(reason) = parsed.prompt_feedback.and_then(|f| f.block_reason) {
                return Err(fail(
                    ErrorClass::Unknown,
                    format!("Prompt was blocked by the provider: {reason}"),
                ));
            }
            let candidate = parsed.candidates.into_iter().next();
            let finish_reason = candidate.as_ref().and_then(|c| c.finish_reason.clone());
            let text: String = candidate
                .and_then(|c| c.content)
                .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
                .unwrap_or_default();
            if text.trim().is_empty() {
                return Err(fail(
                    ErrorClass::StructuredOutputInvalid,
                    format!(
                        "Model returned an empty response (finish reason: {})",
                        finish_reason.as_deref().unwrap_or("none")
                    ),
                ));
            }
            let usage = parsed.usage_metadata.map(|u| Usage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
                total_tokens: u.total_token_count,
            });
            Ok(ExtractedAnswer { text, usage })
        }
        WireFormat::ChatCompletions => {
            if let Ok(err_body) = serde_json::from_str::<UpstreamErrorBody>(body) {
                let message = err_body.error.describe();
                return Err(InvocationFailure {
                    class: classifier.classify(&message, err_body.error.numeric_code()),
                    retry_after: parse_retry_after(&message),
                    message,
                });
            }
            let parsed: ChatResponse = serde_json::from_str(body).map_err(|e| {
                fail(
                    ErrorClass::StructuredOutputInvalid,
                    format!(
                        "Unable to parse JSON envelope from provider: {}. {}",
                        e,
                        sanitize_api_response(body)
                    ),
                )
            })?;
            let choice = parsed.choices.into_iter().next();
            if let Some(refusal) = choice.as_ref().and_then(|c| c.message.refusal.clone()) {
                return Err(fail(
                    ErrorClass::Unknown,
                    format!("Request was refused: {}", truncate_str(&refusal, 200)),
                ));
            }
            let text = choice.and_then(|c| c.message.content).unwrap_or_default();
            if text.trim().is_empty() {
                return Err(fail(
                    ErrorClass::StructuredOutputInvalid,
                    "Model returned an empty response".to_string(),
                ));
            }
            Ok(ExtractedAnswer {
                text,
                usage: parsed.usage,
            })
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  HTTP INVOKER
// ═══════════════════════════════════════════════════════════════════════════

/// Create a configured HTTP client for provider requests
pub fn create_http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("ledgerlens/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))
}

/// Production [`Invoke`] implementation speaking both wire formats.
#[derive(Clone)]
pub struct HttpInvoker {
    client: reqwest::Client,
    topology: Arc<Topology>,
    credentials: Arc<HashMap<String, String>>,
    call_timeout: Duration,
    retry: RetryPolicy,
    classifier: ErrorClassifier,
}

impl HttpInvoker {
    pub fn new(
        client: reqwest::Client,
        topology: Arc<Topology>,
        credentials: HashMap<String, String>,
        call_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            topology,
            credentials: Arc::new(credentials),
            call_timeout,
            retry,
            classifier: ErrorClassifier::default(),
        }
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn has_credential(&self, provider: &str) -> bool {
        self.credentials
            .get(provider)
            .is_some_and(|key| !key.trim().is_empty())
    }

    async fn call_once(
        &self,
        spec: &ProviderSpec,
        model: &str,
        request: &InvocationRequest,
    ) -> InvocationOutcome {
        let url = spec.endpoint_for(model);
        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        let key = self.credentials.get(&spec.id).map(String::as_str).unwrap_or("");
        builder = match spec.wire {
            WireFormat::GenerateContent => builder
                .header("x-goog-api-key", key)
                .json(&generate_content_body(request)),
            WireFormat::ChatCompletions => builder
                .header("Authorization", format!("Bearer {}", key))
                .header("X-Title", "ledgerlens")
                .json(&chat_completions_body(model, request)),
        };

        let exchange = async {
            let response = builder.send().await?;
            let status = response.status();
            let retry_header = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, retry_header, text))
        };

        let (status, retry_header, text) = match timeout(self.call_timeout, exchange).await {
            Err(_) => {
                return InvocationOutcome::failure(
                    ErrorClass::Timeout,
                    format!("Request timed out after {}ms", self.call_timeout.as_millis()),
                )
            }
            Ok(Err(err)) => return self.network_failure(err),
            Ok(Ok(parts)) => parts,
        };

        if !status.is_success() {
            let message = match serde_json::from_str::<UpstreamErrorBody>(&text) {
                Ok(body) => body.error.describe(),
                Err(_) => format!("HTTP {}: {}", status.as_u16(), sanitize_api_response(&text)),
            };
            return InvocationOutcome::Failure(InvocationFailure {
                class: self.classifier.classify(&message, Some(status.as_u16())),
                retry_after: retry_header.or_else(|| parse_retry_after(&message)),
                message: sanitize_api_response(&message),
            });
        }

        let answer = match extract_answer(spec.wire, &text, &self.classifier) {
            Ok(answer) => answer,
            Err(failure) => return InvocationOutcome::Failure(failure),
        };

        match parse_structured_content(&answer.text) {
            Ok(value) => InvocationOutcome::Success(InvocationSuccess {
                value,
                usage: answer.usage,
            }),
            Err(message) => InvocationOutcome::failure(ErrorClass::StructuredOutputInvalid, message),
        }
    }

    fn network_failure(&self, err: reqwest::Error) -> InvocationOutcome {
        if err.is_timeout() {
            InvocationOutcome::failure(ErrorClass::Timeout, "Provider request timed out")
        } else if err.is_connect() {
            InvocationOutcome::failure(
                ErrorClass::TransientUpstream,
                "Could not connect to provider",
            )
        } else {
            let message = err.to_string();
            InvocationOutcome::failure(self.classifier.classify(&message, None), message)
        }
    }
}

impl Invoke for HttpInvoker {
    async fn invoke(&self, attempt: &Attempt, request: &InvocationRequest) -> InvocationOutcome {
        let Some(spec) = self.topology.provider(&attempt.provider) else {
            return InvocationOutcome::failure(
                ErrorClass::Unknown,
                format!("Provider `{}` is not configured", attempt.provider),
            );
        };

        let max_attempts = self.retry.attempts_for(spec);
        let mut inner = 1u32;
        loop {
            let started = Instant::now();
            let outcome = self.call_once(spec, &attempt.model, request).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let failure = match &outcome {
                InvocationOutcome::Success(_) => {
                    tracing::info!(
                        correlation_id = %request.correlation_id,
                        provider = %spec.id,
                        model = %attempt.model,
                        attempt = inner,
                        max_attempts,
                        elapsed_ms,
                        "provider call succeeded"
                    );
                    return outcome;
                }
                InvocationOutcome::Failure(failure) => failure,
            };

            let retryable = spec.retry_on.contains(&failure.class) && inner < max_attempts;
            let wait = retryable.then(|| self.retry.delay(inner));
            tracing::warn!(
                correlation_id = %request.correlation_id,
                provider = %spec.id,
                model = %attempt.model,
                attempt = inner,
                max_attempts,
                reason = failure.class.as_str(),
                wait_ms = wait.map(|w| w.as_millis() as u64).unwrap_or(0),
                elapsed_ms,
                error = %truncate_str(&failure.message, 160),
                "provider call failed"
            );

            match wait {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    inner += 1;
                }
                None => return outcome,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_structured_content_handles_markdown_fences() {
        let fenced = "```json\n{\"quotes\": []}\n```";
        assert_eq!(parse_structured_content(fenced).unwrap(), json!({"quotes": []}));
    }

    #[test]
    fn parse_structured_content_handles_extra_wrapper_braces() {
        let malformed = "{\n {\"headline\":\"hello\"}\n}";
        assert_eq!(
            parse_structured_content(malformed).unwrap(),
            json!({"headline": "hello"})
        );
    }

    #[test]
    fn parse_structured_content_skips_leading_chatter() {
        let chatty = "Sure! Here is the JSON you asked for: {\"slides\": [{\"n\": 1}]} Hope it helps.";
        assert_eq!(
            parse_structured_content(chatty).unwrap(),
            json!({"slides": [{"n": 1}]})
        );
    }

    #[test]
    fn parse_failures_are_tagged_for_the_classifier() {
        let err = parse_structured_content("not json at all").unwrap_err();
        assert_eq!(
            crate::extract::errors::classify(&err, None),
            ErrorClass::StructuredOutputInvalid
        );
    }

    #[test]
    fn sanitize_redacts_key_like_content() {
        assert!(sanitize_api_response("invalid api key AIzaSyXXXX").contains("redacted"));
        assert_eq!(sanitize_api_response("plain failure"), "plain failure");
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            base_ms: 500,
            cap_ms: 4_000,
            max_attempts: 6,
        };
        assert_eq!(policy.base_delay_ms(1), 500);
        assert_eq!(policy.base_delay_ms(2), 1_000);
        assert_eq!(policy.base_delay_ms(3), 2_000);
        assert_eq!(policy.base_delay_ms(4), 4_000);
        assert_eq!(policy.base_delay_ms(9), 4_000);
        for attempt in 1..6 {
            let base = policy.base_delay_ms(attempt);
            let delay = policy.delay(attempt).as_millis() as u64;
            assert!(delay >= base && delay <= base + base / 3);
        }
    }

    #[test]
    fn attempts_respect_provider_and_policy_caps() {
        let policy = RetryPolicy::default();
        let hosted = ProviderSpec::hosted("https://x.test");
        let aggregator = ProviderSpec::aggregator("https://y.test");
        assert_eq!(policy.attempts_for(&hosted), 6);
        assert_eq!(policy.attempts_for(&aggregator), 1);
        let tight = RetryPolicy {
            max_attempts: 2,
            ..policy
        };
        assert_eq!(tight.attempts_for(&hosted), 2);
    }

    #[test]
    fn generate_content_body_inlines_attachments() {
        let request = InvocationRequest::new("describe", "slides", json!({"type": "object"}))
            .with_parts(vec![ContentPart::Inline {
                mime_type: "image/png".to_string(),
                data: vec![1, 2, 3],
            }]);
        let body = generate_content_body(&request);
        assert_eq!(body["contents"][0]["parts"][0]["text"], "describe");
        assert_eq!(body["contents"][0]["parts"][1]["inline_data"]["data"], "AQID");
        assert_eq!(
            body["generationConfig"]["responseMimeType"],
            "application/json"
        );
    }

    #[test]
    fn chat_body_uses_data_urls_and_strict_schema() {
        let request = InvocationRequest::new("describe", "slides", json!({"type": "object"}))
            .with_parts(vec![ContentPart::Inline {
                mime_type: "image/jpeg".to_string(),
                data: vec![1, 2, 3],
            }]);
        let body = serde_json::to_value(chat_completions_body("m", &request)).unwrap();
        assert_eq!(body["messages"][0]["content"][0]["type"], "text");
        assert_eq!(
            body["messages"][0]["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,AQID"
        );
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
        assert_eq!(body["provider"]["require_parameters"], true);
    }

    #[test]
    fn aggregator_error_with_ok_status_is_classified() {
        let body = r#"{"error": {"message": "Rate limit exceeded, retry in 4s", "code": 429}}"#;
        let failure = match extract_answer(WireFormat::ChatCompletions, body, &ErrorClassifier::default()) {
            Err(f) => f,
            Ok(_) => panic!("expected failure"),
        };
        assert_eq!(failure.class, ErrorClass::RateLimited);
        assert_eq!(failure.retry_after, Some(4));
    }

    #[test]
    fn empty_generate_content_answer_is_structured_output_invalid() {
        let body = r#"{"candidates": [{"content": {"parts": [{"text": "  "}]}, "finishReason": "MAX_TOKENS"}]}"#;
        let failure = match extract_answer(WireFormat::GenerateContent, body, &ErrorClassifier::default()) {
            Err(f) => f,
            Ok(_) => panic!("expected failure"),
        };
        assert_eq!(failure.class, ErrorClass::StructuredOutputInvalid);
        assert!(failure.message.contains("MAX_TOKENS"));
    }
}
