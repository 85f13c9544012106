//! Keyword quotes from earnings-call transcripts.

use super::{JobOutput, ResultMeta, Selection};
use crate::api::ApiError;
use crate::extract::client::{InvocationRequest, Invoke};
use crate::extract::engine::Engine;
use crate::extract::prompts::{quotes_prompt, quotes_schema};
use crate::extract::rank::{select, Candidate, QualityScorer, SelectOptions};
use crate::extract::shaping::shape_transcript;
use crate::extract::validate::{validate, ArrayRule, ObjectPolicy, ResponsePolicy, TextRule};
use crate::util::{collapse_whitespace, truncate_str};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

pub const DEFAULT_MAX_QUOTES: usize = 8;
pub const MAX_QUOTES: usize = 25;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotesRequest {
    pub transcript: String,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub max_quotes: Option<usize>,
    #[serde(flatten)]
    pub selection: Selection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub quote: String,
    #[serde(default)]
    pub speaker: String,
    pub keyword: String,
    #[serde(default)]
    pub context: String,
}

struct QuoteCandidate {
    quote: Quote,
    /// Byte offset of the quote in the transcript, when it can be found.
    position: i64,
}

impl Candidate for QuoteCandidate {
    fn id(&self) -> String {
        collapse_whitespace(&self.quote.quote).to_lowercase()
    }

    fn text(&self) -> String {
        format!("{} {}", self.quote.quote, self.quote.context)
    }

    fn order_key(&self) -> i64 {
        self.position
    }
}

pub fn quotes_policy() -> ResponsePolicy {
    ResponsePolicy {
        arrays: vec![ArrayRule {
            field: "quotes",
            min: 0,
            max: None,
            items: ObjectPolicy {
                required: vec!["quote", "keyword"],
                text: vec![
                    TextRule::new("quote").max_chars(1_200),
                    TextRule::new("speaker").max_chars(120),
                    TextRule::new("keyword"),
                    TextRule::prose("context", 400, 6),
                ],
                ..ObjectPolicy::default()
            },
        }],
        ..ResponsePolicy::default()
    }
}

/// Locate a quote in the transcript by its opening words.
fn locate(transcript_lower: &str, quote: &str) -> i64 {
    let probe = truncate_str(quote.trim(), 60).to_lowercase();
    if probe.is_empty() {
        return i64::MAX;
    }
    transcript_lower
        .find(&probe)
        .map(|pos| pos as i64)
        .unwrap_or(i64::MAX)
}

pub(crate) async fn run<I: Invoke>(
    engine: &Engine<I>,
    request: QuotesRequest,
    correlation_id: Uuid,
) -> Result<JobOutput, ApiError> {
    let settings = engine.settings();
    let limits = &settings.limits;
    let mut budget = limits.budget();
    budget.charge(limits.check_field("transcript", &request.transcript)?)?;
    limits.check_items(request.keywords.len())?;

    let keywords: Vec<String> = request
        .keywords
        .iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();
    if keywords.is_empty() {
        return Err(ApiError::InvalidRequest(
            "at least one non-empty keyword is required".to_string(),
        ));
    }
    for keyword in &keywords {
        budget.charge(limits.check_field("keywords", keyword)?)?;
    }
    let max_quotes = request
        .max_quotes
        .unwrap_or(DEFAULT_MAX_QUOTES)
        .clamp(1, MAX_QUOTES);

    let shaped = shape_transcript(&request.transcript, &keywords, &settings.window)?;
    tracing::info!(
        %correlation_id,
        transcript_len = request.transcript.len(),
        body_len = shaped.body.len(),
        mode = ?shaped.mode,
        "transcript shaped"
    );

    let invocation = InvocationRequest {
        correlation_id,
        ..InvocationRequest::new(
            quotes_prompt(&shaped, &keywords, max_quotes),
            "quotes",
            quotes_schema(),
        )
    };
    let policy = quotes_policy().with_mode(settings.mode);
    let validated = engine
        .extract(&request.selection, &invocation, |value| validate(value, &policy))
        .await?;

    let quotes: Vec<Quote> = serde_json::from_value(validated.value["quotes"].clone())
        .map_err(|e| ApiError::Internal(format!("validated quotes did not decode: {e}")))?;
    let candidate_count = quotes.len();
    let transcript_lower = request.transcript.to_lowercase();
    let candidates = quotes
        .into_iter()
        .map(|quote| QuoteCandidate {
            position: locate(&transcript_lower, &quote.quote),
            quote,
        })
        .collect();
    let selected: Vec<Quote> = select(
        candidates,
        &SelectOptions {
            max_count: max_quotes,
            similarity_threshold: 0.6,
            backfill: false,
        },
        &QualityScorer::default(),
    )
    .into_iter()
    .map(|c| c.quote)
    .collect();

    let meta = ResultMeta::from_validated(&validated, correlation_id)
        .with("shaping", serde_json::to_value(&shaped.mode).unwrap_or_default())
        .with("candidateCount", candidate_count);
    Ok(JobOutput {
        result: json!({ "quotes": selected }),
        meta,
    })
}
