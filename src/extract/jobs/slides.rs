//! Slide insights from investor-deck page images, optionally one chunk of
//! a longer deck at a time.

use super::{JobOutput, ResultMeta, Selection};
use crate::api::ApiError;
use crate::extract::client::{ContentPart, InvocationRequest, Invoke};
use crate::extract::engine::Engine;
use crate::extract::prompts::{slides_prompt, slides_schema};
use crate::extract::rank::{select, Candidate, QualityScorer, SelectOptions};
use crate::extract::shaping::{ChunkRange, PageMapping};
use crate::extract::validate::{validate, ArrayRule, ObjectPolicy, ResponsePolicy, TextRule};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

pub const DEFAULT_MAX_SLIDES: usize = 5;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageImage {
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    /// Base64-encoded image bytes.
    pub data: String,
}

fn default_mime_type() -> String {
    "image/png".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlidesRequest {
    pub pages: Vec<PageImage>,
    /// Absolute pages covered by `pages` when the deck is processed in chunks.
    #[serde(default)]
    pub chunk: Option<ChunkRange>,
    #[serde(default)]
    pub max_slides: Option<usize>,
    #[serde(flatten)]
    pub selection: Selection,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlideInsight {
    selected_page_number: u32,
    headline: String,
    insight: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Slide {
    /// Chunk-local page.
    pub selected_page_number: u32,
    pub absolute_page_number: u32,
    pub headline: String,
    pub insight: String,
}

impl Candidate for SlideInsight {
    fn id(&self) -> String {
        self.selected_page_number.to_string()
    }

    fn text(&self) -> String {
        format!("{} {}", self.headline, self.insight)
    }

    fn order_key(&self) -> i64 {
        i64::from(self.selected_page_number)
    }
}

pub fn slides_policy(pages: PageMapping) -> ResponsePolicy {
    ResponsePolicy {
        arrays: vec![ArrayRule {
            field: "slides",
            min: 1,
            max: None,
            items: ObjectPolicy {
                required: vec!["headline", "insight"],
                text: vec![
                    TextRule::prose("headline", 140, 3),
                    TextRule::prose("insight", 900, 12),
                ],
                page_field: Some("selectedPageNumber"),
                ..ObjectPolicy::default()
            },
        }],
        ..ResponsePolicy::default()
    }
    .with_pages(pages)
}

fn decode_pages(pages: &[PageImage]) -> Result<Vec<ContentPart>, ApiError> {
    let mut parts = Vec::with_capacity(pages.len() * 2);
    for (idx, page) in pages.iter().enumerate() {
        let mime_type = page.mime_type.trim().to_lowercase();
        if !(mime_type.starts_with("image/") || mime_type == "application/pdf") {
            return Err(ApiError::InvalidRequest(format!(
                "page {} has unsupported type `{}`",
                idx + 1,
                page.mime_type
            )));
        }
        let data = BASE64_STANDARD.decode(page.data.trim()).map_err(|e| {
            ApiError::InvalidRequest(format!("page {} is not valid base64: {e}", idx + 1))
        })?;
        if data.is_empty() {
            return Err(ApiError::InvalidRequest(format!("page {} is empty", idx + 1)));
        }
        parts.push(ContentPart::Text(format!("Page {}:", idx + 1)));
        parts.push(ContentPart::Inline { mime_type, data });
    }
    Ok(parts)
}

pub(crate) async fn run<I: Invoke>(
    engine: &Engine<I>,
    request: SlidesRequest,
    correlation_id: Uuid,
) -> Result<JobOutput, ApiError> {
    let settings = engine.settings();
    let limits = &settings.limits;
    if request.pages.is_empty() {
        return Err(ApiError::InvalidRequest("at least one page is required".to_string()));
    }
    limits.check_items(request.pages.len())?;
    let mut budget = limits.budget();
    for page in &request.pages {
        budget.charge(page.data.len())?;
    }

    let page_count = u32::try_from(request.pages.len())
        .map_err(|_| ApiError::InvalidRequest("too many pages".to_string()))?;
    let mapping = PageMapping::new(page_count, request.chunk)?;
    let parts = decode_pages(&request.pages)?;
    let max_slides = request
        .max_slides
        .unwrap_or(DEFAULT_MAX_SLIDES)
        .clamp(1, page_count as usize);

    let invocation = InvocationRequest {
        correlation_id,
        ..InvocationRequest::new(slides_prompt(&mapping, max_slides), "slides", slides_schema())
    }
    .with_parts(parts);
    let policy = slides_policy(mapping).with_mode(settings.mode);
    let validated = engine
        .extract(&request.selection, &invocation, |value| validate(value, &policy))
        .await?;

    let insights: Vec<SlideInsight> = serde_json::from_value(validated.value["slides"].clone())
        .map_err(|e| ApiError::Internal(format!("validated slides did not decode: {e}")))?;
    let candidate_count = insights.len();
    let slides: Vec<Slide> = select(
        insights,
        &SelectOptions {
            max_count: max_slides,
            similarity_threshold: 0.6,
            backfill: true,
        },
        &QualityScorer::default(),
    )
    .into_iter()
    .map(|s| Slide {
        absolute_page_number: mapping.to_absolute(s.selected_page_number),
        selected_page_number: s.selected_page_number,
        headline: s.headline,
        insight: s.insight,
    })
    .collect();

    if validated.repairs.normalized_page_count > 0 {
        tracing::info!(
            %correlation_id,
            normalized = validated.repairs.normalized_page_count,
            "remapped absolute page numbers to chunk-local"
        );
    }

    let meta = ResultMeta::from_validated(&validated, correlation_id)
        .with("normalizedPageCount", validated.repairs.normalized_page_count)
        .with("pageCount", page_count)
        .with("candidateCount", candidate_count)
        .with(
            "chunk",
            request
                .chunk
                .map(|c| json!({ "start": c.start, "end": c.end }))
                .unwrap_or_default(),
        );
    Ok(JobOutput {
        result: json!({ "slides": slides }),
        meta,
    })
}
