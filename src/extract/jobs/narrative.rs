//! Investment narrative: headline, summary, market-cap bucket and themes.

use super::{JobOutput, ResultMeta, Selection};
use crate::api::ApiError;
use crate::extract::client::{InvocationRequest, Invoke};
use crate::extract::engine::Engine;
use crate::extract::prompts::{narrative_prompt, narrative_schema};
use crate::extract::validate::{
    validate, ArrayRule, EnumRule, ObjectPolicy, ResponsePolicy, TextRule,
};
use crate::util::truncate_str;
use serde::Deserialize;
use serde_json::Value;
use std::sync::OnceLock;
use uuid::Uuid;

pub const CATEGORIES: &[&str] = &[
    "growth",
    "profitability",
    "capital_allocation",
    "competition",
    "regulation",
    "technology",
    "macro",
    "management",
    "other",
];

pub const MARKET_CAP_LABELS: &[&str] = &["mega", "large", "mid", "small", "micro", "unknown"];

pub const DEFAULT_MAX_THEMES: usize = 4;
pub const MAX_THEMES: usize = 8;

/// Document characters sent to the model.
const MAX_DOCUMENT_CHARS: usize = 150_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NarrativeRequest {
    pub document: String,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub max_themes: Option<usize>,
    #[serde(flatten)]
    pub selection: Selection,
}

fn market_cap_rule() -> Result<EnumRule, regex::Error> {
    EnumRule::new("marketCapLabel", MARKET_CAP_LABELS, "unknown")
        .bucket(r"mega|trillion", "mega")?
        .bucket(r"large|big|blue.?chip", "large")?
        .bucket(r"\bmid|medium", "mid")?
        .bucket(r"micro|nano|penny", "micro")?
        .bucket(r"small", "small")
}

fn category_rule() -> Result<EnumRule, regex::Error> {
    EnumRule::new("category", CATEGORIES, "other")
        .bucket(r"capital|buyback|repurchase|dividend|acqui|m&a|debt|balance sheet", "capital_allocation")?
        .bucket(r"margin|profit|cost|efficien|earnings", "profitability")?
        .bucket(r"compet|market share|moat|pricing power", "competition")?
        .bucket(r"regulat|legal|compliance|antitrust|policy", "regulation")?
        .bucket(r"tech|\bai\b|artificial intelligence|software|innovation|r&d|product", "technology")?
        .bucket(r"macro|econom|interest rate|inflation|currenc|\bfx\b|geopolit|tariff", "macro")?
        .bucket(r"management|leadership|\bceo\b|governance|succession", "management")?
        .bucket(r"growth|expan|revenue|demand|sales|volume", "growth")
}

fn base_policy() -> &'static ResponsePolicy {
    static POLICY: OnceLock<ResponsePolicy> = OnceLock::new();
    POLICY.get_or_init(|| ResponsePolicy {
        root: ObjectPolicy {
            required: vec!["headline", "summary"],
            text: vec![
                TextRule::prose("headline", 140, 3),
                TextRule::prose("summary", 1_500, 25),
            ],
            enums: vec![market_cap_rule().expect("market cap buckets compile")],
            page_field: None,
        },
        arrays: vec![ArrayRule {
            field: "themes",
            min: 1,
            max: None,
            items: ObjectPolicy {
                required: vec!["title", "narrative"],
                text: vec![
                    TextRule::prose("title", 90, 2),
                    TextRule::prose("narrative", 1_200, 15),
                ],
                enums: vec![category_rule().expect("category buckets compile")],
                page_field: None,
            },
        }],
        ..ResponsePolicy::default()
    })
}

pub fn narrative_policy() -> ResponsePolicy {
    base_policy().clone()
}

pub(crate) async fn run<I: Invoke>(
    engine: &Engine<I>,
    request: NarrativeRequest,
    correlation_id: Uuid,
) -> Result<JobOutput, ApiError> {
    let settings = engine.settings();
    let limits = &settings.limits;
    let mut budget = limits.budget();
    budget.charge(limits.check_field("document", &request.document)?)?;
    if let Some(company) = &request.company_name {
        budget.charge(limits.check_field("companyName", company)?)?;
    }
    if request.document.trim().is_empty() {
        return Err(ApiError::InvalidRequest("document is empty".to_string()));
    }
    let max_themes = request
        .max_themes
        .unwrap_or(DEFAULT_MAX_THEMES)
        .clamp(1, MAX_THEMES);

    let document = truncate_str(request.document.trim(), MAX_DOCUMENT_CHARS);
    let invocation = InvocationRequest {
        correlation_id,
        ..InvocationRequest::new(
            narrative_prompt(
                document,
                request.company_name.as_deref(),
                max_themes,
                CATEGORIES,
                MARKET_CAP_LABELS,
            ),
            "narrative",
            narrative_schema(CATEGORIES, MARKET_CAP_LABELS),
        )
    };
    let policy = narrative_policy().with_mode(settings.mode);
    let validated = engine
        .extract(&request.selection, &invocation, |value| validate(value, &policy))
        .await?;

    let mut result = validated.value.clone();
    let mut dropped = 0usize;
    if let Some(themes) = result.get_mut("themes").and_then(Value::as_array_mut) {
        dropped = themes.len().saturating_sub(max_themes);
        themes.truncate(max_themes);
    }

    let meta = ResultMeta::from_validated(&validated, correlation_id)
        .with("documentTruncated", document.len() < request.document.trim().len())
        .with("droppedThemes", dropped);
    Ok(JobOutput { result, meta })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn market_cap_labels_bucket() {
        let rule = market_cap_rule().unwrap();
        assert_eq!(rule.coerce("Large-cap"), "large");
        assert_eq!(rule.coerce("mid cap"), "mid");
        assert_eq!(rule.coerce("micro-cap"), "micro");
        assert_eq!(rule.coerce("small cap"), "small");
        assert_eq!(rule.coerce("$3 trillion"), "mega");
        assert_eq!(rule.coerce("n/a"), "unknown");
    }

    #[test]
    fn categories_bucket_with_catch_all() {
        let rule = category_rule().unwrap();
        assert_eq!(rule.coerce("Capital Allocation"), "capital_allocation");
        assert_eq!(rule.coerce("Share buybacks"), "capital_allocation");
        assert_eq!(rule.coerce("Margin expansion"), "profitability");
        assert_eq!(rule.coerce("AI roadmap"), "technology");
        assert_eq!(rule.coerce("Revenue growth"), "growth");
        assert_eq!(rule.coerce("Weather"), "other");
    }

    #[test]
    fn policy_repairs_enums_and_counts() {
        let raw = json!({
            "headline": "Cloud demand keeps compounding",
            "summary": "Revenue grew on cloud demand.",
            "marketCapLabel": "Mega cap",
            "themes": [
                {"title": "AI capex", "category": "Tech", "narrative": "Spending continues."},
                {"title": "Returns", "category": "dividends", "narrative": "Payout raised."}
            ]
        });
        let result = validate(&raw, &narrative_policy());
        assert!(result.is_valid(), "{:?}", result.error);
        assert_eq!(result.value["marketCapLabel"], "mega");
        assert_eq!(result.value["themes"][0]["category"], "technology");
        assert_eq!(result.value["themes"][1]["category"], "capital_allocation");
        assert_eq!(result.repairs.coerced_enum_count, 3);
    }

    #[test]
    fn strict_mode_flags_thin_summary() {
        let raw = json!({
            "headline": "Cloud demand keeps compounding",
            "summary": "Revenue grew.",
            "marketCapLabel": "large",
            "themes": [{"title": "AI capex", "category": "technology", "narrative": "Spending continues."}]
        });
        let policy = narrative_policy().with_mode(crate::extract::validate::ValidationMode::Strict);
        assert!(validate(&raw, &policy).error.unwrap().contains("summary"));
    }
}
