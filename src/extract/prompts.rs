use super::shaping::{PageMapping, ShapedTranscript};
use serde_json::{json, Value};

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED BUILDING BLOCKS
// ═══════════════════════════════════════════════════════════════════════════════

const ANALYST_VOICE: &str = r#"You are a senior equity analyst preparing material for an investor newsletter.
Write plainly. No hype, no hedging filler, no "Overall," or "In summary," openers."#;

const JSON_ONLY: &str = "Respond with a single JSON object matching the schema. No markdown, no commentary.";

// ═══════════════════════════════════════════════════════════════════════════════
// QUOTES
// ═══════════════════════════════════════════════════════════════════════════════

const QUOTES_RULES: &str = r#"TASK: Pull verbatim quotes from the earnings call transcript below.

Rules:
- Copy each `quote` exactly as spoken; do not paraphrase or stitch sentences from different speakers.
- `keyword` must be the keyword from the list that the quote is about.
- `speaker` is the name (and title when given) of the person speaking.
- `context` is one sentence on why the quote matters.
- Prefer forward-looking statements, guidance changes and strategy over routine recaps."#;

pub fn quotes_prompt(shaped: &ShapedTranscript, keywords: &[String], max_quotes: usize) -> String {
    let mut prompt = format!(
        "{ANALYST_VOICE}\n\n{QUOTES_RULES}\n- Return at most {max_quotes} quotes.\n\nKEYWORDS: {}\n",
        keywords.join(", ")
    );
    if let Some(note) = shaped.prompt_note() {
        prompt.push('\n');
        prompt.push_str(note);
        prompt.push('\n');
    }
    prompt.push_str("\nTRANSCRIPT:\n");
    prompt.push_str(&shaped.body);
    prompt.push_str("\n\n");
    prompt.push_str(JSON_ONLY);
    prompt
}

pub fn quotes_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "quotes": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "quote": { "type": "string" },
                        "speaker": { "type": "string" },
                        "keyword": { "type": "string" },
                        "context": { "type": "string" }
                    },
                    "required": ["quote", "speaker", "keyword", "context"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["quotes"],
        "additionalProperties": false
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// SLIDES
// ═══════════════════════════════════════════════════════════════════════════════

const SLIDES_RULES: &str = r#"TASK: Pick the investor-deck pages that carry real information and explain each one.

Rules:
- `selectedPageNumber` is the page the insight comes from.
- `headline` is a short, specific claim (numbers when the page shows them).
- `insight` is two or three sentences on what changed and why it matters.
- Skip title pages, agendas, disclaimers and section dividers.
- Never select the same page twice."#;

pub fn slides_prompt(pages: &PageMapping, max_slides: usize) -> String {
    format!(
        "{ANALYST_VOICE}\n\n{}\n\n{SLIDES_RULES}\n- Return up to {} slides; more candidates are fine, they will be ranked.\n\n{JSON_ONLY}",
        pages.prompt_preamble(),
        // Over-ask so ranking has room to drop weak or duplicate picks.
        max_slides.saturating_mul(2).min(pages.page_count() as usize).max(1),
    )
}

pub fn slides_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "slides": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "selectedPageNumber": { "type": "integer" },
                        "headline": { "type": "string" },
                        "insight": { "type": "string" }
                    },
                    "required": ["selectedPageNumber", "headline", "insight"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["slides"],
        "additionalProperties": false
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// NARRATIVE
// ═══════════════════════════════════════════════════════════════════════════════

pub fn narrative_prompt(
    document: &str,
    company: Option<&str>,
    max_themes: usize,
    categories: &[&str],
    cap_labels: &[&str],
) -> String {
    let subject = company
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(|c| format!("The company is {c}.\n"))
        .unwrap_or_default();
    format!(
        r#"{ANALYST_VOICE}

TASK: Write the investment narrative for the document below.
{subject}
Rules:
- `headline`: one line, under 15 words.
- `summary`: one paragraph on the business and what changed this period.
- `marketCapLabel`: one of {labels}.
- `themes`: 1 to {max_themes} themes, each with a `title`, a `category` (one of {cats}) and a `narrative` paragraph.

DOCUMENT:
{document}

{JSON_ONLY}"#,
        labels = cap_labels.join(", "),
        cats = categories.join(", "),
    )
}

pub fn narrative_schema(categories: &[&str], cap_labels: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": {
            "headline": { "type": "string" },
            "summary": { "type": "string" },
            "marketCapLabel": { "type": "string", "enum": cap_labels },
            "themes": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "title": { "type": "string" },
                        "category": { "type": "string", "enum": categories },
                        "narrative": { "type": "string" }
                    },
                    "required": ["title", "category", "narrative"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["headline", "summary", "marketCapLabel", "themes"],
        "additionalProperties": false
    })
}
