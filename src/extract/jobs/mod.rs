//! Built-in extraction jobs served by the [`Engine`](super::engine::Engine).

pub mod narrative;
pub mod quotes;
pub mod slides;

use super::models::Usage;
use super::orchestrator::Validated;
use super::validate::Repairs;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Quotes,
    Slides,
    Narrative,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Quotes, JobKind::Slides, JobKind::Narrative];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Quotes => "quotes",
            JobKind::Slides => "slides",
            JobKind::Narrative => "narrative",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown job `{s}` (expected quotes, slides or narrative)"))
    }
}

/// Caller's optional provider/model pick, shared by every job request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Selection {
    pub provider: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMeta {
    pub correlation_id: String,
    pub provider: String,
    pub model: String,
    pub attempts_used: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub repairs: Repairs,
    /// Job-specific details (shaping mode, page counts).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResultMeta {
    pub fn from_validated(validated: &Validated, correlation_id: Uuid) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            provider: validated.attempt.provider.clone(),
            model: validated.attempt.model.clone(),
            attempts_used: validated.attempts_used,
            usage: validated.usage.clone(),
            repairs: validated.repairs,
            extra: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

/// Successful job response.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutput {
    pub result: Value,
    pub meta: ResultMeta,
}
