//! Upstream error taxonomy.
//!
//! Providers don't expose a stable machine-readable error contract, so every
//! failure is tagged by matching its text (and HTTP status, when there is one)
//! against an ordered rule table. New upstream phrasings are added to the
//! table, never to call sites.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Classified reason for an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    RateLimited,
    SchemaConstrained,
    Overloaded,
    Timeout,
    LocationBlocked,
    ImageUnprocessable,
    TransientUpstream,
    StructuredOutputInvalid,
    Unknown,
}

impl ErrorClass {
    pub const ALL: [ErrorClass; 9] = [
        ErrorClass::RateLimited,
        ErrorClass::SchemaConstrained,
        ErrorClass::Overloaded,
        ErrorClass::Timeout,
        ErrorClass::LocationBlocked,
        ErrorClass::ImageUnprocessable,
        ErrorClass::TransientUpstream,
        ErrorClass::StructuredOutputInvalid,
        ErrorClass::Unknown,
    ];

    /// Stable reason code surfaced to callers.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::SchemaConstrained => "schema_constrained",
            ErrorClass::Overloaded => "overloaded",
            ErrorClass::Timeout => "timeout",
            ErrorClass::LocationBlocked => "location_blocked",
            ErrorClass::ImageUnprocessable => "image_unprocessable",
            ErrorClass::TransientUpstream => "transient_upstream",
            ErrorClass::StructuredOutputInvalid => "structured_output_invalid",
            ErrorClass::Unknown => "unknown",
        }
    }

    /// HTTP status used when this class ends a request.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorClass::RateLimited => 429,
            ErrorClass::SchemaConstrained
            | ErrorClass::StructuredOutputInvalid
            | ErrorClass::ImageUnprocessable => 422,
            ErrorClass::Overloaded
            | ErrorClass::Timeout
            | ErrorClass::LocationBlocked
            | ErrorClass::TransientUpstream
            | ErrorClass::Unknown => 424,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the classification table.
///
/// `patterns` are lowercase substrings; `statuses` are HTTP codes. A rule
/// matches on either, but pattern matches across the whole table win over
/// status matches so that e.g. a 500 carrying "unable to process input image"
/// is tagged as an image problem rather than a generic server error.
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub class: ErrorClass,
    pub patterns: &'static [&'static str],
    pub statuses: &'static [u16],
}

pub const DEFAULT_RULES: &[ClassificationRule] = &[
    ClassificationRule {
        class: ErrorClass::LocationBlocked,
        patterns: &["location is not supported", "user location is not supported"],
        statuses: &[],
    },
    ClassificationRule {
        class: ErrorClass::ImageUnprocessable,
        patterns: &["unable to process input image", "invalid image", "image could not be decoded"],
        statuses: &[],
    },
    ClassificationRule {
        class: ErrorClass::RateLimited,
        patterns: &[
            "quota",
            "too many requests",
            "resource exhausted",
            "resource_exhausted",
            "rate limit",
            "rate-limit",
        ],
        statuses: &[429],
    },
    ClassificationRule {
        class: ErrorClass::SchemaConstrained,
        patterns: &["too many states", "constraint", "schema is too complex"],
        statuses: &[],
    },
    ClassificationRule {
        class: ErrorClass::Timeout,
        patterns: &["timed out", "timeout", "deadline exceeded", "deadline_exceeded"],
        statuses: &[408],
    },
    ClassificationRule {
        class: ErrorClass::Overloaded,
        patterns: &["overload", "high demand", "model is unavailable", "service unavailable"],
        statuses: &[503, 529],
    },
    ClassificationRule {
        class: ErrorClass::StructuredOutputInvalid,
        patterns: &[
            "unable to parse json",
            "empty response",
            "failed to parse structured response",
            "invalid json",
        ],
        statuses: &[],
    },
    ClassificationRule {
        class: ErrorClass::TransientUpstream,
        patterns: &["internal error", "bad gateway", "connection reset", "could not connect"],
        statuses: &[500, 502, 504],
    },
];

/// Table-driven classifier. Cheap to clone; holds no state besides rules.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<ClassificationRule>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES.to_vec(),
        }
    }
}

impl ErrorClassifier {
    /// Add a rule that takes priority over every existing rule.
    pub fn with_rule(mut self, rule: ClassificationRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    pub fn classify(&self, message: &str, status: Option<u16>) -> ErrorClass {
        let lower = message.to_lowercase();
        for rule in &self.rules {
            if rule.patterns.iter().any(|p| lower.contains(p)) {
                return rule.class;
            }
        }
        if let Some(code) = status {
            for rule in &self.rules {
                if rule.statuses.contains(&code) {
                    return rule.class;
                }
            }
        }
        ErrorClass::Unknown
    }
}

/// Classify with the default rule table.
pub fn classify(message: &str, status: Option<u16>) -> ErrorClass {
    static DEFAULT: OnceLock<ErrorClassifier> = OnceLock::new();
    DEFAULT
        .get_or_init(ErrorClassifier::default)
        .classify(message, status)
}

fn retry_phrase_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:retry|try again|wait)(?:\s+(?:in|after))?\s*:?\s*([0-9]+(?:\.[0-9]+)?)\s*(ms|milliseconds?|s|secs?|seconds?)?\b",
        )
        .expect("retry phrase regex should compile")
    })
}

fn retry_delay_field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)"?retry_?delay"?\s*:\s*"([0-9]+(?:\.[0-9]+)?)s""#)
            .expect("retry delay regex should compile")
    })
}

/// Extract a retry-after hint in whole seconds (rounded up) from an upstream
/// error message.
pub fn parse_retry_after(message: &str) -> Option<u64> {
    if let Some(caps) = retry_delay_field_re().captures(message) {
        return caps.get(1).and_then(|m| ceil_secs(m.as_str(), None));
    }
    let caps = retry_phrase_re().captures(message)?;
    let unit = caps.get(2).map(|m| m.as_str().to_ascii_lowercase());
    caps.get(1)
        .and_then(|m| ceil_secs(m.as_str(), unit.as_deref()))
}

fn ceil_secs(raw: &str, unit: Option<&str>) -> Option<u64> {
    let value: f64 = raw.parse().ok()?;
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    let secs = match unit {
        Some(u) if u.starts_with("ms") || u.starts_with("milli") => value / 1000.0,
        _ => value,
    };
    Some(secs.ceil().max(1.0) as u64)
}
