//! Response validation and repair.
//!
//! [`validate`] works on a copy of the model's JSON. Cosmetic problems
//! (whitespace, casing, fences, boilerplate openers, near-miss enum values,
//! absolute page numbers inside the current chunk) are repaired and counted;
//! only structural problems produce an error.

use super::shaping::PageMapping;
use crate::util::{collapse_whitespace, truncate};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Openers models like to prepend to otherwise fine sentences.
pub const BANNED_OPENERS: &[&str] = &[
    "in summary,",
    "in conclusion,",
    "overall,",
    "notably,",
    "importantly,",
    "key takeaway:",
    "takeaway:",
    "insight:",
    "this slide shows that",
    "this slide shows",
    "the slide shows that",
    "the slide shows",
    "management noted that",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Structural checks only.
    #[default]
    Lenient,
    /// Structural checks plus minimum word counts on prose fields.
    Strict,
}

/// Free-text sanitation for one field.
#[derive(Debug, Clone)]
pub struct TextRule {
    pub field: &'static str,
    pub max_chars: Option<usize>,
    pub strip_openers: bool,
    pub capitalize: bool,
    /// Enforced in [`ValidationMode::Strict`] only.
    pub min_words: Option<usize>,
}

impl TextRule {
    pub fn new(field: &'static str) -> Self {
        Self {
            field,
            max_chars: None,
            strip_openers: false,
            capitalize: false,
            min_words: None,
        }
    }

    pub fn prose(field: &'static str, max_chars: usize, min_words: usize) -> Self {
        Self {
            field,
            max_chars: Some(max_chars),
            strip_openers: true,
            capitalize: true,
            min_words: Some(min_words),
        }
    }

    pub fn max_chars(mut self, max: usize) -> Self {
        self.max_chars = Some(max);
        self
    }
}

/// Enumerated field coerced into a fixed set of buckets.
#[derive(Debug, Clone)]
pub struct EnumRule {
    pub field: &'static str,
    allowed: Vec<&'static str>,
    buckets: Vec<(Regex, &'static str)>,
    catch_all: &'static str,
}

impl EnumRule {
    pub fn new(field: &'static str, allowed: &[&'static str], catch_all: &'static str) -> Self {
        let mut allowed = allowed.to_vec();
        if !allowed.contains(&catch_all) {
            allowed.push(catch_all);
        }
        Self {
            field,
            allowed,
            buckets: Vec::new(),
            catch_all,
        }
    }

    /// Map values matching `pattern` (case-insensitive) to `target`.
    /// Buckets are tried in the order they were added.
    pub fn bucket(mut self, pattern: &str, target: &'static str) -> Result<Self, regex::Error> {
        let re = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        self.buckets.push((re, target));
        Ok(self)
    }

    pub fn allowed(&self) -> &[&'static str] {
        &self.allowed
    }

    pub fn catch_all(&self) -> &'static str {
        self.catch_all
    }

    /// Canonical bucket for `raw`.
    pub fn coerce(&self, raw: &str) -> &'static str {
        let trimmed = raw.trim();
        if let Some(exact) = self
            .allowed
            .iter()
            .find(|a| a.eq_ignore_ascii_case(trimmed))
        {
            return exact;
        }
        self.buckets
            .iter()
            .find(|(re, _)| re.is_match(trimmed))
            .map(|(_, target)| *target)
            .filter(|target| self.allowed.contains(target))
            .unwrap_or(self.catch_all)
    }
}

/// Checks applied to one JSON object (the root, or each item of an array).
#[derive(Debug, Clone, Default)]
pub struct ObjectPolicy {
    /// Fields that must be non-empty strings after trimming.
    pub required: Vec<&'static str>,
    pub text: Vec<TextRule>,
    pub enums: Vec<EnumRule>,
    /// Integer page reference checked against the request's [`PageMapping`].
    pub page_field: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub struct ArrayRule {
    pub field: &'static str,
    pub min: usize,
    pub max: Option<usize>,
    pub items: ObjectPolicy,
}

#[derive(Debug, Clone, Default)]
pub struct ResponsePolicy {
    pub root: ObjectPolicy,
    pub arrays: Vec<ArrayRule>,
    pub pages: Option<PageMapping>,
    pub mode: ValidationMode,
}

impl ResponsePolicy {
    pub fn with_mode(mut self, mode: ValidationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_pages(mut self, pages: PageMapping) -> Self {
        self.pages = Some(pages);
        self
    }
}

/// Counters for the repairs applied during validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Repairs {
    pub normalized_page_count: u32,
    pub coerced_enum_count: u32,
    pub sanitized_text_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    /// `None` when the value conforms to the policy.
    pub error: Option<String>,
    /// Normalized copy; every field of the input is still present.
    pub value: Value,
    pub repairs: Repairs,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }
}

/// Validate `raw` against `policy`, returning a normalized copy.
pub fn validate(raw: &Value, policy: &ResponsePolicy) -> ValidationResult {
    let mut value = raw.clone();
    let mut repairs = Repairs::default();
    let error = validate_in(&mut value, policy, &mut repairs).err();
    ValidationResult {
        error,
        value,
        repairs,
    }
}

fn validate_in(value: &mut Value, policy: &ResponsePolicy, repairs: &mut Repairs) -> Result<(), String> {
    let Some(root) = value.as_object_mut() else {
        return Err("response root is not a JSON object".to_string());
    };

    check_object(root, &policy.root, policy, repairs, "")?;

    for rule in &policy.arrays {
        if root.get(rule.field).is_none_or(Value::is_null) {
            if rule.min > 0 {
                return Err(format!("missing required array `{}`", rule.field));
            }
            root.insert(rule.field.to_string(), Value::Array(Vec::new()));
        }
        let Some(items) = root.get_mut(rule.field).and_then(Value::as_array_mut) else {
            return Err(format!("`{}` must be an array", rule.field));
        };
        if items.len() < rule.min {
            return Err(format!(
                "`{}` has {} items, at least {} required",
                rule.field,
                items.len(),
                rule.min
            ));
        }
        if let Some(max) = rule.max {
            if items.len() > max {
                return Err(format!(
                    "`{}` has {} items, at most {} allowed",
                    rule.field,
                    items.len(),
                    max
                ));
            }
        }
        for (idx, item) in items.iter_mut().enumerate() {
            let location = format!("{}[{}].", rule.field, idx);
            let Some(obj) = item.as_object_mut() else {
                return Err(format!("`{}[{}]` is not an object", rule.field, idx));
            };
            check_object(obj, &rule.items, policy, repairs, &location)?;
        }
    }

    Ok(())
}

fn check_object(
    obj: &mut Map<String, Value>,
    rules: &ObjectPolicy,
    policy: &ResponsePolicy,
    repairs: &mut Repairs,
    location: &str,
) -> Result<(), String> {
    for rule in &rules.text {
        if let Some(slot) = obj.get_mut(rule.field) {
            // Null, arrays and objects in a text field read as empty text.
            let cleaned = scalar_text(slot)
                .map(|text| sanitize_text(&text, rule))
                .unwrap_or_default();
            if Value::String(cleaned.clone()) != *slot {
                repairs.sanitized_text_count += 1;
                *slot = Value::String(cleaned);
            }
        }
    }

    for field in &rules.required {
        let text = obj.get(*field).and_then(scalar_text).map(|s| s.trim().to_string());
        match text {
            Some(t) if !t.is_empty() => {
                obj.insert(field.to_string(), Value::String(t));
            }
            _ => return Err(format!("missing required field `{location}{field}`")),
        }
    }

    if policy.mode == ValidationMode::Strict {
        for rule in &rules.text {
            let (Some(min), Some(text)) = (rule.min_words, obj.get(rule.field).and_then(Value::as_str))
            else {
                continue;
            };
            let words = text.split_whitespace().count();
            if words < min {
                return Err(format!(
                    "`{location}{}` has {words} words, at least {min} required",
                    rule.field
                ));
            }
        }
    }

    for rule in &rules.enums {
        let current = obj.get(rule.field).and_then(Value::as_str);
        let coerced = rule.coerce(current.unwrap_or(""));
        if current != Some(coerced) {
            repairs.coerced_enum_count += 1;
            obj.insert(rule.field.to_string(), Value::String(coerced.to_string()));
        }
    }

    if let (Some(field), Some(mapping)) = (rules.page_field, policy.pages.as_ref()) {
        let page = obj.get(field).and_then(page_number).ok_or_else(|| {
            format!("`{location}{field}` must be an integer page number")
        })?;
        let resolved = mapping.resolve(page).ok_or_else(|| {
            format!(
                "`{location}{field}` = {page} is outside pages 1-{}",
                mapping.page_count()
            )
        })?;
        if resolved.remapped {
            repairs.normalized_page_count += 1;
        }
        if obj.get(field) != Some(&Value::from(resolved.local)) {
            obj.insert(field.to_string(), Value::from(resolved.local));
        }
    }

    Ok(())
}

/// Strings as-is; numbers and booleans stringified.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn page_number(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn fence_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^```[a-zA-Z]*\s*([\s\S]*?)\s*```$").expect("fence regex"))
}

fn strip_leading_opener(text: &str) -> Option<&str> {
    let lower = text.to_lowercase();
    BANNED_OPENERS
        .iter()
        .find(|opener| lower.starts_with(*opener))
        .and_then(|opener| text.get(opener.len()..))
        .map(str::trim_start)
}

fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Apply one [`TextRule`]. Idempotent.
pub fn sanitize_text(text: &str, rule: &TextRule) -> String {
    let trimmed = text.trim();
    let defenced = fence_re()
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed);
    let mut out = collapse_whitespace(defenced);

    if rule.strip_openers {
        while let Some(rest) = strip_leading_opener(&out) {
            if rest.len() == out.len() {
                break;
            }
            out = rest.to_string();
        }
    }
    if rule.capitalize {
        out = capitalize_first(&out);
    }
    if let Some(max) = rule.max_chars {
        out = truncate(&out, max);
    }
    out
}
