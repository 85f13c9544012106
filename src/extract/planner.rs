//! Builds the ordered (provider, model) attempts for one request.

use super::models::{FallbackShape, ProviderSpec};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub provider: String,
    pub model: String,
}

/// Ordered attempts, consumed left to right. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptPlan {
    attempts: Vec<Attempt>,
}

impl AttemptPlan {
    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Attempt> {
        self.attempts.get(index)
    }

    pub fn first(&self) -> &Attempt {
        &self.attempts[0]
    }

    /// Plan a single fixed attempt (used by tests and callers that pin a model).
    pub fn single(provider: &str, model: &str) -> Self {
        Self {
            attempts: vec![Attempt {
                provider: provider.to_string(),
                model: model.to_string(),
            }],
        }
    }

    /// Build a plan from explicit attempts; `None` when the list is empty.
    pub fn from_attempts(attempts: Vec<Attempt>) -> Option<Self> {
        (!attempts.is_empty()).then_some(Self { attempts })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("model `{model}` is not available on provider `{provider}`")]
    ModelNotAllowed { provider: String, model: String },
}

/// Plan attempts for `requested` (or the provider default) on `provider`.
///
/// Tiered providers start from the caller's pick and then walk the rest of
/// the tier in its fixed priority order, so each tier model is tried exactly
/// once. Primary/backup providers yield the pick plus the other member of the
/// pair.
pub fn plan(requested: Option<&str>, provider: &ProviderSpec) -> Result<AttemptPlan, PlanError> {
    let model = requested
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(provider.default_model.as_str());

    if !provider.allows(model) {
        return Err(PlanError::ModelNotAllowed {
            provider: provider.id.clone(),
            model: model.to_string(),
        });
    }

    let mut models = vec![model.to_string()];
    match &provider.fallback {
        FallbackShape::Tiered(tier) => {
            for candidate in tier {
                if !models.contains(candidate) {
                    models.push(candidate.clone());
                }
            }
        }
        FallbackShape::PrimaryBackup { primary, backup } => {
            let other = if model == backup { primary } else { backup };
            if other != model {
                models.push(other.clone());
            }
        }
    }

    Ok(AttemptPlan {
        attempts: models
            .into_iter()
            .map(|model| Attempt {
                provider: provider.id.clone(),
                model,
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::models::{ProviderSpec, DEFAULT_AGGREGATOR_BASE_URL, DEFAULT_HOSTED_BASE_URL};

    fn models(plan: &AttemptPlan) -> Vec<&str> {
        plan.attempts().iter().map(|a| a.model.as_str()).collect()
    }

    #[test]
    fn tiered_plan_starts_with_requested_and_covers_tier_once() {
        let spec = ProviderSpec::hosted(DEFAULT_HOSTED_BASE_URL);
        let tier = spec.allowed_models.clone();
        for requested in &tier {
            let plan = plan(Some(requested), &spec).unwrap();
            assert_eq!(plan.first().model, *requested);
            let mut seen = models(&plan);
            assert_eq!(seen.len(), tier.len());
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen.len(), tier.len());
        }
    }

    #[test]
    fn tiered_plan_cycles_in_fixed_priority() {
        let spec = ProviderSpec::hosted(DEFAULT_HOSTED_BASE_URL);
        let plan = plan(Some("gemini-2.5-pro"), &spec).unwrap();
        assert_eq!(
            models(&plan),
            vec!["gemini-2.5-pro", "gemini-2.5-flash", "gemini-2.5-flash-lite"]
        );
    }

    #[test]
    fn default_model_is_used_when_none_requested() {
        let spec = ProviderSpec::hosted(DEFAULT_HOSTED_BASE_URL);
        let plan = plan(None, &spec).unwrap();
        assert_eq!(plan.first().model, spec.default_model);
        let blank = super::plan(Some("  "), &spec).unwrap();
        assert_eq!(blank, plan);
    }

    #[test]
    fn aggregator_plan_is_primary_and_backup() {
        let spec = ProviderSpec::aggregator(DEFAULT_AGGREGATOR_BASE_URL);
        let primary_first = plan(None, &spec).unwrap();
        assert_eq!(
            models(&primary_first),
            vec!["google/gemini-2.5-flash", "openai/gpt-4.1-mini"]
        );
        let backup_first = plan(Some("openai/gpt-4.1-mini"), &spec).unwrap();
        assert_eq!(
            models(&backup_first),
            vec!["openai/gpt-4.1-mini", "google/gemini-2.5-flash"]
        );
        assert!(backup_first.attempts().iter().all(|a| a.provider == "aggregator"));
    }

    #[test]
    fn unknown_models_are_rejected() {
        let spec = ProviderSpec::hosted(DEFAULT_HOSTED_BASE_URL);
        let err = plan(Some("gpt-5"), &spec).unwrap_err();
        assert_eq!(
            err,
            PlanError::ModelNotAllowed {
                provider: "primary-hosted".to_string(),
                model: "gpt-5".to_string()
            }
        );
    }

    #[test]
    fn from_attempts_rejects_empty_plans() {
        assert!(AttemptPlan::from_attempts(Vec::new()).is_none());
        assert_eq!(AttemptPlan::single("p", "m").len(), 1);
    }
}
