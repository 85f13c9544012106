//! Walks an [`AttemptPlan`], falling back across models on classified
//! failures until one attempt produces a valid result.

use super::client::{InvocationOutcome, InvocationRequest, Invoke};
use super::errors::ErrorClass;
use super::models::{merge_usage, Usage};
use super::planner::{Attempt, AttemptPlan};
use super::validate::{Repairs, ValidationResult};
use crate::util::truncate_str;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;

/// Which failures may advance the plan to its next element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackPolicy {
    eligible: HashSet<ErrorClass>,
    /// Whether an answer that fails validation moves on to the next model.
    pub fallback_on_validation: bool,
}

impl Default for FallbackPolicy {
    /// Everything except `unknown`, plus validation failures.
    fn default() -> Self {
        Self {
            eligible: ErrorClass::ALL
                .into_iter()
                .filter(|c| *c != ErrorClass::Unknown)
                .collect(),
            fallback_on_validation: true,
        }
    }
}

impl FallbackPolicy {
    pub fn only(classes: &[ErrorClass], fallback_on_validation: bool) -> Self {
        Self {
            eligible: classes.iter().copied().collect(),
            fallback_on_validation,
        }
    }

    pub fn without(mut self, class: ErrorClass) -> Self {
        self.eligible.remove(&class);
        self
    }

    pub fn is_eligible(&self, class: ErrorClass) -> bool {
        self.eligible.contains(&class)
    }
}

/// Orchestrator states; indices refer to plan elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending(usize),
    Invoking(usize),
    Validating(usize),
    FallingBack(usize),
    Succeeded(usize),
    Failed(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptResult {
    Succeeded,
    Upstream { reason: ErrorClass, message: String },
    Invalid { message: String },
}

/// One outer attempt, as recorded in the run trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub index: usize,
    #[serde(flatten)]
    pub attempt: Attempt,
    pub result: AttemptResult,
}

#[derive(Debug, Clone)]
pub struct Validated {
    pub value: Value,
    /// The attempt that produced `value`.
    pub attempt: Attempt,
    pub attempts_used: usize,
    /// Summed over every attempt that returned a body, including rejected ones.
    pub usage: Option<Usage>,
    pub repairs: Repairs,
    pub trace: Vec<AttemptRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    Upstream(ErrorClass),
    Validation,
}

#[derive(Debug, Clone)]
pub struct TerminalError {
    pub kind: TerminalKind,
    pub message: String,
    pub retry_after: Option<u64>,
    pub trace: Vec<AttemptRecord>,
}

impl TerminalError {
    pub fn status(&self) -> u16 {
        match self.kind {
            TerminalKind::Upstream(class) => class.http_status(),
            TerminalKind::Validation => 422,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self.kind {
            TerminalKind::Upstream(class) => class.as_str(),
            TerminalKind::Validation => "validation_failed",
        }
    }
}

impl std::fmt::Display for TerminalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.reason())
    }
}

impl std::error::Error for TerminalError {}

enum Step {
    Failure {
        kind: TerminalKind,
        message: String,
        retry_after: Option<u64>,
    },
    Accepted(ValidationResult),
}

pub struct Orchestrator<I> {
    invoker: I,
    policy: FallbackPolicy,
}

impl<I: Invoke> Orchestrator<I> {
    pub fn new(invoker: I) -> Self {
        Self {
            invoker,
            policy: FallbackPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: FallbackPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn invoker(&self) -> &I {
        &self.invoker
    }

    /// Run `plan` to completion. At most one outer invocation per plan element.
    pub async fn run<F>(
        &self,
        plan: &AttemptPlan,
        request: &InvocationRequest,
        validate: F,
    ) -> Result<Validated, TerminalError>
    where
        F: Fn(&Value) -> ValidationResult,
    {
        let correlation_id = request.correlation_id;
        let mut trace: Vec<AttemptRecord> = Vec::with_capacity(plan.len());
        let mut usage: Option<Usage> = None;
        let mut state = RunState::Pending(0);
        let mut step: Option<Step> = None;

        loop {
            state = match state {
                RunState::Pending(idx) => match plan.get(idx) {
                    Some(_) => RunState::Invoking(idx),
                    None => RunState::Failed(idx),
                },
                RunState::Invoking(idx) => {
                    let Some(attempt) = plan.get(idx) else {
                        return Err(self.exhausted(trace));
                    };
                    match self.invoker.invoke(attempt, request).await {
                        InvocationOutcome::Success(success) => {
                            usage = merge_usage(usage, success.usage);
                            step = Some(Step::Accepted(validate(&success.value)));
                            RunState::Validating(idx)
                        }
                        InvocationOutcome::Failure(failure) => {
                            trace.push(AttemptRecord {
                                index: idx,
                                attempt: attempt.clone(),
                                result: AttemptResult::Upstream {
                                    reason: failure.class,
                                    message: truncate_str(&failure.message, 300).to_string(),
                                },
                            });
                            let eligible = self.policy.is_eligible(failure.class);
                            step = Some(Step::Failure {
                                kind: TerminalKind::Upstream(failure.class),
                                message: failure.message,
                                retry_after: failure.retry_after,
                            });
                            self.next_state(idx, plan, eligible)
                        }
                    }
                }
                RunState::Validating(idx) => {
                    let Some(Step::Accepted(result)) = step.take() else {
                        return Err(self.exhausted(trace));
                    };
                    let attempt = plan.get(idx).cloned().unwrap_or_else(|| plan.first().clone());
                    match result.error {
                        None => {
                            trace.push(AttemptRecord {
                                index: idx,
                                attempt,
                                result: AttemptResult::Succeeded,
                            });
                            step = Some(Step::Accepted(ValidationResult {
                                error: None,
                                value: result.value,
                                repairs: result.repairs,
                            }));
                            RunState::Succeeded(idx)
                        }
                        Some(message) => {
                            trace.push(AttemptRecord {
                                index: idx,
                                attempt,
                                result: AttemptResult::Invalid {
                                    message: message.clone(),
                                },
                            });
                            step = Some(Step::Failure {
                                kind: TerminalKind::Validation,
                                message,
                                retry_after: None,
                            });
                            self.next_state(idx, plan, self.policy.fallback_on_validation)
                        }
                    }
                }
                RunState::FallingBack(next) => {
                    if let Some(Step::Failure { kind, message, .. }) = &step {
                        tracing::warn!(
                            %correlation_id,
                            from = next - 1,
                            to = next,
                            reason = reason_of(*kind),
                            error = %truncate_str(message, 160),
                            "falling back to next attempt"
                        );
                    }
                    RunState::Pending(next)
                }
                RunState::Succeeded(idx) => {
                    let (Some(Step::Accepted(result)), Some(attempt)) = (step.take(), plan.get(idx))
                    else {
                        return Err(self.exhausted(trace));
                    };
                    tracing::info!(
                        %correlation_id,
                        provider = %attempt.provider,
                        model = %attempt.model,
                        attempt = idx + 1,
                        plan_len = plan.len(),
                        "extraction succeeded"
                    );
                    return Ok(Validated {
                        value: result.value,
                        attempt: attempt.clone(),
                        attempts_used: trace.len(),
                        usage,
                        repairs: result.repairs,
                        trace,
                    });
                }
                RunState::Failed(idx) => {
                    let Some(Step::Failure {
                        kind,
                        message,
                        retry_after,
                    }) = step.take()
                    else {
                        return Err(self.exhausted(trace));
                    };
                    tracing::error!(
                        %correlation_id,
                        attempt = idx + 1,
                        plan_len = plan.len(),
                        reason = reason_of(kind),
                        error = %truncate_str(&message, 160),
                        "extraction failed"
                    );
                    return Err(TerminalError {
                        kind,
                        message,
                        retry_after,
                        trace,
                    });
                }
            };
        }
    }

    fn next_state(&self, idx: usize, plan: &AttemptPlan, eligible: bool) -> RunState {
        if eligible && idx + 1 < plan.len() {
            RunState::FallingBack(idx + 1)
        } else {
            RunState::Failed(idx)
        }
    }

    fn exhausted(&self, trace: Vec<AttemptRecord>) -> TerminalError {
        TerminalError {
            kind: TerminalKind::Upstream(ErrorClass::Unknown),
            message: "attempt plan ended without an outcome".to_string(),
            retry_after: None,
            trace,
        }
    }
}

fn reason_of(kind: TerminalKind) -> &'static str {
    match kind {
        TerminalKind::Upstream(class) => class.as_str(),
        TerminalKind::Validation => "validation_failed",
    }
}
