//! Structured-extraction engine: plan provider/model attempts, invoke them
//! with retry and fallback, then validate, repair and rank what comes back.

pub mod client;
pub mod engine;
pub mod errors;
pub mod jobs;
pub mod limits;
pub mod models;
pub mod orchestrator;
pub mod planner;
pub mod prompts;
pub mod rank;
pub mod shaping;
pub mod validate;

pub use client::{HttpInvoker, InvocationOutcome, InvocationRequest, Invoke, RetryPolicy};
pub use engine::{Engine, EngineSettings};
pub use errors::{classify, parse_retry_after, ErrorClass, ErrorClassifier};
pub use jobs::{JobKind, JobOutput};
pub use models::{ProviderSpec, Topology};
pub use orchestrator::{FallbackPolicy, Orchestrator, TerminalError};
pub use planner::{plan, Attempt, AttemptPlan};
