//! Request-scoped pipeline: limits, shaping, planning, orchestration,
//! validation and ranking behind one call per job.

use super::client::{create_http_client, HttpInvoker, InvocationRequest, Invoke};
use super::jobs::{narrative, quotes, slides, JobKind, JobOutput, Selection};
use super::limits::RequestLimits;
use super::models::Topology;
use super::orchestrator::{FallbackPolicy, Orchestrator, Validated};
use super::planner::plan;
use super::shaping::WindowOptions;
use super::validate::{ValidationMode, ValidationResult};
use crate::api::{ApiError, ErrorEnvelope};
use crate::config::Config;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub limits: RequestLimits,
    pub window: WindowOptions,
    pub mode: ValidationMode,
    pub fallback: FallbackPolicy,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            limits: config.limits,
            mode: config.validation_mode,
            ..Self::default()
        }
    }
}

pub struct Engine<I> {
    topology: Arc<Topology>,
    orchestrator: Orchestrator<I>,
    credentialed: HashSet<String>,
    settings: EngineSettings,
}

impl Engine<HttpInvoker> {
    /// Production engine: HTTP invoker, topology and credentials from `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        config.validate()?;
        let topology = Arc::new(Topology::from_config(config));
        let credentials = config.credentials();
        let credentialed: Vec<String> = credentials.keys().cloned().collect();
        let invoker = HttpInvoker::new(
            create_http_client()?,
            Arc::clone(&topology),
            credentials,
            config.call_timeout(),
            config.retry,
        );
        Ok(Engine::new(invoker, topology, EngineSettings::from_config(config))
            .with_credentials(credentialed))
    }
}

impl<I: Invoke> Engine<I> {
    pub fn new(invoker: I, topology: Arc<Topology>, settings: EngineSettings) -> Self {
        let orchestrator = Orchestrator::new(invoker).with_policy(settings.fallback.clone());
        Self {
            topology,
            orchestrator,
            credentialed: HashSet::new(),
            settings,
        }
    }

    /// Providers that have an API key available.
    pub fn with_credentials<S: Into<String>>(mut self, providers: impl IntoIterator<Item = S>) -> Self {
        self.credentialed.extend(providers.into_iter().map(Into::into));
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Run `job` on a raw JSON body, mapping failures to the error envelope.
    pub async fn handle(&self, job: JobKind, body: &str) -> Result<JobOutput, ErrorEnvelope> {
        let correlation_id = Uuid::new_v4();
        match self.run_job(job, body, correlation_id).await {
            Ok(output) => Ok(output),
            Err(err) => {
                tracing::warn!(
                    %correlation_id,
                    job = job.as_str(),
                    status = err.status(),
                    reason = err.reason(),
                    error = %err,
                    "job failed"
                );
                Err(err.envelope(Some(correlation_id)))
            }
        }
    }

    pub async fn run_job(
        &self,
        job: JobKind,
        body: &str,
        correlation_id: Uuid,
    ) -> Result<JobOutput, ApiError> {
        self.settings.limits.check_body(body.len())?;
        match job {
            JobKind::Quotes => quotes::run(self, serde_json::from_str(body)?, correlation_id).await,
            JobKind::Slides => slides::run(self, serde_json::from_str(body)?, correlation_id).await,
            JobKind::Narrative => {
                narrative::run(self, serde_json::from_str(body)?, correlation_id).await
            }
        }
    }

    /// Resolve provider, check credentials, plan and orchestrate one extraction.
    pub(crate) async fn extract<F>(
        &self,
        selection: &Selection,
        request: &InvocationRequest,
        validate: F,
    ) -> Result<Validated, ApiError>
    where
        F: Fn(&Value) -> ValidationResult,
    {
        let requested = selection
            .provider
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty());
        let provider = self.topology.resolve(requested).ok_or_else(|| {
            ApiError::InvalidRequest(format!(
                "unknown provider `{}`",
                requested.unwrap_or(self.topology.default_provider())
            ))
        })?;
        if provider.requires_credential && !self.credentialed.contains(&provider.id) {
            return Err(ApiError::MissingCredentials(provider.id.clone()));
        }

        let plan = plan(selection.model.as_deref(), provider)?;
        tracing::info!(
            correlation_id = %request.correlation_id,
            provider = %provider.id,
            model = %plan.first().model,
            plan_len = plan.len(),
            "starting extraction"
        );

        Ok(self.orchestrator.run(&plan, request, validate).await?)
    }
}
