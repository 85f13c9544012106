use super::errors::ErrorClass;
use serde::{Deserialize, Serialize};

/// Request/response dialect spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// Hosted `models/{model}:generateContent` API with inline base64 parts.
    GenerateContent,
    /// Aggregator OpenAI-compatible `chat/completions` API.
    ChatCompletions,
}

/// How a provider's fallback plan is shaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackShape {
    /// Rotate through a fixed tier (fast → balanced → deep), each model once.
    Tiered(Vec<String>),
    /// Primary model with a single backup.
    PrimaryBackup { primary: String, backup: String },
}

/// Static description of one upstream provider.
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub id: String,
    pub wire: WireFormat,
    /// Endpoint with a `{model}` placeholder.
    pub endpoint_template: String,
    /// Environment variable consulted for the credential.
    pub credential_env: String,
    pub requires_credential: bool,
    /// Inner attempts per plan element (1 = no provider-level retry).
    pub max_attempts: u32,
    /// Classes the inner retry loop treats as transient for this provider.
    pub retry_on: Vec<ErrorClass>,
    pub default_model: String,
    pub allowed_models: Vec<String>,
    pub fallback: FallbackShape,
}

impl ProviderSpec {
    pub fn allows(&self, model: &str) -> bool {
        self.allowed_models.iter().any(|m| m == model)
    }

    pub fn endpoint_for(&self, model: &str) -> String {
        self.endpoint_template.replace("{model}", model)
    }

    /// Hosted tiered provider in the shape of Google's Gemini API.
    pub fn hosted(base_url: &str) -> Self {
        let tier = vec![
            "gemini-2.5-flash".to_string(),
            "gemini-2.5-flash-lite".to_string(),
            "gemini-2.5-pro".to_string(),
        ];
        Self {
            id: "primary-hosted".to_string(),
            wire: WireFormat::GenerateContent,
            endpoint_template: format!(
                "{}/models/{{model}}:generateContent",
                base_url.trim_end_matches('/')
            ),
            credential_env: "GEMINI_API_KEY".to_string(),
            requires_credential: true,
            max_attempts: 6,
            retry_on: vec![
                ErrorClass::Overloaded,
                ErrorClass::TransientUpstream,
                ErrorClass::Timeout,
            ],
            default_model: tier[0].clone(),
            allowed_models: tier.clone(),
            fallback: FallbackShape::Tiered(tier),
        }
    }

    /// Aggregator provider in the shape of OpenRouter.
    pub fn aggregator(base_url: &str) -> Self {
        let primary = "google/gemini-2.5-flash".to_string();
        let backup = "openai/gpt-4.1-mini".to_string();
        Self {
            id: "aggregator".to_string(),
            wire: WireFormat::ChatCompletions,
            endpoint_template: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            credential_env: "OPENROUTER_API_KEY".to_string(),
            requires_credential: true,
            max_attempts: 1,
            retry_on: Vec::new(),
            default_model: primary.clone(),
            allowed_models: vec![primary.clone(), backup.clone()],
            fallback: FallbackShape::PrimaryBackup { primary, backup },
        }
    }
}

pub const DEFAULT_HOSTED_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_AGGREGATOR_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Read-only provider table, built once at startup and passed explicitly.
#[derive(Debug, Clone)]
pub struct Topology {
    providers: Vec<ProviderSpec>,
    default_provider: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self::new(
            vec![
                ProviderSpec::hosted(DEFAULT_HOSTED_BASE_URL),
                ProviderSpec::aggregator(DEFAULT_AGGREGATOR_BASE_URL),
            ],
            "primary-hosted",
        )
    }
}

impl Topology {
    pub fn new(providers: Vec<ProviderSpec>, default_provider: &str) -> Self {
        Self {
            providers,
            default_provider: default_provider.to_string(),
        }
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderSpec> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Resolve the caller's provider choice, falling back to the default.
    pub fn resolve(&self, requested: Option<&str>) -> Option<&ProviderSpec> {
        self.provider(requested.unwrap_or(&self.default_provider))
    }

    pub fn providers(&self) -> &[ProviderSpec] {
        &self.providers
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }
}

/// Token usage reported by a provider.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Merge two optional `Usage` values, summing their token counts.
pub(crate) fn merge_usage(primary: Option<Usage>, secondary: Option<Usage>) -> Option<Usage> {
    match (primary, secondary) {
        (Some(p), Some(s)) => Some(Usage {
            prompt_tokens: p.prompt_tokens + s.prompt_tokens,
            completion_tokens: p.completion_tokens + s.completion_tokens,
            total_tokens: p.total_tokens + s.total_tokens,
        }),
        (Some(p), None) => Some(p),
        (None, Some(s)) => Some(s),
        (None, None) => None,
    }
}
