use serde::{Deserialize, Serialize};

/// Endpoints of the external collaborators the jobs call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitiesConfig {
    /// Transactional email API.
    #[serde(default)]
    pub email: Option<EndpointConfig>,

    /// Generative model API.
    #[serde(default)]
    pub generation: Option<EndpointConfig>,

    /// PDF/DOCX text extraction service.
    #[serde(default)]
    pub extraction: Option<EndpointConfig>,

    /// Object storage read endpoint.
    #[serde(default)]
    pub storage: Option<EndpointConfig>,

    /// Identity provider admin API.
    #[serde(default)]
    pub identity: Option<EndpointConfig>,
}

/// A single HTTP collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base or full URL.
    pub url: String,

    /// Bearer token.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model name for generation endpoints.
    #[serde(default)]
    pub model: Option<String>,

    /// Sender address for email endpoints.
    #[serde(default)]
    pub from: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    60
}
