use std::collections::HashMap;
use std::fmt::Display;
use std::path::PathBuf;

use janusllm::ApiSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse configuration file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("rule {rule} has no backends")]
    EmptyRule { rule: usize },
    #[error("backend '{backend}' references unknown auth handler '{auth}'")]
    UnknownAuthHandler { backend: String, auth: String },
    #[error("request cost '{metadata_key}' of type CEL is missing the expression")]
    MissingCelExpression { metadata_key: String },
}

/// The on-disk YAML configuration rendered by the control plane.
///
/// Parsed fresh on every reload; the service compiles it into an immutable
/// snapshot before any stream sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    pub input_schema: VersionedApiSchema,
    #[serde(default = "default_model_name_header_key")]
    pub model_name_header_key: String,
    #[serde(default = "default_selected_backend_header_key")]
    pub selected_backend_header_key: String,
    #[serde(default = "default_metadata_namespace")]
    pub metadata_namespace: String,
    #[serde(default)]
    pub rules: Vec<RouteRule>,
    #[serde(default)]
    pub backend_auth: HashMap<String, BackendAuthConfig>,
    #[serde(default)]
    pub declared_models: Vec<String>,
    #[serde(default)]
    pub request_costs: Vec<RequestCost>,
}

fn default_model_name_header_key() -> String {
    "x-tollgate-llm-model-name".to_string()
}

fn default_selected_backend_header_key() -> String {
    "x-tollgate-llm-backend-name".to_string()
}

fn default_metadata_namespace() -> String {
    "io.tollgate.ai_gateway".to_string()
}

impl FilterConfig {
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: FilterConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that do not depend on the filesystem.
    fn validate(&self) -> Result<(), ConfigError> {
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.backends.is_empty() {
                return Err(ConfigError::EmptyRule { rule: i });
            }
            for backend in &rule.backends {
                if let Some(auth) = &backend.auth {
                    if !self.backend_auth.contains_key(auth) {
                        return Err(ConfigError::UnknownAuthHandler {
                            backend: backend.name.clone(),
                            auth: auth.clone(),
                        });
                    }
                }
            }
        }
        for cost in &self.request_costs {
            if cost.kind == RequestCostKind::Cel && cost.cel.is_none() {
                return Err(ConfigError::MissingCelExpression {
                    metadata_key: cost.metadata_key.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionedApiSchema {
    pub name: ApiSchema,
    #[serde(default)]
    pub version: String,
}

impl Display for VersionedApiSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// One route rule: header predicates (OR-combined) and candidate backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    #[serde(default)]
    pub headers: Vec<HeaderMatch>,
    pub backends: Vec<Backend>,
}

/// Exact-match predicate on a request header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderMatch {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub name: String,
    pub schema: VersionedApiSchema,
    #[serde(default)]
    pub weight: u32,
    pub auth: Option<String>,
}

/// Credential injection variants, keyed by name under `backendAuth`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BackendAuthConfig {
    #[serde(rename = "apiKey", rename_all = "camelCase")]
    ApiKey { filename: PathBuf },
    #[serde(rename = "awsSigV4", rename_all = "camelCase")]
    AwsSigV4 {
        credential_file_name: PathBuf,
        region: String,
        #[serde(default = "default_aws_service")]
        service: String,
    },
    #[serde(rename = "azure", rename_all = "camelCase")]
    Azure {
        tenant_id: String,
        client_id: String,
        client_secret_filename: PathBuf,
        scope: Option<String>,
        token_refresh_skew_seconds: Option<u64>,
    },
    #[serde(rename = "gcp", rename_all = "camelCase")]
    Gcp {
        token_url: String,
        client_id: String,
        client_secret_filename: PathBuf,
        audience: Option<String>,
        token_refresh_skew_seconds: Option<u64>,
    },
}

fn default_aws_service() -> String {
    "bedrock".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestCost {
    pub metadata_key: String,
    #[serde(rename = "type")]
    pub kind: RequestCostKind,
    pub cel: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RequestCostKind {
    InputToken,
    OutputToken,
    TotalToken,
    #[serde(rename = "CEL")]
    Cel,
}
