//! Compilation of the parsed YAML into an immutable per-generation snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use common::configuration::{BackendAuthConfig, ConfigError, FilterConfig, RequestCostKind};
use common::configuration::VersionedApiSchema;
use thiserror::Error;

use crate::backend_auth::{AuthError, AuthHandler};
use crate::costs::{CelCostProgram, CostError};
use crate::router::Router;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cost(#[from] CostError),
    #[error("failed to build auth handler '{name}': {source}")]
    Auth { name: String, source: AuthError },
}

/// The compiled configuration one stream captures at construction.
///
/// Never mutated; a reload builds a fresh snapshot and swaps the pointer.
/// In-flight streams keep the snapshot they started with.
pub struct Snapshot {
    pub input_schema: VersionedApiSchema,
    pub model_name_header_key: String,
    pub selected_backend_header_key: String,
    pub metadata_namespace: String,
    pub router: Router,
    /// Keyed by backend name; handlers are shared when backends reuse a key.
    pub backend_auth_handlers: HashMap<String, Arc<AuthHandler>>,
    pub declared_models: Vec<String>,
    pub request_costs: Vec<CompiledRequestCost>,
    pub generation: u64,
}

pub struct CompiledRequestCost {
    pub metadata_key: String,
    pub kind: CostKind,
}

pub enum CostKind {
    InputToken,
    OutputToken,
    TotalToken,
    Cel(CelCostProgram),
}

impl Snapshot {
    /// Compile a parsed config. Any failure (CEL compile, credential load)
    /// rejects the whole snapshot; the caller keeps the previous one.
    pub fn build(config: FilterConfig, generation: u64) -> Result<Self, SnapshotError> {
        let mut request_costs = Vec::with_capacity(config.request_costs.len());
        for cost in &config.request_costs {
            let kind = match cost.kind {
                RequestCostKind::InputToken => CostKind::InputToken,
                RequestCostKind::OutputToken => CostKind::OutputToken,
                RequestCostKind::TotalToken => CostKind::TotalToken,
                RequestCostKind::Cel => {
                    let expression =
                        cost.cel
                            .as_deref()
                            .ok_or_else(|| ConfigError::MissingCelExpression {
                                metadata_key: cost.metadata_key.clone(),
                            })?;
                    CostKind::Cel(CelCostProgram::compile(expression)?)
                }
            };
            request_costs.push(CompiledRequestCost {
                metadata_key: cost.metadata_key.clone(),
                kind,
            });
        }

        let mut handlers_by_key: HashMap<&String, Arc<AuthHandler>> = HashMap::new();
        for (key, auth_config) in &config.backend_auth {
            let handler = build_handler(key, auth_config)?;
            handlers_by_key.insert(key, Arc::new(handler));
        }
        let mut backend_auth_handlers = HashMap::new();
        for rule in &config.rules {
            for backend in &rule.backends {
                if let Some(auth_key) = &backend.auth {
                    if let Some(handler) = handlers_by_key.get(auth_key) {
                        backend_auth_handlers.insert(backend.name.clone(), Arc::clone(handler));
                    }
                }
            }
        }

        Ok(Self {
            input_schema: config.input_schema,
            model_name_header_key: config.model_name_header_key,
            selected_backend_header_key: config.selected_backend_header_key,
            metadata_namespace: config.metadata_namespace,
            router: Router::new(config.rules),
            backend_auth_handlers,
            declared_models: config.declared_models,
            request_costs,
            generation,
        })
    }
}

fn build_handler(name: &str, config: &BackendAuthConfig) -> Result<AuthHandler, SnapshotError> {
    AuthHandler::from_config(config).map_err(|source| SnapshotError::Auth {
        name: name.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_yaml() -> String {
        r#"
inputSchema: {name: OpenAI, version: v1}
rules:
  - headers: [{name: x-model, value: gpt}]
    backends:
      - name: openai-a
        schema: {name: OpenAI, version: v1}
        weight: 100
"#
        .to_string()
    }

    #[test]
    fn builds_snapshot_with_compiled_costs() {
        let yaml = base_yaml()
            + r#"
requestCosts:
  - metadataKey: input_token_usage
    type: InputToken
  - metadataKey: cost
    type: CEL
    cel: "input_tokens * 2"
"#;
        let config = FilterConfig::from_yaml(&yaml).unwrap();
        let snapshot = Snapshot::build(config, 7).unwrap();
        assert_eq!(snapshot.generation, 7);
        assert_eq!(snapshot.request_costs.len(), 2);
        match &snapshot.request_costs[1].kind {
            CostKind::Cel(program) => assert_eq!(program.source(), "input_tokens * 2"),
            _ => panic!("expected compiled CEL cost"),
        }
    }

    #[test]
    fn cel_compile_failure_rejects_snapshot() {
        let yaml = base_yaml()
            + r#"
requestCosts:
  - metadataKey: cost
    type: CEL
    cel: "input_tokens *"
"#;
        let config = FilterConfig::from_yaml(&yaml).unwrap();
        assert!(matches!(
            Snapshot::build(config, 1),
            Err(SnapshotError::Cost(_))
        ));
    }

    #[test]
    fn missing_credential_file_rejects_snapshot() {
        let yaml = r#"
inputSchema: {name: OpenAI, version: v1}
rules:
  - headers: [{name: x-model, value: gpt}]
    backends:
      - name: openai-a
        schema: {name: OpenAI, version: v1}
        weight: 100
        auth: key
backendAuth:
  key:
    type: apiKey
    filename: /nonexistent/tollgate-key
"#;
        let config = FilterConfig::from_yaml(yaml).unwrap();
        assert!(matches!(
            Snapshot::build(config, 1),
            Err(SnapshotError::Auth { .. })
        ));
    }
}
