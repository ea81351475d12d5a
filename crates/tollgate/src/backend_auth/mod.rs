//! Per-backend credential injection.
//!
//! A handler is built once per snapshot (credential files are re-read on
//! reload) and invoked per request after the translator has produced the
//! outbound mutations. Handler failures are per-request fatal.

mod api_key;
mod aws_sigv4;
mod oauth;

pub use api_key::ApiKeyHandler;
pub use aws_sigv4::SigV4Handler;
pub use oauth::OAuthHandler;

use std::collections::HashMap;

use common::configuration::BackendAuthConfig;
use envoy_types::pb::envoy::service::ext_proc::v3::HeaderMutation;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("failed to read credential file {path}: {source}")]
    CredentialFile {
        path: String,
        source: std::io::Error,
    },
    #[error("credential file {path} is missing {field}")]
    MissingCredential { path: String, field: String },
    #[error("request is missing the {0} header")]
    MissingHeader(&'static str),
    #[error("failed to sign request: {0}")]
    Signing(String),
    #[error("token exchange failed: {0}")]
    TokenExchange(String),
}

pub enum AuthHandler {
    ApiKey(ApiKeyHandler),
    AwsSigV4(SigV4Handler),
    OAuth(OAuthHandler),
}

impl AuthHandler {
    /// Build a handler from its configuration, loading credentials from disk.
    pub fn from_config(config: &BackendAuthConfig) -> Result<Self, AuthError> {
        match config {
            BackendAuthConfig::ApiKey { filename } => {
                Ok(AuthHandler::ApiKey(ApiKeyHandler::from_file(filename)?))
            }
            BackendAuthConfig::AwsSigV4 {
                credential_file_name,
                region,
                service,
            } => Ok(AuthHandler::AwsSigV4(SigV4Handler::from_credential_file(
                credential_file_name,
                region,
                service,
            )?)),
            BackendAuthConfig::Azure {
                tenant_id,
                client_id,
                client_secret_filename,
                scope,
                token_refresh_skew_seconds,
            } => Ok(AuthHandler::OAuth(OAuthHandler::for_azure(
                tenant_id,
                client_id,
                client_secret_filename,
                scope.as_deref(),
                *token_refresh_skew_seconds,
            )?)),
            BackendAuthConfig::Gcp {
                token_url,
                client_id,
                client_secret_filename,
                audience,
                token_refresh_skew_seconds,
            } => Ok(AuthHandler::OAuth(OAuthHandler::for_gcp(
                token_url,
                client_id,
                client_secret_filename,
                audience.as_deref(),
                *token_refresh_skew_seconds,
            )?)),
        }
    }

    /// Inject credentials into the outbound mutation.
    ///
    /// `request_headers` already reflects the translator's header edits;
    /// `body` is the outbound body after any body mutation.
    pub async fn do_auth(
        &self,
        request_headers: &HashMap<String, String>,
        header_mutation: &mut HeaderMutation,
        body: Option<&[u8]>,
    ) -> Result<(), AuthError> {
        match self {
            AuthHandler::ApiKey(handler) => handler.do_auth(header_mutation),
            AuthHandler::AwsSigV4(handler) => {
                handler.do_auth(request_headers, header_mutation, body)
            }
            AuthHandler::OAuth(handler) => handler.do_auth(header_mutation).await,
        }
    }
}
