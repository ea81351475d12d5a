//! Client-credentials token exchange for Azure and GCP backends.
//!
//! Long-lived client secrets live in snapshot-loaded files; short-lived
//! access tokens are cached per handler and refreshed ahead of expiry by a
//! configurable skew. The exchange suspends only the owning stream.

use std::path::Path;
use std::time::{Duration, Instant};

use envoy_types::pb::envoy::service::ext_proc::v3::HeaderMutation;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::mutation::set_header;

use super::AuthError;

const DEFAULT_REFRESH_SKEW: Duration = Duration::from_secs(300);
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);
const AZURE_DEFAULT_SCOPE: &str = "https://cognitiveservices.azure.com/.default";

pub struct OAuthHandler {
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: Option<String>,
    audience: Option<String>,
    refresh_skew: Duration,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

struct CachedToken {
    header_value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl OAuthHandler {
    pub fn for_azure(
        tenant_id: &str,
        client_id: &str,
        client_secret_filename: &Path,
        scope: Option<&str>,
        refresh_skew_seconds: Option<u64>,
    ) -> Result<Self, AuthError> {
        let token_url =
            format!("https://login.microsoftonline.com/{tenant_id}/oauth2/v2.0/token");
        Self::new(
            token_url,
            client_id,
            client_secret_filename,
            Some(scope.unwrap_or(AZURE_DEFAULT_SCOPE).to_string()),
            None,
            refresh_skew_seconds,
        )
    }

    pub fn for_gcp(
        token_url: &str,
        client_id: &str,
        client_secret_filename: &Path,
        audience: Option<&str>,
        refresh_skew_seconds: Option<u64>,
    ) -> Result<Self, AuthError> {
        Self::new(
            token_url.to_string(),
            client_id,
            client_secret_filename,
            None,
            audience.map(str::to_string),
            refresh_skew_seconds,
        )
    }

    fn new(
        token_url: String,
        client_id: &str,
        client_secret_filename: &Path,
        scope: Option<String>,
        audience: Option<String>,
        refresh_skew_seconds: Option<u64>,
    ) -> Result<Self, AuthError> {
        let client_secret = std::fs::read_to_string(client_secret_filename)
            .map_err(|source| AuthError::CredentialFile {
                path: client_secret_filename.display().to_string(),
                source,
            })?
            .trim()
            .to_string();
        if client_secret.is_empty() {
            return Err(AuthError::MissingCredential {
                path: client_secret_filename.display().to_string(),
                field: "client secret".to_string(),
            });
        }
        let http = reqwest::Client::builder()
            .timeout(EXCHANGE_TIMEOUT)
            .build()
            .map_err(|e| AuthError::TokenExchange(e.to_string()))?;
        Ok(Self {
            token_url,
            client_id: client_id.to_string(),
            client_secret,
            scope,
            audience,
            refresh_skew: refresh_skew_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REFRESH_SKEW),
            http,
            cached: Mutex::new(None),
        })
    }

    pub async fn do_auth(&self, header_mutation: &mut HeaderMutation) -> Result<(), AuthError> {
        let header_value = self.current_token().await?;
        set_header(header_mutation, "Authorization", header_value.as_bytes());
        Ok(())
    }

    async fn current_token(&self) -> Result<String, AuthError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.header_value.clone());
            }
        }

        let token = self.fetch_token().await?;
        let header_value = token.header_value.clone();
        *cached = Some(token);
        Ok(header_value)
    }

    async fn fetch_token(&self) -> Result<CachedToken, AuthError> {
        let mut params = vec![
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("client_id".to_string(), self.client_id.clone()),
            ("client_secret".to_string(), self.client_secret.clone()),
        ];
        if let Some(scope) = &self.scope {
            params.push(("scope".to_string(), scope.clone()));
        }
        if let Some(audience) = &self.audience {
            params.push(("audience".to_string(), audience.clone()));
        }

        let response = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::TokenExchange(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::TokenExchange(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }
        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::TokenExchange(e.to_string()))?;

        let access_token = parsed
            .access_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                AuthError::TokenExchange("token response missing access_token".to_string())
            })?;
        let token_type = parsed
            .token_type
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "Bearer".to_string());
        let ttl = parsed
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_TTL);
        let lifetime = ttl.saturating_sub(self.refresh_skew);

        Ok(CachedToken {
            header_value: format!("{token_type} {access_token}"),
            expires_at: Instant::now() + lifetime,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};
    use std::io::Write;

    fn secret_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "secret-1").unwrap();
        file
    }

    #[tokio::test]
    async fn exchanges_and_caches_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/token")
                    .body_contains("grant_type=client_credentials")
                    .body_contains("client_id=client-1")
                    .body_contains("client_secret=secret-1");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"access_token":"tok-123","token_type":"Bearer","expires_in":3600}"#);
            })
            .await;

        let secret = secret_file();
        let handler =
            OAuthHandler::for_gcp(&server.url("/token"), "client-1", secret.path(), None, None)
                .unwrap();

        let mut first = HeaderMutation::default();
        handler.do_auth(&mut first).await.unwrap();
        let mut second = HeaderMutation::default();
        handler.do_auth(&mut second).await.unwrap();

        // One upstream exchange serves both requests.
        mock.assert_async().await;
        let header = first.set_headers[0].header.as_ref().unwrap();
        assert_eq!(header.key, "Authorization");
        assert_eq!(header.raw_value, b"Bearer tok-123");
    }

    #[tokio::test]
    async fn expired_token_is_refreshed() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(200)
                    .header("content-type", "application/json")
                    // expires_in below the refresh skew forces a refetch.
                    .body(r#"{"access_token":"tok-short","expires_in":1}"#);
            })
            .await;

        let secret = secret_file();
        let handler = OAuthHandler::for_gcp(
            &server.url("/token"),
            "client-1",
            secret.path(),
            None,
            Some(300),
        )
        .unwrap();

        let mut mutation = HeaderMutation::default();
        handler.do_auth(&mut mutation).await.unwrap();
        handler.do_auth(&mut mutation).await.unwrap();
        assert_eq!(mock.hits_async().await, 2);
    }

    #[tokio::test]
    async fn upstream_failure_is_an_auth_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(500).body("boom");
            })
            .await;

        let secret = secret_file();
        let handler =
            OAuthHandler::for_gcp(&server.url("/token"), "client-1", secret.path(), None, None)
                .unwrap();
        let mut mutation = HeaderMutation::default();
        let err = handler.do_auth(&mut mutation).await.unwrap_err();
        assert!(matches!(err, AuthError::TokenExchange(_)));
    }

    #[test]
    fn azure_token_url_is_derived_from_tenant() {
        let secret = secret_file();
        let handler =
            OAuthHandler::for_azure("tenant-1", "client-1", secret.path(), None, None).unwrap();
        assert_eq!(
            handler.token_url,
            "https://login.microsoftonline.com/tenant-1/oauth2/v2.0/token"
        );
        assert_eq!(handler.scope.as_deref(), Some(AZURE_DEFAULT_SCOPE));
    }
}
