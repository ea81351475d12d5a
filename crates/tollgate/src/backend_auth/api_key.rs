use std::path::Path;

use envoy_types::pb::envoy::service::ext_proc::v3::HeaderMutation;

use crate::mutation::set_header;

use super::AuthError;

/// Bearer-token injection from a key file in the snapshot.
pub struct ApiKeyHandler {
    api_key: String,
}

impl ApiKeyHandler {
    pub fn from_file(path: &Path) -> Result<Self, AuthError> {
        let contents = std::fs::read_to_string(path).map_err(|source| AuthError::CredentialFile {
            path: path.display().to_string(),
            source,
        })?;
        let api_key = contents.trim().to_string();
        if api_key.is_empty() {
            return Err(AuthError::MissingCredential {
                path: path.display().to_string(),
                field: "api key".to_string(),
            });
        }
        Ok(Self { api_key })
    }

    pub fn do_auth(&self, header_mutation: &mut HeaderMutation) -> Result<(), AuthError> {
        set_header(
            header_mutation,
            "Authorization",
            format!("Bearer {}", self.api_key).as_bytes(),
        );
        Ok(())
    }
}
