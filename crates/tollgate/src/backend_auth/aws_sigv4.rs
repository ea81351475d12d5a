//! AWS Signature Version 4 request signing.
//!
//! The canonical request is computed from the outbound method, path, query,
//! headers, and the (possibly translator-replaced) body bytes, then signed
//! with credentials loaded from an AWS-CLI-style credentials file.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use envoy_types::pb::envoy::service::ext_proc::v3::HeaderMutation;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;
use url::Url;

use crate::mutation::set_header;

use super::AuthError;

type HmacSha256 = Hmac<Sha256>;

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

pub struct SigV4Handler {
    signer: SigV4Signer,
}

impl SigV4Handler {
    pub fn from_credential_file(
        path: &Path,
        region: &str,
        service: &str,
    ) -> Result<Self, AuthError> {
        let credentials = AwsCredentials::from_file(path)?;
        Ok(Self {
            signer: SigV4Signer {
                access_key: credentials.access_key_id,
                secret_key: credentials.secret_access_key,
                session_token: credentials.session_token,
                region: region.to_string(),
                service: service.to_string(),
            },
        })
    }

    pub fn do_auth(
        &self,
        request_headers: &HashMap<String, String>,
        header_mutation: &mut HeaderMutation,
        body: Option<&[u8]>,
    ) -> Result<(), AuthError> {
        let method = request_headers
            .get(":method")
            .map(String::as_str)
            .unwrap_or("POST");
        let path = request_headers
            .get(":path")
            .ok_or(AuthError::MissingHeader(":path"))?;
        let authority = request_headers
            .get(":authority")
            .or_else(|| request_headers.get("host"))
            .ok_or(AuthError::MissingHeader(":authority"))?;

        let mut headers_to_sign = BTreeMap::new();
        if let Some(content_type) = request_headers.get("content-type") {
            headers_to_sign.insert("content-type".to_string(), content_type.clone());
        }

        let url = format!("https://{authority}{path}");
        let timestamp = SigV4Timestamp::now()?;
        let signed = self.signer.sign(
            method,
            &url,
            &headers_to_sign,
            body.unwrap_or_default(),
            timestamp,
        )?;

        set_header(
            header_mutation,
            "Authorization",
            signed.authorization.as_bytes(),
        );
        set_header(header_mutation, "x-amz-date", signed.amz_date.as_bytes());
        set_header(
            header_mutation,
            "x-amz-content-sha256",
            signed.content_sha256.as_bytes(),
        );
        if let Some(token) = &signed.security_token {
            set_header(header_mutation, "x-amz-security-token", token.as_bytes());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SigV4Timestamp {
    pub amz_date: String,
    pub date: String,
}

impl SigV4Timestamp {
    pub fn now() -> Result<Self, AuthError> {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    pub fn from_datetime(datetime: OffsetDateTime) -> Result<Self, AuthError> {
        const AMZ_FORMAT: &[FormatItem<'_>] =
            format_description!("[year][month][day]T[hour][minute][second]Z");
        const DATE_FORMAT: &[FormatItem<'_>] = format_description!("[year][month][day]");

        let amz_date = datetime
            .format(AMZ_FORMAT)
            .map_err(|e| AuthError::Signing(format!("failed to format amz date: {e}")))?;
        let date = datetime
            .format(DATE_FORMAT)
            .map_err(|e| AuthError::Signing(format!("failed to format date: {e}")))?;
        Ok(Self { amz_date, date })
    }

    #[cfg(test)]
    pub fn from_amz_date(amz_date: &str) -> Self {
        Self {
            amz_date: amz_date.to_string(),
            date: amz_date[..8].to_string(),
        }
    }
}

pub struct SigV4Signer {
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
    region: String,
    service: String,
}

pub struct SignedHeaders {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: String,
    pub security_token: Option<String>,
    pub canonical_request: String,
}

impl SigV4Signer {
    pub fn sign(
        &self,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        payload: &[u8],
        timestamp: SigV4Timestamp,
    ) -> Result<SignedHeaders, AuthError> {
        let url = Url::parse(url)
            .map_err(|e| AuthError::Signing(format!("invalid url {url:?}: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| AuthError::Signing("url missing host".to_string()))?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let payload_hash = sha256_hex(payload);
        let mut canonical_map = BTreeMap::new();
        for (name, value) in headers {
            canonical_map.insert(name.to_ascii_lowercase(), normalize_header_value(value));
        }
        canonical_map.insert("host".to_string(), host);
        canonical_map.insert("x-amz-date".to_string(), timestamp.amz_date.clone());
        canonical_map.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
        if let Some(token) = &self.session_token {
            canonical_map.insert(
                "x-amz-security-token".to_string(),
                normalize_header_value(token),
            );
        }

        let mut canonical_headers = String::new();
        let mut signed_header_names = Vec::new();
        for (name, value) in &canonical_map {
            canonical_headers.push_str(name);
            canonical_headers.push(':');
            canonical_headers.push_str(value);
            canonical_headers.push('\n');
            signed_header_names.push(name.clone());
        }
        let signed_header_names = signed_header_names.join(";");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method,
            canonical_uri(&url),
            canonical_query(&url),
            canonical_headers,
            signed_header_names,
            payload_hash
        );

        let scope = format!(
            "{}/{}/{}/aws4_request",
            timestamp.date, self.region, self.service
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            timestamp.amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let k_date = hmac_sha256(format!("AWS4{}", self.secret_key).as_bytes(), &timestamp.date)?;
        let k_region = hmac_sha256(&k_date, &self.region)?;
        let k_service = hmac_sha256(&k_region, &self.service)?;
        let k_signing = hmac_sha256(&k_service, "aws4_request")?;
        let signature = hex_encode(&hmac_sha256(&k_signing, &string_to_sign)?);

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, scope, signed_header_names, signature
        );

        Ok(SignedHeaders {
            authorization,
            amz_date: timestamp.amz_date,
            content_sha256: payload_hash,
            security_token: self.session_token.clone(),
            canonical_request,
        })
    }
}

struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    /// Parse an AWS-CLI-style credentials file. Profile section headers are
    /// ignored; the first occurrence of each key wins.
    fn from_file(path: &Path) -> Result<Self, AuthError> {
        let contents = std::fs::read_to_string(path).map_err(|source| AuthError::CredentialFile {
            path: path.display().to_string(),
            source,
        })?;

        let mut access_key_id = None;
        let mut secret_access_key = None;
        let mut session_token = None;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('[') || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().to_string();
            match key.as_str() {
                "aws_access_key_id" => access_key_id.get_or_insert(value),
                "aws_secret_access_key" => secret_access_key.get_or_insert(value),
                "aws_session_token" => session_token.get_or_insert(value),
                _ => continue,
            };
        }

        let missing = |field: &str| AuthError::MissingCredential {
            path: path.display().to_string(),
            field: field.to_string(),
        };
        Ok(Self {
            access_key_id: access_key_id.ok_or_else(|| missing("aws_access_key_id"))?,
            secret_access_key: secret_access_key.ok_or_else(|| missing("aws_secret_access_key"))?,
            session_token,
        })
    }
}

fn canonical_uri(url: &Url) -> String {
    let path = url.path();
    if path.is_empty() {
        "/".to_string()
    } else {
        aws_percent_encode(path, false)
    }
}

fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(name, value)| {
            (
                aws_percent_encode(&name, true),
                aws_percent_encode(&value, true),
            )
        })
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn aws_percent_encode(value: &str, encode_slash: bool) -> String {
    let mut out = String::new();
    for &byte in value.as_bytes() {
        let is_unreserved =
            matches!(byte, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~');
        if is_unreserved || (!encode_slash && byte == b'/') {
            out.push(byte as char);
        } else {
            out.push('%');
            out.push(HEX_CHARS[(byte >> 4) as usize] as char);
            out.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
        }
    }
    out
}

fn normalize_header_value(value: &str) -> String {
    let mut out = String::new();
    let mut last_space = false;
    for ch in value.chars() {
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(ch);
            last_space = false;
        }
    }
    out.trim().to_string()
}

fn hmac_sha256(key: &[u8], data: &str) -> Result<Vec<u8>, AuthError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| AuthError::Signing(format!("invalid hmac key: {e}")))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push(HEX_CHARS[(byte >> 4) as usize] as char);
        out.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    out
}
