//! Translator variants between the client-facing schema and a backend's
//! schema, one instance per HTTP transaction.
//!
//! Translators are transport-agnostic: they emit plain header/body mutation
//! values and never see the proxy's gRPC types. The owning processor applies
//! the mutations to the wire.

mod openai_bedrock;
mod openai_openai;

pub use openai_bedrock::OpenAiToBedrockTranslator;
pub use openai_openai::OpenAiToOpenAiTranslator;

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::apis::bedrock_stream::BedrockStreamError;
use crate::schema::ApiSchema;

/// Response pseudo-header carrying the upstream HTTP status.
pub const STATUS_HEADER: &str = ":status";
pub const CONTENT_TYPE_HEADER: &str = "content-type";
pub const CONTENT_LENGTH_HEADER: &str = "content-length";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Lower-cased header name → value map captured from the proxy.
pub type HeaderFields = HashMap<String, String>;

#[derive(Error, Debug)]
pub enum TranslatorError {
    #[error("failed to decode request body: {0}")]
    RequestDecode(#[source] serde_json::Error),
    #[error("failed to decode response body: {0}")]
    ResponseDecode(#[source] serde_json::Error),
    #[error("failed to encode body: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("unsupported request: {0}")]
    UnsupportedRequest(String),
    #[error(transparent)]
    BedrockStream(#[from] BedrockStreamError),
}

/// Header edits to apply to the current direction of the transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMutation {
    pub set: Vec<(String, String)>,
    pub remove: Vec<String>,
}

impl HeaderMutation {
    pub fn set(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set.push((name.into(), value.into()));
        self
    }

    pub fn remove(mut self, name: impl Into<String>) -> Self {
        self.remove.push(name.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }
}

/// How the proxy should deliver response-body events for this transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseBodyMode {
    Buffered,
    Streamed,
}

/// Outcome of translating a request body.
#[derive(Debug, Default)]
pub struct RequestTransform {
    pub header_mutation: Option<HeaderMutation>,
    pub body: Option<Vec<u8>>,
    pub response_body_mode: Option<ResponseBodyMode>,
}

/// Outcome of translating one response-body chunk.
#[derive(Debug, Default)]
pub struct ResponseTransform {
    pub header_mutation: Option<HeaderMutation>,
    pub body: Option<Vec<u8>>,
    pub token_usage: LlmTokenUsage,
}

/// Token counts extracted from an upstream response, saturated to u32 for
/// the downstream metadata encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LlmTokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl LlmTokenUsage {
    pub fn from_counts(input: u64, output: u64, total: u64) -> Self {
        Self {
            input_tokens: saturate(input),
            output_tokens: saturate(output),
            total_tokens: saturate(total),
        }
    }

    /// Fold another extraction into the per-stream running totals.
    pub fn accumulate(&mut self, other: LlmTokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

fn saturate(count: u64) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Schema-pair dispatch. The client side is the configured input schema;
/// only OpenAI-facing deployments are supported today.
pub enum Translator {
    OpenAiToOpenAi(OpenAiToOpenAiTranslator),
    OpenAiToBedrock(OpenAiToBedrockTranslator),
}

impl Translator {
    /// Pick the translator for a (client, backend) schema pair.
    pub fn for_schemas(client: ApiSchema, backend: ApiSchema) -> Option<Translator> {
        match (client, backend) {
            (ApiSchema::OpenAi, ApiSchema::OpenAi) => {
                Some(Translator::OpenAiToOpenAi(OpenAiToOpenAiTranslator::new()))
            }
            (ApiSchema::OpenAi, ApiSchema::AwsBedrock) => Some(Translator::OpenAiToBedrock(
                OpenAiToBedrockTranslator::new(),
            )),
            _ => None,
        }
    }

    pub fn request_body(
        &mut self,
        request: crate::apis::openai::ChatCompletionsRequest,
    ) -> Result<RequestTransform, TranslatorError> {
        match self {
            Translator::OpenAiToOpenAi(t) => t.request_body(request),
            Translator::OpenAiToBedrock(t) => t.request_body(request),
        }
    }

    pub fn response_headers(
        &mut self,
        headers: &HeaderFields,
    ) -> Result<Option<HeaderMutation>, TranslatorError> {
        match self {
            Translator::OpenAiToOpenAi(t) => t.response_headers(headers),
            Translator::OpenAiToBedrock(t) => t.response_headers(headers),
        }
    }

    pub fn response_body(
        &mut self,
        headers: &HeaderFields,
        body: &[u8],
        end_of_stream: bool,
    ) -> Result<ResponseTransform, TranslatorError> {
        match self {
            Translator::OpenAiToOpenAi(t) => t.response_body(headers, body, end_of_stream),
            Translator::OpenAiToBedrock(t) => t.response_body(headers, body, end_of_stream),
        }
    }

    pub fn response_error(
        &mut self,
        headers: &HeaderFields,
        body: &[u8],
    ) -> Result<ResponseTransform, TranslatorError> {
        match self {
            Translator::OpenAiToOpenAi(t) => t.response_error(headers, body),
            Translator::OpenAiToBedrock(t) => t.response_error(headers, body),
        }
    }
}

pub(crate) fn status_code(headers: &HeaderFields) -> Option<u16> {
    headers.get(STATUS_HEADER)?.parse().ok()
}

pub(crate) fn is_good_status(status: u16) -> bool {
    (200..300).contains(&status)
}

pub(crate) fn is_json_content_type(headers: &HeaderFields) -> bool {
    headers
        .get(CONTENT_TYPE_HEADER)
        .map(|v| v.starts_with(JSON_CONTENT_TYPE))
        .unwrap_or(false)
}

pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Wrap a non-JSON upstream error body in the OpenAI error envelope.
pub(crate) fn synthesize_error_body(
    error_tag: &str,
    status: Option<u16>,
    message: String,
) -> Result<Vec<u8>, TranslatorError> {
    let envelope = crate::apis::openai::OpenAiErrorEnvelope {
        envelope_type: "error".to_string(),
        error: crate::apis::openai::OpenAiErrorDetail {
            error_type: error_tag.to_string(),
            code: status.map(|s| s.to_string()),
            message,
        },
    };
    serde_json::to_vec(&envelope).map_err(TranslatorError::Encode)
}
