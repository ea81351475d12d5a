//! Per-stream processors: one four-phase state machine per HTTP transaction.

mod chat_completions;
mod models;

pub use chat_completions::ChatCompletionProcessor;
pub use models::ModelsProcessor;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use envoy_types::pb::envoy::config::core::v3::HeaderMap;
use envoy_types::pb::envoy::r#type::v3::{HttpStatus, StatusCode};
use envoy_types::pb::envoy::service::ext_proc::v3::{
    processing_response, BodyResponse, CommonResponse, HeadersResponse, HttpBody,
    ImmediateResponse, ProcessingResponse,
};
use thiserror::Error;

use crate::backend_auth::AuthError;
use crate::config::Snapshot;
use crate::costs::CostError;
use crate::router::RouterError;

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("unsupported API schema: {0}")]
    UnsupportedSchema(String),
    #[error("failed to parse request body: {0}")]
    BodyParse(#[source] serde_json::Error),
    #[error("failed to encode response body: {0}")]
    BodyEncode(#[source] serde_json::Error),
    #[error("failed to transform request or response: {0}")]
    Translator(#[from] janusllm::TranslatorError),
    #[error("failed to calculate route: {0}")]
    Router(#[from] RouterError),
    #[error("failed to authorize request: {0}")]
    Auth(#[from] AuthError),
    #[error("failed to build dynamic metadata: {0}")]
    Cost(#[from] CostError),
    #[error("failed to decode gzip response body: {0}")]
    Gzip(#[source] std::io::Error),
}

/// One processor handles exactly one stream; phases arrive in order and the
/// processor is dropped when the stream ends.
#[async_trait]
pub trait Processor: Send {
    async fn process_request_headers(
        &mut self,
        headers: &HeaderMap,
    ) -> Result<ProcessingResponse, ProcessorError>;
    async fn process_request_body(
        &mut self,
        body: &HttpBody,
    ) -> Result<ProcessingResponse, ProcessorError>;
    async fn process_response_headers(
        &mut self,
        headers: &HeaderMap,
    ) -> Result<ProcessingResponse, ProcessorError>;
    async fn process_response_body(
        &mut self,
        body: &HttpBody,
    ) -> Result<ProcessingResponse, ProcessorError>;
}

/// Constructor registered against a request path.
pub type ProcessorFactory =
    fn(Arc<Snapshot>, HashMap<String, String>) -> Result<Box<dyn Processor>, ProcessorError>;

/// Issues empty mutations for every phase; used for unknown paths.
pub struct PassthroughProcessor;

impl PassthroughProcessor {
    pub fn factory(
        _config: Arc<Snapshot>,
        _headers: HashMap<String, String>,
    ) -> Result<Box<dyn Processor>, ProcessorError> {
        Ok(Box::new(PassthroughProcessor))
    }
}

#[async_trait]
impl Processor for PassthroughProcessor {
    async fn process_request_headers(
        &mut self,
        _headers: &HeaderMap,
    ) -> Result<ProcessingResponse, ProcessorError> {
        Ok(request_headers_response(None))
    }

    async fn process_request_body(
        &mut self,
        _body: &HttpBody,
    ) -> Result<ProcessingResponse, ProcessorError> {
        Ok(ProcessingResponse {
            response: Some(processing_response::Response::RequestBody(
                BodyResponse::default(),
            )),
            ..Default::default()
        })
    }

    async fn process_response_headers(
        &mut self,
        _headers: &HeaderMap,
    ) -> Result<ProcessingResponse, ProcessorError> {
        Ok(response_headers_response(None))
    }

    async fn process_response_body(
        &mut self,
        _body: &HttpBody,
    ) -> Result<ProcessingResponse, ProcessorError> {
        Ok(ProcessingResponse {
            response: Some(processing_response::Response::ResponseBody(
                BodyResponse::default(),
            )),
            ..Default::default()
        })
    }
}

/// Flatten the proxy's header map, lower-casing names. Values arrive in
/// `raw_value` on current proxies with `value` as the legacy fallback.
pub fn headers_to_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .headers
        .iter()
        .map(|header| {
            let value = if header.raw_value.is_empty() {
                header.value.clone()
            } else {
                String::from_utf8_lossy(&header.raw_value).into_owned()
            };
            (header.key.to_ascii_lowercase(), value)
        })
        .collect()
}

pub fn request_headers_response(
    common: Option<CommonResponse>,
) -> ProcessingResponse {
    ProcessingResponse {
        response: Some(processing_response::Response::RequestHeaders(
            HeadersResponse { response: common },
        )),
        ..Default::default()
    }
}

pub fn response_headers_response(
    common: Option<CommonResponse>,
) -> ProcessingResponse {
    ProcessingResponse {
        response: Some(processing_response::Response::ResponseHeaders(
            HeadersResponse { response: common },
        )),
        ..Default::default()
    }
}

pub fn immediate_response(status: StatusCode, body: Vec<u8>) -> ProcessingResponse {
    ProcessingResponse {
        response: Some(processing_response::Response::ImmediateResponse(
            ImmediateResponse {
                status: Some(HttpStatus {
                    code: status as i32,
                }),
                body,
                ..Default::default()
            },
        )),
        ..Default::default()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use envoy_types::pb::envoy::config::core::v3::{HeaderMap, HeaderValue};

    pub fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        HeaderMap {
            headers: pairs
                .iter()
                .map(|(key, value)| HeaderValue {
                    key: key.to_string(),
                    raw_value: value.as_bytes().to_vec(),
                    ..Default::default()
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::header_map;
    use super::*;

    #[test]
    fn headers_to_map_prefers_raw_value_and_lowercases_names() {
        let mut map = header_map(&[(":path", "/v1/models")]);
        map.headers.push(
            envoy_types::pb::envoy::config::core::v3::HeaderValue {
                key: "X-Model".to_string(),
                value: "gpt".to_string(),
                ..Default::default()
            },
        );
        let flattened = headers_to_map(&map);
        assert_eq!(flattened[":path"], "/v1/models");
        assert_eq!(flattened["x-model"], "gpt");
    }

    #[tokio::test]
    async fn passthrough_processor_issues_empty_mutations() {
        let mut processor = PassthroughProcessor;
        let response = processor
            .process_request_headers(&header_map(&[]))
            .await
            .unwrap();
        assert!(matches!(
            response.response,
            Some(processing_response::Response::RequestHeaders(_))
        ));
        let response = processor
            .process_response_body(&HttpBody::default())
            .await
            .unwrap();
        assert!(matches!(
            response.response,
            Some(processing_response::Response::ResponseBody(_))
        ));
    }
}
