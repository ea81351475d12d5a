//! The `/v1/chat/completions` per-stream processor.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use envoy_types::pb::envoy::config::core::v3::HeaderMap;
use envoy_types::pb::envoy::extensions::filters::http::ext_proc::v3::{
    processing_mode, ProcessingMode,
};
use envoy_types::pb::envoy::r#type::v3::StatusCode;
use envoy_types::pb::envoy::service::ext_proc::v3::{
    processing_response, BodyResponse, CommonResponse, HeaderMutation, HttpBody,
    ProcessingResponse,
};
use flate2::read::GzDecoder;
use janusllm::apis::openai::ChatCompletionsRequest;
use janusllm::{ApiSchema, LlmTokenUsage, ResponseBodyMode, Translator};
use envoy_types::pb::google::protobuf::value::Kind;
use envoy_types::pb::google::protobuf::{Struct, Value};
use tracing::{debug, info};

use crate::config::{CostKind, Snapshot};
use crate::metrics::TokenMetrics;
use crate::mutation;
use crate::router::RouterError;

use super::{
    headers_to_map, immediate_response, request_headers_response, response_headers_response,
    Processor, ProcessorError,
};

const UNKNOWN: &str = "unknown";

pub struct ChatCompletionProcessor {
    config: Arc<Snapshot>,
    request_headers: HashMap<String, String>,
    response_headers: HashMap<String, String>,
    response_encoding: Option<String>,
    translator: Option<Translator>,
    /// Token totals accumulated across response-body events.
    costs: LlmTokenUsage,
    metrics: TokenMetrics,
    streaming: bool,
    backend_name: String,
    model_name: String,
}

impl ChatCompletionProcessor {
    pub fn factory(
        config: Arc<Snapshot>,
        request_headers: HashMap<String, String>,
    ) -> Result<Box<dyn Processor>, ProcessorError> {
        if config.input_schema.name != ApiSchema::OpenAi {
            return Err(ProcessorError::UnsupportedSchema(
                config.input_schema.to_string(),
            ));
        }
        Ok(Box::new(Self {
            config,
            request_headers,
            response_headers: HashMap::new(),
            response_encoding: None,
            translator: None,
            costs: LlmTokenUsage::default(),
            metrics: TokenMetrics::new(),
            streaming: false,
            backend_name: UNKNOWN.to_string(),
            model_name: UNKNOWN.to_string(),
        }))
    }

    fn record_error(&self) {
        self.metrics
            .record_request_completion(&self.backend_name, &self.model_name, false);
    }

    /// Keep the captured header map in sync with outbound mutations so the
    /// auth handlers and cost bindings see what the upstream will see.
    fn apply_header_mutation(&mut self, mutation: &HeaderMutation) {
        for option in &mutation.set_headers {
            if let Some(header) = &option.header {
                let value = if header.raw_value.is_empty() {
                    header.value.clone()
                } else {
                    String::from_utf8_lossy(&header.raw_value).into_owned()
                };
                self.request_headers
                    .insert(header.key.to_ascii_lowercase(), value);
            }
        }
        for name in &mutation.remove_headers {
            self.request_headers.remove(&name.to_ascii_lowercase());
        }
    }

    fn build_dynamic_metadata(&self) -> Result<Option<Struct>, ProcessorError> {
        let mut fields = HashMap::new();
        for cost in &self.config.request_costs {
            let value: u64 = match &cost.kind {
                CostKind::InputToken => u64::from(self.costs.input_tokens),
                CostKind::OutputToken => u64::from(self.costs.output_tokens),
                CostKind::TotalToken => u64::from(self.costs.total_tokens),
                CostKind::Cel(program) => {
                    let model = self
                        .request_headers
                        .get(&self.config.model_name_header_key)
                        .map(String::as_str)
                        .unwrap_or_default();
                    let backend = self
                        .request_headers
                        .get(&self.config.selected_backend_header_key)
                        .map(String::as_str)
                        .unwrap_or_default();
                    program.evaluate(
                        model,
                        backend,
                        self.costs.input_tokens,
                        self.costs.output_tokens,
                        self.costs.total_tokens,
                    )?
                }
            };
            // Lossy by contract: the rate-limit consumer reads 32-bit counts.
            let truncated = value as u32;
            info!(
                metadata_key = cost.metadata_key.as_str(),
                cost = truncated,
                "setting request cost metadata"
            );
            fields.insert(
                cost.metadata_key.clone(),
                Value {
                    kind: Some(Kind::NumberValue(f64::from(truncated))),
                },
            );
        }
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(Struct {
            fields: HashMap::from([(
                self.config.metadata_namespace.clone(),
                Value {
                    kind: Some(Kind::StructValue(Struct { fields })),
                },
            )]),
        }))
    }

    fn decode_body(&self, body: &[u8]) -> Result<Vec<u8>, ProcessorError> {
        match self.response_encoding.as_deref() {
            // Works for buffered bodies only; gzip over streamed chunks is
            // not supported and surfaces as a decode failure.
            Some("gzip") => {
                let mut decoded = Vec::new();
                GzDecoder::new(body)
                    .read_to_end(&mut decoded)
                    .map_err(ProcessorError::Gzip)?;
                Ok(decoded)
            }
            _ => Ok(body.to_vec()),
        }
    }
}

#[async_trait]
impl Processor for ChatCompletionProcessor {
    async fn process_request_headers(
        &mut self,
        _headers: &HeaderMap,
    ) -> Result<ProcessingResponse, ProcessorError> {
        // Headers were captured when the processor was constructed.
        Ok(request_headers_response(None))
    }

    async fn process_request_body(
        &mut self,
        body: &HttpBody,
    ) -> Result<ProcessingResponse, ProcessorError> {
        let request: ChatCompletionsRequest =
            serde_json::from_slice(&body.body).map_err(|e| {
                self.record_error();
                ProcessorError::BodyParse(e)
            })?;
        let model = request.model.clone();
        info!(
            path = self
                .request_headers
                .get(":path")
                .map(String::as_str)
                .unwrap_or_default(),
            model = model.as_str(),
            "processing request"
        );

        self.model_name = model.clone();
        self.request_headers
            .insert(self.config.model_name_header_key.clone(), model.clone());

        let backend = match self.config.router.calculate(&self.request_headers) {
            Ok(backend) => backend,
            Err(err @ RouterError::NoMatchingRule) => {
                self.record_error();
                return Ok(immediate_response(
                    StatusCode::NotFound,
                    err.to_string().into_bytes(),
                ));
            }
        };
        info!(backend = backend.name.as_str(), "selected backend");
        self.backend_name = backend.name.clone();
        let backend_schema = backend.schema.name;
        let backend_name = backend.name.clone();

        let mut translator = match Translator::for_schemas(
            self.config.input_schema.name,
            backend_schema,
        ) {
            Some(translator) => translator,
            None => {
                self.record_error();
                return Err(ProcessorError::UnsupportedSchema(format!(
                    "backend={backend_schema}"
                )));
            }
        };

        let transform = translator.request_body(request).inspect_err(|_| {
            self.record_error();
        })?;
        self.translator = Some(translator);

        let mut header_mutation = transform
            .header_mutation
            .map(mutation::from_translator)
            .unwrap_or_default();
        mutation::set_header(
            &mut header_mutation,
            &self.config.model_name_header_key,
            model.as_bytes(),
        );
        mutation::set_header(
            &mut header_mutation,
            &self.config.selected_backend_header_key,
            backend_name.as_bytes(),
        );
        self.apply_header_mutation(&header_mutation);

        if let Some(handler) = self.config.backend_auth_handlers.get(&backend_name) {
            let handler = Arc::clone(handler);
            let result = handler
                .do_auth(
                    &self.request_headers,
                    &mut header_mutation,
                    transform.body.as_deref(),
                )
                .await;
            if let Err(e) = result {
                self.record_error();
                return Err(e.into());
            }
        }

        let mode_override = match transform.response_body_mode {
            Some(ResponseBodyMode::Streamed) => {
                self.streaming = true;
                Some(ProcessingMode {
                    response_header_mode: processing_mode::HeaderSendMode::Send as i32,
                    response_body_mode: processing_mode::BodySendMode::Streamed as i32,
                    ..Default::default()
                })
            }
            _ => None,
        };

        self.metrics.start_request();
        Ok(ProcessingResponse {
            response: Some(processing_response::Response::RequestBody(BodyResponse {
                response: Some(CommonResponse {
                    header_mutation: Some(header_mutation),
                    body_mutation: transform.body.map(mutation::replace_body),
                    clear_route_cache: true,
                    ..Default::default()
                }),
            })),
            mode_override,
            ..Default::default()
        })
    }

    async fn process_response_headers(
        &mut self,
        headers: &HeaderMap,
    ) -> Result<ProcessingResponse, ProcessorError> {
        self.response_headers = headers_to_map(headers);
        if let Some(encoding) = self.response_headers.get("content-encoding") {
            self.response_encoding = Some(encoding.clone());
        }
        // The response may come from an earlier filter without a preceding
        // request-body phase; there is no translator to consult then.
        let Some(translator) = self.translator.as_mut() else {
            return Ok(response_headers_response(None));
        };
        let header_mutation = match translator.response_headers(&self.response_headers) {
            Ok(header_mutation) => header_mutation,
            Err(e) => {
                self.record_error();
                return Err(e.into());
            }
        };
        Ok(response_headers_response(Some(CommonResponse {
            header_mutation: header_mutation.map(mutation::from_translator),
            ..Default::default()
        })))
    }

    async fn process_response_body(
        &mut self,
        body: &HttpBody,
    ) -> Result<ProcessingResponse, ProcessorError> {
        let decoded = self.decode_body(&body.body)?;
        let Some(translator) = self.translator.as_mut() else {
            return Ok(ProcessingResponse {
                response: Some(processing_response::Response::ResponseBody(
                    BodyResponse::default(),
                )),
                ..Default::default()
            });
        };
        let transform = translator.response_body(&self.response_headers, &decoded, body.end_of_stream);
        let transform = match transform {
            Ok(transform) => transform,
            Err(e) => {
                self.record_error();
                return Err(e.into());
            }
        };

        self.costs.accumulate(transform.token_usage);
        self.metrics.update_token_metrics(
            &self.backend_name,
            &self.model_name,
            transform.token_usage.input_tokens,
            transform.token_usage.output_tokens,
            transform.token_usage.total_tokens,
        );
        if self.streaming {
            self.metrics.update_latency_metrics(
                &self.backend_name,
                &self.model_name,
                transform.token_usage.output_tokens,
            );
        }
        debug!(
            input_tokens = self.costs.input_tokens,
            output_tokens = self.costs.output_tokens,
            total_tokens = self.costs.total_tokens,
            end_of_stream = body.end_of_stream,
            "accumulated token usage"
        );

        let mut response = ProcessingResponse {
            response: Some(processing_response::Response::ResponseBody(BodyResponse {
                response: Some(CommonResponse {
                    header_mutation: transform.header_mutation.map(mutation::from_translator),
                    body_mutation: transform.body.map(mutation::replace_body),
                    ..Default::default()
                }),
            })),
            ..Default::default()
        };

        if body.end_of_stream {
            if !self.config.request_costs.is_empty() {
                response.dynamic_metadata = match self.build_dynamic_metadata() {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        self.record_error();
                        return Err(e);
                    }
                };
            }
            self.metrics
                .record_request_completion(&self.backend_name, &self.model_name, true);
        }
        Ok(response)
    }
}
