//! The `/v1/models` processor: answers directly from the snapshot's
//! declared model list, with no router, translator, or auth involved.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use envoy_types::pb::envoy::config::core::v3::HeaderMap;
use envoy_types::pb::envoy::r#type::v3::{HttpStatus, StatusCode};
use envoy_types::pb::envoy::service::ext_proc::v3::{
    processing_response, BodyResponse, HttpBody, ImmediateResponse, ProcessingResponse,
};
use janusllm::apis::openai::{ModelDetail, Models};
use janusllm::ApiSchema;

use crate::config::Snapshot;
use crate::mutation::set_header;

use super::{response_headers_response, Processor, ProcessorError};

pub struct ModelsProcessor {
    body: Vec<u8>,
}

impl ModelsProcessor {
    pub fn factory(
        config: Arc<Snapshot>,
        _request_headers: HashMap<String, String>,
    ) -> Result<Box<dyn Processor>, ProcessorError> {
        if config.input_schema.name != ApiSchema::OpenAi {
            return Err(ProcessorError::UnsupportedSchema(
                config.input_schema.to_string(),
            ));
        }
        let listing = Models {
            object: "list".to_string(),
            data: config
                .declared_models
                .iter()
                .map(|model| ModelDetail {
                    id: model.clone(),
                    object: "model".to_string(),
                    created: 0,
                    owned_by: "tollgate".to_string(),
                })
                .collect(),
        };
        let body = serde_json::to_vec(&listing).map_err(ProcessorError::BodyEncode)?;
        Ok(Box::new(Self { body }))
    }
}

#[async_trait]
impl Processor for ModelsProcessor {
    async fn process_request_headers(
        &mut self,
        _headers: &HeaderMap,
    ) -> Result<ProcessingResponse, ProcessorError> {
        let mut headers = envoy_types::pb::envoy::service::ext_proc::v3::HeaderMutation::default();
        set_header(&mut headers, "content-type", b"application/json");
        set_header(
            &mut headers,
            "content-length",
            self.body.len().to_string().as_bytes(),
        );
        Ok(ProcessingResponse {
            response: Some(processing_response::Response::ImmediateResponse(
                ImmediateResponse {
                    status: Some(HttpStatus {
                        code: StatusCode::Ok as i32,
                    }),
                    headers: Some(headers),
                    body: self.body.clone(),
                    ..Default::default()
                },
            )),
            ..Default::default()
        })
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
