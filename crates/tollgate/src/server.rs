//! gRPC shell for the proxy's external-processing stream.
//!
//! Each accepted stream runs on its own task: events are read in arrival
//! order, dispatched to the stream's processor, and answered on the same
//! stream. A processor failure ends that stream with a gRPC error without
//! touching the listener or any peer stream.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use envoy_types::pb::envoy::service::ext_proc::v3::external_processor_server::ExternalProcessor;
use envoy_types::pb::envoy::service::ext_proc::v3::{
    processing_request, processing_response, ProcessingRequest, ProcessingResponse,
    TrailersResponse,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

use common::configuration::FilterConfig;

use crate::config::{Snapshot, SnapshotError};
use crate::processor::{
    headers_to_map, ChatCompletionProcessor, ModelsProcessor, PassthroughProcessor, Processor,
    ProcessorFactory,
};

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
pub const MODELS_PATH: &str = "/v1/models";

pub struct ServerState {
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    generation: AtomicU64,
    factories: HashMap<&'static str, ProcessorFactory>,
}

impl ServerState {
    fn new() -> Self {
        let mut factories: HashMap<&'static str, ProcessorFactory> = HashMap::new();
        factories.insert(CHAT_COMPLETIONS_PATH, ChatCompletionProcessor::factory);
        factories.insert(MODELS_PATH, ModelsProcessor::factory);
        Self {
            snapshot: RwLock::new(None),
            generation: AtomicU64::new(0),
            factories,
        }
    }

    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// The external-processor service handle. Cloning shares the state.
#[derive(Clone)]
pub struct ExtProcService {
    state: Arc<ServerState>,
}

impl ExtProcService {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ServerState::new()),
        }
    }

    /// Compile and atomically publish a new configuration snapshot.
    ///
    /// On failure the previous snapshot stays published and the generation
    /// counter is untouched; in-flight streams are unaffected either way.
    pub fn update_config(&self, config: FilterConfig) -> Result<u64, SnapshotError> {
        let generation = self.state.generation.load(Ordering::Acquire) + 1;
        let snapshot = Arc::new(Snapshot::build(config, generation)?);
        *self
            .state
            .snapshot
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
        self.state.generation.store(generation, Ordering::Release);
        info!(generation, "published configuration snapshot");
        Ok(generation)
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }
}

impl Default for ExtProcService {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch one stream event to the stream's processor, constructing it on
/// the RequestHeaders event.
pub(crate) async fn handle_event(
    state: &ServerState,
    processor: &mut Option<Box<dyn Processor>>,
    request: processing_request::Request,
) -> Result<ProcessingResponse, Status> {
    match request {
        processing_request::Request::RequestHeaders(headers) => {
            let header_map = headers.headers.unwrap_or_default();
            let headers_map = headers_to_map(&header_map);
            let path = headers_map
                .get(":path")
                .map(String::as_str)
                .unwrap_or_default();
            let path = path.split('?').next().unwrap_or_default().to_string();

            let Some(snapshot) = state.snapshot() else {
                return Err(Status::failed_precondition("configuration not yet loaded"));
            };
            let factory = state
                .factories
                .get(path.as_str())
                .copied()
                .unwrap_or(PassthroughProcessor::factory);
            let mut new_processor = factory(snapshot, headers_map)
                .map_err(|e| Status::internal(format!("failed to set up stream: {e}")))?;
            let response = new_processor
                .process_request_headers(&header_map)
                .await
                .map_err(|e| Status::internal(e.to_string()))?;
            *processor = Some(new_processor);
            Ok(response)
        }
        processing_request::Request::RequestBody(body) => {
            let processor = processor
                .as_mut()
                .ok_or_else(|| Status::invalid_argument("request body before headers"))?;
            processor
                .process_request_body(&body)
                .await
                .map_err(|e| Status::internal(e.to_string()))
        }
        processing_request::Request::ResponseHeaders(headers) => {
            let processor = processor
                .as_mut()
                .ok_or_else(|| Status::invalid_argument("response headers before request"))?;
            processor
                .process_response_headers(&headers.headers.unwrap_or_default())
                .await
                .map_err(|e| Status::internal(e.to_string()))
        }
        processing_request::Request::ResponseBody(body) => {
            let processor = processor
                .as_mut()
                .ok_or_else(|| Status::invalid_argument("response body before request"))?;
            processor
                .process_response_body(&body)
                .await
                .map_err(|e| Status::internal(e.to_string()))
        }
        processing_request::Request::RequestTrailers(_) => Ok(ProcessingResponse {
            response: Some(processing_response::Response::RequestTrailers(
                TrailersResponse::default(),
            )),
            ..Default::default()
        }),
        processing_request::Request::ResponseTrailers(_) => Ok(ProcessingResponse {
            response: Some(processing_response::Response::ResponseTrailers(
                TrailersResponse::default(),
            )),
            ..Default::default()
        }),
    }
}

async fn run_stream(
    state: Arc<ServerState>,
    mut inbound: Streaming<ProcessingRequest>,
    tx: mpsc::Sender<Result<ProcessingResponse, Status>>,
) {
    let mut processor: Option<Box<dyn Processor>> = None;
    loop {
        let message = match inbound.message().await {
            Ok(Some(message)) => message,
            // Stream closed by the proxy; drop the processor with it.
            Ok(None) => break,
            Err(status) => {
                warn!(error = %status, "stream receive error");
                break;
            }
        };
        let Some(request) = message.request else {
            continue;
        };
        match handle_event(&state, &mut processor, request).await {
            Ok(response) => {
                if tx.send(Ok(response)).await.is_err() {
                    break;
                }
            }
            Err(status) => {
                warn!(error = %status, "stream processing error");
                let _ = tx.send(Err(status)).await;
                break;
            }
        }
    }
}

#[tonic::async_trait]
impl ExternalProcessor for ExtProcService {
    type ProcessStream =
        Pin<Box<dyn Stream<Item = Result<ProcessingResponse, Status>> + Send + 'static>>;

    async fn process(
        &self,
        request: Request<Streaming<ProcessingRequest>>,
    ) -> Result<Response<Self::ProcessStream>, Status> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(run_stream(self.state(), inbound, tx));
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::envoy::service::ext_proc::v3::HttpHeaders;

    fn valid_config() -> FilterConfig {
        FilterConfig::from_yaml(
            r#"
inputSchema: {name: OpenAI, version: v1}
declaredModels: [gpt-4o]
rules:
  - headers: [{name: x-model, value: gpt}]
    backends:
      - name: openai-a
        schema: {name: OpenAI, version: v1}
        weight: 100
"#,
        )
        .unwrap()
    }

    fn broken_config() -> FilterConfig {
        FilterConfig::from_yaml(
            r#"
inputSchema: {name: OpenAI, version: v1}
requestCosts:
  - metadataKey: cost
    type: CEL
    cel: "input_tokens +"
"#,
        )
        .unwrap()
    }

    #[test]
    fn failed_update_keeps_previous_snapshot_and_generation() {
        let service = ExtProcService::new();
        assert!(service.state().snapshot().is_none());

        service.update_config(valid_config()).unwrap();
        let state = service.state();
        assert_eq!(state.generation(), 1);
        let before = state.snapshot().unwrap();

        let err = service.update_config(broken_config()).unwrap_err();
        assert!(matches!(err, SnapshotError::Cost(_)));
        assert_eq!(state.generation(), 1);
        assert!(Arc::ptr_eq(&state.snapshot().unwrap(), &before));

        service.update_config(valid_config()).unwrap();
        assert_eq!(state.generation(), 2);
    }

    #[tokio::test]
    async fn request_headers_dispatches_by_path() {
        let service = ExtProcService::new();
        service.update_config(valid_config()).unwrap();
        let state = service.state();

        let mut processor = None;
        let headers = processing_request::Request::RequestHeaders(HttpHeaders {
            headers: Some(crate::processor::test_support::header_map(&[(
                ":path",
                "/v1/models?limit=10",
            )])),
            ..Default::default()
        });
        let response = handle_event(&state, &mut processor, headers).await.unwrap();
        assert!(matches!(
            response.response,
            Some(processing_response::Response::ImmediateResponse(_))
        ));
    }

    #[tokio::test]
    async fn unknown_path_falls_back_to_passthrough() {
        let service = ExtProcService::new();
        service.update_config(valid_config()).unwrap();
        let state = service.state();

        let mut processor = None;
        let headers = processing_request::Request::RequestHeaders(HttpHeaders {
            headers: Some(crate::processor::test_support::header_map(&[(
                ":path",
                "/v1/embeddings",
            )])),
            ..Default::default()
        });
        let response = handle_event(&state, &mut processor, headers).await.unwrap();
        assert!(matches!(
            response.response,
            Some(processing_response::Response::RequestHeaders(_))
        ));
        assert!(processor.is_some());
    }

    #[tokio::test]
    async fn body_before_headers_is_invalid() {
        let service = ExtProcService::new();
        service.update_config(valid_config()).unwrap();
        let state = service.state();

        let mut processor = None;
        let body = processing_request::Request::RequestBody(Default::default());
        let status = handle_event(&state, &mut processor, body).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}
