//! Translation between OpenAI chat completions and the Amazon Bedrock
//! Converse API.
//!
//! Requests are re-encoded into the Converse JSON shape with the model id
//! moved into the `:path` pseudo-header. Non-streaming responses are decoded
//! once and re-encoded as an OpenAI chat completion. Streaming responses
//! arrive as AWS event-stream frames and leave as OpenAI `data:` chunks.

use serde::Deserialize;
use serde_json::Value;

use crate::apis::amazon_bedrock::{
    AnyChoice, AutoChoice, BedrockMessage, BedrockTool, BedrockToolChoice, ContentBlock,
    ConversationRole, ConverseOutput, ConverseRequest, ConverseResponse, ConverseStreamEvent,
    ImageBlock, ImageSource, InferenceConfiguration, StopReason, SystemContentBlock,
    ToolChoiceSpec, ToolConfiguration, ToolInputSchema, ToolResultBlock, ToolResultContentBlock,
    ToolResultStatus, ToolSpecDefinition, ToolUseBlock,
};
use crate::apis::bedrock_stream::BedrockFrameDecoder;
use crate::apis::openai::{
    ChatCompletionsRequest, ChatCompletionsResponse, ChatCompletionsStreamChunk, Choice,
    ContentPart, FinishReason, FunctionCall, FunctionCallDelta, Message, MessageContent,
    ResponseMessage, Role, StreamChoice, StreamDelta, ToolCall, ToolCallDelta, ToolChoice,
    ToolChoiceType, Usage,
};
use crate::apis::sse::DONE_SENTINEL;

use super::{
    current_timestamp, is_good_status, is_json_content_type, status_code, synthesize_error_body,
    HeaderFields, HeaderMutation, LlmTokenUsage, RequestTransform, ResponseBodyMode,
    ResponseTransform, TranslatorError, CONTENT_LENGTH_HEADER, CONTENT_TYPE_HEADER,
    JSON_CONTENT_TYPE,
};

const BACKEND_ERROR_TAG: &str = "AWSBedrockBackendError";
const ERROR_TYPE_HEADER: &str = "x-amzn-errortype";
const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";
const PATH_HEADER: &str = ":path";

#[derive(Default)]
pub struct OpenAiToBedrockTranslator {
    stream: bool,
    model: String,
    chunk_id: String,
    frame_decoder: BedrockFrameDecoder,
    usage_captured: bool,
}

impl OpenAiToBedrockTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_body(
        &mut self,
        request: ChatCompletionsRequest,
    ) -> Result<RequestTransform, TranslatorError> {
        self.model = request.model.clone();
        self.stream = request.is_streaming();
        self.chunk_id = format!("chatcmpl-{}", current_timestamp());

        let converse = ConverseRequest::try_from(request)?;
        let body = serde_json::to_vec(&converse).map_err(TranslatorError::Encode)?;
        let header_mutation = HeaderMutation::default()
            .set(PATH_HEADER, converse.endpoint_path())
            .set(CONTENT_LENGTH_HEADER, body.len().to_string());

        Ok(RequestTransform {
            header_mutation: Some(header_mutation),
            body: Some(body),
            response_body_mode: self.stream.then_some(ResponseBodyMode::Streamed),
        })
    }

    pub fn response_headers(
        &mut self,
        _headers: &HeaderFields,
    ) -> Result<Option<HeaderMutation>, TranslatorError> {
        // Body length always changes; content-type leaves the AWS framing.
        let content_type = if self.stream {
            EVENT_STREAM_CONTENT_TYPE
        } else {
            JSON_CONTENT_TYPE
        };
        Ok(Some(
            HeaderMutation::default()
                .set(CONTENT_TYPE_HEADER, content_type)
                .remove(CONTENT_LENGTH_HEADER),
        ))
    }

    pub fn response_body(
        &mut self,
        headers: &HeaderFields,
        body: &[u8],
        end_of_stream: bool,
    ) -> Result<ResponseTransform, TranslatorError> {
        if let Some(status) = status_code(headers) {
            if !is_good_status(status) {
                return self.response_error(headers, body);
            }
        }
        if self.stream {
            return self.translate_stream_chunk(body, end_of_stream);
        }

        if !end_of_stream {
            return Ok(ResponseTransform::default());
        }
        let converse: ConverseResponse =
            serde_json::from_slice(body).map_err(TranslatorError::ResponseDecode)?;
        let usage = converse.usage;
        let total = if usage.total_tokens != 0 {
            usage.total_tokens
        } else {
            usage.input_tokens + usage.output_tokens
        };
        let response = self.build_openai_response(converse)?;
        let body = serde_json::to_vec(&response).map_err(TranslatorError::Encode)?;

        Ok(ResponseTransform {
            header_mutation: Some(
                HeaderMutation::default().set(CONTENT_LENGTH_HEADER, body.len().to_string()),
            ),
            body: Some(body),
            token_usage: LlmTokenUsage::from_counts(usage.input_tokens, usage.output_tokens, total),
        })
    }

    pub fn response_error(
        &mut self,
        headers: &HeaderFields,
        body: &[u8],
    ) -> Result<ResponseTransform, TranslatorError> {
        let error_tag = headers
            .get(ERROR_TYPE_HEADER)
            .map(|kind| kind.as_str())
            .unwrap_or(BACKEND_ERROR_TAG);
        let message = if is_json_content_type(headers) {
            #[derive(Deserialize)]
            struct BedrockError {
                #[serde(default)]
                message: Option<String>,
            }
            serde_json::from_slice::<BedrockError>(body)
                .ok()
                .and_then(|e| e.message)
                .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned())
        } else {
            String::from_utf8_lossy(body).into_owned()
        };
        let synthesized = synthesize_error_body(error_tag, status_code(headers), message)?;
        Ok(ResponseTransform {
            header_mutation: Some(
                HeaderMutation::default()
                    .set(CONTENT_LENGTH_HEADER, synthesized.len().to_string())
                    .set(CONTENT_TYPE_HEADER, JSON_CONTENT_TYPE),
            ),
            body: Some(synthesized),
            ..Default::default()
        })
    }

    fn translate_stream_chunk(
        &mut self,
        body: &[u8],
        end_of_stream: bool,
    ) -> Result<ResponseTransform, TranslatorError> {
        self.frame_decoder.push(body);
        let mut out = Vec::new();
        let mut usage = LlmTokenUsage::default();

        while let Some(event) = self.frame_decoder.next_event()? {
            if let ConverseStreamEvent::Metadata(metadata) = &event {
                if !self.usage_captured {
                    self.usage_captured = true;
                    let counts = metadata.usage;
                    let total = if counts.total_tokens != 0 {
                        counts.total_tokens
                    } else {
                        counts.input_tokens + counts.output_tokens
                    };
                    usage = LlmTokenUsage::from_counts(
                        counts.input_tokens,
                        counts.output_tokens,
                        total,
                    );
                }
            }
            if let Some(chunk) = self.build_openai_chunk(event) {
                let payload = serde_json::to_vec(&chunk).map_err(TranslatorError::Encode)?;
                out.extend_from_slice(b"data: ");
                out.extend_from_slice(&payload);
                out.extend_from_slice(b"\n\n");
            }
        }
        if end_of_stream {
            out.extend_from_slice(format!("data: {DONE_SENTINEL}\n\n").as_bytes());
        }

        Ok(ResponseTransform {
            body: Some(out),
            token_usage: usage,
            ..Default::default()
        })
    }

    /// Map one Converse stream event onto an OpenAI chunk. Events with no
    /// client-visible counterpart return `None`.
    fn build_openai_chunk(&self, event: ConverseStreamEvent) -> Option<ChatCompletionsStreamChunk> {
        let choice = |delta: StreamDelta, finish_reason: Option<FinishReason>| StreamChoice {
            index: 0,
            delta,
            finish_reason,
        };
        let (choices, usage) = match event {
            ConverseStreamEvent::MessageStart(start) => {
                let role = match start.role {
                    ConversationRole::User => Role::User,
                    ConversationRole::Assistant => Role::Assistant,
                };
                (
                    vec![choice(
                        StreamDelta {
                            role: Some(role),
                            ..Default::default()
                        },
                        None,
                    )],
                    None,
                )
            }
            ConverseStreamEvent::ContentBlockStart(start) => {
                let tool_use = start.start.as_ref()?.get("toolUse")?.clone();
                let tool_use: ToolUseStart = serde_json::from_value(tool_use).ok()?;
                (
                    vec![choice(
                        StreamDelta {
                            tool_calls: Some(vec![ToolCallDelta {
                                index: start.content_block_index,
                                id: Some(tool_use.tool_use_id),
                                call_type: Some("function".to_string()),
                                function: Some(FunctionCallDelta {
                                    name: Some(tool_use.name),
                                    arguments: Some(String::new()),
                                }),
                            }]),
                            ..Default::default()
                        },
                        None,
                    )],
                    None,
                )
            }
            ConverseStreamEvent::ContentBlockDelta(delta_event) => {
                let delta = if let Some(text) = delta_event.delta.text {
                    StreamDelta {
                        content: Some(text),
                        ..Default::default()
                    }
                } else if let Some(tool_use) = delta_event.delta.tool_use {
                    StreamDelta {
                        tool_calls: Some(vec![ToolCallDelta {
                            index: delta_event.content_block_index,
                            id: None,
                            call_type: None,
                            function: Some(FunctionCallDelta {
                                name: None,
                                arguments: tool_use.input,
                            }),
                        }]),
                        ..Default::default()
                    }
                } else {
                    return None;
                };
                (vec![choice(delta, None)], None)
            }
            ConverseStreamEvent::ContentBlockStop(_) => return None,
            ConverseStreamEvent::MessageStop(stop) => (
                vec![choice(
                    StreamDelta::default(),
                    Some(finish_reason_for(stop.stop_reason)),
                )],
                None,
            ),
            ConverseStreamEvent::Metadata(metadata) => (
                Vec::new(),
                Some(Usage {
                    prompt_tokens: metadata.usage.input_tokens,
                    completion_tokens: metadata.usage.output_tokens,
                    total_tokens: metadata.usage.total_tokens,
                }),
            ),
        };
        Some(ChatCompletionsStreamChunk {
            id: self.chunk_id.clone(),
            object: Some("chat.completion.chunk".to_string()),
            created: current_timestamp(),
            model: self.model.clone(),
            choices,
            usage,
        })
    }

    fn build_openai_response(
        &self,
        converse: ConverseResponse,
    ) -> Result<ChatCompletionsResponse, TranslatorError> {
        let ConverseOutput::Message { message } = converse.output;
        let role = match message.role {
            ConversationRole::User => Role::User,
            ConversationRole::Assistant => Role::Assistant,
        };

        let mut text_content = String::new();
        let mut tool_calls = Vec::new();
        for block in &message.content {
            match block {
                ContentBlock::Text { text } => text_content.push_str(text),
                ContentBlock::ToolUse { tool_use } => tool_calls.push(ToolCall {
                    id: tool_use.tool_use_id.clone(),
                    call_type: "function".to_string(),
                    function: FunctionCall {
                        name: tool_use.name.clone(),
                        arguments: serde_json::to_string(&tool_use.input)
                            .map_err(TranslatorError::Encode)?,
                    },
                }),
                _ => {}
            }
        }

        let usage = converse.usage;
        Ok(ChatCompletionsResponse {
            id: self.chunk_id.clone(),
            object: Some("chat.completion".to_string()),
            created: current_timestamp(),
            model: self.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role,
                    content: (!text_content.is_empty()).then_some(text_content),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                },
                finish_reason: Some(finish_reason_for(converse.stop_reason)),
                logprobs: None,
            }],
            usage: Usage {
                prompt_tokens: usage.input_tokens,
                completion_tokens: usage.output_tokens,
                total_tokens: if usage.total_tokens != 0 {
                    usage.total_tokens
                } else {
                    usage.input_tokens + usage.output_tokens
                },
            },
            system_fingerprint: None,
        })
    }
}

#[derive(Deserialize)]
struct ToolUseStart {
    #[serde(rename = "toolUseId")]
    tool_use_id: String,
    name: String,
}

fn finish_reason_for(stop_reason: StopReason) -> FinishReason {
    match stop_reason {
        StopReason::EndTurn | StopReason::StopSequence => FinishReason::Stop,
        StopReason::ToolUse => FinishReason::ToolCalls,
        StopReason::MaxTokens => FinishReason::Length,
        StopReason::GuardrailIntervened | StopReason::ContentFiltered => {
            FinishReason::ContentFilter
        }
    }
}

// ============================================================================
// REQUEST RE-ENCODING
// ============================================================================

impl TryFrom<ChatCompletionsRequest> for ConverseRequest {
    type Error = TranslatorError;

    fn try_from(request: ChatCompletionsRequest) -> Result<Self, Self::Error> {
        let stream = request.is_streaming();
        let mut system = Vec::new();
        let mut messages = Vec::new();

        for message in request.messages {
            match message.role {
                Role::System => system.push(SystemContentBlock::Text {
                    text: message.content.extract_text(),
                }),
                _ => messages.push(BedrockMessage::try_from(message)?),
            }
        }

        let max_tokens = request.max_completion_tokens.or(request.max_tokens);
        let inference_config = (max_tokens.is_some()
            || request.temperature.is_some()
            || request.top_p.is_some()
            || request.stop.is_some())
        .then(|| InferenceConfiguration {
            max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop,
        });

        let tool_config = build_tool_config(request.tools, request.tool_choice);

        Ok(ConverseRequest {
            model_id: request.model,
            messages: (!messages.is_empty()).then_some(messages),
            system: (!system.is_empty()).then_some(system),
            inference_config,
            tool_config,
            stream,
        })
    }
}

impl TryFrom<Message> for BedrockMessage {
    type Error = TranslatorError;

    fn try_from(message: Message) -> Result<Self, Self::Error> {
        match message.role {
            Role::System => Err(TranslatorError::UnsupportedRequest(
                "system messages are carried in the system field".to_string(),
            )),
            Role::User => {
                let mut content = Vec::new();
                match message.content {
                    MessageContent::Text(text) => {
                        if !text.is_empty() {
                            content.push(ContentBlock::Text { text });
                        }
                    }
                    MessageContent::Parts(parts) => {
                        for part in parts {
                            match part {
                                ContentPart::Text { text } => {
                                    if !text.is_empty() {
                                        content.push(ContentBlock::Text { text });
                                    }
                                }
                                ContentPart::ImageUrl { image_url } => {
                                    content.push(image_block_from_data_url(&image_url.url)?);
                                }
                            }
                        }
                    }
                }
                if content.is_empty() {
                    // Converse rejects messages with no content blocks.
                    content.push(ContentBlock::Text {
                        text: String::new(),
                    });
                }
                Ok(BedrockMessage {
                    role: ConversationRole::User,
                    content,
                })
            }
            Role::Assistant => {
                let mut content = Vec::new();
                let text = message.content.extract_text();
                if !text.is_empty() {
                    content.push(ContentBlock::Text { text });
                }
                for call in message.tool_calls.unwrap_or_default() {
                    let input: Value = serde_json::from_str(&call.function.arguments)
                        .unwrap_or(Value::Null);
                    content.push(ContentBlock::ToolUse {
                        tool_use: ToolUseBlock {
                            tool_use_id: call.id,
                            name: call.function.name,
                            input,
                        },
                    });
                }
                Ok(BedrockMessage {
                    role: ConversationRole::Assistant,
                    content,
                })
            }
            Role::Tool => {
                let tool_call_id = message.tool_call_id.ok_or_else(|| {
                    TranslatorError::UnsupportedRequest(
                        "tool message without tool_call_id".to_string(),
                    )
                })?;
                let text = message.content.extract_text();
                let content = match serde_json::from_str::<Value>(&text) {
                    Ok(json @ Value::Object(_)) => ToolResultContentBlock::Json { json },
                    _ => ToolResultContentBlock::Text { text },
                };
                Ok(BedrockMessage {
                    role: ConversationRole::User,
                    content: vec![ContentBlock::ToolResult {
                        tool_result: ToolResultBlock {
                            tool_use_id: tool_call_id,
                            content: vec![content],
                            status: Some(ToolResultStatus::Success),
                        },
                    }],
                })
            }
        }
    }
}

fn build_tool_config(
    tools: Option<Vec<crate::apis::openai::Tool>>,
    tool_choice: Option<ToolChoice>,
) -> Option<ToolConfiguration> {
    if tools.is_none() && tool_choice.is_none() {
        return None;
    }
    let tools = tools.map(|tools| {
        tools
            .into_iter()
            .map(|tool| {
                BedrockTool::ToolSpec(ToolSpecDefinition {
                    name: tool.function.name,
                    description: tool.function.description,
                    input_schema: ToolInputSchema {
                        json: tool.function.parameters,
                    },
                })
            })
            .collect::<Vec<_>>()
    });
    let tool_choice = tool_choice
        .map(|choice| match choice {
            ToolChoice::Type(kind) => match kind {
                ToolChoiceType::Auto | ToolChoiceType::None => {
                    // Converse has no explicit "none"; auto is the closest fit.
                    BedrockToolChoice::Auto(AutoChoice {})
                }
                ToolChoiceType::Required => BedrockToolChoice::Any(AnyChoice {}),
            },
            ToolChoice::Function { function, .. } => BedrockToolChoice::Tool(ToolChoiceSpec {
                name: function.name,
            }),
        })
        .or_else(|| tools.as_ref().map(|_| BedrockToolChoice::Auto(AutoChoice {})));
    Some(ToolConfiguration { tools, tool_choice })
}

fn image_block_from_data_url(url: &str) -> Result<ContentBlock, TranslatorError> {
    let stripped = url.strip_prefix("data:image/").ok_or_else(|| {
        TranslatorError::UnsupportedRequest(
            "only base64 data URLs are supported for images".to_string(),
        )
    })?;
    let (format, rest) = stripped.split_once(";base64,").ok_or_else(|| {
        TranslatorError::UnsupportedRequest(
            "only base64 data URLs are supported for images".to_string(),
        )
    })?;
    Ok(ContentBlock::Image {
        image: ImageBlock {
            format: format.to_string(),
            source: ImageSource::Bytes {
                bytes: rest.to_string(),
            },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::bedrock_stream::test_support::encode_event_frame;
    use pretty_assertions::assert_eq;

    fn user_request(model: &str, text: &str) -> ChatCompletionsRequest {
        ChatCompletionsRequest {
            model: model.to_string(),
            messages: vec![Message {
                role: Role::User,
                content: MessageContent::Text(text.to_string()),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            }],
            ..Default::default()
        }
    }

    fn ok_headers() -> HeaderFields {
        HeaderFields::from([
            (":status".to_string(), "200".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ])
    }

    #[test]
    fn request_is_re_encoded_as_converse() {
        let mut translator = OpenAiToBedrockTranslator::new();
        let transform = translator
            .request_body(user_request("anthropic.claude-3-sonnet-20240229-v1:0", "hi"))
            .unwrap();

        let raw_body = transform.body.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&raw_body).unwrap();
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["text"], "hi");

        let mutation = transform.header_mutation.unwrap();
        assert!(mutation.set.contains(&(
            ":path".to_string(),
            "/model/anthropic.claude-3-sonnet-20240229-v1:0/converse".to_string()
        )));
        assert!(mutation
            .set
            .contains(&("content-length".to_string(), raw_body.len().to_string())));
        assert_eq!(transform.response_body_mode, None);
    }

    #[test]
    fn streaming_request_targets_converse_stream() {
        let mut translator = OpenAiToBedrockTranslator::new();
        let mut request = user_request("amazon.titan-text-express-v1", "hi");
        request.stream = Some(true);
        let transform = translator.request_body(request).unwrap();
        let mutation = transform.header_mutation.unwrap();
        assert!(mutation.set.contains(&(
            ":path".to_string(),
            "/model/amazon.titan-text-express-v1/converse-stream".to_string()
        )));
        assert_eq!(
            transform.response_body_mode,
            Some(ResponseBodyMode::Streamed)
        );
    }

    #[test]
    fn system_and_sampling_parameters_are_renamed() {
        let mut translator = OpenAiToBedrockTranslator::new();
        let request = ChatCompletionsRequest {
            model: "m".to_string(),
            messages: vec![
                Message {
                    role: Role::System,
                    content: MessageContent::Text("be terse".to_string()),
                    name: None,
                    tool_calls: None,
                    tool_call_id: None,
                },
                Message {
                    role: Role::User,
                    content: MessageContent::Text("hi".to_string()),
                    name: None,
                    tool_calls: None,
                    tool_call_id: None,
                },
            ],
            max_tokens: Some(128),
            temperature: Some(0.2),
            ..Default::default()
        };
        let transform = translator.request_body(request).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&transform.body.unwrap()).unwrap();
        assert_eq!(body["system"][0]["text"], "be terse");
        assert_eq!(body["inferenceConfig"]["maxTokens"], 128);
        assert!((body["inferenceConfig"]["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn tools_are_restructured_into_tool_config() {
        use crate::apis::openai::{FunctionDefinition, Tool};
        let mut translator = OpenAiToBedrockTranslator::new();
        let mut request = user_request("m", "weather?");
        request.tools = Some(vec![Tool {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: "get_weather".to_string(),
                description: Some("look up weather".to_string()),
                parameters: Some(serde_json::json!({"type": "object", "properties": {}})),
            },
        }]);
        let transform = translator.request_body(request).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&transform.body.unwrap()).unwrap();
        assert_eq!(
            body["toolConfig"]["tools"][0]["toolSpec"]["name"],
            "get_weather"
        );
        assert!(body["toolConfig"]["toolChoice"]["auto"].is_object());
    }

    #[test]
    fn converse_response_becomes_openai_response() {
        let mut translator = OpenAiToBedrockTranslator::new();
        translator.request_body(user_request("m", "hi")).unwrap();

        let upstream = br#"{
            "output": {"message": {"role": "assistant", "content": [{"text": "hello there"}]}},
            "stopReason": "end_turn",
            "usage": {"inputTokens": 7, "outputTokens": 3, "totalTokens": 10}
        }"#;
        let transform = translator
            .response_body(&ok_headers(), upstream, true)
            .unwrap();
        assert_eq!(transform.token_usage, LlmTokenUsage::from_counts(7, 3, 10));

        let body: serde_json::Value = serde_json::from_slice(&transform.body.unwrap()).unwrap();
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["message"]["content"], "hello there");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(body["usage"]["prompt_tokens"], 7);
        assert_eq!(body["usage"]["completion_tokens"], 3);
        assert_eq!(body["usage"]["total_tokens"], 10);
    }

    #[test]
    fn stream_frames_become_openai_sse_chunks() {
        let mut translator = OpenAiToBedrockTranslator::new();
        let mut request = user_request("m", "hi");
        request.stream = Some(true);
        translator.request_body(request).unwrap();

        let mut wire = Vec::new();
        wire.extend(encode_event_frame(
            "messageStart",
            r#"{"role":"assistant"}"#,
        ));
        wire.extend(encode_event_frame(
            "contentBlockDelta",
            r#"{"contentBlockIndex":0,"delta":{"text":"Hello"}}"#,
        ));
        wire.extend(encode_event_frame(
            "messageStop",
            r#"{"stopReason":"end_turn"}"#,
        ));
        wire.extend(encode_event_frame(
            "metadata",
            r#"{"usage":{"inputTokens":7,"outputTokens":3,"totalTokens":10}}"#,
        ));

        let headers = ok_headers();
        // Deliver with a split inside a frame to exercise re-assembly.
        let split = wire.len() / 2;
        let first = translator
            .response_body(&headers, &wire[..split], false)
            .unwrap();
        let second = translator
            .response_body(&headers, &wire[split..], true)
            .unwrap();

        let mut total = LlmTokenUsage::default();
        total.accumulate(first.token_usage);
        total.accumulate(second.token_usage);
        assert_eq!(total, LlmTokenUsage::from_counts(7, 3, 10));

        let mut out = first.body.unwrap();
        out.extend(second.body.unwrap());
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\"content\":\"Hello\""));
        assert!(text.contains("\"finish_reason\":\"stop\""));
        assert!(text.contains("\"total_tokens\":10"));
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    #[test]
    fn bedrock_error_is_wrapped_in_openai_shape() {
        let mut translator = OpenAiToBedrockTranslator::new();
        let headers = HeaderFields::from([
            (":status".to_string(), "429".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
            (
                "x-amzn-errortype".to_string(),
                "ThrottlingException".to_string(),
            ),
        ]);
        let transform = translator
            .response_body(&headers, br#"{"message":"Too many requests"}"#, true)
            .unwrap();
        let body: serde_json::Value =
            serde_json::from_slice(&transform.body.unwrap()).unwrap();
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "ThrottlingException");
        assert_eq!(body["error"]["code"], "429");
        assert_eq!(body["error"]["message"], "Too many requests");
    }

    #[test]
    fn plain_text_upstream_error_is_wrapped_verbatim() {
        let mut translator = OpenAiToBedrockTranslator::new();
        let headers = HeaderFields::from([
            (":status".to_string(), "503".to_string()),
            ("content-type".to_string(), "text/plain".to_string()),
        ]);
        let transform = translator
            .response_body(&headers, b"no healthy upstream", true)
            .unwrap();
        let body: serde_json::Value =
            serde_json::from_slice(&transform.body.unwrap()).unwrap();
        assert_eq!(body["error"]["message"], "no healthy upstream");
        assert_eq!(body["error"]["type"], "AWSBedrockBackendError");
    }

    #[test]
    fn tool_result_messages_fold_into_user_turns() {
        let message = Message {
            role: Role::Tool,
            content: MessageContent::Text(r#"{"temp": 21}"#.to_string()),
            name: None,
            tool_calls: None,
            tool_call_id: Some("call-1".to_string()),
        };
        let bedrock = BedrockMessage::try_from(message).unwrap();
        assert_eq!(bedrock.role, ConversationRole::User);
        match &bedrock.content[0] {
            ContentBlock::ToolResult { tool_result } => {
                assert_eq!(tool_result.tool_use_id, "call-1");
            }
            other => panic!("unexpected content block: {other:?}"),
        }
    }
}
