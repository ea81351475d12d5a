use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

// ============================================================================
// CONVERSE REQUEST
// ============================================================================

/// Amazon Bedrock Converse request body.
///
/// The model id travels in the request path (`/model/{modelId}/converse`),
/// never in the body, so it is skipped during serialization.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ConverseRequest {
    #[serde(skip)]
    pub model_id: String,
    pub messages: Option<Vec<BedrockMessage>>,
    pub system: Option<Vec<SystemContentBlock>>,
    #[serde(rename = "inferenceConfig")]
    pub inference_config: Option<InferenceConfiguration>,
    #[serde(rename = "toolConfig")]
    pub tool_config: Option<ToolConfiguration>,
    #[serde(skip)]
    pub stream: bool,
}

impl ConverseRequest {
    /// Request path for the Converse endpoint matching this request's mode.
    pub fn endpoint_path(&self) -> String {
        if self.stream {
            format!("/model/{}/converse-stream", self.model_id)
        } else {
            format!("/model/{}/converse", self.model_id)
        }
    }
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InferenceConfiguration {
    #[serde(rename = "maxTokens")]
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    #[serde(rename = "topP")]
    pub top_p: Option<f32>,
    #[serde(rename = "stopSequences")]
    pub stop_sequences: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BedrockMessage {
    pub role: ConversationRole,
    pub content: Vec<ContentBlock>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationRole {
    User,
    Assistant,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        image: ImageBlock,
    },
    ToolUse {
        #[serde(rename = "toolUse")]
        tool_use: ToolUseBlock,
    },
    ToolResult {
        #[serde(rename = "toolResult")]
        tool_result: ToolResultBlock,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImageBlock {
    pub format: String,
    pub source: ImageSource,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    Bytes { bytes: String },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ToolUseBlock {
    #[serde(rename = "toolUseId")]
    pub tool_use_id: String,
    pub name: String,
    pub input: Value,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ToolResultBlock {
    #[serde(rename = "toolUseId")]
    pub tool_use_id: String,
    pub content: Vec<ToolResultContentBlock>,
    pub status: Option<ToolResultStatus>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum ToolResultContentBlock {
    Text { text: String },
    Json { json: Value },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolResultStatus {
    Success,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum SystemContentBlock {
    Text { text: String },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ToolConfiguration {
    pub tools: Option<Vec<BedrockTool>>,
    #[serde(rename = "toolChoice")]
    pub tool_choice: Option<BedrockToolChoice>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum BedrockTool {
    #[serde(rename = "toolSpec")]
    ToolSpec(ToolSpecDefinition),
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ToolSpecDefinition {
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: ToolInputSchema,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ToolInputSchema {
    pub json: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum BedrockToolChoice {
    #[serde(rename = "auto")]
    Auto(AutoChoice),
    #[serde(rename = "any")]
    Any(AnyChoice),
    #[serde(rename = "tool")]
    Tool(ToolChoiceSpec),
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AutoChoice {}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AnyChoice {}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ToolChoiceSpec {
    pub name: String,
}

// ============================================================================
// CONVERSE RESPONSE
// ============================================================================

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConverseResponse {
    pub output: ConverseOutput,
    #[serde(rename = "stopReason")]
    pub stop_reason: StopReason,
    pub usage: BedrockTokenUsage,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum ConverseOutput {
    Message { message: BedrockMessage },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    GuardrailIntervened,
    ContentFiltered,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default)]
pub struct BedrockTokenUsage {
    #[serde(rename = "inputTokens", default)]
    pub input_tokens: u64,
    #[serde(rename = "outputTokens", default)]
    pub output_tokens: u64,
    #[serde(rename = "totalTokens", default)]
    pub total_tokens: u64,
}

// ============================================================================
// CONVERSE STREAM EVENT PAYLOADS
// ============================================================================

/// Payloads carried by the `:event-type` frames of a ConverseStream
/// response. The frame header names the variant; the payload is plain JSON.
#[derive(Debug, Clone)]
pub enum ConverseStreamEvent {
    MessageStart(MessageStartEvent),
    ContentBlockStart(ContentBlockStartEvent),
    ContentBlockDelta(ContentBlockDeltaEvent),
    ContentBlockStop(ContentBlockStopEvent),
    MessageStop(MessageStopEvent),
    Metadata(ConverseStreamMetadataEvent),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MessageStartEvent {
    pub role: ConversationRole,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ContentBlockStartEvent {
    #[serde(rename = "contentBlockIndex")]
    pub content_block_index: u32,
    pub start: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ContentBlockDeltaEvent {
    #[serde(rename = "contentBlockIndex")]
    pub content_block_index: u32,
    pub delta: ContentBlockDelta,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ContentBlockDelta {
    pub text: Option<String>,
    #[serde(rename = "toolUse")]
    pub tool_use: Option<ToolUseDelta>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ToolUseDelta {
    pub input: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ContentBlockStopEvent {
    #[serde(rename = "contentBlockIndex")]
    pub content_block_index: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MessageStopEvent {
    #[serde(rename = "stopReason")]
    pub stop_reason: StopReason,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConverseStreamMetadataEvent {
    pub usage: BedrockTokenUsage,
    #[serde(default)]
    pub metrics: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn converse_request_omits_model_id_from_body() {
        let req = ConverseRequest {
            model_id: "anthropic.claude-3-sonnet-20240229-v1:0".to_string(),
            messages: Some(vec![BedrockMessage {
                role: ConversationRole::User,
                content: vec![ContentBlock::Text {
                    text: "hi".to_string(),
                }],
            }]),
            ..Default::default()
        };
        let body = serde_json::to_value(&req).unwrap();
        assert!(body.get("modelId").is_none());
        assert!(body.get("model_id").is_none());
        assert_eq!(body["messages"][0]["content"][0]["text"], "hi");
    }

    #[test]
    fn endpoint_path_tracks_stream_flag() {
        let mut req = ConverseRequest {
            model_id: "amazon.titan-text-express-v1".to_string(),
            ..Default::default()
        };
        assert_eq!(
            req.endpoint_path(),
            "/model/amazon.titan-text-express-v1/converse"
        );
        req.stream = true;
        assert_eq!(
            req.endpoint_path(),
            "/model/amazon.titan-text-express-v1/converse-stream"
        );
    }

    #[test]
    fn parses_converse_response() {
        let body = r#"{
            "output": {"message": {"role": "assistant", "content": [{"text": "hello"}]}},
            "stopReason": "end_turn",
            "usage": {"inputTokens": 7, "outputTokens": 3, "totalTokens": 10}
        }"#;
        let resp: ConverseResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.stop_reason, StopReason::EndTurn);
        assert_eq!(resp.usage.input_tokens, 7);
        let ConverseOutput::Message { message } = resp.output;
        assert_eq!(message.role, ConversationRole::Assistant);
    }

    #[test]
    fn parses_stream_metadata_payload() {
        let payload = r#"{"usage":{"inputTokens":13,"outputTokens":12,"totalTokens":25},"metrics":{"latencyMs":42}}"#;
        let event: ConverseStreamMetadataEvent = serde_json::from_str(payload).unwrap();
        assert_eq!(event.usage.total_tokens, 25);
    }
}
