//! Passthrough translation for OpenAI-schema backends.
//!
//! Request and response bodies cross unmodified; the translator's job is
//! limited to flipping the response phase into streamed mode for streaming
//! requests, pulling token usage out of the response, and wrapping non-JSON
//! upstream failures in the OpenAI error envelope.

use crate::apis::openai::{ChatCompletionsRequest, ChatCompletionsResponse, ChatCompletionsStreamChunk};
use crate::apis::sse::{self, SseLineBuffer, DONE_SENTINEL};

use super::{
    is_good_status, is_json_content_type, status_code, synthesize_error_body, HeaderFields,
    HeaderMutation, LlmTokenUsage, RequestTransform, ResponseBodyMode, ResponseTransform,
    TranslatorError, CONTENT_LENGTH_HEADER,
};

const BACKEND_ERROR_TAG: &str = "OpenAIBackendError";

#[derive(Default)]
pub struct OpenAiToOpenAiTranslator {
    stream: bool,
    sse_buffer: SseLineBuffer,
    buffering_done: bool,
}

impl OpenAiToOpenAiTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_body(
        &mut self,
        request: ChatCompletionsRequest,
    ) -> Result<RequestTransform, TranslatorError> {
        let mut transform = RequestTransform::default();
        if request.is_streaming() {
            self.stream = true;
            transform.response_body_mode = Some(ResponseBodyMode::Streamed);
        }
        Ok(transform)
    }

    pub fn response_headers(
        &mut self,
        _headers: &HeaderFields,
    ) -> Result<Option<HeaderMutation>, TranslatorError> {
        Ok(None)
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
            let mut transform = ResponseTransform::default();
            if !self.buffering_done {
                self.sse_buffer.push(body);
                transform.token_usage = self.extract_usage_from_events();
            }
            if end_of_stream {
                self.sse_buffer.clear();
            }
            return Ok(transform);
        }

        if !end_of_stream {
            return Ok(ResponseTransform::default());
        }
        let response: ChatCompletionsResponse =
            serde_json::from_slice(body).map_err(TranslatorError::ResponseDecode)?;
        Ok(ResponseTransform {
            token_usage: LlmTokenUsage::from_counts(
                response.usage.prompt_tokens,
                response.usage.completion_tokens,
                response.usage.total_tokens,
            ),
            ..Default::default()
        })
    }

    pub fn response_error(
        &mut self,
        headers: &HeaderFields,
        body: &[u8],
    ) -> Result<ResponseTransform, TranslatorError> {
        // JSON upstream errors are already in the client's shape.
        if is_json_content_type(headers) {
            return Ok(ResponseTransform::default());
        }
        let synthesized = synthesize_error_body(
            BACKEND_ERROR_TAG,
            status_code(headers),
            String::from_utf8_lossy(body).into_owned(),
        )?;
        Ok(ResponseTransform {
            header_mutation: Some(
                HeaderMutation::default().set(CONTENT_LENGTH_HEADER, synthesized.len().to_string()),
            ),
            body: Some(synthesized),
            ..Default::default()
        })
    }

    /// Scan buffered SSE lines for the usage record. Content chunks before
    /// it are ignored; once usage is seen, later chunks are not re-parsed.
    fn extract_usage_from_events(&mut self) -> LlmTokenUsage {
        while let Some(line) = self.sse_buffer.next_line() {
            let Some(payload) = sse::data_payload(&line) else {
                continue;
            };
            if payload == DONE_SENTINEL.as_bytes() {
                continue;
            }
            let Ok(event) = serde_json::from_slice::<ChatCompletionsStreamChunk>(payload) else {
                continue;
            };
            if let Some(usage) = event.usage {
                self.buffering_done = true;
                self.sse_buffer.clear();
                return LlmTokenUsage::from_counts(
                    usage.prompt_tokens,
                    usage.completion_tokens,
                    usage.total_tokens,
                );
            }
        }
        LlmTokenUsage::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ok_headers() -> HeaderFields {
        HeaderFields::from([
            (":status".to_string(), "200".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ])
    }

    #[test]
    fn non_streaming_body_passes_through_untouched() {
        let mut translator = OpenAiToOpenAiTranslator::new();
        let body = br#"{"id":"chatcmpl-1","created":1,"model":"gpt-4o","choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        let transform = translator
            .response_body(&ok_headers(), body, true)
            .unwrap();
        assert!(transform.body.is_none());
        assert!(transform.header_mutation.is_none());
        assert_eq!(transform.token_usage, LlmTokenUsage::from_counts(10, 5, 15));
    }

    #[test]
    fn missing_usage_yields_zero_without_error() {
        let mut translator = OpenAiToOpenAiTranslator::new();
        let body = br#"{"id":"chatcmpl-1","created":1,"model":"gpt-4o","choices":[]}"#;
        let transform = translator
            .response_body(&ok_headers(), body, true)
            .unwrap();
        assert!(transform.token_usage.is_zero());
    }

    #[test]
    fn streaming_usage_survives_any_chunk_split() {
        let stream = b"data: {\"id\":\"c\",\"created\":1,\"model\":\"gpt\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hi\"},\"finish_reason\":null}]}\n\n\
data: {\"id\":\"c\",\"created\":1,\"model\":\"gpt\",\"choices\":[],\"usage\":{\"prompt_tokens\":13,\"completion_tokens\":12,\"total_tokens\":25}}\n\n\
data: [DONE]\n\n";

        for split_a in 1..stream.len() {
            // Two cut points stress the prefix, payload, and boundary cases.
            let split_b = (split_a + 11).min(stream.len());
            let mut translator = OpenAiToOpenAiTranslator::new();
            let request = ChatCompletionsRequest {
                model: "gpt".to_string(),
                stream: Some(true),
                ..Default::default()
            };
            translator.request_body(request).unwrap();

            let mut total = LlmTokenUsage::default();
            let headers = ok_headers();
            for (chunk, eos) in [
                (&stream[..split_a], false),
                (&stream[split_a..split_b], false),
                (&stream[split_b..], true),
            ] {
                let transform = translator.response_body(&headers, chunk, eos).unwrap();
                assert!(transform.body.is_none(), "streaming bytes must pass through");
                total.accumulate(transform.token_usage);
            }
            assert_eq!(
                total,
                LlmTokenUsage::from_counts(13, 12, 25),
                "split at {split_a}/{split_b}"
            );
        }
    }

    #[test]
    fn later_chunks_are_not_reparsed_after_usage() {
        let mut translator = OpenAiToOpenAiTranslator::new();
        translator
            .request_body(ChatCompletionsRequest {
                stream: Some(true),
                ..Default::default()
            })
            .unwrap();
        let headers = ok_headers();
        let usage_chunk = b"data: {\"id\":\"c\",\"created\":1,\"model\":\"gpt\",\"choices\":[],\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":2,\"total_tokens\":3}}\n\n";
        let first = translator
            .response_body(&headers, usage_chunk, false)
            .unwrap();
        assert_eq!(first.token_usage, LlmTokenUsage::from_counts(1, 2, 3));

        let second = translator
            .response_body(&headers, usage_chunk, false)
            .unwrap();
        assert!(second.token_usage.is_zero());
    }

    #[test]
    fn streaming_request_flips_response_mode() {
        let mut translator = OpenAiToOpenAiTranslator::new();
        let transform = translator
            .request_body(ChatCompletionsRequest {
                stream: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            transform.response_body_mode,
            Some(ResponseBodyMode::Streamed)
        );
        assert!(transform.body.is_none());
    }

    #[test]
    fn plain_text_error_is_wrapped_in_openai_shape() {
        let mut translator = OpenAiToOpenAiTranslator::new();
        let headers = HeaderFields::from([
            (":status".to_string(), "503".to_string()),
            ("content-type".to_string(), "text/plain".to_string()),
        ]);
        let transform = translator
            .response_body(&headers, b"upstream connect error", false)
            .unwrap();
        let body = transform.body.expect("synthesized error body");
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["type"], "error");
        assert_eq!(parsed["error"]["type"], "OpenAIBackendError");
        assert_eq!(parsed["error"]["code"], "503");
        assert_eq!(parsed["error"]["message"], "upstream connect error");
        let mutation = transform.header_mutation.unwrap();
        assert_eq!(
            mutation.set,
            vec![("content-length".to_string(), body.len().to_string())]
        );
    }

    #[test]
    fn json_error_passes_through() {
        let mut translator = OpenAiToOpenAiTranslator::new();
        let headers = HeaderFields::from([
            (":status".to_string(), "429".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ]);
        let transform = translator
            .response_body(&headers, br#"{"error":{"message":"rate limited"}}"#, false)
            .unwrap();
        assert!(transform.body.is_none());
        assert!(transform.header_mutation.is_none());
    }
}
