//! Incremental decoding of the AWS event-stream framing used by
//! `ConverseStream` responses.
//!
//! Frames are binary (`application/vnd.amazon.eventstream`) and may split
//! across HTTP body chunks; undecoded bytes stay in the accumulation buffer
//! until the rest of the frame arrives.

use aws_smithy_eventstream::frame::{DecodedFrame, MessageFrameDecoder};
use aws_smithy_types::event_stream::{HeaderValue, Message};
use bytes::BytesMut;
use thiserror::Error;

use super::amazon_bedrock::ConverseStreamEvent;

#[derive(Error, Debug)]
pub enum BedrockStreamError {
    #[error("malformed event stream frame: {0}")]
    Frame(String),
    #[error("malformed event payload for {event_type}: {source}")]
    Payload {
        event_type: String,
        source: serde_json::Error,
    },
    #[error("upstream exception {kind}: {message}")]
    Exception { kind: String, message: String },
}

/// Stateful frame decoder for one response stream.
pub struct BedrockFrameDecoder {
    decoder: MessageFrameDecoder,
    buffer: BytesMut,
}

impl Default for BedrockFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BedrockFrameDecoder {
    pub fn new() -> Self {
        Self {
            decoder: MessageFrameDecoder::new(),
            buffer: BytesMut::new(),
        }
    }

    /// Append a raw body chunk as received from the upstream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Decode the next complete event, if a full frame is buffered.
    ///
    /// Unknown event types are skipped. Exception frames surface as errors.
    pub fn next_event(&mut self) -> Result<Option<ConverseStreamEvent>, BedrockStreamError> {
        loop {
            let frame = self
                .decoder
                .decode_frame(&mut self.buffer)
                .map_err(|e| BedrockStreamError::Frame(e.to_string()))?;
            let message = match frame {
                DecodedFrame::Incomplete => return Ok(None),
                DecodedFrame::Complete(message) => message,
            };

            if let Some(kind) = header_str(&message, ":exception-type") {
                return Err(BedrockStreamError::Exception {
                    kind: kind.to_string(),
                    message: String::from_utf8_lossy(&message.payload()[..]).into_owned(),
                });
            }

            let Some(event_type) = header_str(&message, ":event-type") else {
                continue;
            };
            let event_type = event_type.to_string();
            let payload = message.payload();

            macro_rules! payload_as {
                ($ty:ty) => {
                    serde_json::from_slice::<$ty>(payload).map_err(|source| {
                        BedrockStreamError::Payload {
                            event_type: event_type.clone(),
                            source,
                        }
                    })?
                };
            }

            let event = match event_type.as_str() {
                "messageStart" => ConverseStreamEvent::MessageStart(payload_as!(
                    super::amazon_bedrock::MessageStartEvent
                )),
                "contentBlockStart" => ConverseStreamEvent::ContentBlockStart(payload_as!(
                    super::amazon_bedrock::ContentBlockStartEvent
                )),
                "contentBlockDelta" => ConverseStreamEvent::ContentBlockDelta(payload_as!(
                    super::amazon_bedrock::ContentBlockDeltaEvent
                )),
                "contentBlockStop" => ConverseStreamEvent::ContentBlockStop(payload_as!(
                    super::amazon_bedrock::ContentBlockStopEvent
                )),
                "messageStop" => ConverseStreamEvent::MessageStop(payload_as!(
                    super::amazon_bedrock::MessageStopEvent
                )),
                "metadata" => ConverseStreamEvent::Metadata(payload_as!(
                    super::amazon_bedrock::ConverseStreamMetadataEvent
                )),
                _ => continue,
            };
            return Ok(Some(event));
        }
    }
}

fn header_str<'a>(message: &'a Message, name: &str) -> Option<&'a str> {
    message.headers().iter().find_map(|header| {
        if header.name().as_str() != name {
            return None;
        }
        match header.value() {
            HeaderValue::String(value) => Some(value.as_str()),
            _ => None,
        }
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use aws_smithy_eventstream::frame::write_message_to;
    use aws_smithy_types::event_stream::{Header, HeaderValue, Message};

    /// Serialize one Bedrock event frame the way the service frames them.
    pub fn encode_event_frame(event_type: &str, payload: &str) -> Vec<u8> {
        let message = Message::new(payload.as_bytes().to_vec())
            .add_header(Header::new(
                ":message-type",
                HeaderValue::String("event".into()),
            ))
            .add_header(Header::new(
                ":event-type",
                HeaderValue::String(event_type.to_string().into()),
            ))
            .add_header(Header::new(
                ":content-type",
                HeaderValue::String("application/json".into()),
            ));
        let mut buffer = Vec::new();
        write_message_to(&message, &mut buffer).unwrap();
        buffer
    }
}
