//! Split-resistant parsing for `data: …` Server-Sent Event streams.
//!
//! Upstream chunks may cut an event anywhere: inside the `data: ` prefix,
//! inside the JSON payload, or between two events. The buffer re-assembles
//! complete lines across those boundaries; an unterminated tail is retained
//! until the next chunk arrives (or discarded when the stream ends).

const DATA_PREFIX: &[u8] = b"data: ";

/// Terminal sentinel of OpenAI-style SSE streams. Carries no usage.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Append-only byte buffer yielding complete SSE lines.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffered: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw chunk as received from the upstream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffered.extend_from_slice(chunk);
    }

    /// Pop the next complete line, without its trailing newline.
    /// Returns `None` when only an unterminated tail remains.
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        let newline = self.buffered.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buffered.drain(..=newline).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }

    /// Bytes held for the next chunk.
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Drop everything still buffered.
    pub fn clear(&mut self) {
        self.buffered.clear();
    }
}

/// Strip the `data: ` prefix from a complete SSE line.
pub fn data_payload(line: &[u8]) -> Option<&[u8]> {
    line.strip_prefix(DATA_PREFIX)
}
