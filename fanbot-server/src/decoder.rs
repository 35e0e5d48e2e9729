//! Reassembles newline-delimited JSON records from an upstream body that
//! arrives in arbitrary byte chunks.

use fanbot_shared::Utf8Decoder;
use serde_json::Value;
use tracing::debug;

/// One decoded record of the upstream stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFrame {
    /// Text increment; empty when the record carried no content.
    pub delta: String,
    /// Set on the record that completes the reply.
    pub done: bool,
}

impl StreamFrame {
    /// Maps one JSON record. Anything that is not an object is rejected;
    /// missing or non-string content is a zero-length increment.
    pub fn from_record(record: &Value) -> Option<Self> {
        let object = record.as_object()?;
        let delta = object
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        // Only a JSON `true` ends the stream; `1` or `"true"` do not.
        let done = object
            .get("done")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Some(Self { delta, done })
    }
}

/// Per-session decoder state. Never shared between sessions.
///
/// A line is only parsed once its terminating `\n` has been seen, so a
/// record split across chunks is never attempted half-way.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    text: Utf8Decoder,
    buffer: String,
    dropped: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamFrame> {
        self.buffer.push_str(&self.text.decode(chunk));

        let Some(last_newline) = self.buffer.rfind('\n') else {
            return Vec::new();
        };
        let residual = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, residual);

        let mut frames = Vec::new();
        for line in complete.split('\n') {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|record| StreamFrame::from_record(&record))
            {
                Some(frame) => frames.push(frame),
                None => {
                    self.dropped += 1;
                    debug!(line_len = line.len(), "dropping malformed stream record");
                }
            }
        }
        frames
    }

    /// Records dropped so far because they were not JSON objects.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Bytes/characters received after the last newline. They are never
    /// parsed, even when the stream ends.
    pub fn residual_len(&self) -> usize {
        self.buffer.len() + self.text.pending_len()
    }
}
