//! Line-level decoding of a chat completion event stream
//!
//! Bytes arrive in arbitrary chunks, so lines (and UTF-8 sequences) may be
//! split across reads. [`LineDecoder`] buffers raw bytes and only decodes
//! complete lines; [`classify`] then looks at one line at a time.

use serde::Deserialize;

/// Sentinel payload that ends a completion stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// Longest unterminated line kept in memory; the rest of such a line is dropped
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits a byte stream into text lines
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    /// Inside an overlong line whose head was already dropped
    discarding: bool,
}

impl LineDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed
    ///
    /// Line terminators (`\n` or `\r\n`) are stripped. Invalid UTF-8 is
    /// replaced rather than rejected; such a line simply fails to decode
    /// as JSON later. A line that grows past [`MAX_LINE_BYTES`] without a
    /// terminator is dropped whole.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            if self.discarding {
                self.discarding = false;
            } else {
                lines.push(decode_line(&self.buffer[start..end]));
            }
            start = end + 1;
        }
        self.buffer.drain(..start);

        if self.buffer.len() > MAX_LINE_BYTES {
            if !self.discarding {
                tracing::debug!("dropping stream line longer than {} bytes", MAX_LINE_BYTES);
            }
            self.buffer.clear();
            self.discarding = true;
        }
        lines
    }

    /// Flush a trailing line that had no terminator
    pub fn finish(&mut self) -> Option<String> {
        if std::mem::take(&mut self.discarding) {
            self.buffer.clear();
            return None;
        }
        if self.buffer.is_empty() {
            return None;
        }
        let line = decode_line(&self.buffer);
        self.buffer.clear();
        Some(line)
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Meaning of one stream line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseLine<'a> {
    /// Payload of a `data:` line
    Data(&'a str),
    /// The `data: [DONE]` terminator
    Done,
    /// Blank lines, comments, `event:`/`id:` fields and keep-alives
    Ignored,
}

/// Classify a single line of the event stream
pub fn classify(line: &str) -> SseLine<'_> {
    let Some(value) = line.strip_prefix("data:") else {
        return SseLine::Ignored;
    };
    let value = value.trim();
    if value == DONE_SENTINEL {
        SseLine::Done
    } else if value.is_empty() {
        SseLine::Ignored
    } else {
        SseLine::Data(value)
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Decode a `data:` payload into the text of its first choice
///
/// Returns `Ok(None)` for a well-formed fragment without content (role
/// announcements, finish markers) and an error for anything that is not a
/// completion chunk, including error objects without a `choices` array.
pub fn decode_fragment(payload: &str) -> serde_json::Result<Option<String>> {
    let chunk: ChatCompletionChunk = serde_json::from_str(payload)?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty()))
}
