//! Server-sent events decoding for streamed replies
//!
//! Only `data:` fields matter for the backends here. Event names, ids and
//! retry hints are ignored; comment lines are skipped.

use bytes::Bytes;
use futures::{Stream, StreamExt};

use super::ProviderError;

/// Incremental SSE decoder.
///
/// Bytes are buffered until a full line is available, so multi-byte characters
/// split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect the data payloads of every event it completes
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, ProviderError> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = decode_line(&raw)?;
            if let Some(event) = self.feed_line(line) {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Flush whatever is left once the byte stream ends
    pub fn finish(&mut self) -> Result<Option<String>, ProviderError> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = decode_line(&raw)?;
            if let Some(event) = self.feed_line(line) {
                return Ok(Some(event));
            }
        }
        Ok(self.take_event())
    }

    fn feed_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.take_event();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_string());
        }
        None
    }

    fn take_event(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        let event = self.data.join("\n");
        self.data.clear();
        Some(event)
    }
}

fn decode_line(raw: &[u8]) -> Result<&str, ProviderError> {
    let line = std::str::from_utf8(raw)
        .map_err(|e| ProviderError::MalformedResponse(format!("invalid UTF-8 in stream: {}", e)))?;
    Ok(line.trim_end_matches(|c| c == '\n' || c == '\r'))
}

/// Turn an HTTP body into the sequence of SSE data payloads it carries.
///
/// A failure reading the body ends the sequence with a transport error.
pub fn data_events<S>(bytes: S) -> impl Stream<Item = Result<String, ProviderError>> + Send
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    async_stream::try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut decoder = SseDecoder::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(ProviderError::from)?;
            for event in decoder.push(&chunk)? {
                yield event;
            }
        }

        if let Some(event) = decoder.finish()? {
            yield event;
        }
    }
}
