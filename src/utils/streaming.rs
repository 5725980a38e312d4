//! Common Streaming Utilities
//!
//! Shared plumbing for turning vendor byte streams into unified event
//! streams: SSE framing via eventsource-stream (UTF-8 safe, `data:` prefix
//! stripping, blank-line separation) and a buffered NDJSON line splitter
//! for vendors that speak one JSON object per line.
//!
//! JSON decode failures never abort a stream; they are logged and skipped.
//! Transport failures surface as one terminal `Error` event.

use eventsource_stream::Eventsource;
use futures_util::StreamExt;

use crate::error::AiError;
use crate::stream::{EventStream, StreamEvent};

/// Converts one decoded vendor payload into zero or more unified events.
///
/// Converters are stateful (tool-call accumulators, duplicate-terminal
/// suppression), so conversion takes `&mut self`.
pub trait EventConverter: Send + 'static {
    /// Convert one event-stream `data` payload (or one NDJSON line).
    fn convert_data(&mut self, data: &str) -> Vec<StreamEvent>;

    /// Called when the byte source closes without an explicit terminal.
    /// Return a final event to honor the terminal-event contract.
    fn finish(&mut self) -> Option<StreamEvent> {
        None
    }
}

/// End-of-stream sentinel used by SSE-framed vendors.
const DONE_SENTINEL: &str = "[DONE]";

/// Build a unified event stream from an SSE response body.
///
/// Each SSE event carries one JSON payload in `data`. Blank payloads and
/// the `[DONE]` sentinel produce no converted event; the converter's
/// `finish` supplies the terminal event when the vendor never sent one.
pub fn sse_event_stream<C>(response: reqwest::Response, mut converter: C) -> EventStream
where
    C: EventConverter,
{
    let mut source = response.bytes_stream().eventsource();

    Box::pin(async_stream::stream! {
        while let Some(event) = source.next().await {
            match event {
                Ok(event) => {
                    let data = event.data.trim();
                    if data.is_empty() {
                        continue;
                    }
                    if data == DONE_SENTINEL {
                        if let Some(last) = converter.finish() {
                            yield last;
                        }
                        return;
                    }
                    for out in converter.convert_data(data) {
                        let terminal = out.is_terminal();
                        yield out;
                        if terminal {
                            return;
                        }
                    }
                }
                Err(eventsource_stream::EventStreamError::Transport(e)) => {
                    yield StreamEvent::Error(AiError::Stream(format!(
                        "transport failure mid-stream: {e}"
                    )));
                    return;
                }
                Err(e) => {
                    // Framing/UTF-8 hiccups are skipped, same as bad JSON.
                    tracing::warn!("skipping undecodable SSE frame: {e}");
                }
            }
        }
        if let Some(last) = converter.finish() {
            yield last;
        }
    })
}

/// Buffered line splitter for NDJSON bodies.
///
/// Appends each chunk, splits on line boundaries, and holds back a trailing
/// partial line for the next chunk. `flush` returns whatever remains once
/// the source closes.
#[derive(Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete line it closes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // trailing \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Drain the held-back partial line after the source closes.
    pub fn flush(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(rest)
    }
}

/// Build a unified event stream from an NDJSON response body.
///
/// Each complete line is one JSON payload handed to the converter. No
/// SSE-style prefix stripping applies.
pub fn ndjson_event_stream<C>(response: reqwest::Response, mut converter: C) -> EventStream
where
    C: EventConverter,
{
    let mut bytes = response.bytes_stream();

    Box::pin(async_stream::stream! {
        let mut buffer = LineBuffer::new();
        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    yield StreamEvent::Error(AiError::Stream(format!(
                        "transport failure mid-stream: {e}"
                    )));
                    return;
                }
            };
            for line in buffer.push(&chunk) {
                if line.trim().is_empty() {
                    continue;
                }
                for out in converter.convert_data(line.trim()) {
                    let terminal = out.is_terminal();
                    yield out;
                    if terminal {
                        return;
                    }
                }
            }
        }
        // Process any remaining buffered partial line the same way.
        if let Some(rest) = buffer.flush()
            && !rest.trim().is_empty()
        {
            for out in converter.convert_data(rest.trim()) {
                let terminal = out.is_terminal();
                yield out;
                if terminal {
                    return;
                }
            }
        }
        if let Some(last) = converter.finish() {
            yield last;
        }
    })
}
