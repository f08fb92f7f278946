use futures::stream::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

use std::collections::VecDeque;

use stockflow_core::error::{Result, StockflowError};

/// Incremental parser for a `text/event-stream` body.
///
/// Events are separated by a blank line; `data:` lines within one event
/// are joined with `\n`. CRLF line endings are accepted.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

/// A parsed SSE event.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed text into the parser and drain every complete event.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        if chunk.contains('\r') {
            self.buffer.push_str(&chunk.replace("\r\n", "\n"));
        } else {
            self.buffer.push_str(chunk);
        }

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();

            let mut event_type = None;
            let mut data_lines = Vec::new();
            for line in block.lines() {
                if let Some(val) = line.strip_prefix("event:") {
                    event_type = Some(val.trim_start().to_string());
                } else if let Some(val) = line.strip_prefix("data:") {
                    data_lines.push(val.strip_prefix(' ').unwrap_or(val).to_string());
                }
            }

            if !data_lines.is_empty() {
                events.push(SseEvent {
                    event_type,
                    data: data_lines.join("\n"),
                });
            }
        }
        events
    }
}

/// Adapts an HTTP byte stream into a stream of SSE events.
///
/// Transport errors and invalid UTF-8 surface as `LlmStream` errors
/// and end the stream.
pub struct SseStream<S> {
    inner: S,
    parser: SseParser,
    pending: VecDeque<SseEvent>,
    // Bytes of a UTF-8 sequence split across chunks.
    carry: Vec<u8>,
    done: bool,
}

impl<S> SseStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            parser: SseParser::new(),
            pending: VecDeque::new(),
            carry: Vec::new(),
            done: false,
        }
    }
}

impl<S> Stream for SseStream<S>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<SseEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if this.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.carry.extend_from_slice(&bytes);
                    let valid_up_to = match std::str::from_utf8(&this.carry) {
                        Ok(_) => this.carry.len(),
                        Err(e) if e.error_len().is_none() => e.valid_up_to(),
                        Err(e) => {
                            this.done = true;
                            return Poll::Ready(Some(Err(StockflowError::LlmStream(format!(
                                "invalid UTF-8 in event stream: {}",
                                e
                            )))));
                        }
                    };
                    let rest = this.carry.split_off(valid_up_to);
                    let text = String::from_utf8_lossy(&this.carry).into_owned();
                    this.carry = rest;
                    this.pending.extend(this.parser.feed(&text));
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(StockflowError::LlmStream(e.to_string()))));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    // Flush a trailing event that was not followed by a blank line
                    this.pending.extend(this.parser.feed("\n\n"));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
