use std::time::Instant;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::sse::SseFrameDecoder;
use crate::types::{LatencyMs, StreamEvent};

/// Final product of one streamed response. Created fresh per stream and
/// discarded once persisted or rendered.
#[derive(Debug, Clone)]
pub struct AccumulationResult {
    pub text: String,
    pub image_urls: Vec<String>,
    /// Wall-clock delay to the first non-empty token delta, frozen once set.
    pub first_chunk_latency: Option<LatencyMs>,
    /// False when the byte source died mid-stream. The accumulated prefix is
    /// still returned; partial progress is never dropped.
    pub completed: bool,
}

type TokenCallback = Box<dyn FnMut(&str) + Send>;
type ImageCallback = Box<dyn FnMut(&str) + Send>;

/// Folds a StreamEvent sequence into final text. Callbacks fire
/// synchronously, in arrival order, before the accumulator considers itself
/// done — concatenating every `on_token` argument reproduces the final text.
pub struct StreamAccumulator {
    text: String,
    image_urls: Vec<String>,
    started: Instant,
    first_chunk_latency: Option<LatencyMs>,
    done: bool,
    on_token: Option<TokenCallback>,
    on_image: Option<ImageCallback>,
}

impl Default for StreamAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            image_urls: Vec::new(),
            started: Instant::now(),
            first_chunk_latency: None,
            done: false,
            on_token: None,
            on_image: None,
        }
    }

    pub fn on_token(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_token = Some(Box::new(callback));
        self
    }

    pub fn on_image(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_image = Some(Box::new(callback));
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn first_chunk_latency(&self) -> Option<LatencyMs> {
        self.first_chunk_latency
    }

    /// Fold one event. Returns true once the stream is finished; events
    /// pushed after that are ignored.
    pub fn push(&mut self, event: &StreamEvent) -> bool {
        if self.done {
            return true;
        }
        match event {
            StreamEvent::Token { delta } => {
                if !delta.is_empty() && self.first_chunk_latency.is_none() {
                    self.first_chunk_latency = Some(LatencyMs(self.started.elapsed().as_millis()));
                }
                self.text.push_str(delta);
                if let Some(callback) = self.on_token.as_mut() {
                    callback(delta);
                }
            }
            StreamEvent::Image { url } => {
                self.image_urls.push(url.clone());
                if let Some(callback) = self.on_image.as_mut() {
                    callback(url);
                }
            }
            StreamEvent::Done => {
                self.done = true;
            }
            StreamEvent::Unknown { .. } => {}
        }
        self.done
    }

    /// Clean completion: a done sentinel or source exhaustion, treated
    /// identically.
    pub fn finalize(self) -> AccumulationResult {
        AccumulationResult {
            text: self.text,
            image_urls: self.image_urls,
            first_chunk_latency: self.first_chunk_latency,
            completed: true,
        }
    }

    /// The byte source errored mid-stream: keep the prefix, flag it.
    pub fn finalize_truncated(self) -> AccumulationResult {
        AccumulationResult {
            text: self.text,
            image_urls: self.image_urls,
            first_chunk_latency: self.first_chunk_latency,
            completed: false,
        }
    }

    /// Drive the accumulator over a raw byte source through the frame
    /// decoder until done or exhausted.
    pub async fn accumulate_bytes<S>(mut self, mut bytes: S) -> AccumulationResult
    where
        S: Stream<Item = std::result::Result<Bytes, std::io::Error>> + Unpin,
    {
        let mut decoder = SseFrameDecoder::new();
        while let Some(next) = bytes.next().await {
            match next {
                Ok(chunk) => {
                    for event in decoder.push(&chunk) {
                        if self.push(&event) {
                            return self.finalize();
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("[☁️  -> ⚙️ ] Byte source failed mid-accumulation: {}", e);
                    return self.finalize_truncated();
                }
            }
        }
        if let Some(event) = decoder.finish() {
            self.push(&event);
        }
        self.finalize()
    }
}
