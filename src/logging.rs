use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use colored::*;
use std::panic;
use tracing::{error, info, warn, Span};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::types::{ChatRequest, StreamEvent};

pub const TURN_ID_HEADER: &str = "x-banter-turn-id";

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

pub async fn turn_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let turn_id = Uuid::new_v4().to_string();
    if let Ok(val) = turn_id.parse() {
        req.headers_mut().insert(TURN_ID_HEADER, val);
    }

    let span = info_span!("request", turn_id = %turn_id);
    next.run(req).instrument(span).await
}

pub fn log_request_summary(request: &ChatRequest) {
    let msg_count = request.messages.len();
    let ends_with_user = request.messages.last().map(|m| m.is_user).unwrap_or(false);
    let unsaved = request
        .messages
        .iter()
        .filter(|m| m.id.is_none())
        .count();

    if !ends_with_user {
        warn!(
            target: "flight_recorder",
            "{}", "[PROTOCOL MISMATCH] chat turn does not end with a user message".bold().yellow()
        );
    }

    info!(
        target: "flight_recorder",
        "[REQ] Session: [{}...] | Messages: {} | Unsaved: {} | Stream: {}",
        crate::str_utils::prefix_chars(&request.chat_id, 6),
        msg_count,
        unsaved,
        request.stream
    );
}

/// Per-stream counters, logged once at stream end.
#[derive(Default)]
pub struct StreamMetric {
    pub frames: usize,
    pub token_deltas: usize,
    pub text_chars: usize,
    pub images: usize,
    pub unknown: usize,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&mut self) {
        self.frames += 1;
    }

    pub fn record_event(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Token { delta } => {
                self.token_deltas += 1;
                self.text_chars += delta.len();
            }
            StreamEvent::Image { .. } => self.images += 1,
            StreamEvent::Unknown { .. } => self.unknown += 1,
            StreamEvent::Done => {}
        }
    }

    pub fn log_summary(&self, first_chunk_latency: Option<crate::types::LatencyMs>) {
        let turn_id = get_turn_id();
        let latency_str = match first_chunk_latency {
            Some(ms) => format!("{}ms", ms),
            None => "n/a".to_string(),
        };

        info!(
            target: "flight_recorder",
            "[STREAM END] TurnID: {} | Frames: {} | Deltas: {} | Text: {} chars | Images: {} | Unknown: {} | TTFB: {}",
            turn_id, self.frames, self.token_deltas, self.text_chars, self.images, self.unknown, latency_str
        );
    }
}

pub fn get_turn_id() -> String {
    match Span::current().field("turn_id").map(|v| v.to_string()) {
        Some(id) => id,
        None => "unknown".to_string(),
    }
}
