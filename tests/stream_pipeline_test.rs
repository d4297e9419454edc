use std::sync::{Arc, Mutex};

use banter::accumulator::StreamAccumulator;
use banter::sse::SseFrameDecoder;
use banter::types::StreamEvent;
use bytes::Bytes;

#[test]
fn chunked_sse_payload_accumulates_to_hello() {
    let chunks: [&[u8]; 3] = [
        b"data: {\"delta\":\"Hel\"}\n\n",
        b"data: {\"delta\":\"lo\"}\n\n",
        b"data: [DONE]\n\n",
    ];

    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    let mut decoder = SseFrameDecoder::new();
    let mut acc = StreamAccumulator::new().on_token(move |delta| {
        if let Ok(mut v) = sink.lock() {
            v.push(delta.to_string());
        }
    });

    for chunk in chunks {
        for event in decoder.push(chunk) {
            acc.push(&event);
        }
    }

    assert!(acc.is_done());
    let result = acc.finalize();
    assert_eq!(result.text, "Hello");
    assert!(result.completed);

    let calls = match calls.lock() {
        Ok(v) => v.clone(),
        Err(_) => panic!("callback sink poisoned"),
    };
    assert_eq!(calls, vec!["Hel".to_string(), "lo".to_string()]);
}

#[test]
fn done_terminates_even_with_trailing_frames_in_buffer() {
    let mut decoder = SseFrameDecoder::new();
    let events =
        decoder.push(b"data: {\"delta\":\"x\"}\n\ndata: [DONE]\n\ndata: {\"delta\":\"late\"}\n\n");
    assert_eq!(
        events,
        vec![
            StreamEvent::Token {
                delta: "x".to_string()
            },
            StreamEvent::Done,
        ]
    );
    assert!(decoder.is_finished());
}

#[test]
fn noise_and_images_flow_through_the_pipeline() {
    let payload: &[u8] = b"data: {\"delta\":\"a\"}\n\n\
        data: {\"type\":\"image\",\"url\":\"https://cdn.example/pic.png\"}\n\n\
        data: {oops\n\n\
        event: ping\n\n\
        data: {\"unexpected\":true}\n\n\
        data: {\"delta\":\"b\"}\n\n\
        data: [DONE]\n\n";

    let mut decoder = SseFrameDecoder::new();
    let mut acc = StreamAccumulator::new();
    for event in decoder.push(payload) {
        acc.push(&event);
    }

    let result = acc.finalize();
    assert_eq!(result.text, "ab");
    assert_eq!(result.image_urls, vec!["https://cdn.example/pic.png"]);
    assert!(result.completed);
}

#[tokio::test]
async fn byte_source_error_keeps_accumulated_prefix() {
    let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
        Ok(Bytes::from_static(b"data: {\"delta\":\"kept \"}\n\n")),
        Ok(Bytes::from_static(b"data: {\"delta\":\"words\"}\n\n")),
        Err(std::io::Error::other("connection reset by peer")),
    ];
    let result = StreamAccumulator::new()
        .accumulate_bytes(futures_util::stream::iter(chunks))
        .await;
    assert_eq!(result.text, "kept words");
    assert!(!result.completed);
}

#[tokio::test]
async fn latency_is_captured_once_per_stream() {
    let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
        Ok(Bytes::from_static(b"data: {\"unexpected\":1}\n\n")),
        Ok(Bytes::from_static(b"data: {\"delta\":\"first\"}\n\n")),
        Ok(Bytes::from_static(b"data: {\"delta\":\"second\"}\n\n")),
        Ok(Bytes::from_static(b"data: [DONE]\n\n")),
    ];
    let result = StreamAccumulator::new()
        .accumulate_bytes(futures_util::stream::iter(chunks))
        .await;
    assert!(result.first_chunk_latency.is_some());
    assert_eq!(result.text, "firstsecond");
}
