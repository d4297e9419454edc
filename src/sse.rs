use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::constants::{DATA_PREFIX, MAX_FRAME_BYTES};
use crate::types::{classify_stream_payload, StreamEvent};

/// Frames are separated by a blank line. The separator is ASCII, so raw-byte
/// scanning is safe no matter where a chunk boundary falls, including inside
/// a multi-byte UTF-8 sequence.
fn find_frame_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/// Split the next complete frame off the front of the buffer, dropping the
/// separator. Processed bytes never stay in the buffer and are never
/// re-scanned.
fn split_frame(buf: &mut BytesMut) -> Option<String> {
    let pos = find_frame_boundary(buf)?;
    let frame = buf.split_to(pos);
    buf.advance(2);
    Some(String::from_utf8_lossy(&frame).into_owned())
}

/// Extract the `data:` payload from one frame, or None if the frame's first
/// line is not a data line. Whitespace after the colon is tolerated.
pub fn frame_payload(frame: &str) -> Option<&str> {
    let first_line = frame.trim().lines().next()?;
    let rest = first_line.strip_prefix(DATA_PREFIX)?;
    Some(rest.trim_start())
}

/// Decode one complete frame into at most one StreamEvent.
pub fn decode_frame(frame: &str) -> Option<StreamEvent> {
    let payload = frame_payload(frame)?;
    classify_stream_payload(payload)
}

/// Push-based incremental decoder: feed byte chunks as they arrive, collect
/// events as frames complete. Single-pass and forward-only; restarting
/// requires a new decoder.
#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    buf: BytesMut,
    finished: bool,
}

impl SseFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Append a chunk and drain every frame it completes. Stops cold at the
    /// done sentinel: trailing bytes are dropped, further pushes are no-ops.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.buf.extend_from_slice(chunk);
        while let Some(frame) = split_frame(&mut self.buf) {
            if let Some(event) = decode_frame(&frame) {
                let done = matches!(event, StreamEvent::Done);
                events.push(event);
                if done {
                    self.finished = true;
                    self.buf.clear();
                    break;
                }
            }
        }
        events
    }

    /// Flush a trailing frame that arrived without its separator once the
    /// byte source is exhausted.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if self.finished || self.buf.is_empty() {
            return None;
        }
        let frame = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        self.finished = true;
        decode_frame(&frame)
    }
}

/// Codec form of the same framing, for reading upstream bodies with
/// `FramedRead` over a `StreamReader`. Yields whole frames as text; the
/// relay decides per frame what to forward and what to fold.
pub struct SseFrameCodec;

impl Decoder for SseFrameCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if src.len() > MAX_FRAME_BYTES && find_frame_boundary(src).is_none() {
            return Err(std::io::Error::other(format!(
                "SSE frame exceeded {} bytes without a separator",
                MAX_FRAME_BYTES
            )));
        }
        Ok(split_frame(src))
    }

    fn decode_eof(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                let frame = String::from_utf8_lossy(src).into_owned();
                src.clear();
                Ok(Some(frame))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(chunks: &[&[u8]]) -> Vec<StreamEvent> {
        let mut decoder = SseFrameDecoder::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(decoder.push(chunk));
        }
        if let Some(event) = decoder.finish() {
            events.push(event);
        }
        events
    }

    const PAYLOAD: &[u8] = b"data: {\"delta\":\"H\\u00e9l\"}\n\n\
        data: {\"type\":\"image\",\"url\":\"https://cdn.example/a.png\"}\n\n\
        event: noise\n\n\
        data: {broken json\n\n\
        data: {\"delta\":\"lo\"}\n\n\
        data: [DONE]\n\n";

    #[test]
    fn test_reference_decode() {
        let events = decode_all(&[PAYLOAD]);
        assert_eq!(
            events,
            vec![
                StreamEvent::Token {
                    delta: "Hél".to_string()
                },
                StreamEvent::Image {
                    url: "https://cdn.example/a.png".to_string()
                },
                StreamEvent::Token {
                    delta: "lo".to_string()
                },
                StreamEvent::Done,
            ]
        );
    }

    #[test]
    fn test_identical_events_for_every_chunk_split() {
        let reference = decode_all(&[PAYLOAD]);
        for split in 1..PAYLOAD.len() {
            let (a, b) = PAYLOAD.split_at(split);
            assert_eq!(
                decode_all(&[a, b]),
                reference,
                "split at byte {} diverged",
                split
            );
        }
    }

    #[test]
    fn test_split_inside_multibyte_codepoint() {
        // "é" encodes as 0xC3 0xA9; force the chunk boundary between them.
        let raw = "data: {\"delta\":\"é\"}\n\n".as_bytes();
        let cut = raw.iter().position(|b| *b == 0xC3).map(|p| p + 1);
        let cut = match cut {
            Some(c) => c,
            None => panic!("multibyte codepoint missing from fixture"),
        };
        let (a, b) = raw.split_at(cut);
        assert_eq!(
            decode_all(&[a, b]),
            vec![StreamEvent::Token {
                delta: "é".to_string()
            }]
        );
    }

    #[test]
    fn test_done_stops_even_with_more_buffered_data() {
        let raw = b"data: [DONE]\n\ndata: {\"delta\":\"ignored\"}\n\n";
        let mut decoder = SseFrameDecoder::new();
        let events = decoder.push(raw);
        assert_eq!(events, vec![StreamEvent::Done]);
        assert!(decoder.is_finished());
        assert!(decoder.push(b"data: {\"delta\":\"late\"}\n\n").is_empty());
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_non_data_frames_are_ignored() {
        assert_eq!(decode_all(&[b"retry: 500\n\n: comment\n\n"]), vec![]);
    }

    #[test]
    fn test_whitespace_after_colon_tolerated() {
        let events = decode_all(&[b"data:    {\"delta\":\"x\"}\n\n"]);
        assert_eq!(
            events,
            vec![StreamEvent::Token {
                delta: "x".to_string()
            }]
        );
        let tight = decode_all(&[b"data:{\"delta\":\"y\"}\n\n"]);
        assert_eq!(
            tight,
            vec![StreamEvent::Token {
                delta: "y".to_string()
            }]
        );
    }

    #[test]
    fn test_trailing_frame_without_separator_flushed_on_finish() {
        let events = decode_all(&[b"data: {\"delta\":\"tail\"}"]);
        assert_eq!(
            events,
            vec![StreamEvent::Token {
                delta: "tail".to_string()
            }]
        );
    }

    #[test]
    fn test_codec_splits_frames_and_flushes_eof() {
        let mut codec = SseFrameCodec;
        let mut buf = BytesMut::from(&b"data: a\n\ndata: b"[..]);
        assert_eq!(codec.decode(&mut buf).ok().flatten(), Some("data: a".to_string()));
        assert_eq!(codec.decode(&mut buf).ok().flatten(), None);
        assert_eq!(
            codec.decode_eof(&mut buf).ok().flatten(),
            Some("data: b".to_string())
        );
        assert_eq!(codec.decode_eof(&mut buf).ok().flatten(), None);
    }
}
