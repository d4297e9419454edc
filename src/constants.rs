/// Terminal sentinel payload; a frame carrying it ends the stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// SSE payload line prefix. Whitespace after the colon is tolerated.
pub const DATA_PREFIX: &str = "data:";

/// Upstream status codes forwarded to the client as-is; everything else is
/// normalized to 503.
pub const PASSTHROUGH_STATUS_CODES: &[u16] = &[401, 403, 404, 429];

/// Provider API defaults, overridable via CLI args.
pub const DEFAULT_PROVIDER_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// A metadata-generation round trip fires after every Nth assistant turn.
pub const METADATA_TURN_INTERVAL: u32 = 3;

/// Hard caps on the relay loop.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;
pub const MAX_STREAM_FRAMES: usize = 100_000;

/// Database defaults
pub const DB_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA busy_timeout = 5000",
];

/// Retry settings for the background metadata round trip. Interactive sends
/// are never retried automatically.
pub const METADATA_RETRY_ATTEMPTS: u32 = 2;
pub const METADATA_RETRY_BASE_DELAY_MS: u64 = 200;
