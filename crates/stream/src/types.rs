//! Core types for the durable streams server.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel offset for the start of a stream. Also the tail offset of a
/// stream that has never been appended to.
pub const OFFSET_BEGINNING: &str = "-1";

/// Sentinel offset for the current tail.
pub const OFFSET_NOW: &str = "now";

/// Format an offset token from a record index and a byte position.
/// Format: "recordIndex_bytePosition" with 16-digit zero-padding each,
/// so tokens sort lexicographically in append order.
pub fn format_offset(record_index: u64, byte_position: u64) -> String {
    format!("{:016}_{:016}", record_index, byte_position)
}

/// Parse an offset token into (record_index, byte_position).
/// Returns None for the sentinels and for malformed tokens.
pub fn parse_offset(offset: &str) -> Option<(u64, u64)> {
    let (index, byte) = offset.split_once('_')?;
    if index.len() != 16 || byte.len() != 16 {
        return None;
    }
    let record_index = index.parse().ok()?;
    let byte_position = byte.parse().ok()?;
    Some((record_index, byte_position))
}

/// Compare two offset tokens. `"-1"` sorts before every formatted token,
/// so plain lexicographic comparison is the protocol ordering.
pub fn compare_offsets(a: &str, b: &str) -> std::cmp::Ordering {
    a.cmp(b)
}

/// Normalize a content type by stripping charset and parameters.
pub fn normalize_content_type(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
}

/// Whether a content type triggers JSON mode.
pub fn is_json_content_type(content_type: &str) -> bool {
    normalize_content_type(content_type).eq_ignore_ascii_case("application/json")
}

/// When the log file is flushed to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsyncPolicy {
    /// fsync after every append before acknowledging.
    Always,
    /// Leave flushing to the operating system.
    Os,
}

impl FromStr for FsyncPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(FsyncPolicy::Always),
            "os" => Ok(FsyncPolicy::Os),
            other => Err(format!("unknown fsync policy: {other} (expected 'always' or 'os')")),
        }
    }
}

/// Per-producer coordination state for idempotent appends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerEntry {
    /// Highest accepted epoch. Writes with an older epoch are fenced.
    pub epoch: u64,
    /// Last accepted sequence within the epoch, -1 if none yet.
    pub last_seq: i64,
    /// Tail offset returned for the last accepted write, replayed on
    /// duplicate submissions of the same seq.
    pub last_offset: String,
    /// Milliseconds since epoch, drives eviction of idle producers.
    pub updated_at: i64,
}

/// Stream metadata. In file-backed mode this is the unit persisted in the
/// metadata store; the log file holds only payload frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMeta {
    /// URL path identifying the stream
    pub path: String,
    /// MIME type of the stream content, immutable after creation
    pub content_type: Option<String>,
    /// Time-to-live in seconds (relative input, kept for idempotent PUT)
    pub ttl_seconds: Option<u64>,
    /// Absolute expiration timestamp
    pub expires_at: Option<DateTime<Utc>>,
    /// Once true, appends are rejected
    pub closed: bool,
    /// Creation timestamp (milliseconds since epoch)
    pub created_at: i64,
    /// Records ever appended
    pub record_count: u64,
    /// Payload bytes ever appended
    pub byte_count: u64,
    /// Records reclaimed by retention
    pub pruned_records: u64,
    /// Payload bytes reclaimed by retention
    pub pruned_bytes: u64,
    /// Last Stream-Seq accepted on the non-producer path
    pub last_seq: Option<String>,
    /// Producer coordination state keyed by producer id
    pub producers: HashMap<String, ProducerEntry>,
}

impl StreamMeta {
    pub fn new(path: String) -> Self {
        Self {
            path,
            content_type: None,
            ttl_seconds: None,
            expires_at: None,
            closed: false,
            created_at: Utc::now().timestamp_millis(),
            record_count: 0,
            byte_count: 0,
            pruned_records: 0,
            pruned_bytes: 0,
            last_seq: None,
            producers: HashMap::new(),
        }
    }

    /// Current tail offset. `"-1"` until the first record is appended.
    pub fn next_offset(&self) -> String {
        if self.record_count == 0 {
            OFFSET_BEGINNING.to_string()
        } else {
            format_offset(self.record_count, self.byte_count)
        }
    }

    /// Lowest offset still readable. Reads below it are gone.
    pub fn earliest_offset(&self) -> String {
        format_offset(self.pruned_records, self.pruned_bytes)
    }

    /// Strong entity tag: the quoted tail offset.
    pub fn etag(&self) -> String {
        format!("\"{}\"", self.next_offset())
    }

    /// Payload bytes currently retained.
    pub fn retained_bytes(&self) -> u64 {
        self.byte_count - self.pruned_bytes
    }

    /// Check if the stream has expired.
    pub fn is_expired(&self) -> bool {
        if let Some(expires_at) = self.expires_at {
            return Utc::now() >= expires_at;
        }
        false
    }

    /// Check if this stream uses JSON content type.
    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(is_json_content_type)
            .unwrap_or(false)
    }
}

/// Stream lifecycle event for hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamLifecycleEvent {
    Created {
        path: String,
        content_type: Option<String>,
        timestamp: i64,
    },
    Appended {
        path: String,
        next_offset: String,
        records: usize,
        timestamp: i64,
    },
    Deleted {
        path: String,
        timestamp: i64,
    },
}

/// Configuration for creating a stream.
#[derive(Debug, Clone, Default)]
pub struct StreamConfig {
    pub content_type: Option<String>,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub initial_data: Option<Bytes>,
}

/// A record returned by a read.
#[derive(Debug, Clone)]
pub struct Record {
    /// Raw payload bytes
    pub payload: Bytes,
    /// Offset at which the record begins
    pub offset: String,
    /// Offset immediately after the record
    pub end_offset: String,
    /// Timestamp when the record was appended (milliseconds since epoch)
    pub produced_at: i64,
}

/// Result of reading from a stream.
#[derive(Debug, Clone)]
pub struct ReadResult {
    /// Records read from the stream
    pub records: Vec<Record>,
    /// Next offset to use for subsequent reads
    pub next_offset: String,
    /// Whether the response reaches the tail known at read time
    pub up_to_date: bool,
    /// Whether the stream is closed
    pub closed: bool,
}

/// How an append concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendKind {
    /// Records were appended.
    Appended(usize),
    /// Duplicate producer seq; nothing appended, cached offset replayed.
    Duplicate,
    /// Close with no payload (including closing an already-closed stream).
    CloseOnly,
}

/// Outcome of a successful append.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub next_offset: String,
    pub kind: AppendKind,
    pub closed: bool,
}

/// Outcome of a create.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    /// true if the stream did not exist before
    pub created: bool,
    pub next_offset: String,
}

/// Point-in-time view of stream metadata, served on HEAD and used by the
/// read paths to avoid holding the stream lock while streaming bytes.
#[derive(Debug, Clone)]
pub struct StreamSnapshot {
    pub path: String,
    pub content_type: Option<String>,
    pub next_offset: String,
    pub earliest_offset: String,
    pub closed: bool,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: i64,
}

impl StreamSnapshot {
    pub fn etag(&self) -> String {
        format!("\"{}\"", self.next_offset)
    }

    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(is_json_content_type)
            .unwrap_or(false)
    }
}

/// Server configuration options.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Port to listen on (0 for auto-assign)
    pub port: u16,
    /// Host to bind to
    pub host: String,
    /// Long-poll timeout in milliseconds
    pub long_poll_timeout_ms: u64,
    /// SSE keep-alive interval and disconnect-detection bound in milliseconds
    pub heartbeat_ms: u64,
    /// Data directory for file-backed storage (None for in-memory)
    pub data_dir: Option<PathBuf>,
    /// When log appends are flushed to disk
    pub fsync: FsyncPolicy,
    /// Enable response compression (never applied to SSE)
    pub compression: bool,
    /// Cursor interval in seconds
    pub cursor_interval_seconds: u64,
    /// Cursor epoch for interval calculation
    pub cursor_epoch: DateTime<Utc>,
    /// Retention sweep period in milliseconds
    pub retention_scan_interval_ms: u64,
    /// Per-stream retention horizon in bytes (0 = keep everything)
    pub retention_max_bytes: u64,
    /// Maximum concurrent long-poll/SSE waiters before BUSY
    pub max_waiters: usize,
    /// Per-stream byte budget for the in-memory store (0 = unlimited)
    pub max_stream_bytes: u64,
    /// Process-wide byte budget for the in-memory store (0 = unlimited)
    pub max_total_bytes: u64,
    /// Cap on bytes returned by a single catch-up read (0 = unlimited)
    pub max_read_bytes: u64,
    /// Mirror lifecycle events into this stream when set
    pub registry_stream: Option<String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: 4437,
            host: "127.0.0.1".to_string(),
            long_poll_timeout_ms: 30_000,
            heartbeat_ms: 15_000,
            data_dir: None,
            fsync: FsyncPolicy::Always,
            compression: true,
            cursor_interval_seconds: 20,
            // October 9, 2024 as default epoch
            cursor_epoch: DateTime::parse_from_rfc3339("2024-10-09T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            retention_scan_interval_ms: 5_000,
            retention_max_bytes: 0,
            max_waiters: 4096,
            max_stream_bytes: 0,
            max_total_bytes: 0,
            max_read_bytes: 0,
            registry_stream: None,
        }
    }
}
