//! Cursor system for CDN cache collision prevention.
//!
//! The cursor system divides time into fixed intervals and returns cursor
//! values that change at interval boundaries, letting intermediaries
//! collapse concurrent identical range requests without ever serving a
//! stale window forever. Cursors are a cache hint only; correctness never
//! depends on them.

use chrono::{DateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};

/// Options for cursor calculation.
#[derive(Debug, Clone)]
pub struct CursorOptions {
    /// Interval duration in seconds (default: 20)
    pub interval_seconds: u64,
    /// Epoch for interval calculation (default: Oct 9, 2024)
    pub epoch: DateTime<Utc>,
    /// Per-instance seed so two servers behind the same cache never
    /// produce colliding windows
    pub instance_seed: u64,
}

impl Default for CursorOptions {
    fn default() -> Self {
        Self {
            interval_seconds: 20,
            epoch: DateTime::parse_from_rfc3339("2024-10-09T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            instance_seed: 0,
        }
    }
}

/// Derive a cursor seed from a server instance identifier.
pub fn instance_seed(instance_id: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(instance_id.as_bytes());
    let digest = hasher.finalize();
    // Fold the first eight digest bytes, keep the seed small enough that
    // seed + interval count stays far from overflow.
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes) % 1_000_000
}

/// Calculate the current cursor value based on time intervals.
pub fn calculate_cursor(options: &CursorOptions) -> u64 {
    let now = Utc::now();
    let elapsed = now
        .signed_duration_since(options.epoch)
        .num_seconds()
        .max(0) as u64;
    elapsed / options.interval_seconds + options.instance_seed
}

/// Generate a response cursor that is guaranteed to be monotonically
/// increasing with respect to the cursor the client presented.
///
/// If the client provides a cursor that is >= the current interval, random
/// jitter is added so the cursor still advances.
pub fn generate_response_cursor(client_cursor: Option<u64>, options: &CursorOptions) -> u64 {
    let current_interval = calculate_cursor(options);

    match client_cursor {
        Some(cursor) if cursor >= current_interval => {
            let mut rng = rand::thread_rng();
            let jitter_seconds: u64 = rng.gen_range(1..=3600);
            let jitter_intervals = jitter_seconds / options.interval_seconds;
            cursor + jitter_intervals.max(1)
        }
        Some(cursor) => current_interval.max(cursor),
        None => current_interval,
    }
}

/// Parse a cursor string into a u64.
pub fn parse_cursor(cursor: &str) -> Option<u64> {
    cursor.parse().ok()
}
