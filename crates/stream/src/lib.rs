//! Durable Streams Server
//!
//! A Rust implementation of the durable streams protocol - append-only logs
//! with replay support.
//!
//! # Features
//!
//! - **Append-only streams**: Create streams and append data with guaranteed ordering
//! - **Replay support**: Read from any offset to catch up on missed messages
//! - **Long-polling**: Wait for new messages with configurable timeout
//! - **Server-Sent Events (SSE)**: Continuous streaming of new messages
//! - **Idempotent producers**: Exactly-once writes via (id, epoch, seq) headers
//! - **Optimistic concurrency**: `If-Match` against the stream's entity tag
//! - **TTL/Expiration**: Automatic stream cleanup based on time
//! - **JSON mode**: Array flattening on append, array framing on read
//! - **Durable storage**: Optional file-backed mode with crash recovery
//!
//! # Example
//!
//! ```rust,no_run
//! use durable_stream::{server, types::ServerOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let options = ServerOptions {
//!         port: 4437,
//!         host: "127.0.0.1".to_string(),
//!         ..Default::default()
//!     };
//!
//!     server::start_server(options).await.unwrap();
//! }
//! ```
//!
//! # Protocol
//!
//! ## Creating a stream
//!
//! ```text
//! PUT /v1/stream/my-events HTTP/1.1
//! Content-Type: application/json
//! Stream-TTL: 3600
//!
//! Response: 201 Created
//! Stream-Next-Offset: -1
//! ETag: "-1"
//! ```
//!
//! ## Appending data
//!
//! ```text
//! POST /v1/stream/my-events HTTP/1.1
//! Content-Type: application/json
//!
//! {"event": "user_created", "id": 123}
//!
//! Response: 200 OK
//! Stream-Next-Offset: 0000000000000001_0000000000000036
//! ```
//!
//! ## Reading data
//!
//! ```text
//! GET /v1/stream/my-events?offset=-1 HTTP/1.1
//!
//! Response: 200 OK
//! Stream-Next-Offset: 0000000000000001_0000000000000036
//! Stream-Up-To-Date: true
//! Content-Type: application/json
//!
//! [{"event": "user_created", "id": 123}]
//! ```
//!
//! ## Long-polling
//!
//! ```text
//! GET /v1/stream/my-events?offset=0000000000000001_0000000000000036&live=long-poll HTTP/1.1
//!
//! (waits up to 30 seconds for new data)
//!
//! Response: 200 OK with an empty body if nothing arrived
//! Stream-Up-To-Date: true
//! ```
//!
//! ## Server-Sent Events
//!
//! ```text
//! GET /v1/stream/my-events?offset=-1&live=sse HTTP/1.1
//! Accept: text/event-stream
//!
//! event: data
//! data: {"event": "user_created", "id": 123}
//!
//! event: control
//! data: {"streamNextOffset": "0000000000000001_0000000000000036", "upToDate": true}
//! ```

pub mod cursor;
pub mod error;
pub mod hooks;
pub mod retention;
pub mod server;
pub mod store;
pub mod types;
pub mod waiters;

// Re-export commonly used items
pub use error::StoreError;
pub use hooks::LifecycleBus;
pub use retention::spawn_retention_sweeper;
pub use server::{create_router, start_server, AppState};
pub use store::{AppendRequest, ProducerHeaders, StoreOptions, StreamStore};
pub use types::{
    AppendKind, AppendOutcome, CreateOutcome, FsyncPolicy, ReadResult, Record, ServerOptions,
    StreamConfig, StreamLifecycleEvent, StreamSnapshot,
};
