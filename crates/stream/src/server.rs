//! HTTP server implementing the durable streams protocol.

use std::cmp::Ordering;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{delete, get, head, post, put},
    Router,
};
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::Stream;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::{timeout, Instant};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::{
    cursor::{self, CursorOptions},
    error::StoreError,
    hooks::spawn_registry_mirror,
    retention::spawn_retention_sweeper,
    store::{
        load_or_create_instance_id, AppendRequest, ProducerHeaders, StoreOptions, StreamStore,
    },
    types::{
        compare_offsets, normalize_content_type, AppendKind, ReadResult, Record, ServerOptions,
        StreamConfig, StreamSnapshot, OFFSET_BEGINNING,
    },
    waiters::{TailEvent, TailSignal, WaiterPermit},
};

/// Protocol header names
pub const HEADER_STREAM_NEXT_OFFSET: &str = "stream-next-offset";
pub const HEADER_STREAM_UP_TO_DATE: &str = "stream-up-to-date";
pub const HEADER_STREAM_CLOSED: &str = "stream-closed";
pub const HEADER_STREAM_CURSOR: &str = "stream-cursor";
pub const HEADER_STREAM_SEQ: &str = "stream-seq";
pub const HEADER_STREAM_TTL: &str = "stream-ttl";
pub const HEADER_STREAM_EXPIRES_AT: &str = "stream-expires-at";
pub const HEADER_STREAM_CLOSE: &str = "stream-close";
pub const HEADER_SSE_DATA_ENCODING: &str = "stream-sse-data-encoding";
pub const HEADER_LAST_EVENT_ID: &str = "last-event-id";

/// Producer headers
pub const HEADER_PRODUCER_ID: &str = "producer-id";
pub const HEADER_PRODUCER_EPOCH: &str = "producer-epoch";
pub const HEADER_PRODUCER_SEQ: &str = "producer-seq";
pub const HEADER_PRODUCER_CURRENT_EPOCH: &str = "producer-current-epoch";
pub const HEADER_PRODUCER_EXPECTED_SEQ: &str = "producer-expected-seq";
pub const HEADER_PRODUCER_RECEIVED_SEQ: &str = "producer-received-seq";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StreamStore>,
    pub options: ServerOptions,
    pub cursor: CursorOptions,
}

impl AppState {
    pub fn new(store: Arc<StreamStore>, options: ServerOptions, instance_id: &str) -> Self {
        let cursor = CursorOptions {
            interval_seconds: options.cursor_interval_seconds,
            epoch: options.cursor_epoch,
            instance_seed: cursor::instance_seed(instance_id),
        };
        Self {
            store,
            options,
            cursor,
        }
    }
}

/// Query parameters for GET requests.
#[derive(Debug, Deserialize)]
pub struct ReadQuery {
    pub offset: Option<String>,
    pub live: Option<String>,
    pub cursor: Option<String>,
}

/// Create the router with all stream endpoints.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::IF_MATCH,
            header::IF_NONE_MATCH,
            HeaderName::from_static(HEADER_STREAM_SEQ),
            HeaderName::from_static(HEADER_STREAM_TTL),
            HeaderName::from_static(HEADER_STREAM_EXPIRES_AT),
            HeaderName::from_static(HEADER_STREAM_CLOSE),
            HeaderName::from_static(HEADER_PRODUCER_ID),
            HeaderName::from_static(HEADER_PRODUCER_EPOCH),
            HeaderName::from_static(HEADER_PRODUCER_SEQ),
            HeaderName::from_static(HEADER_LAST_EVENT_ID),
        ])
        .expose_headers([
            header::ETAG,
            header::RETRY_AFTER,
            HeaderName::from_static(HEADER_STREAM_NEXT_OFFSET),
            HeaderName::from_static(HEADER_STREAM_UP_TO_DATE),
            HeaderName::from_static(HEADER_STREAM_CLOSED),
            HeaderName::from_static(HEADER_STREAM_CURSOR),
            HeaderName::from_static(HEADER_PRODUCER_CURRENT_EPOCH),
            HeaderName::from_static(HEADER_PRODUCER_EPOCH),
            HeaderName::from_static(HEADER_PRODUCER_EXPECTED_SEQ),
            HeaderName::from_static(HEADER_PRODUCER_RECEIVED_SEQ),
            HeaderName::from_static(HEADER_SSE_DATA_ENCODING),
        ]);

    let compression = state.options.compression;
    let router = Router::new()
        // Stream operations on wildcard paths
        .route("/{*path}", put(handle_create))
        .route("/{*path}", head(handle_head))
        .route("/{*path}", get(handle_read))
        .route("/{*path}", post(handle_append))
        .route("/{*path}", delete(handle_delete))
        .layer(cors)
        .with_state(state);

    if compression {
        // The default compression predicate skips text/event-stream, so
        // SSE responses pass through unbuffered.
        router.layer(CompressionLayer::new())
    } else {
        router
    }
}

/// PUT - Create a new stream
async fn handle_create(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let path = format!("/{}", path);
    debug!(path = %path, "creating stream");

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let ttl_seconds = match parse_ttl_header(&headers) {
        Ok(v) => v,
        Err(e) => return error_response(&e),
    };
    let expires_at = match parse_expires_at_header(&headers) {
        Ok(v) => v,
        Err(e) => return error_response(&e),
    };
    if ttl_seconds.is_some() && expires_at.is_some() {
        return error_response(&StoreError::TtlConflict);
    }

    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::BAD_REQUEST, "failed to read body").into_response(),
    };
    let initial_data = if body_bytes.is_empty() {
        None
    } else {
        Some(body_bytes)
    };

    let config = StreamConfig {
        content_type: content_type.clone(),
        ttl_seconds,
        expires_at,
        initial_data,
    };

    match state.store.create(&path, config) {
        Ok(outcome) => {
            let mut response = Response::builder()
                .status(if outcome.created {
                    StatusCode::CREATED
                } else {
                    StatusCode::OK
                })
                .header(HEADER_STREAM_NEXT_OFFSET, &outcome.next_offset)
                .header(header::ETAG, quote_etag(&outcome.next_offset))
                .header(header::LOCATION, &path);

            if let Some(ct) = content_type {
                response = response.header(header::CONTENT_TYPE, ct);
            }
            finish(response.body(Body::empty()))
        }
        Err(e) => error_response(&e),
    }
}

/// HEAD - Get stream metadata
async fn handle_head(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<ReadQuery>,
    headers: HeaderMap,
) -> Response {
    let path = format!("/{}", path);

    let snapshot = match state.store.snapshot(&path) {
        Ok(s) => s,
        Err(e) => return error_response(&e),
    };

    let etag = snapshot.etag();
    if if_none_match_matches(&headers, &etag) {
        return finish(
            Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header(header::ETAG, &etag)
                .header(HEADER_STREAM_NEXT_OFFSET, &snapshot.next_offset)
                .body(Body::empty()),
        );
    }

    let cursor = response_cursor(&state, query.cursor.as_deref());
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(HEADER_STREAM_NEXT_OFFSET, &snapshot.next_offset)
        .header(HEADER_STREAM_CURSOR, cursor.to_string())
        .header(header::ETAG, &etag);

    if let Some(ct) = &snapshot.content_type {
        response = response.header(header::CONTENT_TYPE, ct.as_str());
    }
    if snapshot.closed {
        response = response.header(HEADER_STREAM_CLOSED, "true");
    }
    if let Some(ttl) = snapshot.ttl_seconds {
        response = response.header(HEADER_STREAM_TTL, ttl.to_string());
    }
    if let Some(expires) = snapshot.expires_at {
        response = response.header(
            HEADER_STREAM_EXPIRES_AT,
            expires.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }
    finish(response.body(Body::empty()))
}

/// GET - Read from stream (catch-up, long-poll, or SSE)
async fn handle_read(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<ReadQuery>,
    headers: HeaderMap,
) -> Response {
    let path = format!("/{}", path);

    let snapshot = match state.store.snapshot(&path) {
        Ok(s) => s,
        Err(e) => return error_response(&e),
    };

    // Last-Event-ID stands in for the offset on SSE reconnects.
    let offset = query
        .offset
        .clone()
        .or_else(|| {
            headers
                .get(HEADER_LAST_EVENT_ID)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        })
        .unwrap_or_else(|| OFFSET_BEGINNING.to_string());
    if offset.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty offset parameter").into_response();
    }

    let cursor = response_cursor(&state, query.cursor.as_deref());

    match query.live.as_deref() {
        Some("sse") => handle_sse(state, path, offset, cursor, snapshot).await,
        Some("long-poll") => handle_long_poll(state, path, offset, cursor, snapshot).await,
        None => handle_catch_up(state, path, offset, cursor, snapshot, &headers).await,
        Some(other) => {
            (StatusCode::BAD_REQUEST, format!("unknown live mode: {other}")).into_response()
        }
    }
}

/// Handle catch-up read (immediate response)
async fn handle_catch_up(
    state: AppState,
    path: String,
    offset: String,
    cursor: u64,
    snapshot: StreamSnapshot,
    headers: &HeaderMap,
) -> Response {
    let etag = snapshot.etag();
    if if_none_match_matches(headers, &etag) {
        return finish(
            Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header(header::ETAG, &etag)
                .header(HEADER_STREAM_NEXT_OFFSET, &snapshot.next_offset)
                .body(Body::empty()),
        );
    }

    let result = match state.store.read(&path, &offset, state.options.max_read_bytes) {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    read_response(&snapshot, &result, cursor)
}

/// Handle long-poll read (wait for new data)
async fn handle_long_poll(
    state: AppState,
    path: String,
    offset: String,
    cursor: u64,
    snapshot: StreamSnapshot,
) -> Response {
    // Anything already buffered (or a closed tail) is answered immediately.
    let result = match state.store.read(&path, &offset, state.options.max_read_bytes) {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    if !result.records.is_empty() || !result.up_to_date || result.closed {
        return read_response(&snapshot, &result, cursor);
    }

    // Park at the tail. Subscribe before re-checking so an append racing
    // with the subscription is never missed.
    let (permit, mut rx) = match state.store.tail().waiter() {
        Ok(w) => w,
        Err(e) => return error_response(&e),
    };
    let recheck = match state.store.read(&path, &offset, state.options.max_read_bytes) {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    if !recheck.records.is_empty() || recheck.closed {
        return read_response(&snapshot, &recheck, cursor);
    }
    let parked_at = recheck.next_offset;

    let deadline = Instant::now() + Duration::from_millis(state.options.long_poll_timeout_ms);
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        match timeout(deadline - now, rx.recv()).await {
            Ok(Ok(event)) if event.path == path => match event.signal {
                TailSignal::Append { next_offset } => {
                    if compare_offsets(&next_offset, &parked_at) != Ordering::Greater {
                        continue;
                    }
                    let result =
                        match state.store.read(&path, &offset, state.options.max_read_bytes) {
                            Ok(r) => r,
                            Err(e) => return error_response(&e),
                        };
                    if result.records.is_empty() {
                        continue;
                    }
                    drop(permit);
                    return read_response(&snapshot, &result, cursor);
                }
                TailSignal::Closed { .. } => {
                    let result =
                        match state.store.read(&path, &offset, state.options.max_read_bytes) {
                            Ok(r) => r,
                            Err(e) => return error_response(&e),
                        };
                    drop(permit);
                    return read_response(&snapshot, &result, cursor);
                }
                TailSignal::Deleted => {
                    drop(permit);
                    return error_response(&StoreError::NotFound(path));
                }
            },
            Ok(Ok(_)) => continue, // different stream
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                // Fell behind the bus; the store is the source of truth.
                let result = match state.store.read(&path, &offset, state.options.max_read_bytes)
                {
                    Ok(r) => r,
                    Err(e) => return error_response(&e),
                };
                if !result.records.is_empty() || result.closed {
                    drop(permit);
                    return read_response(&snapshot, &result, cursor);
                }
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => break,
            Err(_) => break, // deadline
        }
    }
    drop(permit);

    // Timed out: empty body, unchanged tail.
    match state.store.snapshot(&path) {
        Ok(current) => finish(
            Response::builder()
                .status(StatusCode::OK)
                .header(HEADER_STREAM_NEXT_OFFSET, &current.next_offset)
                .header(HEADER_STREAM_CURSOR, cursor.to_string())
                .header(HEADER_STREAM_UP_TO_DATE, "true")
                .header(header::ETAG, current.etag())
                .body(Body::empty()),
        ),
        Err(e) => error_response(&e),
    }
}

/// Handle SSE streaming
async fn handle_sse(
    state: AppState,
    path: String,
    offset: String,
    cursor: u64,
    snapshot: StreamSnapshot,
) -> Response {
    // Validate the start offset up front so protocol errors surface as
    // statuses instead of an immediately-closed event stream.
    if let Err(e) = state.store.read(&path, &offset, 1) {
        return error_response(&e);
    }

    let (permit, rx) = match state.store.tail().waiter() {
        Ok(w) => w,
        Err(e) => return error_response(&e),
    };

    let base64_mode = sse_base64_mode(&snapshot);
    let heartbeat = Duration::from_millis(state.options.heartbeat_ms);
    let stream = sse_event_stream(state, path, offset, cursor, permit, rx, base64_mode);

    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(heartbeat).text("keepalive"))
        .into_response();
    if base64_mode {
        response.headers_mut().insert(
            HeaderName::from_static(HEADER_SSE_DATA_ENCODING),
            HeaderValue::from_static("base64"),
        );
    }
    response
}

/// Binary payloads are base64-encoded inside SSE data events; JSON and
/// text pass through verbatim.
fn sse_base64_mode(snapshot: &StreamSnapshot) -> bool {
    match snapshot.content_type.as_deref().map(normalize_content_type) {
        Some(ct) => {
            !(ct.eq_ignore_ascii_case("application/json")
                || ct.to_ascii_lowercase().starts_with("text/"))
        }
        None => true,
    }
}

#[allow(clippy::too_many_arguments)]
fn sse_event_stream(
    state: AppState,
    path: String,
    mut offset: String,
    initial_cursor: u64,
    permit: WaiterPermit,
    mut rx: broadcast::Receiver<TailEvent>,
    base64_mode: bool,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let cursor_options = state.cursor.clone();
    let heartbeat = Duration::from_millis(state.options.heartbeat_ms);

    async_stream::stream! {
        // Holds the waiter slot for the lifetime of the connection.
        let _permit = permit;
        let mut current_cursor = initial_cursor;

        // Replay everything already buffered, then advertise the tail.
        match state.store.read(&path, &offset, 0) {
            Ok(result) => {
                for record in &result.records {
                    yield Ok(data_event(record, base64_mode));
                }
                offset = result.next_offset.clone();
                current_cursor = cursor::generate_response_cursor(Some(current_cursor), &cursor_options);
                yield Ok(control_event(&result.next_offset, current_cursor, result.up_to_date, result.closed));
                if result.closed {
                    return;
                }
            }
            Err(e) => {
                warn!(path = %path, error = %e, "sse replay failed");
                return;
            }
        }

        loop {
            match timeout(heartbeat, rx.recv()).await {
                Ok(Ok(event)) if event.path == path => match event.signal {
                    TailSignal::Append { next_offset } => {
                        if compare_offsets(&next_offset, &offset) != Ordering::Greater {
                            continue;
                        }
                        match state.store.read(&path, &offset, 0) {
                            Ok(result) => {
                                for record in &result.records {
                                    yield Ok(data_event(record, base64_mode));
                                }
                                offset = result.next_offset.clone();
                                current_cursor = cursor::generate_response_cursor(Some(current_cursor), &cursor_options);
                                yield Ok(control_event(&result.next_offset, current_cursor, result.up_to_date, result.closed));
                            }
                            Err(_) => break,
                        }
                    }
                    TailSignal::Closed { .. } => {
                        // Flush anything between our position and the final
                        // tail, then say goodbye.
                        if let Ok(result) = state.store.read(&path, &offset, 0) {
                            for record in &result.records {
                                yield Ok(data_event(record, base64_mode));
                            }
                            offset = result.next_offset.clone();
                        }
                        current_cursor = cursor::generate_response_cursor(Some(current_cursor), &cursor_options);
                        yield Ok(control_event(&offset, current_cursor, true, true));
                        break;
                    }
                    TailSignal::Deleted => break,
                },
                Ok(Ok(_)) => continue, // different stream
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                    match state.store.read(&path, &offset, 0) {
                        Ok(result) => {
                            for record in &result.records {
                                yield Ok(data_event(record, base64_mode));
                            }
                            offset = result.next_offset.clone();
                            current_cursor = cursor::generate_response_cursor(Some(current_cursor), &cursor_options);
                            yield Ok(control_event(&result.next_offset, current_cursor, result.up_to_date, result.closed));
                            if result.closed {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => break,
                Err(_) => {
                    // Heartbeat: re-advertise the tail so proxies and
                    // clients see a live connection.
                    current_cursor = cursor::generate_response_cursor(Some(current_cursor), &cursor_options);
                    yield Ok(control_event(&offset, current_cursor, true, false));
                }
            }
        }
    }
}

fn data_event(record: &Record, base64_mode: bool) -> Event {
    let payload = if base64_mode {
        base64::engine::general_purpose::STANDARD.encode(&record.payload)
    } else {
        String::from_utf8_lossy(&record.payload).into_owned()
    };
    Event::default()
        .event("data")
        .data(payload)
        .id(record.end_offset.clone())
}

fn control_event(next_offset: &str, cursor: u64, up_to_date: bool, closed: bool) -> Event {
    let mut control = serde_json::json!({
        "streamNextOffset": next_offset,
        "streamCursor": cursor.to_string(),
        "upToDate": up_to_date,
    });
    if closed {
        control["streamClosed"] = serde_json::Value::Bool(true);
    }
    Event::default().event("control").data(control.to_string())
}

/// POST - Append data to stream
async fn handle_append(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let path = format!("/{}", path);

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let seq = headers
        .get(HEADER_STREAM_SEQ)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let if_match = headers
        .get(header::IF_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let close = header_flag(&headers, HEADER_STREAM_CLOSE);
    let producer = match parse_producer_headers(&headers) {
        Ok(p) => p,
        Err(e) => return error_response(&e),
    };

    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::BAD_REQUEST, "failed to read body").into_response(),
    };

    let req = AppendRequest {
        body: body_bytes,
        content_type,
        seq,
        producer,
        if_match,
        close,
    };

    match state.store.append(&path, req) {
        Ok(outcome) => {
            let status = if outcome.kind == AppendKind::Duplicate {
                StatusCode::NO_CONTENT
            } else {
                StatusCode::OK
            };
            let mut response = Response::builder()
                .status(status)
                .header(HEADER_STREAM_NEXT_OFFSET, &outcome.next_offset)
                .header(header::ETAG, quote_etag(&outcome.next_offset));
            if outcome.closed {
                response = response.header(HEADER_STREAM_CLOSED, "true");
            }
            finish(response.body(Body::empty()))
        }
        Err(e) => error_response(&e),
    }
}

/// DELETE - Delete a stream
async fn handle_delete(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    let path = format!("/{}", path);

    match state.store.delete(&path) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error_response(&e),
    }
}

/// Build a 200 read response with the stream's framing.
fn read_response(snapshot: &StreamSnapshot, result: &ReadResult, cursor: u64) -> Response {
    let body = format_body(snapshot.is_json(), &result.records);

    // Appends may land between the snapshot and the read; advertise the
    // newest tail we know of.
    let tail = if compare_offsets(&result.next_offset, &snapshot.next_offset) == Ordering::Less {
        snapshot.next_offset.clone()
    } else {
        result.next_offset.clone()
    };

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(HEADER_STREAM_NEXT_OFFSET, &result.next_offset)
        .header(HEADER_STREAM_CURSOR, cursor.to_string())
        .header(
            HEADER_STREAM_UP_TO_DATE,
            if result.up_to_date { "true" } else { "false" },
        )
        .header(header::ETAG, quote_etag(&tail));

    if result.closed {
        response = response.header(HEADER_STREAM_CLOSED, "true");
    }
    if let Some(ct) = &snapshot.content_type {
        response = response.header(header::CONTENT_TYPE, ct.as_str());
    }
    finish(response.body(Body::from(body)))
}

/// Frame records for a catch-up body: JSON streams get a JSON array of
/// the records, everything else is raw concatenation.
fn format_body(json_mode: bool, records: &[Record]) -> Vec<u8> {
    if json_mode {
        let mut out = vec![b'['];
        for (i, record) in records.iter().enumerate() {
            if i > 0 {
                out.push(b',');
            }
            out.extend_from_slice(&record.payload);
        }
        out.push(b']');
        out
    } else {
        records
            .iter()
            .flat_map(|r| r.payload.iter().copied())
            .collect()
    }
}

/// Map a store error onto its status and protocol headers.
fn error_response(err: &StoreError) -> Response {
    let status =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::builder().status(status);

    match err {
        StoreError::Closed { next_offset } => {
            response = response
                .header(HEADER_STREAM_CLOSED, "true")
                .header(HEADER_STREAM_NEXT_OFFSET, next_offset)
                .header(header::ETAG, quote_etag(next_offset));
        }
        StoreError::StaleEpoch { current, .. } => {
            response = response
                .header(HEADER_PRODUCER_CURRENT_EPOCH, current.to_string())
                // Shipped clients read the bare epoch header on 403.
                .header(HEADER_PRODUCER_EPOCH, current.to_string());
        }
        StoreError::ProducerSeqRegression { expected, received }
        | StoreError::ProducerSeqGap { expected, received } => {
            response = response
                .header(HEADER_PRODUCER_EXPECTED_SEQ, expected.to_string())
                .header(HEADER_PRODUCER_RECEIVED_SEQ, received.to_string());
        }
        StoreError::PreconditionFailed { current } => {
            response = response.header(header::ETAG, current);
        }
        StoreError::Busy(_) => {
            response = response.header(header::RETRY_AFTER, "1");
        }
        StoreError::Io(_) | StoreError::Meta(_) | StoreError::Corrupt { .. } => {
            warn!(error = %err, "internal storage error");
            return finish(
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::from("internal storage error")),
            );
        }
        _ => {}
    }

    finish(response.body(Body::from(err.to_string())))
}

fn quote_etag(offset: &str) -> String {
    format!("\"{}\"", offset)
}

/// Strong If-None-Match comparison; `*` matches any existing stream.
fn if_none_match_matches(headers: &HeaderMap, etag: &str) -> bool {
    let Some(value) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    if value.trim() == "*" {
        return true;
    }
    value
        .split(',')
        .any(|candidate| candidate.trim().trim_matches('"') == etag.trim_matches('"'))
}

fn header_flag(headers: &HeaderMap, name: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// The three producer headers travel together or not at all.
fn parse_producer_headers(headers: &HeaderMap) -> Result<Option<ProducerHeaders>, StoreError> {
    let id = headers.get(HEADER_PRODUCER_ID).and_then(|v| v.to_str().ok());
    let epoch = headers
        .get(HEADER_PRODUCER_EPOCH)
        .and_then(|v| v.to_str().ok());
    let seq = headers.get(HEADER_PRODUCER_SEQ).and_then(|v| v.to_str().ok());

    match (id, epoch, seq) {
        (None, None, None) => Ok(None),
        (Some(id), Some(epoch), Some(seq)) => {
            if id.is_empty() {
                return Err(StoreError::InvalidProducer(
                    "Producer-Id must not be empty".to_string(),
                ));
            }
            let epoch = epoch.parse().map_err(|_| {
                StoreError::InvalidProducer("Producer-Epoch must be a non-negative integer".to_string())
            })?;
            let seq = seq.parse().map_err(|_| {
                StoreError::InvalidProducer("Producer-Seq must be a non-negative integer".to_string())
            })?;
            Ok(Some(ProducerHeaders {
                id: id.to_string(),
                epoch,
                seq,
            }))
        }
        _ => Err(StoreError::InvalidProducer(
            "Producer-Id, Producer-Epoch and Producer-Seq must be sent together".to_string(),
        )),
    }
}

/// Parse Stream-TTL header. Present-but-malformed is an error.
fn parse_ttl_header(headers: &HeaderMap) -> Result<Option<u64>, StoreError> {
    match headers.get(HEADER_STREAM_TTL) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Some)
            .ok_or(StoreError::InvalidTtl),
    }
}

/// Parse Stream-Expires-At header as RFC3339.
fn parse_expires_at_header(headers: &HeaderMap) -> Result<Option<DateTime<Utc>>, StoreError> {
    match headers.get(HEADER_STREAM_EXPIRES_AT) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .ok_or(StoreError::InvalidExpiresAt),
    }
}

fn response_cursor(state: &AppState, client: Option<&str>) -> u64 {
    let client = client.and_then(cursor::parse_cursor);
    cursor::generate_response_cursor(client, &state.cursor)
}

fn finish(result: Result<Response<Body>, axum::http::Error>) -> Response {
    match result {
        Ok(response) => response.into_response(),
        Err(e) => {
            warn!(error = %e, "failed to build response");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

/// Start the server: open the store, spawn the retention sweeper and the
/// optional registry mirror, and serve until a shutdown signal arrives.
pub async fn start_server(options: ServerOptions) -> Result<(), StoreError> {
    let store = StreamStore::open(StoreOptions::from_server(&options))?;

    let instance_id = match &options.data_dir {
        Some(dir) => load_or_create_instance_id(dir)?,
        None => uuid::Uuid::new_v4().to_string(),
    };

    let sweeper = spawn_retention_sweeper(
        store.clone(),
        Duration::from_millis(options.retention_scan_interval_ms.max(1)),
    );
    if let Some(registry) = options.registry_stream.clone() {
        spawn_registry_mirror(store.clone(), registry);
    }

    let state = AppState::new(store, options.clone(), &instance_id);
    let router = create_router(state);

    let addr = format!("{}:{}", options.host, options.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %listener.local_addr()?, "durable streams server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    sweeper.abort();
    info!("server shut down gracefully");
    Ok(())
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful
/// shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    use super::*;

    fn create_test_app() -> Router {
        let state = AppState::new(
            StreamStore::in_memory(),
            ServerOptions {
                compression: false,
                long_poll_timeout_ms: 200,
                ..Default::default()
            },
            "test-instance",
        );
        create_router(state)
    }

    async fn put_stream(app: &Router, uri: &str, content_type: &str) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri(uri)
                    .header("Content-Type", content_type)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_create_stream() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/v1/stream/test")
                    .header("Content-Type", "text/plain")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers()[HEADER_STREAM_NEXT_OFFSET].to_str().unwrap(),
            "-1"
        );
        assert_eq!(response.headers()["etag"].to_str().unwrap(), "\"-1\"");
    }

    #[tokio::test]
    async fn test_create_rejects_ttl_and_expires_together() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/v1/stream/test")
                    .header("Stream-TTL", "60")
                    .header("Stream-Expires-At", "2030-01-01T00:00:00Z")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let app = create_test_app();
        put_stream(&app, "/v1/stream/test", "text/plain").await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/stream/test")
                    .header("Content-Type", "text/plain")
                    .body(Body::from("hello world"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let offset = response.headers()[HEADER_STREAM_NEXT_OFFSET]
            .to_str()
            .unwrap()
            .to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/v1/stream/test?offset=-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[HEADER_STREAM_NEXT_OFFSET].to_str().unwrap(),
            offset
        );
        assert_eq!(
            response.headers()[HEADER_STREAM_UP_TO_DATE].to_str().unwrap(),
            "true"
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn test_if_none_match_returns_304() {
        let app = create_test_app();
        put_stream(&app, "/v1/stream/test", "text/plain").await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("HEAD")
                    .uri("/v1/stream/test")
                    .header("If-None-Match", "\"-1\"")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/v1/stream/test?offset=-1")
                    .header("If-None-Match", "\"-1\"")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_delete_stream() {
        let app = create_test_app();
        put_stream(&app, "/v1/stream/test", "text/plain").await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/v1/stream/test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/v1/stream/test?offset=-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_long_poll_timeout_returns_200_empty() {
        let app = create_test_app();
        put_stream(&app, "/v1/stream/test", "text/plain").await;

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/v1/stream/test?offset=-1&live=long-poll")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[HEADER_STREAM_UP_TO_DATE].to_str().unwrap(),
            "true"
        );
        assert_eq!(
            response.headers()[HEADER_STREAM_NEXT_OFFSET].to_str().unwrap(),
            "-1"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(body.is_empty());
    }
}
