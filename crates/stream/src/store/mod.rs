//! Stream store: the per-stream coordinator over log and metadata storage.
//!
//! Every mutating operation on one stream runs under that stream's write
//! lock, which makes appends, closes and deletes appear atomic and totally
//! ordered. Readers take the read lock only long enough to snapshot the
//! tail and clone the record index; payload bytes are streamed without any
//! lock because the appended region never changes.
//!
//! In file-backed mode the durability order is: log frames are written and
//! flushed first, then the metadata record. Crash recovery reconciles the
//! two on open by truncating log bytes the metadata never acknowledged, or
//! rebuilding the metadata tail from the log when the log is shorter.

mod log;
mod meta;

pub use meta::load_or_create_instance_id;

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::hooks::LifecycleBus;
use crate::types::{
    compare_offsets, format_offset, normalize_content_type, parse_offset, AppendKind,
    AppendOutcome, CreateOutcome, FsyncPolicy, ProducerEntry, ReadResult, Record, ServerOptions,
    StreamConfig, StreamLifecycleEvent, StreamMeta, StreamSnapshot, OFFSET_BEGINNING, OFFSET_NOW,
};
use crate::waiters::{TailBus, TailEvent, TailSignal};

use log::{log_file_name, HandleCache, IndexedRecord, RecordPayload};
use meta::MetaStore;

/// Producer entries kept per stream before the least-recently-updated one
/// is evicted.
const PRODUCER_TABLE_CAP: usize = 1024;

/// Append handles kept open across all streams.
const HANDLE_CACHE_CAP: usize = 128;

/// Store construction options, the subset of [`ServerOptions`] the storage
/// layer cares about.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Storage root; None selects the in-memory backend
    pub data_dir: Option<PathBuf>,
    pub fsync: FsyncPolicy,
    /// Concurrent long-poll/SSE waiters before BUSY (0 = unbounded)
    pub max_waiters: usize,
    /// Per-stream byte budget, in-memory mode only (0 = unlimited)
    pub max_stream_bytes: u64,
    /// Process byte budget, in-memory mode only (0 = unlimited)
    pub max_total_bytes: u64,
    /// Per-stream retention horizon in bytes (0 = keep everything)
    pub retention_max_bytes: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            fsync: FsyncPolicy::Always,
            max_waiters: 4096,
            max_stream_bytes: 0,
            max_total_bytes: 0,
            retention_max_bytes: 0,
        }
    }
}

impl StoreOptions {
    pub fn from_server(options: &ServerOptions) -> Self {
        Self {
            data_dir: options.data_dir.clone(),
            fsync: options.fsync,
            max_waiters: options.max_waiters,
            max_stream_bytes: options.max_stream_bytes,
            max_total_bytes: options.max_total_bytes,
            retention_max_bytes: options.retention_max_bytes,
        }
    }
}

/// Producer protocol headers on an append.
#[derive(Debug, Clone)]
pub struct ProducerHeaders {
    pub id: String,
    pub epoch: u64,
    pub seq: u64,
}

/// Everything a POST carries into the coordinator.
#[derive(Debug, Clone, Default)]
pub struct AppendRequest {
    pub body: Bytes,
    pub content_type: Option<String>,
    /// Non-producer monotonic sequence (Stream-Seq)
    pub seq: Option<String>,
    pub producer: Option<ProducerHeaders>,
    /// Optimistic concurrency (If-Match), `*` accepts any existing state
    pub if_match: Option<String>,
    /// Close the stream atomically with this append
    pub close: bool,
}

impl AppendRequest {
    /// A plain append with no coordination headers.
    pub fn body(body: Bytes) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }
}

struct Persistence {
    meta: MetaStore,
    logs: PathBuf,
    handles: Mutex<HandleCache>,
    fsync: FsyncPolicy,
}

impl Persistence {
    fn log_path(&self, stream: &str) -> PathBuf {
        self.logs.join(log_file_name(stream))
    }
}

struct StreamState {
    meta: StreamMeta,
    records: VecDeque<IndexedRecord>,
    /// Cleared under the write lock when the stream is deleted, so ops
    /// already holding the slot observe the deletion.
    live: bool,
}

type Slot = Arc<RwLock<StreamState>>;

/// Coordinator over all streams owned by this server instance.
pub struct StreamStore {
    streams: RwLock<HashMap<String, Slot>>,
    persistence: Option<Persistence>,
    tail: TailBus,
    hooks: LifecycleBus,
    options: StoreOptions,
    /// Retained payload bytes across all in-memory streams.
    total_bytes: AtomicU64,
}

impl StreamStore {
    /// Create an in-memory store with default limits. Used for tests and
    /// ephemeral deployments.
    pub fn in_memory() -> Arc<Self> {
        Self::new_inner(None, StoreOptions::default())
    }

    /// Open a store. With a data directory this loads every stream's
    /// metadata and reconciles it against the log files on disk.
    pub fn open(options: StoreOptions) -> Result<Arc<Self>, StoreError> {
        let Some(data_dir) = options.data_dir.clone() else {
            return Ok(Self::new_inner(None, options));
        };

        let meta_store = MetaStore::open(&data_dir)?;
        let logs = meta::logs_dir(&data_dir);

        let mut streams = HashMap::new();
        for mut m in meta_store.load_all()? {
            let (records, changed) = recover_stream(&logs, &mut m)?;
            if changed {
                meta_store.put(&m)?;
            }
            streams.insert(
                m.path.clone(),
                Arc::new(RwLock::new(StreamState {
                    meta: m,
                    records,
                    live: true,
                })),
            );
        }
        info!(streams = streams.len(), dir = %data_dir.display(), "opened file-backed stream store");

        let persistence = Persistence {
            meta: meta_store,
            logs,
            handles: Mutex::new(HandleCache::new(HANDLE_CACHE_CAP)),
            fsync: options.fsync,
        };
        let store = Self::new_inner(Some(persistence), options);
        *store.streams.write() = streams;
        Ok(store)
    }

    fn new_inner(persistence: Option<Persistence>, options: StoreOptions) -> Arc<Self> {
        Arc::new(Self {
            streams: RwLock::new(HashMap::new()),
            persistence,
            tail: TailBus::new(options.max_waiters),
            hooks: LifecycleBus::new(),
            options,
            total_bytes: AtomicU64::new(0),
        })
    }

    /// The tail-notification fabric, for long-poll and SSE readers.
    pub fn tail(&self) -> &TailBus {
        &self.tail
    }

    /// The lifecycle hook bus.
    pub fn hooks(&self) -> &LifecycleBus {
        &self.hooks
    }

    /// Check if a stream exists (and is not expired).
    pub fn has(&self, path: &str) -> bool {
        self.snapshot(path).is_ok()
    }

    /// List all live streams.
    pub fn list(&self) -> Vec<String> {
        self.streams
            .read()
            .iter()
            .filter(|(_, slot)| {
                let st = slot.read();
                st.live && !st.meta.is_expired()
            })
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Create a new stream.
    ///
    /// Idempotent when the existing stream has the same content type and
    /// expiry configuration; conflicting configuration is an error.
    pub fn create(&self, path: &str, config: StreamConfig) -> Result<CreateOutcome, StoreError> {
        if config.ttl_seconds.is_some() && config.expires_at.is_some() {
            return Err(StoreError::TtlConflict);
        }

        loop {
            if let Some(slot) = self.streams.read().get(path).cloned() {
                let expired = {
                    let st = slot.read();
                    if st.live && !st.meta.is_expired() {
                        return check_idempotent(&st.meta, &config);
                    }
                    st.live
                };
                if expired {
                    let _ = self.delete(path)?;
                }
                // Deleted (or raced with a delete); retry as a fresh create.
                continue;
            }

            let now = Utc::now();
            let now_ms = now.timestamp_millis();
            let mut meta = StreamMeta::new(path.to_string());
            meta.created_at = now_ms;
            meta.content_type = config.content_type.clone();
            meta.ttl_seconds = config.ttl_seconds;
            meta.expires_at = config.expires_at.or_else(|| {
                config
                    .ttl_seconds
                    .map(|secs| now + chrono::Duration::seconds(secs as i64))
            });

            let payloads = match &config.initial_data {
                Some(data) if !data.is_empty() => split_payloads(data.clone(), meta.is_json())?,
                _ => Vec::new(),
            };
            let added: u64 = payloads.iter().map(|p| p.len() as u64).sum();
            self.check_budgets(0, added)?;

            let mut map = self.streams.write();
            if map.contains_key(path) {
                // Lost a create race; re-evaluate against the winner.
                drop(map);
                continue;
            }

            let mut records = VecDeque::new();
            let file_mode = self.persistence.is_some();
            if let Some(p) = &self.persistence {
                if !payloads.is_empty() {
                    let log_path = p.log_path(path);
                    let handle = p.handles.lock().get(path, &log_path)?;
                    log::append_frames(&handle, &payloads, p.fsync)?;
                }
            }
            apply_records(&mut meta, &mut records, &payloads, file_mode, now_ms);
            if let Some(p) = &self.persistence {
                p.meta.put(&meta)?;
            } else {
                self.total_bytes.fetch_add(added, Ordering::AcqRel);
            }

            let next_offset = meta.next_offset();
            let content_type = meta.content_type.clone();
            map.insert(
                path.to_string(),
                Arc::new(RwLock::new(StreamState {
                    meta,
                    records,
                    live: true,
                })),
            );
            drop(map);

            info!(path = %path, "created stream");
            self.hooks.emit(StreamLifecycleEvent::Created {
                path: path.to_string(),
                content_type,
                timestamp: now_ms,
            });
            if !payloads.is_empty() {
                self.tail.publish(TailEvent {
                    path: path.to_string(),
                    signal: TailSignal::Append {
                        next_offset: next_offset.clone(),
                    },
                });
            }

            return Ok(CreateOutcome {
                created: true,
                next_offset,
            });
        }
    }

    /// Append to a stream, running the full coordination ladder: closed
    /// check, content-type check, If-Match, producer protocol, Stream-Seq.
    pub fn append(&self, path: &str, req: AppendRequest) -> Result<AppendOutcome, StoreError> {
        let slot = self.slot(path)?;
        let mut st = slot.write();
        if !st.live {
            return Err(StoreError::NotFound(path.to_string()));
        }
        if st.meta.is_expired() {
            drop(st);
            let _ = self.delete(path);
            return Err(StoreError::NotFound(path.to_string()));
        }

        if st.meta.closed {
            // A retry of the write that closed the stream still deduplicates.
            if let Some(p) = &req.producer {
                if let Some(entry) = st.meta.producers.get(&p.id) {
                    if p.epoch == entry.epoch && (p.seq as i64) == entry.last_seq {
                        return Ok(AppendOutcome {
                            next_offset: entry.last_offset.clone(),
                            kind: AppendKind::Duplicate,
                            closed: true,
                        });
                    }
                }
            }
            if req.close && req.body.is_empty() {
                // Closing a closed stream is idempotent.
                return Ok(AppendOutcome {
                    next_offset: st.meta.next_offset(),
                    kind: AppendKind::CloseOnly,
                    closed: true,
                });
            }
            return Err(StoreError::Closed {
                next_offset: st.meta.next_offset(),
            });
        }

        if let Some(ct) = req.content_type.as_deref() {
            if let Some(stream_ct) = st.meta.content_type.as_deref() {
                if normalize_content_type(ct) != normalize_content_type(stream_ct) {
                    return Err(StoreError::ContentTypeMismatch {
                        expected: stream_ct.to_string(),
                        actual: ct.to_string(),
                    });
                }
            }
        }

        if req.if_match.is_some() && req.producer.is_some() {
            return Err(StoreError::IfMatchWithProducer);
        }
        if req.seq.is_some() && req.producer.is_some() {
            return Err(StoreError::SeqWithProducer);
        }

        if let Some(tag) = req.if_match.as_deref() {
            if !if_match_accepts(tag, &st.meta.next_offset()) {
                return Err(StoreError::PreconditionFailed {
                    current: st.meta.etag(),
                });
            }
        }

        // Producer protocol: fence old epochs, deduplicate the previous
        // seq, reject gaps and regressions.
        let mut producer_update: Option<(String, u64, i64)> = None;
        if let Some(p) = &req.producer {
            let received = p.seq as i64;
            match st.meta.producers.get(&p.id) {
                Some(entry) => {
                    if p.epoch < entry.epoch {
                        return Err(StoreError::StaleEpoch {
                            current: entry.epoch,
                            received: p.epoch,
                        });
                    }
                    let last_seq = if p.epoch > entry.epoch { -1 } else { entry.last_seq };
                    if received == last_seq {
                        return Ok(AppendOutcome {
                            next_offset: entry.last_offset.clone(),
                            kind: AppendKind::Duplicate,
                            closed: false,
                        });
                    }
                    if received < last_seq {
                        return Err(StoreError::ProducerSeqRegression {
                            expected: (last_seq + 1) as u64,
                            received: p.seq,
                        });
                    }
                    if received > last_seq + 1 {
                        return Err(StoreError::ProducerSeqGap {
                            expected: (last_seq + 1) as u64,
                            received: p.seq,
                        });
                    }
                    producer_update = Some((p.id.clone(), p.epoch, received));
                }
                None => {
                    if p.seq != 0 {
                        return Err(StoreError::ProducerSeqGap {
                            expected: 0,
                            received: p.seq,
                        });
                    }
                    producer_update = Some((p.id.clone(), p.epoch, 0));
                }
            }
        } else if let Some(seq) = req.seq.as_deref() {
            if let Some(last) = st.meta.last_seq.as_deref() {
                if seq <= last {
                    return Err(StoreError::SequenceConflict {
                        last: last.to_string(),
                        received: seq.to_string(),
                    });
                }
            }
        }

        let payloads = if req.body.is_empty() {
            if req.close {
                Vec::new()
            } else {
                return Err(StoreError::EmptyBody);
            }
        } else {
            split_payloads(req.body.clone(), st.meta.is_json())?
        };

        let added: u64 = payloads.iter().map(|p| p.len() as u64).sum();
        self.check_budgets(st.meta.retained_bytes(), added)?;

        // Stage the mutation, make it durable, then commit in memory.
        let now_ms = Utc::now().timestamp_millis();
        let file_mode = self.persistence.is_some();
        let mut next_meta = st.meta.clone();
        let mut new_records = VecDeque::new();
        apply_records(&mut next_meta, &mut new_records, &payloads, file_mode, now_ms);
        if req.close {
            next_meta.closed = true;
        }
        if let Some(seq) = req.seq.as_deref() {
            next_meta.last_seq = Some(seq.to_string());
        }
        let next_offset = next_meta.next_offset();
        if let Some((id, epoch, seq)) = producer_update {
            upsert_producer(&mut next_meta, id, epoch, seq, next_offset.clone(), now_ms);
        }

        if let Some(p) = &self.persistence {
            if !payloads.is_empty() {
                let log_path = p.log_path(path);
                let handle = p.handles.lock().get(path, &log_path)?;
                log::append_frames(&handle, &payloads, p.fsync)?;
            }
            p.meta.put(&next_meta)?;
        } else {
            self.total_bytes.fetch_add(added, Ordering::AcqRel);
        }

        let appended = payloads.len();
        let closed = next_meta.closed;
        st.meta = next_meta;
        st.records.extend(new_records);
        drop(st);

        debug!(path = %path, offset = %next_offset, records = appended, "appended to stream");

        if appended > 0 {
            self.tail.publish(TailEvent {
                path: path.to_string(),
                signal: TailSignal::Append {
                    next_offset: next_offset.clone(),
                },
            });
            self.hooks.emit(StreamLifecycleEvent::Appended {
                path: path.to_string(),
                next_offset: next_offset.clone(),
                records: appended,
                timestamp: now_ms,
            });
        }
        if closed {
            self.tail.publish(TailEvent {
                path: path.to_string(),
                signal: TailSignal::Closed {
                    next_offset: next_offset.clone(),
                },
            });
        }

        let kind = if appended > 0 {
            AppendKind::Appended(appended)
        } else {
            AppendKind::CloseOnly
        };
        Ok(AppendOutcome {
            next_offset,
            kind,
            closed,
        })
    }

    /// Read records starting at `offset`. `"-1"` reads from the earliest
    /// retained record, `"now"` from the current tail. `max_bytes` caps the
    /// payload volume (0 = unlimited); a capped read reports
    /// `up_to_date = false`.
    pub fn read(&self, path: &str, offset: &str, max_bytes: u64) -> Result<ReadResult, StoreError> {
        let slot = self.slot(path)?;
        let st = slot.read();
        if !st.live {
            return Err(StoreError::NotFound(path.to_string()));
        }

        let tail = st.meta.next_offset();
        let earliest = st.meta.earliest_offset();

        let from_pair = match offset {
            OFFSET_BEGINNING => None,
            OFFSET_NOW => parse_offset(&tail),
            other => {
                let pair = parse_offset(other)
                    .ok_or_else(|| StoreError::InvalidOffset(other.to_string()))?;
                let token = format_offset(pair.0, pair.1);
                if compare_offsets(&token, &earliest) == std::cmp::Ordering::Less {
                    return Err(StoreError::Gone {
                        offset: token,
                        earliest,
                    });
                }
                if compare_offsets(&token, &tail) == std::cmp::Ordering::Greater {
                    return Err(StoreError::InvalidOffset(token));
                }
                Some(pair)
            }
        };

        let start = match from_pair {
            None => 0,
            Some((index, byte)) => st
                .records
                .partition_point(|r| (r.index, r.byte) < (index, byte)),
        };

        let mut selected: Vec<IndexedRecord> = Vec::new();
        let mut bytes_acc = 0u64;
        for record in st.records.iter().skip(start) {
            if max_bytes > 0 && !selected.is_empty() && bytes_acc + record.len as u64 > max_bytes {
                break;
            }
            bytes_acc += record.len as u64;
            selected.push(record.clone());
        }

        let next_offset = selected
            .last()
            .map(|r| r.end_offset())
            .unwrap_or_else(|| tail.clone());
        let up_to_date = compare_offsets(&next_offset, &tail) != std::cmp::Ordering::Less;
        let closed = st.meta.closed;
        drop(st);

        // Materialize payloads outside the lock; the appended region is
        // immutable, so this cannot observe torn state.
        let mut records = Vec::with_capacity(selected.len());
        let mut pending: Vec<(usize, (u64, u32))> = Vec::new();
        for (i, r) in selected.iter().enumerate() {
            let payload = match &r.payload {
                RecordPayload::Inline(bytes) => bytes.clone(),
                RecordPayload::File { pos } => {
                    pending.push((i, (*pos, r.len)));
                    Bytes::new()
                }
            };
            records.push(Record {
                payload,
                offset: r.offset(),
                end_offset: r.end_offset(),
                produced_at: r.produced_at,
            });
        }
        if !pending.is_empty() {
            let p = self
                .persistence
                .as_ref()
                .ok_or_else(|| StoreError::Corrupt {
                    path: path.to_string(),
                    detail: "file-backed record in an in-memory store".to_string(),
                })?;
            let items: Vec<(u64, u32)> = pending.iter().map(|(_, item)| *item).collect();
            let payloads = log::read_payloads(&p.log_path(path), &items)?;
            for ((i, _), payload) in pending.into_iter().zip(payloads) {
                records[i].payload = payload;
            }
        }

        Ok(ReadResult {
            records,
            next_offset,
            up_to_date,
            closed,
        })
    }

    /// Point-in-time metadata view for HEAD and the read handlers.
    pub fn snapshot(&self, path: &str) -> Result<StreamSnapshot, StoreError> {
        let slot = self.slot(path)?;
        let st = slot.read();
        if !st.live {
            return Err(StoreError::NotFound(path.to_string()));
        }
        let m = &st.meta;
        Ok(StreamSnapshot {
            path: m.path.clone(),
            content_type: m.content_type.clone(),
            next_offset: m.next_offset(),
            earliest_offset: m.earliest_offset(),
            closed: m.closed,
            ttl_seconds: m.ttl_seconds,
            expires_at: m.expires_at,
            created_at: m.created_at,
        })
    }

    /// Delete a stream, waking any parked readers with a terminal signal.
    pub fn delete(&self, path: &str) -> Result<bool, StoreError> {
        let slot = { self.streams.write().remove(path) };
        let Some(slot) = slot else {
            return Ok(false);
        };

        let mut st = slot.write();
        if !st.live {
            return Ok(false);
        }
        st.live = false;
        let retained = st.meta.retained_bytes();
        drop(st);

        if let Some(p) = &self.persistence {
            p.handles.lock().remove(path);
            match fs::remove_file(p.log_path(path)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            p.meta.delete(path)?;
        } else {
            self.total_bytes.fetch_sub(retained, Ordering::AcqRel);
        }

        info!(path = %path, "deleted stream");
        self.tail.publish(TailEvent {
            path: path.to_string(),
            signal: TailSignal::Deleted,
        });
        self.hooks.emit(StreamLifecycleEvent::Deleted {
            path: path.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        });
        Ok(true)
    }

    /// One retention pass: delete expired streams, prune past the horizon.
    /// Driven by the background sweeper; also safe to call directly.
    pub fn sweep(&self) {
        let paths: Vec<String> = { self.streams.read().keys().cloned().collect() };

        for path in paths {
            let Some(slot) = self.streams.read().get(&path).cloned() else {
                continue;
            };

            let expired = {
                let st = slot.read();
                st.live && st.meta.is_expired()
            };
            if expired {
                match self.delete(&path) {
                    Ok(true) => info!(path = %path, "expired stream removed"),
                    Ok(false) => {}
                    Err(e) => warn!(path = %path, error = %e, "failed to remove expired stream"),
                }
                continue;
            }

            if self.options.retention_max_bytes > 0 {
                if let Err(e) = self.prune_stream(&path, &slot) {
                    warn!(path = %path, error = %e, "retention prune failed");
                }
            }
        }
    }

    fn prune_stream(&self, path: &str, slot: &Slot) -> Result<u64, StoreError> {
        let max = self.options.retention_max_bytes;
        let mut st = slot.write();
        if !st.live || st.meta.retained_bytes() <= max {
            return Ok(0);
        }

        let mut next_meta = st.meta.clone();
        let mut drop_count = 0usize;
        let mut freed = 0u64;
        while next_meta.retained_bytes() > max {
            let Some(front) = st.records.get(drop_count) else {
                break;
            };
            next_meta.pruned_records += 1;
            next_meta.pruned_bytes += front.len as u64;
            freed += front.len as u64;
            drop_count += 1;
        }
        if drop_count == 0 {
            return Ok(0);
        }

        if let Some(p) = &self.persistence {
            p.meta.put(&next_meta)?;
        }
        st.meta = next_meta;
        st.records.drain(..drop_count);
        drop(st);

        if self.persistence.is_none() {
            self.total_bytes.fetch_sub(freed, Ordering::AcqRel);
        }
        debug!(path = %path, freed, records = drop_count, "pruned records past retention horizon");
        Ok(freed)
    }

    fn slot(&self, path: &str) -> Result<Slot, StoreError> {
        let slot = self
            .streams
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        let expired = {
            let st = slot.read();
            if !st.live {
                return Err(StoreError::NotFound(path.to_string()));
            }
            st.meta.is_expired()
        };
        if expired {
            let _ = self.delete(path)?;
            return Err(StoreError::NotFound(path.to_string()));
        }
        Ok(slot)
    }

    fn check_budgets(&self, stream_retained: u64, added: u64) -> Result<(), StoreError> {
        if self.persistence.is_some() || added == 0 {
            return Ok(());
        }
        if self.options.max_stream_bytes > 0
            && stream_retained + added > self.options.max_stream_bytes
        {
            return Err(StoreError::Busy("stream byte budget exceeded"));
        }
        if self.options.max_total_bytes > 0
            && self.total_bytes.load(Ordering::Acquire) + added > self.options.max_total_bytes
        {
            return Err(StoreError::Busy("process byte budget exceeded"));
        }
        Ok(())
    }
}

fn check_idempotent(
    existing: &StreamMeta,
    config: &StreamConfig,
) -> Result<CreateOutcome, StoreError> {
    let existing_ct = existing.content_type.as_deref().map(normalize_content_type);
    let new_ct = config.content_type.as_deref().map(normalize_content_type);

    let expiry_matches = match config.expires_at {
        // TTL-derived expiry is compared through ttl_seconds instead.
        None => existing.ttl_seconds == config.ttl_seconds,
        Some(expires_at) => existing.expires_at == Some(expires_at),
    };

    if existing_ct != new_ct || !expiry_matches {
        return Err(StoreError::ConfigMismatch);
    }
    Ok(CreateOutcome {
        created: false,
        next_offset: existing.next_offset(),
    })
}

/// Split an append body into record payloads. In JSON mode a top-level
/// array is flattened into one record per element; any other JSON document
/// is a single record.
fn split_payloads(body: Bytes, json_mode: bool) -> Result<Vec<Bytes>, StoreError> {
    if !json_mode {
        return Ok(vec![body]);
    }

    let value: serde_json::Value =
        serde_json::from_slice(&body).map_err(|_| StoreError::InvalidJson)?;
    match value {
        serde_json::Value::Array(items) => {
            if items.is_empty() {
                return Err(StoreError::EmptyArrayNotAllowed);
            }
            items
                .into_iter()
                .map(|item| {
                    serde_json::to_vec(&item)
                        .map(Bytes::from)
                        .map_err(|_| StoreError::InvalidJson)
                })
                .collect()
        }
        _ => Ok(vec![body]),
    }
}

fn apply_records(
    meta: &mut StreamMeta,
    records: &mut VecDeque<IndexedRecord>,
    payloads: &[Bytes],
    file_mode: bool,
    produced_at: i64,
) {
    for payload in payloads {
        let pos = log::framed_len(meta.record_count, meta.byte_count) + log::FRAME_HEADER_LEN;
        records.push_back(IndexedRecord {
            index: meta.record_count,
            byte: meta.byte_count,
            len: payload.len() as u32,
            produced_at,
            payload: if file_mode {
                RecordPayload::File { pos }
            } else {
                RecordPayload::Inline(payload.clone())
            },
        });
        meta.record_count += 1;
        meta.byte_count += payload.len() as u64;
    }
}

fn upsert_producer(
    meta: &mut StreamMeta,
    id: String,
    epoch: u64,
    seq: i64,
    offset: String,
    now_ms: i64,
) {
    meta.producers.insert(
        id.clone(),
        ProducerEntry {
            epoch,
            last_seq: seq,
            last_offset: offset,
            updated_at: now_ms,
        },
    );
    if meta.producers.len() > PRODUCER_TABLE_CAP {
        let oldest = meta
            .producers
            .iter()
            .filter(|(key, _)| key.as_str() != id)
            .min_by_key(|(_, entry)| entry.updated_at)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            meta.producers.remove(&key);
        }
    }
}

/// `*` accepts any existing state; otherwise strong comparison against the
/// current tail.
fn if_match_accepts(tag: &str, next_offset: &str) -> bool {
    let tag = tag.trim();
    tag == "*" || tag.trim_matches('"') == next_offset
}

fn recover_stream(
    logs: &Path,
    meta: &mut StreamMeta,
) -> Result<(VecDeque<IndexedRecord>, bool), StoreError> {
    let log_path = logs.join(log_file_name(&meta.path));
    let mut changed = false;

    let frames = if log_path.exists() {
        log::scan_frames(&log_path)?
    } else {
        Vec::new()
    };

    let kept = frames.len().min(meta.record_count as usize);
    let byte_count: u64 = frames.iter().take(kept).map(|f| f.len as u64).sum();
    if (kept as u64) != meta.record_count || byte_count != meta.byte_count {
        warn!(
            path = %meta.path,
            recorded = meta.record_count,
            found = kept,
            "log disagrees with metadata; rebuilding tail from last intact record"
        );
        meta.record_count = kept as u64;
        meta.byte_count = byte_count;
        changed = true;
    }
    if meta.pruned_records > meta.record_count {
        meta.pruned_records = meta.record_count;
        meta.pruned_bytes = meta.pruned_bytes.min(meta.byte_count);
        changed = true;
    }

    // Cut back bytes the metadata never acknowledged (crash mid-append).
    if log_path.exists() {
        let expected = log::framed_len(meta.record_count, meta.byte_count);
        let actual = fs::metadata(&log_path)?.len();
        if actual > expected {
            warn!(path = %meta.path, actual, expected, "truncating log past acknowledged tail");
            log::truncate_log(&log_path, expected)?;
        }
    }

    let mut records = VecDeque::new();
    let mut byte = 0u64;
    for (i, frame) in frames.iter().take(kept).enumerate() {
        if (i as u64) >= meta.pruned_records {
            records.push_back(IndexedRecord {
                index: i as u64,
                byte,
                len: frame.len,
                produced_at: meta.created_at,
                payload: RecordPayload::File { pos: frame.pos },
            });
        }
        byte += frame.len as u64;
    }

    Ok((records, changed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_config() -> StreamConfig {
        StreamConfig {
            content_type: Some("text/plain".to_string()),
            ..Default::default()
        }
    }

    fn append_body(store: &StreamStore, path: &str, body: &[u8]) -> AppendOutcome {
        store
            .append(path, AppendRequest::body(Bytes::copy_from_slice(body)))
            .unwrap()
    }

    #[test]
    fn test_create_and_read_empty() {
        let store = StreamStore::in_memory();

        let outcome = store.create("/test/stream", plain_config()).unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.next_offset, OFFSET_BEGINNING);

        let result = store.read("/test/stream", OFFSET_BEGINNING, 0).unwrap();
        assert!(result.records.is_empty());
        assert_eq!(result.next_offset, OFFSET_BEGINNING);
        assert!(result.up_to_date);
    }

    #[test]
    fn test_create_idempotent() {
        let store = StreamStore::in_memory();

        assert!(store.create("/s", plain_config()).unwrap().created);
        assert!(!store.create("/s", plain_config()).unwrap().created);
    }

    #[test]
    fn test_create_config_mismatch() {
        let store = StreamStore::in_memory();
        store.create("/s", plain_config()).unwrap();

        let other = StreamConfig {
            content_type: Some("application/json".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            store.create("/s", other),
            Err(StoreError::ConfigMismatch)
        ));

        let with_ttl = StreamConfig {
            content_type: Some("text/plain".to_string()),
            ttl_seconds: Some(60),
            ..Default::default()
        };
        assert!(matches!(
            store.create("/s", with_ttl),
            Err(StoreError::ConfigMismatch)
        ));
    }

    #[test]
    fn test_append_and_read() {
        let store = StreamStore::in_memory();
        store.create("/s", plain_config()).unwrap();

        let first = append_body(&store, "/s", b"hello");
        assert_eq!(first.next_offset, format_offset(1, 5));
        let second = append_body(&store, "/s", b"world");
        assert_eq!(second.next_offset, format_offset(2, 10));

        let result = store.read("/s", OFFSET_BEGINNING, 0).unwrap();
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.records[0].payload.as_ref(), b"hello");
        assert_eq!(result.records[1].payload.as_ref(), b"world");
        assert_eq!(result.next_offset, second.next_offset);
        assert!(result.up_to_date);

        // Resume from the first append's tail.
        let resumed = store.read("/s", &first.next_offset, 0).unwrap();
        assert_eq!(resumed.records.len(), 1);
        assert_eq!(resumed.records[0].payload.as_ref(), b"world");
    }

    #[test]
    fn test_read_now_skips_history() {
        let store = StreamStore::in_memory();
        store.create("/s", plain_config()).unwrap();
        append_body(&store, "/s", b"old");

        let result = store.read("/s", OFFSET_NOW, 0).unwrap();
        assert!(result.records.is_empty());
        assert!(result.up_to_date);
    }

    #[test]
    fn test_read_invalid_and_future_offsets() {
        let store = StreamStore::in_memory();
        store.create("/s", plain_config()).unwrap();
        append_body(&store, "/s", b"x");

        assert!(matches!(
            store.read("/s", "garbage", 0),
            Err(StoreError::InvalidOffset(_))
        ));
        assert!(matches!(
            store.read("/s", &format_offset(5, 500), 0),
            Err(StoreError::InvalidOffset(_))
        ));
    }

    #[test]
    fn test_capped_read_is_not_up_to_date() {
        let store = StreamStore::in_memory();
        store.create("/s", plain_config()).unwrap();
        append_body(&store, "/s", b"aaaa");
        append_body(&store, "/s", b"bbbb");

        let result = store.read("/s", OFFSET_BEGINNING, 4).unwrap();
        assert_eq!(result.records.len(), 1);
        assert!(!result.up_to_date);

        let rest = store.read("/s", &result.next_offset, 4).unwrap();
        assert_eq!(rest.records.len(), 1);
        assert!(rest.up_to_date);
    }

    #[test]
    fn test_json_array_flattening() {
        let store = StreamStore::in_memory();
        store
            .create(
                "/j",
                StreamConfig {
                    content_type: Some("application/json".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let outcome = store
            .append(
                "/j",
                AppendRequest::body(Bytes::from_static(b"[{\"a\":1},{\"a\":2}]")),
            )
            .unwrap();
        assert_eq!(outcome.kind, AppendKind::Appended(2));

        let result = store.read("/j", OFFSET_BEGINNING, 0).unwrap();
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.records[0].payload.as_ref(), b"{\"a\":1}");
        assert_eq!(result.records[1].payload.as_ref(), b"{\"a\":2}");

        // Contiguous offsets.
        assert_eq!(result.records[0].end_offset, result.records[1].offset);
    }

    #[test]
    fn test_json_rejects_empty_array_and_garbage() {
        let store = StreamStore::in_memory();
        store
            .create(
                "/j",
                StreamConfig {
                    content_type: Some("application/json".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(matches!(
            store.append("/j", AppendRequest::body(Bytes::from_static(b"[]"))),
            Err(StoreError::EmptyArrayNotAllowed)
        ));
        assert!(matches!(
            store.append("/j", AppendRequest::body(Bytes::from_static(b"not json"))),
            Err(StoreError::InvalidJson)
        ));
    }

    #[test]
    fn test_empty_body_rejected() {
        let store = StreamStore::in_memory();
        store.create("/s", plain_config()).unwrap();
        assert!(matches!(
            store.append("/s", AppendRequest::default()),
            Err(StoreError::EmptyBody)
        ));
    }

    #[test]
    fn test_content_type_mismatch() {
        let store = StreamStore::in_memory();
        store.create("/s", plain_config()).unwrap();

        let req = AppendRequest {
            body: Bytes::from_static(b"x"),
            content_type: Some("application/json".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            store.append("/s", req),
            Err(StoreError::ContentTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_if_match() {
        let store = StreamStore::in_memory();
        store.create("/s", plain_config()).unwrap();

        let req = AppendRequest {
            body: Bytes::from_static(b"X"),
            if_match: Some("\"-1\"".to_string()),
            ..Default::default()
        };
        let outcome = store.append("/s", req).unwrap();

        // Stale tag fails with the current etag.
        let stale = AppendRequest {
            body: Bytes::from_static(b"Y"),
            if_match: Some("\"-1\"".to_string()),
            ..Default::default()
        };
        match store.append("/s", stale) {
            Err(StoreError::PreconditionFailed { current }) => {
                assert_eq!(current, format!("\"{}\"", outcome.next_offset));
            }
            other => panic!("expected precondition failure, got {:?}", other.map(|o| o.kind)),
        }

        // Wildcard accepts any existing state.
        let any = AppendRequest {
            body: Bytes::from_static(b"Z"),
            if_match: Some("*".to_string()),
            ..Default::default()
        };
        store.append("/s", any).unwrap();
    }

    #[test]
    fn test_if_match_with_producer_rejected() {
        let store = StreamStore::in_memory();
        store.create("/s", plain_config()).unwrap();

        let req = AppendRequest {
            body: Bytes::from_static(b"x"),
            if_match: Some("*".to_string()),
            producer: Some(ProducerHeaders {
                id: "p".to_string(),
                epoch: 0,
                seq: 0,
            }),
            ..Default::default()
        };
        assert!(matches!(
            store.append("/s", req),
            Err(StoreError::IfMatchWithProducer)
        ));
    }

    #[test]
    fn test_producer_protocol() {
        let store = StreamStore::in_memory();
        store.create("/s", plain_config()).unwrap();

        let write = |epoch: u64, seq: u64, body: &'static [u8]| AppendRequest {
            body: Bytes::from_static(body),
            producer: Some(ProducerHeaders {
                id: "p".to_string(),
                epoch,
                seq,
            }),
            ..Default::default()
        };

        // First accepted write.
        let first = store.append("/s", write(0, 0, b"A")).unwrap();
        assert_eq!(first.kind, AppendKind::Appended(1));

        // Exact retry deduplicates with the cached offset.
        let retry = store.append("/s", write(0, 0, b"A")).unwrap();
        assert_eq!(retry.kind, AppendKind::Duplicate);
        assert_eq!(retry.next_offset, first.next_offset);
        assert_eq!(
            store.read("/s", OFFSET_BEGINNING, 0).unwrap().records.len(),
            1
        );

        // Gap.
        assert!(matches!(
            store.append("/s", write(0, 2, b"B")),
            Err(StoreError::ProducerSeqGap {
                expected: 1,
                received: 2
            })
        ));

        // New epoch resets the sequence.
        let bumped = store.append("/s", write(1, 0, b"B")).unwrap();
        assert_eq!(bumped.kind, AppendKind::Appended(1));

        // Old epoch is fenced.
        assert!(matches!(
            store.append("/s", write(0, 1, b"C")),
            Err(StoreError::StaleEpoch {
                current: 1,
                received: 0
            })
        ));

        // Regression within the epoch.
        store.append("/s", write(1, 1, b"C")).unwrap();
        assert!(matches!(
            store.append("/s", write(1, 0, b"D")),
            Err(StoreError::ProducerSeqRegression {
                expected: 2,
                received: 0
            })
        ));

        // A fresh producer must start at seq 0.
        let fresh = AppendRequest {
            body: Bytes::from_static(b"E"),
            producer: Some(ProducerHeaders {
                id: "q".to_string(),
                epoch: 0,
                seq: 5,
            }),
            ..Default::default()
        };
        assert!(matches!(
            store.append("/s", fresh),
            Err(StoreError::ProducerSeqGap {
                expected: 0,
                received: 5
            })
        ));
    }

    #[test]
    fn test_stream_seq_conflict() {
        let store = StreamStore::in_memory();
        store.create("/s", plain_config()).unwrap();

        let with_seq = |seq: &str, body: &'static [u8]| AppendRequest {
            body: Bytes::from_static(body),
            seq: Some(seq.to_string()),
            ..Default::default()
        };

        store.append("/s", with_seq("2", b"msg1")).unwrap();
        assert!(matches!(
            store.append("/s", with_seq("1", b"msg2")),
            Err(StoreError::SequenceConflict { .. })
        ));
        assert!(matches!(
            store.append("/s", with_seq("2", b"msg2")),
            Err(StoreError::SequenceConflict { .. })
        ));
        store.append("/s", with_seq("3", b"msg2")).unwrap();
    }

    #[test]
    fn test_close_is_terminal_and_idempotent() {
        let store = StreamStore::in_memory();
        store.create("/s", plain_config()).unwrap();
        append_body(&store, "/s", b"a");

        // Close with a final record.
        let close = AppendRequest {
            body: Bytes::from_static(b"bye"),
            close: true,
            ..Default::default()
        };
        let outcome = store.append("/s", close).unwrap();
        assert!(outcome.closed);

        // Appends now fail closed.
        assert!(matches!(
            store.append("/s", AppendRequest::body(Bytes::from_static(b"x"))),
            Err(StoreError::Closed { .. })
        ));

        // Re-closing succeeds with the final offset.
        let again = store
            .append(
                "/s",
                AppendRequest {
                    close: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(again.kind, AppendKind::CloseOnly);
        assert_eq!(again.next_offset, outcome.next_offset);

        // Reads keep working.
        let result = store.read("/s", OFFSET_BEGINNING, 0).unwrap();
        assert_eq!(result.records.len(), 2);
        assert!(result.closed);
    }

    #[test]
    fn test_delete() {
        let store = StreamStore::in_memory();
        store.create("/s", plain_config()).unwrap();
        assert!(store.has("/s"));

        assert!(store.delete("/s").unwrap());
        assert!(!store.has("/s"));
        assert!(matches!(
            store.read("/s", OFFSET_BEGINNING, 0),
            Err(StoreError::NotFound(_))
        ));

        // Re-create after delete starts fresh.
        let outcome = store.create("/s", plain_config()).unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.next_offset, OFFSET_BEGINNING);
    }

    #[test]
    fn test_retention_prune_and_gone() {
        let store = StreamStore::open(StoreOptions {
            retention_max_bytes: 8,
            ..Default::default()
        })
        .unwrap();
        store.create("/s", plain_config()).unwrap();

        let first = append_body(&store, "/s", b"aaaa");
        append_body(&store, "/s", b"bbbb");
        append_body(&store, "/s", b"cccc");

        store.sweep();

        // The oldest record fell past the horizon.
        let from_start = store.read("/s", OFFSET_BEGINNING, 0).unwrap();
        assert_eq!(from_start.records.len(), 2);
        assert_eq!(from_start.records[0].payload.as_ref(), b"bbbb");

        assert!(matches!(
            store.read("/s", &format_offset(0, 0), 0),
            Err(StoreError::Gone { .. })
        ));
        // The horizon itself is still readable.
        let at_horizon = store.read("/s", &first.next_offset, 0).unwrap();
        assert_eq!(at_horizon.records.len(), 2);
    }

    #[test]
    fn test_memory_budgets() {
        let store = StreamStore::open(StoreOptions {
            max_stream_bytes: 8,
            ..Default::default()
        })
        .unwrap();
        store.create("/s", plain_config()).unwrap();

        append_body(&store, "/s", b"12345678");
        assert!(matches!(
            store.append("/s", AppendRequest::body(Bytes::from_static(b"x"))),
            Err(StoreError::Busy(_))
        ));

        let total = StreamStore::open(StoreOptions {
            max_total_bytes: 4,
            ..Default::default()
        })
        .unwrap();
        total.create("/a", plain_config()).unwrap();
        total.create("/b", plain_config()).unwrap();
        total
            .append("/a", AppendRequest::body(Bytes::from_static(b"1234")))
            .unwrap();
        assert!(matches!(
            total.append("/b", AppendRequest::body(Bytes::from_static(b"5"))),
            Err(StoreError::Busy(_))
        ));
    }

    #[test]
    fn test_ttl_expiry_is_lazy() {
        let store = StreamStore::in_memory();
        store
            .create(
                "/s",
                StreamConfig {
                    content_type: Some("text/plain".to_string()),
                    expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(matches!(
            store.read("/s", OFFSET_BEGINNING, 0),
            Err(StoreError::NotFound(_))
        ));
        // And a new stream can take the path over.
        assert!(store.create("/s", plain_config()).unwrap().created);
    }

    mod file_backed {
        use super::*;
        use std::io::Write;
        use tempfile::tempdir;

        fn file_options(dir: &Path) -> StoreOptions {
            StoreOptions {
                data_dir: Some(dir.to_path_buf()),
                ..Default::default()
            }
        }

        #[test]
        fn test_append_read_across_reopen() {
            let dir = tempdir().unwrap();

            let first_offset;
            {
                let store = StreamStore::open(file_options(dir.path())).unwrap();
                store.create("/v1/stream/s1", plain_config()).unwrap();
                first_offset = append_body(&store, "/v1/stream/s1", b"hello").next_offset;
                append_body(&store, "/v1/stream/s1", b"world");
            }

            let store = StreamStore::open(file_options(dir.path())).unwrap();
            let result = store.read("/v1/stream/s1", OFFSET_BEGINNING, 0).unwrap();
            assert_eq!(result.records.len(), 2);
            assert_eq!(result.records[0].payload.as_ref(), b"hello");
            assert_eq!(result.records[1].payload.as_ref(), b"world");
            assert_eq!(result.records[0].end_offset, first_offset);

            let snapshot = store.snapshot("/v1/stream/s1").unwrap();
            assert_eq!(snapshot.content_type, Some("text/plain".to_string()));
        }

        #[test]
        fn test_recovery_truncates_unacknowledged_bytes() {
            let dir = tempdir().unwrap();
            let path = "/s";

            {
                let store = StreamStore::open(file_options(dir.path())).unwrap();
                store.create(path, plain_config()).unwrap();
                append_body(&store, path, b"durable");
            }

            // Simulate a crash mid-append: extra bytes past the recorded tail.
            let log_path = dir
                .path()
                .join("logs")
                .join(log_file_name(path));
            let mut file = fs::OpenOptions::new().append(true).open(&log_path).unwrap();
            file.write_all(&99u32.to_be_bytes()).unwrap();
            file.write_all(b"torn").unwrap();
            drop(file);

            let store = StreamStore::open(file_options(dir.path())).unwrap();
            let result = store.read(path, OFFSET_BEGINNING, 0).unwrap();
            assert_eq!(result.records.len(), 1);
            assert_eq!(result.records[0].payload.as_ref(), b"durable");
            assert_eq!(fs::metadata(&log_path).unwrap().len(), 4 + 7);
        }

        #[test]
        fn test_recovery_rebuilds_short_log() {
            let dir = tempdir().unwrap();
            let path = "/s";

            let full_tail;
            let first_tail;
            {
                let store = StreamStore::open(file_options(dir.path())).unwrap();
                store.create(path, plain_config()).unwrap();
                first_tail = append_body(&store, path, b"aaa").next_offset;
                full_tail = append_body(&store, path, b"bbb").next_offset;
            }

            // Chop the second record off the log while metadata still
            // claims it: next_offset must come back reduced.
            let log_path = dir
                .path()
                .join("logs")
                .join(log_file_name(path));
            let file = fs::OpenOptions::new().write(true).open(&log_path).unwrap();
            file.set_len(4 + 3).unwrap();
            drop(file);

            let store = StreamStore::open(file_options(dir.path())).unwrap();
            let snapshot = store.snapshot(path).unwrap();
            assert_eq!(snapshot.next_offset, first_tail);
            assert_ne!(snapshot.next_offset, full_tail);

            let result = store.read(path, OFFSET_BEGINNING, 0).unwrap();
            assert_eq!(result.records.len(), 1);
            assert_eq!(result.records[0].payload.as_ref(), b"aaa");
        }

        #[test]
        fn test_producer_state_survives_reopen() {
            let dir = tempdir().unwrap();

            let first;
            {
                let store = StreamStore::open(file_options(dir.path())).unwrap();
                store.create("/s", plain_config()).unwrap();
                first = store
                    .append(
                        "/s",
                        AppendRequest {
                            body: Bytes::from_static(b"A"),
                            producer: Some(ProducerHeaders {
                                id: "p".to_string(),
                                epoch: 0,
                                seq: 0,
                            }),
                            ..Default::default()
                        },
                    )
                    .unwrap();
            }

            let store = StreamStore::open(file_options(dir.path())).unwrap();
            let retry = store
                .append(
                    "/s",
                    AppendRequest {
                        body: Bytes::from_static(b"A"),
                        producer: Some(ProducerHeaders {
                            id: "p".to_string(),
                            epoch: 0,
                            seq: 0,
                        }),
                        ..Default::default()
                    },
                )
                .unwrap();
            assert_eq!(retry.kind, AppendKind::Duplicate);
            assert_eq!(retry.next_offset, first.next_offset);
        }

        #[test]
        fn test_delete_removes_log_file() {
            let dir = tempdir().unwrap();
            let store = StreamStore::open(file_options(dir.path())).unwrap();
            store.create("/s", plain_config()).unwrap();
            append_body(&store, "/s", b"x");

            let log_path = dir
                .path()
                .join("logs")
                .join(log_file_name("/s"));
            assert!(log_path.exists());

            store.delete("/s").unwrap();
            assert!(!log_path.exists());
        }
    }
}
