//! Append-only log persistence.
//!
//! Every stream keeps an in-memory record index; payload bytes live either
//! inline (memory mode) or in a length-prefixed log file (file mode).
//!
//! Log frame layout: `u32 BE payload length | payload`. Offsets exposed to
//! clients count payload bytes only, so both backing modes produce
//! identical tokens for identical appends. Files are opened once in append
//! mode and cached in a bounded LRU; the appended region is immutable, so
//! reads open short-lived handles and never contend with writers.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::types::{format_offset, FsyncPolicy};

/// Bytes of framing overhead per record in a log file.
pub(crate) const FRAME_HEADER_LEN: u64 = 4;

/// Longest encoded stream name we allow in a log file name; anything past
/// this is replaced by a digest suffix to stay under filesystem limits.
const MAX_ENCODED_NAME: usize = 180;
/// Hex characters of digest appended to a shortened name.
const DIGEST_SUFFIX: usize = 16;

/// Filesystem-safe log file name for a stream path.
///
/// base64url keeps arbitrary URL paths (slashes, query-ish characters,
/// unicode) out of the filesystem's way. Paths whose encoding would overrun
/// `MAX_ENCODED_NAME` are cut down and suffixed with a SHA-256 fragment so
/// two distinct streams never share a log file.
pub(crate) fn log_file_name(stream: &str) -> String {
    let mut name = URL_SAFE_NO_PAD.encode(stream.as_bytes());
    if name.len() > MAX_ENCODED_NAME {
        let digest = hex::encode(Sha256::digest(stream.as_bytes()));
        name.truncate(MAX_ENCODED_NAME - DIGEST_SUFFIX - 1);
        name.push('~');
        name.push_str(&digest[..DIGEST_SUFFIX]);
    }
    name.push_str(".log");
    name
}

/// Where a record's payload bytes live.
#[derive(Debug, Clone)]
pub(crate) enum RecordPayload {
    Inline(Bytes),
    /// Payload starts at this position in the stream's log file.
    File { pos: u64 },
}

/// One entry in a stream's record index.
#[derive(Debug, Clone)]
pub(crate) struct IndexedRecord {
    /// Records appended before this one
    pub index: u64,
    /// Payload bytes appended before this one
    pub byte: u64,
    pub len: u32,
    pub produced_at: i64,
    pub payload: RecordPayload,
}

impl IndexedRecord {
    pub fn offset(&self) -> String {
        format_offset(self.index, self.byte)
    }

    pub fn end_offset(&self) -> String {
        format_offset(self.index + 1, self.byte + self.len as u64)
    }
}

/// The framed length of a log holding `record_count` records totalling
/// `byte_count` payload bytes.
pub(crate) fn framed_len(record_count: u64, byte_count: u64) -> u64 {
    byte_count + record_count * FRAME_HEADER_LEN
}

/// Bounded LRU of append handles, keyed by stream path.
///
/// Handles are opened with append semantics so every write lands at the
/// current end of file. Eviction just drops the handle; the next append
/// reopens it.
pub(crate) struct HandleCache {
    capacity: usize,
    map: HashMap<String, Arc<File>>,
    order: VecDeque<String>,
}

impl HandleCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Get the cached append handle for `key`, opening `file_path` on miss.
    pub fn get(&mut self, key: &str, file_path: &Path) -> std::io::Result<Arc<File>> {
        if let Some(handle) = self.map.get(key) {
            let handle = handle.clone();
            self.touch(key);
            return Ok(handle);
        }

        let file = OpenOptions::new().append(true).create(true).open(file_path)?;
        let handle = Arc::new(file);

        while self.map.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            } else {
                break;
            }
        }

        self.map.insert(key.to_string(), handle.clone());
        self.order.push_back(key.to_string());
        Ok(handle)
    }

    pub fn remove(&mut self, key: &str) {
        self.map.remove(key);
        self.order.retain(|k| k != key);
    }

    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_string());
    }
}

/// Append the given payloads as one contiguous write, then flush according
/// to the fsync policy. A torn multi-record write is cut back to the last
/// intact frame during recovery, which keeps JSON-array appends atomic.
pub(crate) fn append_frames(
    file: &File,
    payloads: &[Bytes],
    fsync: FsyncPolicy,
) -> std::io::Result<()> {
    let total: usize = payloads
        .iter()
        .map(|p| p.len() + FRAME_HEADER_LEN as usize)
        .sum();
    let mut buf = Vec::with_capacity(total);
    for payload in payloads {
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
    }

    let mut writer: &File = file;
    writer.write_all(&buf)?;
    if fsync == FsyncPolicy::Always {
        file.sync_data()?;
    }
    Ok(())
}

/// Read a batch of payloads from a log file. `items` are (position, length)
/// pairs as recorded in the index.
pub(crate) fn read_payloads(
    log_path: &Path,
    items: &[(u64, u32)],
) -> std::io::Result<Vec<Bytes>> {
    let mut file = File::open(log_path)?;
    let mut out = Vec::with_capacity(items.len());
    for &(pos, len) in items {
        file.seek(SeekFrom::Start(pos))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)?;
        out.push(Bytes::from(buf));
    }
    Ok(out)
}

/// A frame located by a recovery scan.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScannedFrame {
    /// Payload position in the file
    pub pos: u64,
    pub len: u32,
}

/// Walk the log file frame by frame, stopping at the first torn frame.
pub(crate) fn scan_frames(log_path: &Path) -> std::io::Result<Vec<ScannedFrame>> {
    let mut file = File::open(log_path)?;
    let file_len = file.metadata()?.len();

    let mut frames = Vec::new();
    let mut pos = 0u64;
    let mut header = [0u8; 4];

    while pos + FRAME_HEADER_LEN <= file_len {
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut header)?;
        let len = u32::from_be_bytes(header);
        let payload_pos = pos + FRAME_HEADER_LEN;
        if payload_pos + len as u64 > file_len {
            break;
        }
        frames.push(ScannedFrame {
            pos: payload_pos,
            len,
        });
        pos = payload_pos + len as u64;
    }

    Ok(frames)
}

/// Truncate a log file to the given length, discarding torn or
/// unacknowledged frames found during recovery.
pub(crate) fn truncate_log(log_path: &Path, len: u64) -> std::io::Result<()> {
    let file = OpenOptions::new().write(true).open(log_path)?;
    file.set_len(len)?;
    file.sync_data()
}
