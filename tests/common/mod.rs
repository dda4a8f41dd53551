//! Shared test infrastructure: a local object store speaking HTTP Range and
//! a deterministic ZIP builder.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use flate2::{Compression, write::DeflateEncoder};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::net::TcpListener;

use zipages::{HttpObjectStore, StoreConfig};

/// Modification time reported for every stored object
pub const OBJECT_MTIME: u64 = 1_600_000_000;

/// DOS date/time written into every archive entry: 2020-01-02 03:04:06
pub const ENTRY_DOS_DATE: u16 = ((2020 - 1980) << 9) | (1 << 5) | 2;
pub const ENTRY_DOS_TIME: u16 = (3 << 11) | (4 << 5) | 3;
pub const ENTRY_MTIME: u64 = 1_577_934_246;

// ============================================================================
// Object server
// ============================================================================

struct StoredObject {
    data: Arc<Vec<u8>>,
    version: u32,
    ignore_ranges: bool,
    weak_etag: bool,
}

#[derive(Default)]
struct ServerState {
    objects: Mutex<HashMap<String, StoredObject>>,
    /// (key, Range header) of every GET received
    log: Mutex<Vec<(String, String)>>,
    delay: Mutex<Duration>,
    /// Pause between body bytes; zero sends each body in one piece
    trickle: Mutex<Duration>,
}

/// Object store on a random localhost port.
pub struct ObjectServer {
    base_url: String,
    state: Arc<ServerState>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl ObjectServer {
    pub async fn new() -> Self {
        let state = Arc::new(ServerState::default());
        let router = Router::new()
            .route("/*key", get(serve_object))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let server = axum::serve(listener, router).with_graceful_shutdown(async {
            shutdown_rx.await.ok();
        });
        tokio::spawn(async move {
            server.await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}/store/"),
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn store(&self) -> HttpObjectStore {
        self.store_with(StoreConfig::default())
    }

    pub fn store_with(&self, config: StoreConfig) -> HttpObjectStore {
        HttpObjectStore::new(&self.base_url, config).unwrap()
    }

    /// Store (or replace) an object; replacing changes its ETag.
    pub fn put(&self, key: &str, data: impl Into<Vec<u8>>) {
        self.insert(key, data.into(), false, false);
    }

    /// Store an object served by a server that ignores `Range`.
    pub fn put_without_ranges(&self, key: &str, data: impl Into<Vec<u8>>) {
        self.insert(key, data.into(), true, false);
    }

    /// Store an object tagged with a weak ETag, which never satisfies
    /// `If-Range`.
    pub fn put_with_weak_etag(&self, key: &str, data: impl Into<Vec<u8>>) {
        self.insert(key, data.into(), false, true);
    }

    fn insert(&self, key: &str, data: Vec<u8>, ignore_ranges: bool, weak_etag: bool) {
        let mut objects = self.state.objects.lock();
        let version = objects.get(key).map_or(1, |object| object.version + 1);
        objects.insert(
            key.to_string(),
            StoredObject {
                data: Arc::new(data),
                version,
                ignore_ranges,
                weak_etag,
            },
        );
    }

    /// Delay applied before answering each request
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock() = delay;
    }

    /// Send bodies one byte at a time, pausing `per_byte` before each
    pub fn set_trickle(&self, per_byte: Duration) {
        *self.state.trickle.lock() = per_byte;
    }

    /// `Range` headers of the GET requests received for `key`, in order
    pub fn ranges(&self, key: &str) -> Vec<String> {
        self.state
            .log
            .lock()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Number of GET requests received for `key`
    pub fn requests(&self, key: &str) -> usize {
        self.state.log.lock().iter().filter(|(k, _)| k == key).count()
    }

    /// Number of GET requests for `key` with exactly this `Range` header
    pub fn requests_with_range(&self, key: &str, range: &str) -> usize {
        self.state
            .log
            .lock()
            .iter()
            .filter(|(k, r)| k == key && r == range)
            .count()
    }

    pub fn total_requests(&self) -> usize {
        self.state.log.lock().len()
    }
}

impl Drop for ObjectServer {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}

async fn serve_object(
    State(state): State<Arc<ServerState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Response {
    let key = key.strip_prefix("store/").unwrap_or(&key).to_string();
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.log.lock().push((key.clone(), range.clone()));

    let delay = *state.delay.lock();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let Some((data, version, ignore_ranges, weak_etag)) = state
        .objects
        .lock()
        .get(&key)
        .map(|o| (o.data.clone(), o.version, o.ignore_ranges, o.weak_etag))
    else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let etag = if weak_etag {
        format!("W/\"v{version}\"")
    } else {
        format!("\"v{version}\"")
    };
    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::ETAG, etag.parse().unwrap());
    response_headers.insert(
        header::LAST_MODIFIED,
        httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_secs(OBJECT_MTIME))
            .parse()
            .unwrap(),
    );
    response_headers.insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());

    let if_range_matches = headers
        .get(header::IF_RANGE)
        .and_then(|v| v.to_str().ok())
        // If-Range uses the strong comparison
        .is_none_or(|tag| !weak_etag && tag == etag);

    let span = range.strip_prefix("bytes=").and_then(|r| r.split_once('-'));
    let (Some((start, end)), false, true) = (span, ignore_ranges, if_range_matches) else {
        return (StatusCode::OK, response_headers, data.to_vec()).into_response();
    };
    let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    if start >= data.len() || end < start {
        response_headers.insert(
            header::CONTENT_RANGE,
            format!("bytes */{}", data.len()).parse().unwrap(),
        );
        return (StatusCode::RANGE_NOT_SATISFIABLE, response_headers).into_response();
    }

    let end = end.min(data.len() - 1);
    response_headers.insert(
        header::CONTENT_RANGE,
        format!("bytes {start}-{end}/{}", data.len()).parse().unwrap(),
    );
    let body = data[start..=end].to_vec();
    let trickle = *state.trickle.lock();
    if trickle.is_zero() {
        return (StatusCode::PARTIAL_CONTENT, response_headers, body).into_response();
    }

    let stream = futures::stream::iter(body).then(move |byte| async move {
        tokio::time::sleep(trickle).await;
        Ok::<_, axum::BoxError>(Bytes::from(vec![byte]))
    });
    (
        StatusCode::PARTIAL_CONTENT,
        response_headers,
        Body::from_stream(stream),
    )
        .into_response()
}

pub fn object_mtime() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(OBJECT_MTIME)
}

// ============================================================================
// ZIP builder
// ============================================================================

struct PendingEntry {
    name: String,
    method: u16,
    raw: Vec<u8>,
    crc: u32,
    size: usize,
}

/// Builds ZIP archives in memory, one local header per entry followed by
/// the Central Directory and the end record.
#[derive(Default)]
pub struct ZipBuilder {
    entries: Vec<PendingEntry>,
    comment: Vec<u8>,
    local_extra: Option<usize>,
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(mut self, name: &str, data: &[u8]) -> Self {
        self.entries.push(PendingEntry {
            name: name.to_string(),
            method: 0,
            raw: data.to_vec(),
            crc: crc32fast::hash(data),
            size: data.len(),
        });
        self
    }

    pub fn deflated(mut self, name: &str, data: &[u8]) -> Self {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        self.entries.push(PendingEntry {
            name: name.to_string(),
            method: 8,
            raw: encoder.finish().unwrap(),
            crc: crc32fast::hash(data),
            size: data.len(),
        });
        self
    }

    pub fn directory(self, name: &str) -> Self {
        self.stored(name, b"")
    }

    /// Entry with an arbitrary compression method; `raw` is stored as is.
    pub fn with_method(mut self, name: &str, method: u16, raw: &[u8]) -> Self {
        self.entries.push(PendingEntry {
            name: name.to_string(),
            method,
            raw: raw.to_vec(),
            crc: 0,
            size: raw.len(),
        });
        self
    }

    /// Length of the extra field written into every local header only
    /// (at least 4, the field's own header); 6 by default.
    pub fn local_extra(mut self, len: usize) -> Self {
        self.local_extra = Some(len);
        self
    }

    pub fn comment(mut self, comment: &[u8]) -> Self {
        self.comment = comment.to_vec();
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut cd = Vec::new();

        // an unknown extra field so the local header differs from the
        // directory record
        let extra_len = self.local_extra.unwrap_or(6);
        let mut extra = vec![0xfe, 0xca];
        extra.extend_from_slice(&((extra_len - 4) as u16).to_le_bytes());
        extra.resize(extra_len, 0);

        for entry in &self.entries {
            let local_offset = out.len() as u32;

            out.extend_from_slice(b"PK\x03\x04");
            out.extend_from_slice(&20u16.to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&entry.method.to_le_bytes());
            out.extend_from_slice(&ENTRY_DOS_TIME.to_le_bytes());
            out.extend_from_slice(&ENTRY_DOS_DATE.to_le_bytes());
            out.extend_from_slice(&entry.crc.to_le_bytes());
            out.extend_from_slice(&(entry.raw.len() as u32).to_le_bytes());
            out.extend_from_slice(&(entry.size as u32).to_le_bytes());
            out.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
            out.extend_from_slice(&(extra.len() as u16).to_le_bytes());
            out.extend_from_slice(entry.name.as_bytes());
            out.extend_from_slice(&extra);
            out.extend_from_slice(&entry.raw);

            cd.extend_from_slice(b"PK\x01\x02");
            cd.extend_from_slice(&20u16.to_le_bytes());
            cd.extend_from_slice(&20u16.to_le_bytes());
            cd.extend_from_slice(&0u16.to_le_bytes());
            cd.extend_from_slice(&entry.method.to_le_bytes());
            cd.extend_from_slice(&ENTRY_DOS_TIME.to_le_bytes());
            cd.extend_from_slice(&ENTRY_DOS_DATE.to_le_bytes());
            cd.extend_from_slice(&entry.crc.to_le_bytes());
            cd.extend_from_slice(&(entry.raw.len() as u32).to_le_bytes());
            cd.extend_from_slice(&(entry.size as u32).to_le_bytes());
            cd.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
            cd.extend_from_slice(&0u16.to_le_bytes());
            cd.extend_from_slice(&0u16.to_le_bytes());
            cd.extend_from_slice(&0u16.to_le_bytes());
            cd.extend_from_slice(&0u16.to_le_bytes());
            cd.extend_from_slice(&0u32.to_le_bytes());
            cd.extend_from_slice(&local_offset.to_le_bytes());
            cd.extend_from_slice(entry.name.as_bytes());
        }

        let cd_offset = out.len() as u32;
        out.extend_from_slice(&cd);
        out.extend_from_slice(b"PK\x05\x06");
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());
        out.extend_from_slice(&(cd.len() as u32).to_le_bytes());
        out.extend_from_slice(&cd_offset.to_le_bytes());
        out.extend_from_slice(&(self.comment.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.comment);
        out
    }
}

/// Deterministic, poorly compressible bytes
pub fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}
