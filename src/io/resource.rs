use bytes::{Buf, Bytes};
use log::{debug, warn};
use reqwest::{Client, Response, StatusCode, Url, header};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Network counters, shared by every resource opened through one store.
#[derive(Debug, Default)]
pub struct TransferStats {
    bytes: AtomicU64,
    requests: AtomicU64,
}

impl TransferStats {
    /// Total body bytes received from the network
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Total HTTP requests issued, retries included
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

/// Remote object addressed by URL and read with HTTP Range requests.
///
/// The size is discovered once by [`RangedResource::open`] and never changes
/// afterwards; every range request is validated against it. When the server
/// reported a strong `ETag`, range requests carry `If-Range` so that bytes
/// from a replaced object are never mixed with bytes of the original one.
/// Weak tags never match in `If-Range`, so they are not sent.
#[derive(Debug)]
pub struct RangedResource {
    client: Client,
    url: Url,
    size: u64,
    etag: Option<String>,
    last_modified: Option<SystemTime>,
    content_type: Option<String>,
    max_retry: u32,
    stats: Arc<TransferStats>,
}

impl RangedResource {
    /// Probe the object with a one-byte range request.
    ///
    /// This fetches no content beyond that single byte. A missing object
    /// yields [`Error::NotFound`]; a server answering the probe with the full
    /// body does not support ranges and is rejected.
    pub async fn open(
        client: Client,
        url: Url,
        max_retry: u32,
        stats: Arc<TransferStats>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let resp = send(&client, &url, "bytes=0-0", None, max_retry, &stats, cancel).await?;

        let size = match resp.status() {
            StatusCode::PARTIAL_CONTENT => content_range(resp.headers())
                .map(|range| range.total)
                .ok_or_else(|| Error::transport("range probe returned no Content-Range"))?,
            // Only an empty object cannot satisfy `bytes=0-0`
            StatusCode::RANGE_NOT_SATISFIABLE => {
                content_range(resp.headers()).map_or(0, |range| range.total)
            }
            StatusCode::NOT_FOUND => return Err(Error::NotFound(url.to_string())),
            StatusCode::OK => {
                return Err(Error::transport(format!(
                    "{url}: remote server does not support Range requests"
                )));
            }
            status => {
                return Err(Error::transport(format!(
                    "{url}: HTTP request failed with status: {status}"
                )));
            }
        };

        let headers = resp.headers();
        let etag = header_str(headers, header::ETAG).map(str::to_string);
        let last_modified =
            header_str(headers, header::LAST_MODIFIED).and_then(|v| httpdate::parse_http_date(v).ok());
        let content_type = header_str(headers, header::CONTENT_TYPE).map(str::to_string);

        debug!("opened {url}: {size} bytes");

        Ok(Self {
            client,
            url,
            size,
            etag,
            last_modified,
            content_type,
            max_retry,
            stats,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// Validator sent as `If-Range`: the ETag, when it is strong
    fn if_range(&self) -> Option<&str> {
        self.etag.as_deref().filter(|tag| is_strong(tag))
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Counters of the store this resource was opened through
    pub fn stats(&self) -> &Arc<TransferStats> {
        &self.stats
    }

    /// Issue exactly one request for the bytes in `[start, end)`.
    ///
    /// A zero-length range at or before the end of the resource is valid and
    /// returns an empty body without touching the network.
    pub async fn fetch_range(
        &self,
        start: u64,
        end: u64,
        cancel: &CancellationToken,
    ) -> Result<RangeBody> {
        if end < start || start > self.size || end > self.size {
            warn!(
                "rejecting range {start}..{end} of {} ({} bytes)",
                self.url, self.size
            );
            return Err(Error::invalid_range(
                start,
                end.saturating_sub(start),
                self.size,
            ));
        }
        if start == end {
            return Ok(RangeBody::empty(cancel.clone(), self.stats.clone()));
        }

        let range = format!("bytes={}-{}", start, end - 1);
        let resp = send(
            &self.client,
            &self.url,
            &range,
            self.if_range(),
            self.max_retry,
            &self.stats,
            cancel,
        )
        .await?;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::NOT_FOUND => return Err(Error::NotFound(self.url.to_string())),
            StatusCode::RANGE_NOT_SATISFIABLE => {
                return Err(Error::invalid_range(start, end - start, self.size));
            }
            StatusCode::OK if self.if_range().is_some() => {
                return Err(Error::transport(format!(
                    "{} changed since it was opened",
                    self.url
                )));
            }
            status => {
                return Err(Error::transport(format!(
                    "{}: range request failed with status: {status}",
                    self.url
                )));
            }
        }

        if let Some(range) = content_range(resp.headers()) {
            if range.start != Some(start) {
                return Err(Error::transport(format!(
                    "{}: server answered {range:?} for {start}..{end}",
                    self.url
                )));
            }
        }

        Ok(RangeBody {
            response: Some(resp),
            chunk: Bytes::new(),
            remaining: end - start,
            cancel: cancel.clone(),
            stats: self.stats.clone(),
        })
    }
}

/// Body of one range response, read incrementally.
///
/// Dropping it (or calling [`RangeBody::close`]) releases the connection.
#[derive(Debug)]
pub struct RangeBody {
    response: Option<Response>,
    chunk: Bytes,
    remaining: u64,
    cancel: CancellationToken,
    stats: Arc<TransferStats>,
}

impl RangeBody {
    fn empty(cancel: CancellationToken, stats: Arc<TransferStats>) -> Self {
        Self {
            response: None,
            chunk: Bytes::new(),
            remaining: 0,
            cancel,
            stats,
        }
    }

    /// Bytes of the requested range not yet returned by [`RangeBody::read`]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Copy the next bytes of the range into `buf`. Returns 0 once the whole
    /// range has been delivered.
    ///
    /// A response shorter than the requested range is a transport error, not
    /// an end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || self.remaining == 0 {
            return Ok(0);
        }

        while self.chunk.is_empty() {
            let Some(response) = self.response.as_mut() else {
                return Err(Error::transport("range body already closed"));
            };
            let next = tokio::select! {
                _ = self.cancel.cancelled() => None,
                next = response.chunk() => Some(next),
            };
            match next {
                None => {
                    self.close();
                    return Err(Error::Cancelled);
                }
                Some(Err(e)) => {
                    self.close();
                    return Err(e.into());
                }
                Some(Ok(None)) => {
                    let missing = self.remaining;
                    self.close();
                    return Err(Error::transport(format!(
                        "range response ended with {missing} bytes missing"
                    )));
                }
                Some(Ok(Some(bytes))) => {
                    self.stats
                        .bytes
                        .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                    self.chunk = bytes;
                }
            }
        }

        let remaining = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        let n = buf.len().min(self.chunk.len()).min(remaining);
        buf[..n].copy_from_slice(&self.chunk[..n]);
        self.chunk.advance(n);
        self.remaining -= n as u64;

        if self.remaining == 0 {
            self.close();
        }
        Ok(n)
    }

    /// Drop the underlying response, releasing its connection.
    pub fn close(&mut self) {
        self.response = None;
        self.chunk = Bytes::new();
    }
}

fn is_strong(etag: &str) -> bool {
    !etag.starts_with("W/")
}

/// Send a GET with the given `Range`, retrying connect and timeout failures.
async fn send(
    client: &Client,
    url: &Url,
    range: &str,
    if_range: Option<&str>,
    max_retry: u32,
    stats: &TransferStats,
    cancel: &CancellationToken,
) -> Result<Response> {
    let mut retry_count = 0;

    loop {
        let mut request = client.get(url.clone()).header(header::RANGE, range);
        if let Some(tag) = if_range {
            request = request.header(header::IF_RANGE, tag);
        }
        stats.requests.fetch_add(1, Ordering::Relaxed);

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = request.send() => result,
        };

        match result {
            Ok(resp) => return Ok(resp),
            Err(e) if e.is_timeout() || e.is_connect() => {
                retry_count += 1;
                if retry_count >= max_retry {
                    return Err(Error::transport(format!(
                        "{url}: max retries exceeded: {e}"
                    )));
                }
                warn!(
                    "Connection error for {url}, retry {}/{}: {}",
                    retry_count, max_retry, e
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(500 * retry_count as u64)) => {}
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn header_str(headers: &header::HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContentRange {
    /// `None` for the unsatisfied form `bytes */<total>`
    start: Option<u64>,
    total: u64,
}

fn content_range(headers: &header::HeaderMap) -> Option<ContentRange> {
    header_str(headers, header::CONTENT_RANGE).and_then(parse_content_range)
}

/// Parse `bytes <start>-<end>/<total>` or `bytes */<total>`.
fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (span, total) = rest.split_once('/')?;
    let total = total.trim().parse().ok()?;
    let start = if span == "*" {
        None
    } else {
        let (start, end) = span.split_once('-')?;
        let start: u64 = start.trim().parse().ok()?;
        let end: u64 = end.trim().parse().ok()?;
        if end < start {
            return None;
        }
        Some(start)
    };
    Some(ContentRange { start, total })
}
