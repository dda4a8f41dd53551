//! Response metadata of served content

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use httpdate::fmt_http_date;
use mime_guess::MimeGuess;
use std::time::{Duration, SystemTime};

/// Metadata of a file about to be served, from an archive entry or a
/// standalone object
#[derive(Debug, Clone)]
pub struct Metadata {
    /// MIME types guessed from the file extension
    pub mime: MimeGuess,
    /// Size of the delivered body in bytes
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl Metadata {
    pub fn new(name: &str, size: u64, modified: Option<SystemTime>) -> Self {
        Self {
            mime: mime_guess::from_path(name),
            size,
            modified,
        }
    }

    /// Build the response headers.
    ///
    /// `Cache-Control` and `Expires` are only added when `max_age` is given;
    /// access-controlled content passes `None` so intermediaries never store
    /// it.
    pub fn to_headers(&self, max_age: Option<Duration>, now: SystemTime) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(5);
        insert(
            &mut headers,
            header::CONTENT_TYPE,
            self.mime.first_or_octet_stream().as_ref(),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(self.size));
        if let Some(modified) = self.modified {
            insert(&mut headers, header::LAST_MODIFIED, &fmt_http_date(modified));
        }
        if let Some(max_age) = max_age {
            insert(
                &mut headers,
                header::CACHE_CONTROL,
                &format!("max-age={}", max_age.as_secs()),
            );
            insert(&mut headers, header::EXPIRES, &fmt_http_date(now + max_age));
        }
        headers
    }
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
