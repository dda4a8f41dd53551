//! Tunables for the object store client and the content server.

use std::time::Duration;

/// Settings for [`HttpObjectStore`](crate::store::HttpObjectStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Limit on establishing a connection to the store
    pub connect_timeout: Duration,
    /// Longest a response may stall between two reads; a slow but steady
    /// body is never cut off
    pub read_timeout: Duration,
    /// Attempts made on connect/timeout failures before giving up
    pub max_retry: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            max_retry: 10,
        }
    }
}

/// Settings for [`ContentServer`](crate::serving::ContentServer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeConfig {
    /// Object name, relative to a project's path, of its published archive
    pub archive_name: String,
    /// `max-age` advertised for content without access control
    pub cache_max_age: Duration,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            archive_name: "artifacts.zip".to_string(),
            cache_max_age: Duration::from_secs(600),
        }
    }
}
