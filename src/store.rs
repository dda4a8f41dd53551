//! Object store access.
//!
//! The content server only needs `get_object`: resolve a key to a sized,
//! range-readable object, or report that it does not exist.

use async_trait::async_trait;
use reqwest::{Client, Url};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::io::{RangedResource, TransferStats};

/// Source of range-readable objects addressed by key
#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    /// Open the object stored under `key`.
    ///
    /// Returns [`Error::NotFound`] when there is no such object.
    async fn get_object(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<RangedResource>>;
}

/// Object store exposed over plain HTTP(S), one URL per key below a base URL
/// (e.g. a public bucket endpoint).
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: Client,
    base_url: Url,
    config: StoreConfig,
    stats: Arc<TransferStats>,
}

impl HttpObjectStore {
    pub fn new(base_url: &str, config: StoreConfig) -> Result<Self> {
        let mut url = Url::parse(base_url)
            .map_err(|e| Error::transport(format!("invalid store URL {base_url}: {e}")))?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: url,
            config,
            stats: Arc::new(TransferStats::default()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Counters aggregated over every object opened through this store
    pub fn stats(&self) -> &Arc<TransferStats> {
        &self.stats
    }

    /// URL of the object stored under `key`
    pub fn object_url(&self, key: &str) -> Result<Url> {
        // "./" keeps a key like "a:b" from being parsed as a scheme
        self.base_url
            .join(&format!("./{}", key.trim_start_matches('/')))
            .map_err(|e| Error::transport(format!("invalid object key {key}: {e}")))
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get_object(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<RangedResource>> {
        let url = self.object_url(key)?;
        let resource = RangedResource::open(
            self.client.clone(),
            url,
            self.config.max_retry,
            self.stats.clone(),
            cancel,
        )
        .await?;
        Ok(Arc::new(resource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_urls_stay_below_base() {
        let store =
            HttpObjectStore::new("http://127.0.0.1:9000/pages", StoreConfig::default()).unwrap();
        assert_eq!(store.base_url().as_str(), "http://127.0.0.1:9000/pages/");
        assert_eq!(
            store
                .object_url("group/project/public/artifacts.zip")
                .unwrap()
                .as_str(),
            "http://127.0.0.1:9000/pages/group/project/public/artifacts.zip"
        );
        assert_eq!(
            store.object_url("/a:b.html").unwrap().as_str(),
            "http://127.0.0.1:9000/pages/a:b.html"
        );
    }

    #[test]
    fn rejects_invalid_base() {
        assert!(matches!(
            HttpObjectStore::new("not a url", StoreConfig::default()),
            Err(Error::Transport(_))
        ));
    }
}
