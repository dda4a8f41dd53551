//! Per-project memo of archive indexes.
//!
//! Each project key moves at most once from "not probed" to either a built
//! index or a confirmed absence. The map lock is only held to decide who
//! builds; builds themselves run unlocked, and callers arriving while a build
//! is in flight wait on its outcome instead of starting another one.

use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::zip::ArchiveIndex;

/// Outcome shared with the callers waiting on a build
type Outcome<V> = Option<Result<Option<Arc<V>>>>;

#[derive(Debug)]
enum Slot<V> {
    /// The project has no archive
    Absent,
    Ready(Arc<V>),
    Building(watch::Receiver<Outcome<V>>),
}

enum Claim<V> {
    Cached(Option<Arc<V>>),
    Wait(watch::Receiver<Outcome<V>>),
    Build(watch::Sender<Outcome<V>>),
}

/// Archive indexes keyed by project id.
///
/// Entries are never evicted or revalidated: a replaced archive object is
/// only picked up after a restart.
#[derive(Debug)]
pub struct ArchiveCache<V = ArchiveIndex> {
    slots: Mutex<HashMap<u64, Slot<V>>>,
}

impl<V> Default for ArchiveCache<V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Send + Sync> ArchiveCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the memoized value for `key`, running `build` on a miss.
    ///
    /// `Ok(None)` means the project has no archive: `build` failed with
    /// [`Error::NotFound`], which is remembered. Any other failure is handed
    /// to this caller and to everyone waiting on the same build, but is not
    /// remembered; the next call builds again. A build that is cancelled or
    /// dropped lets one of the waiters take over.
    pub async fn get<F, Fut>(&self, key: u64, build: F) -> Result<Option<Arc<V>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let tx = loop {
            match self.claim(key) {
                Claim::Cached(value) => return Ok(value),
                Claim::Build(tx) => break tx,
                Claim::Wait(mut rx) => {
                    debug!("project {key}: waiting for archive build in flight");
                    if let Ok(outcome) = rx.wait_for(Option::is_some).await {
                        if let Some(result) = outcome.clone() {
                            return result;
                        }
                    }
                    // Builder went away without an outcome
                }
            }
        };

        let mut guard = BuildGuard {
            slots: &self.slots,
            key,
            armed: true,
        };

        debug!("project {key}: building archive index");
        let result = match build().await {
            Ok(value) => Ok(Some(Arc::new(value))),
            Err(Error::NotFound(what)) => {
                debug!("project {key}: no archive at {what}");
                Ok(None)
            }
            // Leave the slot to a waiter whose request is still alive
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => Err(err),
        };

        {
            let mut slots = self.slots.lock();
            match &result {
                Ok(Some(value)) => {
                    slots.insert(key, Slot::Ready(value.clone()));
                }
                Ok(None) => {
                    slots.insert(key, Slot::Absent);
                }
                Err(_) => {
                    slots.remove(&key);
                }
            }
        }
        guard.armed = false;
        tx.send_replace(Some(result.clone()));
        result
    }

    /// Memoized state of `key` without building: `None` when not resolved,
    /// `Some(None)` when the project is known to have no archive.
    pub fn peek(&self, key: u64) -> Option<Option<Arc<V>>> {
        match self.slots.lock().get(&key) {
            Some(Slot::Ready(value)) => Some(Some(value.clone())),
            Some(Slot::Absent) => Some(None),
            Some(Slot::Building(_)) | None => None,
        }
    }

    /// Number of projects with a resolved state
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| !matches!(slot, Slot::Building(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn claim(&self, key: u64) -> Claim<V> {
        let mut slots = self.slots.lock();
        match slots.get(&key) {
            Some(Slot::Ready(value)) => Claim::Cached(Some(value.clone())),
            Some(Slot::Absent) => Claim::Cached(None),
            Some(Slot::Building(rx)) => Claim::Wait(rx.clone()),
            None => {
                let (tx, rx) = watch::channel(None);
                slots.insert(key, Slot::Building(rx));
                Claim::Build(tx)
            }
        }
    }
}

/// Clears an abandoned `Building` slot so waiters can retry.
struct BuildGuard<'a, V> {
    slots: &'a Mutex<HashMap<u64, Slot<V>>>,
    key: u64,
    armed: bool,
}

impl<V> Drop for BuildGuard<'_, V> {
    fn drop(&mut self) {
        if self.armed {
            let mut slots = self.slots.lock();
            if matches!(slots.get(&self.key), Some(Slot::Building(_))) {
                slots.remove(&self.key);
            }
        }
    }
}
