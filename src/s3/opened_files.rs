//! Registry of opened staging files.
//!
//! Each entry owns a per-file async mutex. `add_and_lock` acquires that
//! mutex *before* touching the registry map, so a second opener of the
//! same staging path parks on the entry lock until the current holder
//! closes; the registry mutex itself only ever guards short map
//! operations and is never held across I/O or lock acquisition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::opened_file::S3OpenedFile;

/// An entry of the opened files list, detached from the registry.
///
/// Cloning shares the per-entry lock and the handle, so a waiter and the
/// current holder contend on the same mutex.
#[derive(Clone)]
pub struct S3OpenedFilesListEntry {
    pub added: SystemTime,
    pub file: S3OpenedFile,
    lock: Arc<AsyncMutex<()>>,
}

impl S3OpenedFilesListEntry {
    pub fn new(added: SystemTime, file: S3OpenedFile) -> Self {
        Self {
            added,
            file,
            lock: Arc::new(AsyncMutex::new(())),
        }
    }
}

struct LockedEntry {
    entry: S3OpenedFilesListEntry,
    // Held for the whole lifetime of the open file; dropped (and thereby
    // released) when the entry is removed.
    _guard: OwnedMutexGuard<()>,
}

/// Mapping from staging file path to the entry holding its handle and
/// per-file exclusion lock.
#[derive(Default)]
pub struct S3OpenedFilesList {
    m: Mutex<HashMap<String, LockedEntry>>,
}

impl S3OpenedFilesList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the entry's mutex (blocking until any current holder
    /// releases it), then registers the entry under `local_name`.
    pub async fn add_and_lock(&self, local_name: &str, entry: S3OpenedFilesListEntry) {
        let guard = entry.lock.clone().lock_owned().await;
        self.m.lock().unwrap().insert(
            local_name.to_string(),
            LockedEntry {
                entry,
                _guard: guard,
            },
        );
    }

    /// Removes the entry and releases its lock. Returns whether an entry
    /// was present.
    pub fn delete_and_unlock(&self, local_name: &str) -> bool {
        self.m.lock().unwrap().remove(local_name).is_some()
    }

    /// A detached copy of the entry registered under `local_name`.
    pub fn peek(&self, local_name: &str) -> Option<S3OpenedFilesListEntry> {
        self.m
            .lock()
            .unwrap()
            .get(local_name)
            .map(|le| le.entry.clone())
    }

    pub fn exists(&self, local_name: &str) -> bool {
        self.m.lock().unwrap().contains_key(local_name)
    }

    pub fn len(&self) -> usize {
        self.m.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Staging paths currently registered.
    pub fn local_names(&self) -> Vec<String> {
        self.m.lock().unwrap().keys().cloned().collect()
    }

    /// Snapshot of (staging path, admission time, handle) triples for
    /// the TTL cleaner.
    pub(crate) fn snapshot(&self) -> Vec<(String, SystemTime, S3OpenedFile)> {
        self.m
            .lock()
            .unwrap()
            .iter()
            .map(|(k, le)| (k.clone(), le.entry.added, le.entry.file.clone()))
            .collect()
    }
}
