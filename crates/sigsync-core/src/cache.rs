//! Digest cache: library-relative path to last-known MD5 and cache time.
//!
//! Answers "is this path valid" and "what is this path's digest", lazily
//! recomputing when the file on disk is newer than the cached timestamp.
//! Shared by every download worker; each public operation takes the entry
//! lock once and never holds it while hashing file contents.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::digest;

/// Snapshot file name, fixed location under the library root.
pub const CACHE_SNAPSHOT_FILE: &str = "cache.json";

/// Required-files document name under the library root, consumed read-only
/// by [`DigestCache::regenerate`].
pub const REQUIRED_FILES_FILE: &str = "required-files.json";

/// Entries cached within this window validate by file existence alone;
/// under high sync frequency re-stating the mtime every pass is wasted I/O.
const FRESH_WINDOW: Duration = Duration::from_secs(120);

/// One cached digest: relative path, hex MD5, and when it was computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedDigest {
    pub path: String,
    pub md5: String,
    pub cached_at: SystemTime,
}

/// Minimal read-side view of the required-files document; only the local
/// paths matter to reconciliation, other fields are ignored.
#[derive(Debug, Deserialize)]
struct RequiredPathsDoc {
    files: Vec<RequiredPathEntry>,
}

#[derive(Debug, Deserialize)]
struct RequiredPathEntry {
    save_as: String,
}

/// Process-wide digest cache for the library directory.
pub struct DigestCache {
    library: PathBuf,
    entries: Mutex<Vec<CachedDigest>>,
}

impl DigestCache {
    pub fn new(library: PathBuf) -> Self {
        Self {
            library,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Library root this cache resolves relative paths against.
    pub fn library(&self) -> &Path {
        &self.library
    }

    fn abs(&self, path: &str) -> PathBuf {
        self.library.join(path)
    }

    /// Digest for `path`. A stored entry is returned as-is unless the file
    /// has been written since it was cached, in which case the digest is
    /// recomputed and the entry replaced (remove then add, so both side
    /// effects stay in one place). With no entry at all the digest is
    /// computed but not inserted; callers decide when it becomes official.
    pub fn get_digest(&self, path: &str) -> String {
        let cached = {
            let entries = self.entries.lock().unwrap();
            entries.iter().find(|e| e.path == path).cloned()
        };

        let Some(entry) = cached else {
            return digest::md5_path_or_invalid(&self.abs(path));
        };

        let modified_since_cache = match std::fs::metadata(self.abs(path)).and_then(|m| m.modified())
        {
            Ok(mtime) => mtime > entry.cached_at,
            // File gone or unreadable: recompute, which yields the invalid
            // sentinel and fails any digest comparison closed.
            Err(_) => true,
        };

        if !modified_since_cache {
            return entry.md5;
        }

        tracing::debug!("{} written since cache, recalculating digest", path);
        let md5 = digest::md5_path_or_invalid(&self.abs(path));
        self.remove(path);
        self.add(path, &md5);
        md5
    }

    /// Insert an entry with `cached_at = now` iff the path is absent.
    /// Duplicate inserts are no-ops.
    pub fn add(&self, path: &str, md5: &str) {
        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|e| e.path == path) {
            return;
        }
        entries.push(CachedDigest {
            path: path.to_string(),
            md5: md5.to_string(),
            cached_at: SystemTime::now(),
        });
        tracing::debug!("added digest for {} to cache", path);
    }

    /// Delete all entries matching `path` (defensive against duplicates).
    pub fn remove(&self, path: &str) {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| e.path != path);
        if entries.len() != before {
            tracing::debug!("removed stale digest for {} from cache", path);
        }
    }

    /// Is the file behind `path` present and unmodified since it was cached?
    /// Absent entries and any filesystem error are invalid (fail closed).
    pub fn is_valid_path(&self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }

        let entries = self.entries.lock().unwrap();
        let Some(entry) = entries.iter().find(|e| e.path == path) else {
            return false;
        };

        // Recently-cached entries validate on existence alone.
        let fresh = SystemTime::now()
            .duration_since(entry.cached_at)
            .map(|age| age < FRESH_WINDOW)
            .unwrap_or(true);
        if fresh {
            return self.abs(path).exists();
        }

        match std::fs::metadata(self.abs(path)).and_then(|m| m.modified()) {
            Ok(mtime) => mtime <= entry.cached_at,
            Err(e) => {
                tracing::error!(
                    "unable to determine if {} is valid, assuming not: {}",
                    path,
                    e
                );
                false
            }
        }
    }

    /// Reconcile the cache against the required-files document under the
    /// library root: every declared path that exists locally gets an entry,
    /// every declared path that is missing loses its entry. Entries for
    /// paths the document does not mention stay for later analysis.
    pub fn regenerate(&self) -> Result<()> {
        let doc_path = self.library.join(REQUIRED_FILES_FILE);
        if !doc_path.exists() {
            return Ok(());
        }

        let data = std::fs::read_to_string(&doc_path)
            .with_context(|| format!("read {}", doc_path.display()))?;
        let doc: RequiredPathsDoc = serde_json::from_str(&data)
            .with_context(|| format!("parse {}", doc_path.display()))?;

        for entry in doc.files {
            let path = entry.save_as;
            if self.abs(&path).exists() {
                let md5 = self.get_digest(&path);
                self.add(&path, &md5);
            } else {
                self.remove(&path);
            }
        }
        Ok(())
    }

    /// Write the whole entry set to the snapshot file, overwriting any
    /// previous snapshot. Failure is logged and non-fatal; the in-memory
    /// state stays authoritative until the next successful persist.
    pub fn persist(&self) {
        let snapshot: Vec<CachedDigest> = self.entries.lock().unwrap().clone();
        let path = self.library.join(CACHE_SNAPSHOT_FILE);
        let result = serde_json::to_vec_pretty(&snapshot)
            .context("serialize cache snapshot")
            .and_then(|bytes| crate::storage::write_atomic(&path, &bytes));
        if let Err(e) = result {
            tracing::error!("unable to persist digest cache: {:#}", e);
        }
    }

    /// Load the snapshot written by [`persist`](Self::persist), if any.
    /// A missing snapshot is a normal first start; a corrupt one is logged
    /// and the cache starts empty.
    pub fn load(&self) {
        let path = self.library.join(CACHE_SNAPSHOT_FILE);
        if !path.exists() {
            return;
        }
        match std::fs::read_to_string(&path)
            .context("read cache snapshot")
            .and_then(|data| {
                serde_json::from_str::<Vec<CachedDigest>>(&data).context("parse cache snapshot")
            }) {
            Ok(snapshot) => {
                let mut entries = self.entries.lock().unwrap();
                *entries = snapshot;
                tracing::info!("loaded {} cached digests from snapshot", entries.len());
            }
            Err(e) => {
                tracing::error!("unable to load digest cache snapshot: {:#}", e);
            }
        }
    }

    /// Snapshot of all entries, for status reporting.
    pub fn entries(&self) -> Vec<CachedDigest> {
        self.entries.lock().unwrap().clone()
    }
}
