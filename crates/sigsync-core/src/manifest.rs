//! Required-file manifest: the in-memory table of files the player wants
//! present locally, shared across all download workers.
//!
//! The table is produced from the server's required-files document; workers
//! mutate entry progress through the methods here, each of which takes the
//! entry lock for exactly one read-modify-write and never across network I/O.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::cache::DigestCache;

/// Default chunk size for chunked pulls when the document does not set one.
pub const DEFAULT_CHUNK_SIZE: u64 = 512_000;

/// Closed set of required-file kinds, as declared by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileType {
    /// Rendered widget HTML fetched whole through the resource call.
    Resource,
    /// Layout document, delivered as a single chunk.
    Layout,
    /// Media payload, pulled in bounded chunks.
    Media,
    /// Media payload served from a plain HTTP URL.
    HttpResource,
}

impl FileType {
    /// Wire name used in transfer-call parameters and status payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Resource => "resource",
            FileType::Layout => "layout",
            FileType::Media => "media",
            FileType::HttpResource => "http-resource",
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One required file and its transfer state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequiredFile {
    pub id: i64,
    #[serde(rename = "type")]
    pub file_type: FileType,
    /// Total size in bytes (zero for resource fetches, which are one-shot).
    #[serde(default)]
    pub size: u64,
    /// Remote locator: URL for http-resource entries, server path otherwise.
    #[serde(default)]
    pub path: String,
    /// Local path relative to the library root.
    pub save_as: String,
    /// Digest the server declares for the finished file.
    #[serde(default)]
    pub md5: String,
    /// Identifiers for the whole-resource call.
    #[serde(default)]
    pub layout_id: i64,
    #[serde(default)]
    pub region_id: String,
    #[serde(default)]
    pub media_id: String,
    #[serde(default)]
    pub chunk_offset: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    #[serde(skip)]
    pub downloading: bool,
    #[serde(skip)]
    pub complete: bool,
    /// Count of digest mismatches after download; at the configured limit
    /// the entry is quarantined until a fresh manifest replaces the table.
    #[serde(skip)]
    pub verify_failures: u32,
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

#[derive(Debug, Deserialize)]
struct RequiredFilesDoc {
    files: Vec<RequiredFile>,
}

/// Shared table of required files plus the digest cache they validate
/// against. One instance per manifest generation.
pub struct RequiredFiles {
    entries: Mutex<Vec<RequiredFile>>,
    cache: Arc<DigestCache>,
}

impl RequiredFiles {
    pub fn new(entries: Vec<RequiredFile>, cache: Arc<DigestCache>) -> Self {
        Self {
            entries: Mutex::new(entries),
            cache,
        }
    }

    /// Parse a required-files JSON document into a fresh table.
    pub fn from_document(json: &str, cache: Arc<DigestCache>) -> Result<Self> {
        let doc: RequiredFilesDoc =
            serde_json::from_str(json).context("parse required-files document")?;
        Ok(Self::new(doc.files, cache))
    }

    /// Load the required-files document from disk.
    pub fn load(path: &Path, cache: Arc<DigestCache>) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        Self::from_document(&data, cache)
    }

    /// The digest cache shared with the download workers.
    pub fn cache(&self) -> &Arc<DigestCache> {
        &self.cache
    }

    /// Clone of the entry with the given id.
    pub fn get(&self, id: i64) -> Option<RequiredFile> {
        self.entries.lock().unwrap().iter().find(|f| f.id == id).cloned()
    }

    pub fn set_downloading(&self, id: i64, downloading: bool) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(f) = entries.iter_mut().find(|f| f.id == id) {
            f.downloading = downloading;
        }
    }

    /// Record chunk progress. Holds `chunk_offset + chunk_size <= size`
    /// at all times during a chunked transfer.
    pub fn advance_chunk(&self, id: i64, chunk_offset: u64, chunk_size: u64) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(f) = entries.iter_mut().find(|f| f.id == id) {
            debug_assert!(chunk_offset + chunk_size <= f.size);
            f.chunk_offset = chunk_offset;
            f.chunk_size = chunk_size;
        }
    }

    /// Rewind chunk progress so the next transfer starts from offset zero
    /// with the given nominal chunk size. Used after a failed verification
    /// of an append-mode file, which cannot be resumed.
    pub fn reset_chunk(&self, id: i64, chunk_size: u64) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(f) = entries.iter_mut().find(|f| f.id == id) {
            f.chunk_offset = 0;
            f.chunk_size = chunk_size;
        }
    }

    /// Mark an entry complete with its verified digest.
    pub fn mark_complete(&self, id: i64, md5: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(f) = entries.iter_mut().find(|f| f.id == id) {
            f.complete = true;
            f.md5 = md5.to_string();
        }
    }

    /// Mark an entry complete without digest verification (whole-resource
    /// fetches, which carry no server digest).
    pub fn set_complete(&self, id: i64) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(f) = entries.iter_mut().find(|f| f.id == id) {
            f.complete = true;
        }
    }

    /// Bump the digest-mismatch count for an entry; returns the new count.
    pub fn record_verify_failure(&self, id: i64) -> u32 {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter_mut().find(|f| f.id == id) {
            Some(f) => {
                f.verify_failures += 1;
                f.verify_failures
            }
            None => 0,
        }
    }

    /// Entries a sync pass should hand to workers: not complete, not
    /// already downloading, and not quarantined by repeated mismatches.
    pub fn pending(&self, max_verify_failures: u32) -> Vec<RequiredFile> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|f| !f.complete && !f.downloading && f.verify_failures < max_verify_failures)
            .cloned()
            .collect()
    }

    /// Snapshot of every entry, for status reporting.
    pub fn snapshot(&self) -> Vec<RequiredFile> {
        self.entries.lock().unwrap().clone()
    }
}
