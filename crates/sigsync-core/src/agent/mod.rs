//! Download worker: one agent per required file.
//!
//! An agent runs through `pending -> admitted (gate slot) -> transferring
//! -> verifying -> complete | failed`, picking one of three transfer
//! strategies from the entry's file type, and reports outcomes through
//! completion events. Failures are isolated: a broken transfer terminates
//! its own agent only.

mod gate;

pub use gate::{DownloadGate, GateGuard};

use anyhow::Result;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use crate::manifest::{FileType, RequiredFile, RequiredFiles, DEFAULT_CHUNK_SIZE};
use crate::storage;
use crate::transfer::RemoteTransfer;

/// Completion notifications delivered to the surrounding application.
/// Chunk events for one file arrive in chunk order; no ordering holds
/// across files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// A non-terminal chunk of a chunked pull finished.
    ChunkComplete { file_id: i64 },
    /// The agent reached a terminal state without a transfer error,
    /// regardless of digest outcome.
    FileComplete { file_id: i64, file_type: FileType },
}

/// Transfer strategy, decided once from the entry's file type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferPlan {
    /// Single resource call returning the full payload; no verification.
    WholeResource,
    /// Single streamed HTTP download, then verification.
    DirectHttp,
    /// Repeated bounded-range pulls, then verification.
    ChunkedPull,
}

impl TransferPlan {
    fn for_type(file_type: FileType) -> Self {
        match file_type {
            FileType::Resource => TransferPlan::WholeResource,
            FileType::HttpResource => TransferPlan::DirectHttp,
            FileType::Layout | FileType::Media => TransferPlan::ChunkedPull,
        }
    }
}

/// Worker responsible for downloading a single required file.
pub struct FileAgent {
    manifest: Arc<RequiredFiles>,
    client: Arc<dyn RemoteTransfer>,
    gate: Arc<DownloadGate>,
    events: mpsc::Sender<AgentEvent>,
    file_id: i64,
    max_verify_failures: u32,
}

impl FileAgent {
    pub fn new(
        manifest: Arc<RequiredFiles>,
        client: Arc<dyn RemoteTransfer>,
        gate: Arc<DownloadGate>,
        events: mpsc::Sender<AgentEvent>,
        file_id: i64,
        max_verify_failures: u32,
    ) -> Self {
        Self {
            manifest,
            client,
            gate,
            events,
            file_id,
            max_verify_failures,
        }
    }

    /// Run the agent to a terminal state. Blocks on the download gate
    /// first; the slot is held for the whole transfer and released on
    /// every path when the guard drops.
    pub fn run(&self) {
        tracing::debug!("file agent started for id {}", self.file_id);

        let Some(mut file) = self.manifest.get(self.file_id) else {
            tracing::warn!("required file {} vanished from the manifest", self.file_id);
            return;
        };

        let _slot = self.gate.acquire();
        self.manifest.set_downloading(self.file_id, true);
        tracing::debug!("download slot obtained for {}", file.save_as);

        let outcome = match TransferPlan::for_type(file.file_type) {
            TransferPlan::WholeResource => self.fetch_whole_resource(&file),
            TransferPlan::DirectHttp => self.fetch_direct_http(&file),
            TransferPlan::ChunkedPull => self.fetch_chunked(&mut file),
        };

        match outcome {
            Ok(()) => {
                let _ = self.events.send(AgentEvent::FileComplete {
                    file_id: file.id,
                    file_type: file.file_type,
                });
            }
            Err(e) => {
                // A partially-transferred file is untrustworthy: drop its
                // cache entry and leave the entry incomplete for the next
                // synchronization cycle.
                self.manifest.cache().remove(&file.save_as);
                self.manifest.set_downloading(self.file_id, false);
                tracing::error!("transfer of {} failed: {:#}", file.save_as, e);
            }
        }
    }

    fn dest(&self, file: &RequiredFile) -> PathBuf {
        self.manifest.cache().library().join(&file.save_as)
    }

    /// Strategy 1: one resource call, written atomically, immediately
    /// complete. Resources carry no server digest, so no verification.
    fn fetch_whole_resource(&self, file: &RequiredFile) -> Result<()> {
        let body = self
            .client
            .fetch_resource(file.layout_id, &file.region_id, &file.media_id)?;
        storage::write_atomic(&self.dest(file), body.as_bytes())?;
        self.manifest.set_downloading(file.id, false);
        self.manifest.set_complete(file.id);
        tracing::info!("resource downloaded: {}", file.save_as);
        Ok(())
    }

    /// Strategy 2: one streamed download to `save_as`, then verification.
    fn fetch_direct_http(&self, file: &RequiredFile) -> Result<()> {
        self.client.fetch_http(&file.path, &self.dest(file))?;
        self.manifest.set_downloading(file.id, false);
        self.verify(file);
        Ok(())
    }

    /// Strategy 3: bounded-range pulls until the offset reaches the total
    /// size. Layout payloads arrive whole on the first chunk; media
    /// payloads append per chunk.
    fn fetch_chunked(&self, file: &mut RequiredFile) -> Result<()> {
        let dest = self.dest(file);
        // A zero chunk size would never advance the offset.
        if file.chunk_size == 0 {
            file.chunk_size = DEFAULT_CHUNK_SIZE;
        }
        loop {
            // Clamp every request, the first included, so no pull reaches
            // past the declared size.
            let length = if file.file_type == FileType::Layout {
                file.chunk_size
            } else {
                file.chunk_size.min(file.size.saturating_sub(file.chunk_offset))
            };
            let data = self
                .client
                .fetch_file_chunk(file.id, file.file_type, file.chunk_offset, length)?;

            if file.file_type == FileType::Layout {
                // Layouts come back as one shot regardless of declared size.
                storage::write_atomic(&dest, &data)?;
                break;
            }

            storage::append(&dest, &data)?;
            file.chunk_offset += length;

            if file.chunk_offset >= file.size {
                break;
            }

            let next = file.chunk_size.min(file.size - file.chunk_offset);
            self.manifest.advance_chunk(file.id, file.chunk_offset, next);
            let _ = self.events.send(AgentEvent::ChunkComplete { file_id: file.id });
        }

        self.manifest.set_downloading(file.id, false);

        if !self.verify(file) && file.file_type == FileType::Media {
            // An appended file that failed verification cannot be repaired
            // by pulling more chunks: clear it and rewind the entry so the
            // next attempt starts from offset zero.
            if let Err(e) = std::fs::remove_file(&dest) {
                tracing::warn!("unable to remove mismatched file {}: {}", dest.display(), e);
            }
            self.manifest.cache().remove(&file.save_as);
            self.manifest.reset_chunk(file.id, file.chunk_size);
        }
        Ok(())
    }

    /// Compare the recomputed local digest against the manifest's declared
    /// one. A match completes the entry and makes the digest official; a
    /// mismatch counts toward quarantine. Returns whether the digests
    /// matched; the caller decides what happens to the file on disk.
    fn verify(&self, file: &RequiredFile) -> bool {
        let md5 = self.manifest.cache().get_digest(&file.save_as);
        if md5 == file.md5 {
            self.manifest.mark_complete(file.id, &file.md5);
            self.manifest.cache().add(&file.save_as, &file.md5);
            tracing::info!("file downloaded successfully: {}", file.save_as);
            true
        } else {
            let failures = self.manifest.record_verify_failure(file.id);
            tracing::info!(
                "downloaded file failed digest check, calculated [{}] declared [{}]: {}",
                md5,
                file.md5,
                file.save_as
            );
            if failures >= self.max_verify_failures {
                tracing::warn!(
                    "quarantining {} after {} failed verifications; will retry on next manifest",
                    file.save_as,
                    failures
                );
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DigestCache;
    use crate::transfer::TransferError;
    use std::path::Path;
    use std::sync::Mutex;

    /// Test double serving a fixed payload in chunks and over plain HTTP.
    struct MockTransfer {
        payload: Vec<u8>,
        chunk_requests: Mutex<Vec<(u64, u64)>>,
        fail_chunk_index: Option<usize>,
    }

    impl MockTransfer {
        fn new(payload: &[u8]) -> Self {
            Self {
                payload: payload.to_vec(),
                chunk_requests: Mutex::new(Vec::new()),
                fail_chunk_index: None,
            }
        }

        fn failing_at(payload: &[u8], index: usize) -> Self {
            Self {
                fail_chunk_index: Some(index),
                ..Self::new(payload)
            }
        }
    }

    impl RemoteTransfer for MockTransfer {
        fn fetch_resource(
            &self,
            _layout_id: i64,
            _region_id: &str,
            _media_id: &str,
        ) -> Result<String, TransferError> {
            Ok(String::from_utf8_lossy(&self.payload).into_owned())
        }

        fn fetch_file_chunk(
            &self,
            _file_id: i64,
            _file_type: FileType,
            offset: u64,
            length: u64,
        ) -> Result<Vec<u8>, TransferError> {
            let mut requests = self.chunk_requests.lock().unwrap();
            if self.fail_chunk_index == Some(requests.len()) {
                return Err(TransferError::Http(503));
            }
            requests.push((offset, length));
            let start = offset as usize;
            let end = (offset + length).min(self.payload.len() as u64) as usize;
            Ok(self.payload[start.min(self.payload.len())..end].to_vec())
        }

        fn fetch_http(&self, _url: &str, dest: &Path) -> Result<(), TransferError> {
            std::fs::write(dest, &self.payload)?;
            Ok(())
        }

        fn notify_status(&self, _payload: &serde_json::Value) {}
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        manifest: Arc<RequiredFiles>,
        events: mpsc::Receiver<AgentEvent>,
        agent: FileAgent,
    }

    fn fixture(entry: RequiredFile, client: MockTransfer) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DigestCache::new(dir.path().to_path_buf()));
        let manifest = Arc::new(RequiredFiles::new(vec![entry], cache));
        let gate = Arc::new(DownloadGate::new(1));
        let (tx, rx) = mpsc::channel();
        let agent = FileAgent::new(
            Arc::clone(&manifest),
            Arc::new(client),
            gate,
            tx,
            1,
            3,
        );
        Fixture {
            _dir: dir,
            manifest,
            events: rx,
            agent,
        }
    }

    fn media_entry(payload: &[u8], chunk_size: u64, md5: &str) -> RequiredFile {
        RequiredFile {
            id: 1,
            file_type: FileType::Media,
            size: payload.len() as u64,
            path: "1.bin".to_string(),
            save_as: "1.bin".to_string(),
            md5: md5.to_string(),
            layout_id: 0,
            region_id: String::new(),
            media_id: String::new(),
            chunk_offset: 0,
            chunk_size,
            downloading: false,
            complete: false,
            verify_failures: 0,
        }
    }

    #[test]
    fn chunked_pull_offsets_and_final_shrink() {
        let payload = vec![7u8; 1000];
        let md5 = format!("{:x}", md5::compute(&payload));
        let client = MockTransfer::new(&payload);
        let fx = fixture(media_entry(&payload, 400, &md5), client);

        fx.agent.run();

        let file = fx.manifest.get(1).unwrap();
        assert!(file.complete);
        assert!(!file.downloading);
        assert!(fx.manifest.cache().is_valid_path("1.bin"));
        assert_eq!(
            std::fs::read(fx.manifest.cache().library().join("1.bin")).unwrap(),
            payload
        );

        let events: Vec<AgentEvent> = fx.events.try_iter().collect();
        assert_eq!(
            events,
            vec![
                AgentEvent::ChunkComplete { file_id: 1 },
                AgentEvent::ChunkComplete { file_id: 1 },
                AgentEvent::FileComplete {
                    file_id: 1,
                    file_type: FileType::Media
                },
            ]
        );
    }

    #[test]
    fn chunk_request_sequence_never_over_requests() {
        let payload = vec![3u8; 1000];
        let md5 = format!("{:x}", md5::compute(&payload));
        let client = Arc::new(MockTransfer::new(&payload));
        // Keep a handle on the mock to inspect the request log after the run.
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DigestCache::new(dir.path().to_path_buf()));
        let manifest = Arc::new(RequiredFiles::new(
            vec![media_entry(&payload, 400, &md5)],
            cache,
        ));
        let (tx, _rx) = mpsc::channel();
        let agent = FileAgent::new(
            Arc::clone(&manifest),
            Arc::clone(&client) as Arc<dyn RemoteTransfer>,
            Arc::new(DownloadGate::new(1)),
            tx,
            1,
            3,
        );
        agent.run();

        let requests = client.chunk_requests.lock().unwrap().clone();
        assert_eq!(requests, vec![(0, 400), (400, 400), (800, 200)]);
        assert!(manifest.get(1).unwrap().complete);
    }

    #[test]
    fn layout_completes_on_first_chunk() {
        let payload = b"<layout><region/></layout>".to_vec();
        let md5 = format!("{:x}", md5::compute(&payload));
        let mut entry = media_entry(&payload, 512_000, &md5);
        entry.file_type = FileType::Layout;
        entry.save_as = "5.xlf".to_string();
        let client = MockTransfer::new(&payload);
        let fx = fixture(entry, client);

        fx.agent.run();

        let file = fx.manifest.get(1).unwrap();
        assert!(file.complete);
        assert_eq!(
            std::fs::read(fx.manifest.cache().library().join("5.xlf")).unwrap(),
            payload
        );
        // One shot: no chunk events, just the terminal one.
        let events: Vec<AgentEvent> = fx.events.try_iter().collect();
        assert_eq!(
            events,
            vec![AgentEvent::FileComplete {
                file_id: 1,
                file_type: FileType::Layout
            }]
        );
    }

    #[test]
    fn whole_resource_skips_verification() {
        let payload = b"<html>widget</html>".to_vec();
        let mut entry = media_entry(&payload, 512_000, "");
        entry.file_type = FileType::Resource;
        entry.save_as = "widget.html".to_string();
        let client = MockTransfer::new(&payload);
        let fx = fixture(entry, client);

        fx.agent.run();

        let file = fx.manifest.get(1).unwrap();
        assert!(file.complete);
        assert!(!file.downloading);
        // No digest was declared or inserted.
        assert!(!fx.manifest.cache().is_valid_path("widget.html"));
    }

    #[test]
    fn digest_mismatch_leaves_entry_incomplete() {
        let payload = vec![9u8; 100];
        let entry = media_entry(&payload, 400, "00000000000000000000000000000000");
        let client = MockTransfer::new(&payload);
        let fx = fixture(entry, client);

        fx.agent.run();

        let file = fx.manifest.get(1).unwrap();
        assert!(!file.complete);
        assert_eq!(file.verify_failures, 1);
        // No cache insertion for a mismatched file.
        assert!(!fx.manifest.cache().is_valid_path("1.bin"));
        // The append-mode file was cleared and rewound for a clean retry.
        assert!(!fx.manifest.cache().library().join("1.bin").exists());
        assert_eq!(file.chunk_offset, 0);
        // Terminal event still fires; consumers decide what to do.
        let events: Vec<AgentEvent> = fx.events.try_iter().collect();
        assert!(matches!(
            events.last(),
            Some(AgentEvent::FileComplete { file_id: 1, .. })
        ));
    }

    #[test]
    fn mismatched_media_restarts_clean_on_next_pass() {
        let payload = vec![5u8; 1000];
        let client = Arc::new(MockTransfer::new(&payload));
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DigestCache::new(dir.path().to_path_buf()));
        let manifest = Arc::new(RequiredFiles::new(
            vec![media_entry(&payload, 400, "00000000000000000000000000000000")],
            cache,
        ));
        let (tx, _rx) = mpsc::channel();
        let agent = FileAgent::new(
            Arc::clone(&manifest),
            Arc::clone(&client) as Arc<dyn RemoteTransfer>,
            Arc::new(DownloadGate::new(1)),
            tx,
            1,
            3,
        );

        agent.run();
        let first = manifest.get(1).unwrap();
        assert!(!first.complete);
        assert_eq!(first.verify_failures, 1);
        assert_eq!(first.chunk_offset, 0);
        assert!(!dir.path().join("1.bin").exists());

        // The retry pulls the whole file again from offset zero rather
        // than appending past the end of the previous attempt.
        agent.run();
        let requests = client.chunk_requests.lock().unwrap().clone();
        assert_eq!(
            requests,
            vec![(0, 400), (400, 400), (800, 200), (0, 400), (400, 400), (800, 200)]
        );
        let second = manifest.get(1).unwrap();
        assert_eq!(second.verify_failures, 2);
        assert_eq!(second.chunk_offset, 0);
        assert!(!dir.path().join("1.bin").exists());
    }

    #[test]
    fn mismatched_http_file_left_in_place() {
        let payload = b"not what was promised".to_vec();
        let mut entry = media_entry(&payload, 400, "00000000000000000000000000000000");
        entry.file_type = FileType::HttpResource;
        entry.path = "http://cdn.example.com/1.bin".to_string();
        let client = MockTransfer::new(&payload);
        let fx = fixture(entry, client);

        fx.agent.run();

        let file = fx.manifest.get(1).unwrap();
        assert!(!file.complete);
        assert_eq!(file.verify_failures, 1);
        // A single-shot download is replaced wholesale on the next pass,
        // so the mismatched file stays on disk.
        assert!(fx.manifest.cache().library().join("1.bin").exists());
    }

    #[test]
    fn first_request_clamped_to_declared_size() {
        let payload = vec![2u8; 1000];
        let md5 = format!("{:x}", md5::compute(&payload));
        let client = Arc::new(MockTransfer::new(&payload));
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DigestCache::new(dir.path().to_path_buf()));
        // Default chunk size, far larger than the file itself.
        let manifest = Arc::new(RequiredFiles::new(
            vec![media_entry(&payload, DEFAULT_CHUNK_SIZE, &md5)],
            cache,
        ));
        let (tx, _rx) = mpsc::channel();
        let agent = FileAgent::new(
            Arc::clone(&manifest),
            Arc::clone(&client) as Arc<dyn RemoteTransfer>,
            Arc::new(DownloadGate::new(1)),
            tx,
            1,
            3,
        );
        agent.run();

        let requests = client.chunk_requests.lock().unwrap().clone();
        assert_eq!(requests, vec![(0, 1000)]);
        assert!(manifest.get(1).unwrap().complete);
    }

    #[test]
    fn zero_chunk_size_falls_back_to_default() {
        let payload = vec![4u8; 100];
        let md5 = format!("{:x}", md5::compute(&payload));
        let client = Arc::new(MockTransfer::new(&payload));
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DigestCache::new(dir.path().to_path_buf()));
        let manifest = Arc::new(RequiredFiles::new(
            vec![media_entry(&payload, 0, &md5)],
            cache,
        ));
        let (tx, _rx) = mpsc::channel();
        let agent = FileAgent::new(
            Arc::clone(&manifest),
            Arc::clone(&client) as Arc<dyn RemoteTransfer>,
            Arc::new(DownloadGate::new(1)),
            tx,
            1,
            3,
        );
        agent.run();

        // One clamped request, no spin on a zero-length pull.
        let requests = client.chunk_requests.lock().unwrap().clone();
        assert_eq!(requests, vec![(0, 100)]);
        assert!(manifest.get(1).unwrap().complete);
    }

    #[test]
    fn transfer_failure_cleans_cache_and_stops() {
        let payload = vec![1u8; 1000];
        let md5 = format!("{:x}", md5::compute(&payload));
        let entry = media_entry(&payload, 400, &md5);
        let client = MockTransfer::failing_at(&payload, 1);
        let fx = fixture(entry, client);
        fx.manifest.cache().add("1.bin", "stale");

        fx.agent.run();

        let file = fx.manifest.get(1).unwrap();
        assert!(!file.complete);
        assert!(!file.downloading);
        // The partial download's cache entry was dropped.
        assert!(fx.manifest.cache().entries().is_empty());
        // No terminal event on the error path.
        let events: Vec<AgentEvent> = fx.events.try_iter().collect();
        assert_eq!(events, vec![AgentEvent::ChunkComplete { file_id: 1 }]);
    }
}
