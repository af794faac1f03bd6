//! One synchronization pass over the required-files table.
//!
//! Spawns a file agent thread per pending entry; all agents share the
//! download gate, the manifest, and the digest cache. Workers are
//! independent: one failing transfer never touches another's entry.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use crate::agent::{AgentEvent, DownloadGate, FileAgent};
use crate::config::PlayerConfig;
use crate::manifest::RequiredFiles;
use crate::transfer::RemoteTransfer;

/// Outcome counts for a single pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Agents spawned this pass.
    pub spawned: usize,
    /// Entries complete after the pass (of those spawned).
    pub completed: usize,
    /// Entries still incomplete after the pass.
    pub failed: usize,
}

/// Run one pass: an agent per pending entry, bounded by the gate, joined
/// before returning. Afterwards the media inventory is reported to the
/// server (fire-and-forget).
pub fn run_sync_pass(
    manifest: &Arc<RequiredFiles>,
    client: &Arc<dyn RemoteTransfer>,
    cfg: &PlayerConfig,
    events: mpsc::Sender<AgentEvent>,
) -> SyncSummary {
    let gate = Arc::new(DownloadGate::new(cfg.max_concurrent_downloads));
    let pending = manifest.pending(cfg.max_verify_failures);
    tracing::info!("sync pass: {} file(s) pending", pending.len());

    let mut handles = Vec::with_capacity(pending.len());
    for file in &pending {
        let agent = FileAgent::new(
            Arc::clone(manifest),
            Arc::clone(client),
            Arc::clone(&gate),
            events.clone(),
            file.id,
            cfg.max_verify_failures,
        );
        let handle = thread::Builder::new()
            .name(format!("file-agent-{}", file.id))
            .spawn(move || agent.run());
        match handle {
            Ok(h) => handles.push(h),
            Err(e) => tracing::error!("unable to spawn agent for {}: {}", file.id, e),
        }
    }

    let spawned = handles.len();
    for h in handles {
        if h.join().is_err() {
            tracing::error!("file agent panicked");
        }
    }

    let pending_ids: Vec<i64> = pending.iter().map(|f| f.id).collect();
    let completed = manifest
        .snapshot()
        .iter()
        .filter(|f| pending_ids.contains(&f.id) && f.complete)
        .count();

    let summary = SyncSummary {
        spawned,
        completed,
        failed: spawned - completed,
    };
    tracing::info!(
        "sync pass finished: {} spawned, {} completed, {} failed",
        summary.spawned,
        summary.completed,
        summary.failed
    );

    notify_media_inventory(manifest, client);
    summary
}

/// Report the current inventory to the server. Fire-and-forget: transport
/// failures are logged inside the client, never surfaced here.
pub fn notify_media_inventory(manifest: &Arc<RequiredFiles>, client: &Arc<dyn RemoteTransfer>) {
    let inventory: Vec<serde_json::Value> = manifest
        .snapshot()
        .iter()
        .map(|f| {
            serde_json::json!({
                "id": f.id,
                "type": f.file_type.as_str(),
                "complete": f.complete,
            })
        })
        .collect();
    client.notify_status(&serde_json::Value::Array(inventory));
}
