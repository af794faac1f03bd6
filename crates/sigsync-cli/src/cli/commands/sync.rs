//! `sigsync sync` – run one synchronization pass.

use anyhow::{Context, Result};
use sigsync_core::cache::{DigestCache, REQUIRED_FILES_FILE};
use sigsync_core::config::PlayerConfig;
use sigsync_core::manifest::RequiredFiles;
use sigsync_core::sync::run_sync_pass;
use sigsync_core::transfer::{HttpTransfer, RemoteTransfer};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

pub fn run_sync(cfg: &PlayerConfig, manifest_path: Option<PathBuf>) -> Result<()> {
    std::fs::create_dir_all(&cfg.library_path)
        .with_context(|| format!("create library dir {}", cfg.library_path.display()))?;

    let cache = Arc::new(DigestCache::new(cfg.library_path.clone()));
    cache.load();

    let manifest_path =
        manifest_path.unwrap_or_else(|| cfg.library_path.join(REQUIRED_FILES_FILE));
    let manifest = Arc::new(RequiredFiles::load(&manifest_path, Arc::clone(&cache))?);
    let client: Arc<dyn RemoteTransfer> = Arc::new(HttpTransfer::from_config(cfg));

    // Drain agent events as they arrive so per-chunk progress lands in the log.
    let (tx, rx) = mpsc::channel();
    let drain = std::thread::spawn(move || {
        for event in rx {
            tracing::debug!("agent event: {:?}", event);
        }
    });

    let summary = run_sync_pass(&manifest, &client, cfg, tx);
    let _ = drain.join();

    cache.persist();

    println!(
        "sync: {} spawned, {} completed, {} failed",
        summary.spawned, summary.completed, summary.failed
    );
    Ok(())
}
