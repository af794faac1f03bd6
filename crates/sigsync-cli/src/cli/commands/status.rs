//! `sigsync status` – show the digest cache state.

use anyhow::Result;
use sigsync_core::cache::DigestCache;
use sigsync_core::config::PlayerConfig;
use std::sync::Arc;

pub fn run_status(cfg: &PlayerConfig) -> Result<()> {
    let cache = Arc::new(DigestCache::new(cfg.library_path.clone()));
    cache.load();

    let entries = cache.entries();
    if entries.is_empty() {
        println!("Digest cache is empty.");
        return Ok(());
    }

    println!("{:<40} {:<34} {}", "PATH", "MD5", "VALID");
    for e in entries {
        println!(
            "{:<40} {:<34} {}",
            e.path,
            e.md5,
            if cache.is_valid_path(&e.path) {
                "yes"
            } else {
                "no"
            }
        );
    }
    Ok(())
}
