//! `sigsync regenerate` – reconcile the digest cache with the
//! required-files document.

use anyhow::Result;
use sigsync_core::cache::DigestCache;
use sigsync_core::config::PlayerConfig;

pub fn run_regenerate(cfg: &PlayerConfig) -> Result<()> {
    let cache = DigestCache::new(cfg.library_path.clone());
    cache.load();
    cache.regenerate()?;
    cache.persist();
    println!("digest cache regenerated: {} entries", cache.entries().len());
    Ok(())
}
