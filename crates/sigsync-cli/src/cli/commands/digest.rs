//! Digest command: compute the MD5 of a file.

use anyhow::Result;
use sigsync_core::digest;
use std::path::Path;

/// Compute and print the MD5 of the given file.
pub fn run_digest(path: &Path) -> Result<()> {
    let md5 = digest::md5_path(path)?;
    println!("{}  {}", md5, path.display());
    Ok(())
}
