//! Content digest computation.
//!
//! The server manifest declares 128-bit MD5 digests (as lowercase hex), so
//! that is the one algorithm used for staleness and corruption detection.
//! It is a compatibility choice, not a security boundary.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const BUF_SIZE: usize = 64 * 1024;

/// Reserved digest value returned when a file cannot be hashed. It is not
/// valid hex of the right length, so it can never match a server-declared
/// digest: any comparison against it fails closed.
pub const INVALID_DIGEST: &str = "0";

/// Compute the MD5 of a file and return the digest as lowercase hex.
/// Reads in chunks to keep memory use bounded; suitable for large media.
pub fn md5_path(path: &Path) -> Result<String> {
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut ctx = md5::Context::new();
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = f
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

/// Compute the MD5 of a file, mapping any I/O failure to [`INVALID_DIGEST`].
/// Never returns an error: an unreadable file simply yields the sentinel.
pub fn md5_path_or_invalid(path: &Path) -> String {
    match md5_path(path) {
        Ok(digest) => digest,
        Err(e) => {
            tracing::error!("unable to compute digest for {}: {:#}", path.display(), e);
            INVALID_DIGEST.to_string()
        }
    }
}
