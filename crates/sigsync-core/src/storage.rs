//! Disk write helpers for downloaded content.
//!
//! Whole payloads (resources, layout documents, plain HTTP bodies) land via
//! temp-file-plus-rename so a crash mid-write never leaves a torn file at
//! the final path. Chunked media appends sequentially to the target file.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Temporary file suffix used before atomic rename.
pub const TEMP_SUFFIX: &str = ".part";

/// Path for the temp file: appends `.part` to the final path
/// (e.g. `video.mp4` becomes `video.mp4.part`).
pub fn temp_path(final_path: &Path) -> PathBuf {
    let mut o = final_path.as_os_str().to_owned();
    o.push(TEMP_SUFFIX);
    PathBuf::from(o)
}

/// Write `data` to `path` atomically: write the full payload to a `.part`
/// sibling, then rename over the final path.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = temp_path(path);
    std::fs::write(&tmp, data)
        .with_context(|| format!("write temp file {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Append `data` to `path`, creating the file if it does not exist.
/// Used by chunked media transfers, which arrive strictly in order.
pub fn append(path: &Path, data: &[u8]) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {} for append", path.display()))?;
    f.write_all(data)
        .with_context(|| format!("append to {}", path.display()))?;
    Ok(())
}
