//! Procedure source preparation: materializes a procedure's code into a
//! runner-local directory before the worker is started against it.
//!
//! A `file://` source is a symlink-tree copy (cheap, no network); an
//! `http(s)://` source is a tar.gz archive downloaded and extracted. Both
//! land at `$TMPDIR/procedure-<sha256(url)>-<slot>` so re-preparing the
//! same source for the same slot is idempotent and collision-free across
//! slots.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

#[derive(thiserror::Error, Debug)]
pub enum ProcedureError {
    #[error("unsupported procedure source scheme: {0}")]
    UnsupportedScheme(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),
    #[error("archive extraction failed: {0}")]
    Archive(String),
}

/// Hash used to both name the prepared directory and to recognize "this
/// runner already hosts this procedure" for slot reuse in the manager.
pub fn source_hash(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn prepared_dir(tmp_dir: &Path, url: &str, slot: &str) -> PathBuf {
    tmp_dir.join(format!("procedure-{}-{}", source_hash(url), slot))
}

/// Prepares `url`'s procedure source into `prepared_dir(tmp_dir, url,
/// slot)`, returning that path. A no-op if the directory already exists
/// (slot already hosts this procedure).
pub async fn prepare(tmp_dir: &Path, url: &str, slot: &str) -> Result<PathBuf, ProcedureError> {
    let dest = prepared_dir(tmp_dir, url, slot);
    if dest.exists() {
        return Ok(dest);
    }

    if let Some(path) = url.strip_prefix("file://") {
        copy_symlink_tree(Path::new(path), &dest)?;
    } else if url.starts_with("http://") || url.starts_with("https://") {
        download_and_extract(url, &dest).await?;
    } else {
        return Err(ProcedureError::UnsupportedScheme(url.to_string()));
    }

    Ok(dest)
}

/// Recursively recreates `src`'s tree at `dest`, symlinking individual
/// files rather than copying their contents (the source directory is
/// expected to outlive the runner and is typically read-only).
fn copy_symlink_tree(src: &Path, dest: &Path) -> Result<(), ProcedureError> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dest_path = dest.join(entry.file_name());
        if file_type.is_dir() {
            copy_symlink_tree(&entry.path(), &dest_path)?;
        } else {
            #[cfg(unix)]
            std::os::unix::fs::symlink(entry.path(), &dest_path)?;
            #[cfg(not(unix))]
            std::fs::copy(entry.path(), &dest_path)?;
        }
    }
    Ok(())
}

async fn download_and_extract(url: &str, dest: &Path) -> Result<(), ProcedureError> {
    let bytes = reqwest::get(url).await?.bytes().await?;
    std::fs::create_dir_all(dest)?;

    let decoder = flate2::read::GzDecoder::new(std::io::Cursor::new(bytes));
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(dest)
        .map_err(|e| ProcedureError::Archive(e.to_string()))?;

    Ok(())
}
