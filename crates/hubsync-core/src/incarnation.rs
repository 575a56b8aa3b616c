//! Durable incarnation counter for producers.
//!
//! Generation counters live in memory and restart at zero, so each producer
//! start must claim a fresh incarnation. The last claimed value is kept in a
//! one-line text file next to the producer's other state.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::ErrorCode;

/// Errors raised while claiming an incarnation.
#[derive(Debug, thiserror::Error)]
pub enum IncarnationError {
    #[error("incarnation file I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl IncarnationError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::IncarnationStoreFailed
    }
}

/// Read the last claimed incarnation; 0 when the file is missing or garbled.
///
/// # Errors
///
/// Returns [`IncarnationError::Io`] if the file exists but cannot be read.
pub fn read_incarnation(path: &Path) -> Result<u64, IncarnationError> {
    if !path.exists() {
        return Ok(0);
    }
    let content = fs::read_to_string(path).map_err(|source| IncarnationError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(content.trim().parse::<u64>().unwrap_or(0))
}

/// Claim the next incarnation: `last + 1`, persisted before it is returned.
///
/// The value is written to a sibling temp file and renamed into place so a
/// crash never leaves a truncated counter behind.
///
/// # Errors
///
/// Returns [`IncarnationError::Io`] if the file cannot be read or written.
pub fn next_incarnation(path: &Path) -> Result<u64, IncarnationError> {
    let next = read_incarnation(path)?.saturating_add(1);
    let io_err = |source| IncarnationError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, next.to_string()).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;

    tracing::info!(incarnation = next, path = %path.display(), "claimed producer incarnation");
    Ok(next)
}
