//! Crash-safe file writes shared by the log and the rekey path.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use tracing::warn;
use uuid::Uuid;

use crate::error::Result;

/// Write `bytes` to `dest` via a staging file: write, fsync, rename, fsync
/// the destination directory. Readers (including the file synchronizer)
/// never observe partial content.
pub(crate) fn write_atomic(staging_dir: &Path, dest: &Path, bytes: &[u8]) -> Result<()> {
    fs::create_dir_all(staging_dir)?;
    let staging_path = staging_dir.join(format!("{}.staging", Uuid::new_v4()));
    {
        let mut file = File::create(&staging_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&staging_path, dest)?;
    if let Some(parent) = dest.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

/// Remove `.staging` leftovers from a previous crash.
pub(crate) fn cleanup_staging_dir(staging_dir: &Path) {
    let Ok(entries) = fs::read_dir(staging_dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().ends_with(".staging") {
            warn!(path = %entry.path().display(), "removing orphaned staging file");
            let _ = fs::remove_file(entry.path());
        }
    }
}

pub(crate) fn fsync_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = OpenOptions::new().read(true).open(path)?;
        dir.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
