use std::path::PathBuf;

use directories::ProjectDirs;

use crate::error::{Result, StoreError};

pub const APP_QUALIFIER: &str = "net";
pub const APP_ORG: &str = "burrow";
pub const APP_NAME: &str = "burrow";

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| StoreError::Corrupt("cannot determine home directory".to_string()))
}

/// Default location of the synchronized store folder.
pub fn default_sync_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().join("SyncData"))
}

/// Per-device local state (device id file); never inside the synced folder.
pub fn config_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().to_path_buf())
}
