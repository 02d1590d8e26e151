use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "dev";
pub const APP_ORG: &str = "keyvault";
pub const APP_NAME: &str = "keyvault";

/// File name of the [`FileStorage`](crate::storage::FileStorage) document.
pub const STORE_FILE: &str = "store.json";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("KEYVAULT_DATA_DIR") {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn store_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join(STORE_FILE))
}
