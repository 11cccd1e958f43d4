use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{Result, StoreError};

pub const APP_QUALIFIER: &str = "de";
pub const APP_ORG: &str = "gematik";
pub const APP_NAME: &str = "erp";

pub const DATABASE_FILE_NAME: &str = "erp.realm";

pub fn data_dir() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var("ERP_DATA_DIR") {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).ok_or_else(|| {
        StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "cannot determine data directory",
        ))
    })?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn secure_prefs_path(dir: &Path, file_name: &str) -> PathBuf {
    dir.join(format!("{file_name}.json"))
}

pub fn master_key_path(dir: &Path, alias: &str) -> PathBuf {
    dir.join(format!("{alias}.key"))
}

pub fn database_path(dir: &Path) -> PathBuf {
    dir.join(DATABASE_FILE_NAME)
}

/// Creates `dir` if needed and restricts it to the current user.
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
            warn!("cannot restrict permissions on {}: {}", dir.display(), e);
        }
    }
    Ok(())
}

/// Replaces `path` with `bytes` through a temp file in the same directory,
/// so readers never observe a half-written file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))?;
    }
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}
