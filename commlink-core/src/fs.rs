//! Filesystem helpers used before reading or writing persisted parameters

use std::fs;
use std::path::{Path, PathBuf};

/// Name of the directory created under the working directory when no root is given
pub const DEFAULT_ROOT_NAME: &str = "commlink";

/// Default configuration root: `<current dir>/commlink`
///
/// Falls back to a relative path if the working directory cannot be read.
pub fn default_root() -> PathBuf {
    match std::env::current_dir() {
        Ok(dir) => dir.join(DEFAULT_ROOT_NAME),
        Err(e) => {
            log::warn!("Cannot read current directory, using relative root: {}", e);
            PathBuf::from(DEFAULT_ROOT_NAME)
        }
    }
}

/// Make sure `path` exists as a directory, creating it (and parents) if missing
pub fn verify_directory(path: &Path) -> bool {
    if path.as_os_str().is_empty() {
        return false;
    }
    if path.is_dir() {
        return true;
    }
    match fs::create_dir_all(path) {
        Ok(()) => path.is_dir(),
        Err(e) => {
            log::warn!("Failed to create directory {}: {}", path.display(), e);
            false
        }
    }
}

/// Make sure the parent directory of `path` exists and, if `create` is set,
/// that the file itself exists (created empty)
///
/// # Returns
/// `true` if the file exists after the call, or if its directory exists and
/// `create` is `false` and the file is already present.
pub fn verify_file_path(path: &Path, create: bool) -> bool {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if !verify_directory(parent) {
        return false;
    }
    if path.is_file() {
        return true;
    }
    if !create {
        return false;
    }
    match fs::File::create(path) {
        Ok(_) => true,
        Err(e) => {
            log::warn!("Failed to create file {}: {}", path.display(), e);
            false
        }
    }
}
