use crate::error::{ManagerError, Result};
use std::path::{Path, PathBuf};

#[cfg(windows)]
const BINARY_NAMES: &[&str] = &["wireproxy.exe", "wireproxy"];
#[cfg(not(windows))]
const BINARY_NAMES: &[&str] = &["wireproxy"];

/// Finds the wireproxy executable: the path saved in settings, then the daemon config
/// override, then `PATH`.
pub fn resolve_binary(saved: Option<&str>, configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(saved) = saved.map(str::trim).filter(|path| !path.is_empty()) {
        let path = PathBuf::from(saved);
        if path.is_file() {
            return Ok(path);
        }
        tracing::warn!(path = %path.display(), "saved wireproxy path no longer exists");
    }
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        tracing::warn!(path = %path.display(), "configured wireproxy binary not found");
    }
    search_path(std::env::var_os("PATH").as_deref()).ok_or(ManagerError::BinaryNotFound)
}

fn search_path(path_var: Option<&std::ffi::OsStr>) -> Option<PathBuf> {
    let path_var = path_var?;
    std::env::split_paths(path_var)
        .flat_map(|dir| BINARY_NAMES.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}
