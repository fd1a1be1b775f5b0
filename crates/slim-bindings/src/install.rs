//! Where prebuilt static libraries live on the local machine.
//!
//! Release archives are keyed by target triple; only static libraries are
//! ever extracted from them, into a per-user cache directory.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

const CACHE_SUBDIR: &str = "slim-bindings";
const LIBRARY_PREFIX: &str = "libslim_bindings_";

/// Failures locating or unpacking a prebuilt library.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InstallError {
    /// Target triple with fewer than two non-empty segments.
    #[error("invalid target triple: {0}")]
    InvalidTarget(String),

    /// Absolute path or `..` component.
    #[error("archive entry escapes the destination: {0}")]
    UnsafeEntry(String),

    /// Not a `.a` file, or an import library.
    #[error("archive entry is not a static library: {0}")]
    NotStaticLibrary(String),

    /// No cache directory could be derived from the environment.
    #[error("no cache directory available")]
    NoCacheDir,
}

/// Result alias for install helpers.
pub type Result<T> = std::result::Result<T, InstallError>;

/// Static library file name for `target`, with the vendor segment dropped:
/// `aarch64-unknown-linux-gnu` gives `libslim_bindings_aarch64_linux_gnu.a`.
pub fn library_file_name(target: &str) -> Result<String> {
    let parts: Vec<&str> = target.split('-').collect();
    if parts.len() < 2 || parts.iter().any(|p| p.is_empty()) {
        return Err(InstallError::InvalidTarget(target.to_string()));
    }
    let kept: Vec<&str> = parts
        .into_iter()
        .filter(|p| !matches!(*p, "unknown" | "pc" | "apple"))
        .collect();
    Ok(format!("{}{}.a", LIBRARY_PREFIX, kept.join("_")))
}

/// `$XDG_CACHE_HOME/slim-bindings`, else the platform cache directory.
pub fn cache_dir() -> Result<PathBuf> {
    cache_dir_from(|key| std::env::var_os(key).map(PathBuf::from))
}

fn cache_dir_from(env: impl Fn(&str) -> Option<PathBuf>) -> Result<PathBuf> {
    let non_empty = |key: &str| env(key).filter(|p| !p.as_os_str().is_empty());
    if let Some(xdg) = non_empty("XDG_CACHE_HOME") {
        return Ok(xdg.join(CACHE_SUBDIR));
    }
    let base = if cfg!(target_os = "macos") {
        non_empty("HOME").map(|h| h.join("Library").join("Caches"))
    } else if cfg!(windows) {
        non_empty("LOCALAPPDATA")
    } else {
        non_empty("HOME").map(|h| h.join(".cache"))
    };
    base.map(|b| b.join(CACHE_SUBDIR))
        .ok_or(InstallError::NoCacheDir)
}

/// Cached static library path for `target`.
pub fn library_path(target: &str) -> Result<PathBuf> {
    Ok(cache_dir()?.join(library_file_name(target)?))
}

/// Accepts an archive entry for extraction. Entries with `..` components or
/// absolute paths are rejected, as is anything but a `.a` file (import
/// libraries ending in `.dll.a` are not static libraries).
pub fn validate_archive_entry(entry: &Path) -> Result<()> {
    let display = entry.display().to_string();
    for component in entry.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(InstallError::UnsafeEntry(display))
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }
    let file_name = entry
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| InstallError::NotStaticLibrary(display.clone()))?;
    if !file_name.ends_with(".a") || file_name.ends_with(".dll.a") {
        return Err(InstallError::NotStaticLibrary(display));
    }
    Ok(())
}
