//! Cross-platform filesystem utilities
//!
//! This module provides helpers that work correctly on both Unix and Windows:
//! - `normalize_path`: Strips Windows `\\?\` prefix from canonicalized paths
//! - `atomic_rename` / `write_atomic`: Crash-safe file replacement
//! - `remove_tree`: Directory removal that copes with read-only git objects
//! - `copy_tree`: Copy a directory honoring ignore files
//! - `replace_tree`: Re-copy a directory without exposing a partial result
//! - `get_cache_base_dir`: Returns platform-appropriate cache directory

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Normalize Windows paths by removing the `\\?\` prefix if present.
///
/// On Windows, `Path::canonicalize()` returns paths with the extended-length path prefix
/// (`\\?\C:\...`), which changes the derived cache key for the same directory.
/// This function strips the prefix on Windows while being a no-op on Unix.
///
/// # Examples
///
/// ```
/// use std::path::PathBuf;
/// use codemap_cache::fs_utils::normalize_path;
///
/// let path = PathBuf::from("/home/user/repo");
/// assert_eq!(normalize_path(&path), path);
/// ```
pub fn normalize_path(path: &Path) -> PathBuf {
    #[cfg(windows)]
    {
        let s = path.to_string_lossy();
        if let Some(stripped) = s.strip_prefix(r"\\?\UNC\") {
            return PathBuf::from(format!(r"\\{}", stripped));
        }
        if let Some(stripped) = s.strip_prefix(r"\\?\") {
            return PathBuf::from(stripped);
        }
    }
    path.to_path_buf()
}

/// Cross-platform atomic rename that handles Windows file replacement.
///
/// On Unix, `fs::rename` atomically replaces the target if it exists.
/// On Windows, `fs::rename` fails if the target exists, so the target is
/// deleted first.
pub fn atomic_rename(src: &Path, dst: &Path) -> io::Result<()> {
    #[cfg(windows)]
    {
        if dst.exists() {
            fs::remove_file(dst)?;
        }
    }
    fs::rename(src, dst)
}

/// Write `contents` to `path` so that readers observe either the old or the
/// new file, never a torn write.
///
/// The data is written and fsynced to a sibling temp file, which is then
/// renamed over the target.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let tmp_path = parent.join(format!(".{}.{}.tmp", file_name, std::process::id()));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    if let Err(e) = atomic_rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    Ok(())
}

/// Remove a directory tree if it exists.
///
/// Git marks pack files read-only, which makes `remove_dir_all` fail on
/// Windows; on a permission error the tree is made writable and removal is
/// retried once.
pub fn remove_tree(path: &Path) -> io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            clear_readonly(path);
            fs::remove_dir_all(path)
        }
        Err(e) => Err(e),
    }
}

/// Copy the files of `src` into `dst`, skipping anything excluded by
/// `.gitignore`, `.ignore` or hidden-file rules. Returns the number of files
/// copied.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<usize> {
    fs::create_dir_all(dst)?;
    let walker = ignore::WalkBuilder::new(src)
        .hidden(true)
        .git_ignore(true)
        .require_git(false)
        .follow_links(false)
        .build();

    let mut copied = 0;
    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(relative);
        match entry.file_type() {
            Some(t) if t.is_dir() => fs::create_dir_all(&target)?,
            Some(t) if t.is_file() => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(entry.path(), &target)?;
                copied += 1;
            }
            _ => {}
        }
    }
    Ok(copied)
}

/// Replace `dst` with a fresh copy of `src`.
///
/// The copy is staged in a hidden sibling of `dst` and swapped in only once
/// it is complete; if anything fails before the swap, `dst` is untouched.
pub fn replace_tree(src: &Path, dst: &Path) -> io::Result<usize> {
    if !src.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a directory", src.display()),
        ));
    }
    let staging = sibling(dst, "staging");
    let retired = sibling(dst, "retired");
    remove_tree(&staging)?;
    remove_tree(&retired)?;

    let copied = match copy_tree(src, &staging) {
        Ok(copied) => copied,
        Err(e) => {
            let _ = remove_tree(&staging);
            return Err(e);
        }
    };

    if dst.exists() {
        fs::rename(dst, &retired)?;
    }
    if let Err(e) = fs::rename(&staging, dst) {
        let _ = fs::rename(&retired, dst);
        let _ = remove_tree(&staging);
        return Err(e);
    }
    remove_tree(&retired)?;
    Ok(copied)
}

/// Hidden path next to `path`, e.g. `.name.staging`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "tree".to_string());
    parent.join(format!(".{}.{}", name, suffix))
}

fn clear_readonly(root: &Path) {
    let walker = ignore::WalkBuilder::new(root)
        .standard_filters(false)
        .hidden(false)
        .build();
    for entry in walker.flatten() {
        if let Ok(meta) = entry.metadata() {
            let mut perms = meta.permissions();
            if perms.readonly() {
                #[allow(clippy::permissions_set_readonly_false)]
                perms.set_readonly(false);
                let _ = fs::set_permissions(entry.path(), perms);
            }
        }
    }
}

/// Get platform-appropriate cache base directory.
///
/// - **Windows**: `%LOCALAPPDATA%\codemap-cache`
/// - **Unix**: `$XDG_CACHE_HOME/codemap-cache` or `~/.cache/codemap-cache`
/// - **Fallback**: System temp directory + `codemap-cache`
///
/// # Examples
///
/// ```
/// use codemap_cache::fs_utils::get_cache_base_dir;
///
/// let cache_dir = get_cache_base_dir();
/// assert!(cache_dir.to_string_lossy().contains("codemap-cache"));
/// ```
pub fn get_cache_base_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(local_appdata) = std::env::var("LOCALAPPDATA") {
            return PathBuf::from(local_appdata).join("codemap-cache");
        }
    }

    #[cfg(not(windows))]
    {
        if let Ok(xdg_cache) = std::env::var("XDG_CACHE_HOME") {
            if !xdg_cache.is_empty() {
                return PathBuf::from(xdg_cache).join("codemap-cache");
            }
        }
    }

    if let Some(cache) = dirs::cache_dir() {
        return cache.join("codemap-cache");
    }

    std::env::temp_dir().join("codemap-cache")
}
