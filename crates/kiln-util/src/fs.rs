//! Filesystem utilities for Kiln.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::error::UtilError;

/// The filesystem operations the engine performs on sandboxes, outputs and
/// the artifact store.
///
/// Implementations must be safe to call from many worker threads at once.
pub trait Filesystem: Send + Sync {
    /// Read a whole file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read.
    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, UtilError>;

    /// Write `data` to `path` so that readers observe either the old content
    /// or the complete new content, never a partial file.
    ///
    /// # Errors
    /// Returns an error if the temporary file cannot be written or renamed.
    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), UtilError>;

    /// Create a hard link at `dest` pointing to `src`.
    ///
    /// # Errors
    /// Returns an error if the link cannot be created.
    fn hard_link(&self, src: &Path, dest: &Path) -> Result<(), UtilError>;

    /// Copy `src` to `dest`, preserving permissions.
    ///
    /// # Errors
    /// Returns an error if the copy fails.
    fn copy(&self, src: &Path, dest: &Path) -> Result<(), UtilError>;

    /// Remove a directory tree. Absent paths are not an error.
    ///
    /// # Errors
    /// Returns an error if the tree exists but cannot be removed.
    fn remove_tree(&self, path: &Path) -> Result<(), UtilError>;

    /// Ensure `path` exists as an empty directory.
    ///
    /// # Errors
    /// Returns an error if the old content cannot be removed or the
    /// directory cannot be created.
    fn make_dir_clean(&self, path: &Path) -> Result<(), UtilError>;

    /// Set the permission bits of `path` to `mode`.
    ///
    /// # Errors
    /// Returns an error if the permissions cannot be changed.
    fn set_mode(&self, path: &Path, mode: u32) -> Result<(), UtilError>;
}

/// [`Filesystem`] backed by the local disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl Filesystem for LocalFs {
    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, UtilError> {
        std::fs::read(path).map_err(|source| UtilError::io(path, source))
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), UtilError> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let mut tmp =
            tempfile::NamedTempFile::new_in(parent).map_err(|source| UtilError::io(parent, source))?;
        tmp.write_all(data)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|source| UtilError::io(tmp.path(), source))?;
        tmp.persist(path)
            .map_err(|e| UtilError::io(path, e.error))?;
        Ok(())
    }

    fn hard_link(&self, src: &Path, dest: &Path) -> Result<(), UtilError> {
        std::fs::hard_link(src, dest).map_err(|source| UtilError::io(dest, source))
    }

    fn copy(&self, src: &Path, dest: &Path) -> Result<(), UtilError> {
        std::fs::copy(src, dest)
            .map(|_| ())
            .map_err(|source| UtilError::io(dest, source))
    }

    fn remove_tree(&self, path: &Path) -> Result<(), UtilError> {
        remove_dir_all_if_exists(path)
    }

    fn make_dir_clean(&self, path: &Path) -> Result<(), UtilError> {
        remove_dir_all_if_exists(path)?;
        ensure_dir(path)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> Result<(), UtilError> {
        set_file_mode(path, mode)
    }
}

/// Create a directory and all parent directories if they do not exist.
///
/// # Errors
/// Returns an error if the directory cannot be created.
pub fn ensure_dir(path: &Path) -> Result<(), UtilError> {
    std::fs::create_dir_all(path).map_err(|source| UtilError::io(path, source))
}

/// Place `src` at `dest`, by hard link when `link` is set and by copy
/// otherwise.
///
/// A failed hard link (e.g. cross-device) falls back to a copy. Any existing
/// file at `dest` is replaced.
///
/// # Errors
/// Returns an error if both hard linking and copying fail.
pub fn materialize(fs: &dyn Filesystem, src: &Path, dest: &Path, link: bool) -> Result<(), UtilError> {
    if let Some(parent) = dest.parent() {
        ensure_dir(parent)?;
    }

    // Remove existing destination if present, so hard_link doesn't fail.
    if dest.symlink_metadata().is_ok() {
        std::fs::remove_file(dest).map_err(|source| UtilError::io(dest, source))?;
    }

    if link {
        match fs.hard_link(src, dest) {
            Ok(()) => return Ok(()),
            Err(e) => tracing::debug!(src = %src.display(), error = %e, "hard link failed, copying"),
        }
    }
    fs.copy(src, dest)
}

/// Remove a directory and all its contents. No error if the directory is absent.
///
/// # Errors
/// Returns an error if the directory exists but cannot be removed.
pub fn remove_dir_all_if_exists(path: &Path) -> Result<(), UtilError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(UtilError::io(path, source)),
    }
}

/// Permission bits of `path`, following symlinks.
///
/// # Errors
/// Returns an error if the file cannot be inspected.
pub fn file_mode(path: &Path) -> Result<u32, UtilError> {
    let meta = std::fs::metadata(path).map_err(|source| UtilError::io(path, source))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        Ok(meta.permissions().mode() & 0o7777)
    }
    #[cfg(not(unix))]
    {
        Ok(if meta.permissions().readonly() { 0o444 } else { 0o644 })
    }
}

/// Set the permission bits of `path`.
///
/// # Errors
/// Returns an error if the permissions cannot be changed.
pub fn set_file_mode(path: &Path, mode: u32) -> Result<(), UtilError> {
    #[cfg(unix)]
    let perms = {
        use std::os::unix::fs::PermissionsExt;
        std::fs::Permissions::from_mode(mode)
    };
    #[cfg(not(unix))]
    let perms = {
        let mut perms = std::fs::metadata(path)
            .map_err(|source| UtilError::io(path, source))?
            .permissions();
        perms.set_readonly(mode & 0o200 == 0);
        perms
    };
    std::fs::set_permissions(path, perms).map_err(|source| UtilError::io(path, source))
}

/// Whether a source entry contains glob metacharacters.
pub fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Expand a glob `pattern` relative to `dir`, returning the matching regular
/// files as paths relative to `dir`, sorted.
///
/// # Errors
/// Returns an error if the pattern is malformed or a match cannot be read.
pub fn expand_glob(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, UtilError> {
    let prefix = glob::Pattern::escape(&dir.to_string_lossy());
    let full = format!("{prefix}/{pattern}");
    let paths = glob::glob(&full).map_err(|e| UtilError::GlobPattern {
        pattern: pattern.to_owned(),
        message: e.to_string(),
    })?;

    let mut out = Vec::new();
    for entry in paths {
        let path = entry.map_err(|e| {
            let failed = e.path().to_path_buf();
            UtilError::io(&failed, e.into_error())
        })?;
        if !path.is_file() {
            continue;
        }
        if let Ok(rel) = path.strip_prefix(dir) {
            out.push(rel.to_path_buf());
        }
    }
    out.sort();
    Ok(out)
}

/// Collect every file called `file_name` under `dir`, recursively, sorted by
/// path. Directories for which `skip_dir` returns true are not descended into.
///
/// # Errors
/// Returns an error if a directory cannot be read.
pub fn find_named(
    dir: &Path,
    file_name: &str,
    skip_dir: &dyn Fn(&Path) -> bool,
) -> Result<Vec<PathBuf>, UtilError> {
    let mut files = Vec::new();
    find_named_recursive(dir, file_name, skip_dir, &mut files)?;
    files.sort();
    Ok(files)
}

fn find_named_recursive(
    dir: &Path,
    file_name: &str,
    skip_dir: &dyn Fn(&Path) -> bool,
    out: &mut Vec<PathBuf>,
) -> Result<(), UtilError> {
    let entries = std::fs::read_dir(dir).map_err(|source| UtilError::io(dir, source))?;

    for entry in entries {
        let entry = entry.map_err(|source| UtilError::io(dir, source))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|source| UtilError::io(&path, source))?;

        if file_type.is_dir() {
            if !skip_dir(&path) {
                find_named_recursive(&path, file_name, skip_dir, out)?;
            }
        } else if entry.file_name().to_str() == Some(file_name) {
            out.push(path);
        }
    }

    Ok(())
}

/// Total size in bytes of all regular files under `dir`. Absent dirs are 0.
///
/// # Errors
/// Returns an error if a directory cannot be read.
pub fn dir_size(dir: &Path) -> Result<u64, UtilError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(source) => return Err(UtilError::io(dir, source)),
    };
    let mut total = 0u64;
    for entry in entries {
        let entry = entry.map_err(|source| UtilError::io(dir, source))?;
        let path = entry.path();
        let meta = entry.metadata().map_err(|source| UtilError::io(&path, source))?;
        if meta.is_dir() {
            total = total.saturating_add(dir_size(&path)?);
        } else {
            total = total.saturating_add(meta.len());
        }
    }
    Ok(total)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn ensure_dir_creates_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b").join("c");
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn write_atomic_creates_parents_and_replaces() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("x").join("f.bin");
        LocalFs.write_atomic(&path, b"one").unwrap();
        LocalFs.write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        // No temp files left behind.
        assert_eq!(fs::read_dir(tmp.path().join("x")).unwrap().count(), 1);
    }

    #[test]
    fn make_dir_clean_empties_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("sandbox");
        fs::create_dir_all(dir.join("stale")).unwrap();
        fs::write(dir.join("stale").join("f"), b"x").unwrap();

        LocalFs.make_dir_clean(&dir).unwrap();
        assert!(dir.is_dir());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[test]
    fn materialize_hardlink() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src.txt");
        let dest = tmp.path().join("dest.txt");
        fs::write(&src, b"data").unwrap();

        materialize(&LocalFs, &src, &dest, true).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"data");
    }

    #[test]
    fn materialize_copy_creates_parent_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src.txt");
        let dest = tmp.path().join("sub").join("dir").join("dest.txt");
        fs::write(&src, b"data").unwrap();

        materialize(&LocalFs, &src, &dest, false).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"data");
    }

    #[test]
    fn materialize_overwrites_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src.txt");
        let dest = tmp.path().join("dest.txt");
        fs::write(&src, b"new").unwrap();
        fs::write(&dest, b"old").unwrap();

        materialize(&LocalFs, &src, &dest, true).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new");
    }

    #[cfg(unix)]
    #[test]
    fn file_mode_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tool.sh");
        fs::write(&path, b"#!/bin/sh\n").unwrap();
        set_file_mode(&path, 0o755).unwrap();
        assert_eq!(file_mode(&path).unwrap(), 0o755);
    }

    #[test]
    fn remove_dir_all_if_exists_absent_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        remove_dir_all_if_exists(&tmp.path().join("nonexistent")).unwrap();
    }

    #[test]
    fn glob_detection() {
        assert!(is_glob("src/*.c"));
        assert!(is_glob("a?.txt"));
        assert!(is_glob("[ab].txt"));
        assert!(!is_glob("src/main.c"));
    }

    #[test]
    fn expand_glob_sorted_relative_files_only() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("src").join("nested.c")).unwrap();
        fs::write(tmp.path().join("src").join("b.c"), b"").unwrap();
        fs::write(tmp.path().join("src").join("a.c"), b"").unwrap();
        fs::write(tmp.path().join("src").join("a.h"), b"").unwrap();

        let files = expand_glob(tmp.path(), "src/*.c").unwrap();
        assert_eq!(
            files,
            vec![PathBuf::from("src/a.c"), PathBuf::from("src/b.c")]
        );
    }

    #[test]
    fn expand_glob_rejects_bad_pattern() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(expand_glob(tmp.path(), "src/[.c").is_err());
    }

    #[test]
    fn find_named_skips_and_sorts() {
        let tmp = tempfile::tempdir().unwrap();
        for dir in ["b", "a", "a/inner", "skipme"] {
            fs::create_dir_all(tmp.path().join(dir)).unwrap();
            fs::write(tmp.path().join(dir).join("BUILD.toml"), b"").unwrap();
        }
        fs::write(tmp.path().join("a").join("other.toml"), b"").unwrap();

        let skip = |p: &Path| p.file_name().is_some_and(|n| n == "skipme");
        let files = find_named(tmp.path(), "BUILD.toml", &skip).unwrap();
        let rel: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(tmp.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            rel,
            vec![
                PathBuf::from("a/BUILD.toml"),
                PathBuf::from("a/inner/BUILD.toml"),
                PathBuf::from("b/BUILD.toml"),
            ]
        );
    }

    #[test]
    fn dir_size_sums_nested_files() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("x")).unwrap();
        fs::write(tmp.path().join("a"), b"12345").unwrap();
        fs::write(tmp.path().join("x").join("b"), b"123").unwrap();
        assert_eq!(dir_size(tmp.path()).unwrap(), 8);
        assert_eq!(dir_size(&tmp.path().join("missing")).unwrap(), 0);
    }
}
