//! Repository-relative POSIX paths.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::error::UtilError;

/// A normalized, repository-relative path using `/` separators.
///
/// Normalization removes `.` components and resolves `..` against earlier
/// components. Absolute paths and paths escaping the root are rejected, so two
/// spellings of the same file always produce the same `RepoPath`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RepoPath(String);

impl RepoPath {
    /// The empty path, denoting the repository root.
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Normalize `path` into repository-relative POSIX form.
    ///
    /// # Errors
    /// Returns an error if the path is absolute, escapes the root via `..`,
    /// or is not valid UTF-8.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, UtilError> {
        let path = path.as_ref();
        let invalid = |reason: &str| UtilError::InvalidPath {
            path: path.display().to_string(),
            reason: reason.to_owned(),
        };

        let mut parts: Vec<&str> = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => {
                    let Some(part) = part.to_str() else {
                        return Err(invalid("not valid UTF-8"));
                    };
                    parts.push(part);
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(invalid("escapes the repository root"));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid("must be relative to the repository root"));
                }
            }
        }
        Ok(Self(parts.join("/")))
    }

    /// Return the POSIX string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the repository root.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Join a relative path onto this one, normalizing the result.
    ///
    /// # Errors
    /// Returns an error if the joined path escapes the root.
    pub fn join(&self, rel: impl AsRef<Path>) -> Result<Self, UtilError> {
        Self::new(Path::new(&self.0).join(rel))
    }

    /// Resolve against an on-disk root directory.
    pub fn to_path(&self, root: &Path) -> PathBuf {
        if self.0.is_empty() {
            return root.to_path_buf();
        }
        self.0.split('/').fold(root.to_path_buf(), |acc, part| acc.join(part))
    }

    /// The final component, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.0.rsplit('/').next().filter(|s| !s.is_empty())
    }

    /// Whether `self` equals `prefix` or lies beneath it.
    pub fn starts_with(&self, prefix: &RepoPath) -> bool {
        prefix.is_root()
            || self.0 == prefix.0
            || self
                .0
                .strip_prefix(prefix.0.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_dot_and_parent() {
        let p = RepoPath::new("a/./b/../c.txt").unwrap();
        assert_eq!(p.as_str(), "a/c.txt");
    }

    #[test]
    fn collapses_duplicate_separators() {
        let p = RepoPath::new("a//b///c").unwrap();
        assert_eq!(p.as_str(), "a/b/c");
    }

    #[test]
    fn rejects_absolute() {
        assert!(RepoPath::new("/etc/passwd").is_err());
    }

    #[test]
    fn rejects_escape() {
        assert!(RepoPath::new("a/../../b").is_err());
    }

    #[test]
    fn empty_is_root() {
        let p = RepoPath::new("").unwrap();
        assert!(p.is_root());
        assert_eq!(p, RepoPath::root());
    }

    #[test]
    fn join_and_to_path() {
        let pkg = RepoPath::new("lib/core").unwrap();
        let file = pkg.join("src/a.c").unwrap();
        assert_eq!(file.as_str(), "lib/core/src/a.c");
        assert_eq!(
            file.to_path(Path::new("/repo")),
            PathBuf::from("/repo/lib/core/src/a.c")
        );
    }

    #[test]
    fn file_name_of_nested_path() {
        let p = RepoPath::new("a/b/c.txt").unwrap();
        assert_eq!(p.file_name(), Some("c.txt"));
        assert_eq!(RepoPath::root().file_name(), None);
    }

    #[test]
    fn starts_with_respects_component_boundaries() {
        let p = RepoPath::new("lib/core/a.c").unwrap();
        assert!(p.starts_with(&RepoPath::new("lib").unwrap()));
        assert!(p.starts_with(&RepoPath::new("lib/core").unwrap()));
        assert!(!p.starts_with(&RepoPath::new("li").unwrap()));
        assert!(p.starts_with(&RepoPath::root()));
    }
}
