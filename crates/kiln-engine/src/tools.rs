//! Tool resolution: map a tool name to a concrete executable and its identity.
//!
//! Tools are resolved lazily, at most once per invocation, so that every rule
//! key computed during the invocation sees the same tool identity.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use kiln_config::ToolSpec;
use kiln_util::hash::{sha256_file, Digest};

use crate::error::EngineError;

/// The resolved identity of a tool: where it lives and what it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolIdentity {
    pub name: String,
    pub path: PathBuf,
    /// SHA-256 of the executable.
    pub digest: Digest,
    /// Optional pinned version label.
    pub version: Option<String>,
}

/// Resolves tool names to identities.
pub trait ToolResolver: Send + Sync {
    /// Resolve `name`, returning the same identity for every call within
    /// one invocation.
    ///
    /// # Errors
    /// Returns [`EngineError::ToolUnavailable`] if the tool cannot be found
    /// or read.
    fn resolve(&self, name: &str) -> Result<Arc<ToolIdentity>, EngineError>;
}

/// Resolves tools from the `[tools]` table, falling back to a `PATH` search.
#[derive(Debug)]
pub struct ConfigToolResolver {
    repo_root: PathBuf,
    pinned: BTreeMap<String, ToolSpec>,
    search_path: Option<OsString>,
    resolved: DashMap<String, Arc<ToolIdentity>>,
}

impl ConfigToolResolver {
    /// Create a resolver over the pinned tools, searching `search_path`
    /// (usually the host `PATH`) for everything else.
    pub fn new(
        repo_root: &Path,
        pinned: BTreeMap<String, ToolSpec>,
        search_path: Option<OsString>,
    ) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            pinned,
            search_path,
            resolved: DashMap::new(),
        }
    }

    fn locate(&self, name: &str) -> Result<(PathBuf, Option<String>), EngineError> {
        if let Some(spec) = self.pinned.get(name) {
            let path = if spec.path.is_absolute() {
                spec.path.clone()
            } else {
                self.repo_root.join(&spec.path)
            };
            if !path.is_file() {
                return Err(EngineError::ToolUnavailable {
                    tool: name.to_owned(),
                    reason: format!("pinned path {} is not a file", path.display()),
                });
            }
            return Ok((path, spec.version.clone()));
        }

        let found = self.search_path.as_ref().and_then(|paths| {
            std::env::split_paths(paths)
                .map(|dir| dir.join(name))
                .find(|candidate| is_executable(candidate))
        });
        found.map(|path| (path, None)).ok_or_else(|| EngineError::ToolUnavailable {
            tool: name.to_owned(),
            reason: "not pinned in [tools] and not found on PATH".to_owned(),
        })
    }
}

impl ToolResolver for ConfigToolResolver {
    fn resolve(&self, name: &str) -> Result<Arc<ToolIdentity>, EngineError> {
        if let Some(hit) = self.resolved.get(name) {
            return Ok(Arc::clone(hit.value()));
        }

        let (path, version) = self.locate(name)?;
        let digest = sha256_file(&path).map_err(|e| EngineError::ToolUnavailable {
            tool: name.to_owned(),
            reason: e.to_string(),
        })?;
        tracing::debug!(tool = name, path = %path.display(), digest = %digest, "resolved tool");

        let identity = Arc::new(ToolIdentity {
            name: name.to_owned(),
            path,
            digest,
            version,
        });
        // A racing thread may have resolved the same tool; keep the first.
        let entry = self
            .resolved
            .entry(name.to_owned())
            .or_insert(identity);
        Ok(Arc::clone(entry.value()))
    }
}

/// A fixed tool table.
#[derive(Debug, Default)]
pub struct StaticToolResolver {
    tools: BTreeMap<String, Arc<ToolIdentity>>,
}

impl StaticToolResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any earlier entry of the same name.
    pub fn with(mut self, identity: ToolIdentity) -> Self {
        self.tools.insert(identity.name.clone(), Arc::new(identity));
        self
    }
}

impl ToolResolver for StaticToolResolver {
    fn resolve(&self, name: &str) -> Result<Arc<ToolIdentity>, EngineError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::ToolUnavailable {
                tool: name.to_owned(),
                reason: "not registered".to_owned(),
            })
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
