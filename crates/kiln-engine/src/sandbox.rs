//! Per-action scratch directories.
//!
//! A sandbox holds copies of an action's declared inputs and nothing else,
//! so an undeclared read fails instead of silently succeeding. Outputs are
//! written under `__out__/` and picked up from there.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kiln_util::fs::Filesystem;
use kiln_util::hash::{sha256_bytes, sha256_file, Digest};
use kiln_util::process::ProcessRequest;
use kiln_util::RepoPath;

use crate::action::{Action, Artifact, SANDBOX_OUT_DIR, SANDBOX_TMP_DIR};
use crate::error::EngineError;
use crate::store::OutputFile;

/// Directory under the output root holding live sandboxes.
pub const SANDBOX_ROOT: &str = ".sandbox";

/// `HOME` inside a sandbox; does not exist.
const SANDBOX_HOME: &str = "/homeless-shelter";
/// 1980-01-01T00:00:00Z.
const SOURCE_DATE_EPOCH: &str = "315532800";

/// Where sandboxes find their inputs.
#[derive(Debug, Clone)]
pub struct SandboxRoots {
    /// Repository root, for source inputs.
    pub repo_root: PathBuf,
    /// Output root, for generated inputs.
    pub output_root: PathBuf,
    /// Host `PATH`, appended after the action's tool directories.
    pub host_path: Option<String>,
    /// Leave sandboxes on disk after the action finishes.
    pub keep: bool,
}

/// A prepared sandbox. Removed on drop unless `keep` was set.
pub struct Sandbox {
    dir: PathBuf,
    fs: Arc<dyn Filesystem>,
    keep: bool,
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("dir", &self.dir)
            .field("keep", &self.keep)
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Create a clean sandbox for `action` and copy its inputs in.
    ///
    /// # Errors
    /// Returns [`EngineError::MissingInput`] if an input is absent, or an I/O
    /// error if the directory cannot be populated.
    pub fn prepare(action: &Action, roots: &SandboxRoots, fs: Arc<dyn Filesystem>) -> Result<Self, EngineError> {
        let name = sha256_bytes(action.id.to_string().as_bytes()).to_hex();
        let dir = roots
            .output_root
            .join(SANDBOX_ROOT)
            .join(name.get(..16).unwrap_or(&name));
        fs.make_dir_clean(&dir)?;
        let sandbox = Self {
            dir,
            fs,
            keep: roots.keep,
        };

        for input in &action.inputs {
            let from = match input {
                Artifact::Source(path) => path.to_path(&roots.repo_root),
                Artifact::Generated { producer, path } => {
                    path.to_path(&producer.target().output_dir()?.to_path(&roots.output_root))
                }
            };
            if !from.is_file() {
                return Err(EngineError::MissingInput {
                    target: action.id.to_string(),
                    path: from.display().to_string(),
                });
            }
            let to = input.sandbox_path()?.to_path(&sandbox.dir);
            kiln_util::fs::materialize(sandbox.fs.as_ref(), &from, &to, false)?;
        }

        let out_dir = sandbox.dir.join(SANDBOX_OUT_DIR);
        kiln_util::fs::ensure_dir(&out_dir)?;
        for output in &action.outputs {
            if let Some(parent) = output.to_path(&out_dir).parent() {
                kiln_util::fs::ensure_dir(parent)?;
            }
        }
        kiln_util::fs::ensure_dir(&sandbox.dir.join(SANDBOX_TMP_DIR))?;
        tracing::debug!(action = %action.id, dir = %sandbox.dir.display(), inputs = action.inputs.len(), "sandbox ready");
        Ok(sandbox)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The process launch for `action` inside this sandbox.
    ///
    /// The environment is rebuilt from scratch: fixed locale and clock
    /// variables, `PATH` with tool directories first, then the action's own
    /// variables on top.
    pub fn request(&self, action: &Action, roots: &SandboxRoots, timeout: Option<Duration>, kill_grace: Duration) -> ProcessRequest {
        let mut path_entries: Vec<String> = Vec::new();
        for tool in &action.tools {
            if let Some(parent) = tool.path.parent() {
                let entry = parent.display().to_string();
                if !path_entries.contains(&entry) {
                    path_entries.push(entry);
                }
            }
        }
        if let Some(host) = roots.host_path.as_deref().filter(|p| !p.is_empty()) {
            path_entries.push(host.to_owned());
        }

        let mut env = BTreeMap::new();
        env.insert("PATH".to_owned(), path_entries.join(":"));
        env.insert("HOME".to_owned(), SANDBOX_HOME.to_owned());
        env.insert("LANG".to_owned(), "C".to_owned());
        env.insert("LC_ALL".to_owned(), "C".to_owned());
        env.insert("SOURCE_DATE_EPOCH".to_owned(), SOURCE_DATE_EPOCH.to_owned());
        env.insert(
            "TMPDIR".to_owned(),
            self.dir.join(SANDBOX_TMP_DIR).display().to_string(),
        );
        env.extend(action.command.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        ProcessRequest {
            program: action.command.program.clone(),
            args: action.command.argv.clone(),
            env,
            cwd: self.dir.clone(),
            stdin: None,
            timeout,
            kill_grace,
        }
    }

    /// Declared outputs as files to store, or the outputs that are missing.
    ///
    /// A directory where a file was declared counts as missing.
    pub fn collect_outputs(&self, action: &Action) -> Result<Vec<OutputFile>, Vec<RepoPath>> {
        let out_dir = self.dir.join(SANDBOX_OUT_DIR);
        let mut found = Vec::with_capacity(action.outputs.len());
        let mut missing = Vec::new();
        for output in &action.outputs {
            let source = output.to_path(&out_dir);
            if source.is_file() {
                found.push(OutputFile {
                    path: output.clone(),
                    source,
                });
            } else {
                missing.push(output.clone());
            }
        }
        if missing.is_empty() {
            Ok(found)
        } else {
            Err(missing)
        }
    }

    /// Inputs an action reported reading in its Makefile-style depfile,
    /// paired with their content digests.
    ///
    /// Paths that do not name a file in the sandbox are ignored. A missing
    /// depfile yields `None`.
    ///
    /// # Errors
    /// Returns an error if the depfile or a listed input cannot be read.
    pub fn read_depfile(&self, depfile: &RepoPath) -> Result<Option<Vec<(String, Digest)>>, EngineError> {
        let path = depfile.to_path(&self.dir.join(SANDBOX_OUT_DIR));
        if !path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path).map_err(|e| EngineError::io(&path, e))?;
        let mut used = Vec::new();
        for input in parse_depfile(&content) {
            let Ok(rel) = RepoPath::new(&input) else {
                tracing::debug!(depfile = %path.display(), input = %input, "ignoring path outside the sandbox");
                continue;
            };
            let on_disk = rel.to_path(&self.dir);
            if on_disk.is_file() {
                used.push((rel.to_string(), sha256_file(&on_disk)?));
            }
        }
        used.sort();
        used.dedup();
        Ok(Some(used))
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = self.fs.remove_tree(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), error = %e, "cannot remove sandbox");
        }
    }
}

/// Prerequisites listed in a Makefile-style dependency file.
///
/// Every rule's prerequisites are collected; targets (text before the first
/// unescaped `:` of a rule) are dropped. Backslash-newline continues a line.
pub fn parse_depfile(content: &str) -> Vec<String> {
    let joined = content.replace("\\\r\n", " ").replace("\\\n", " ");
    let mut inputs = Vec::new();
    for line in joined.lines() {
        let Some((_, prerequisites)) = line.split_once(": ").or_else(|| line.strip_suffix(':').map(|t| (t, ""))) else {
            continue;
        };
        let mut current = String::new();
        let mut chars = prerequisites.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                }
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        inputs.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            }
        }
        if !current.is_empty() {
            inputs.push(current);
        }
    }
    inputs
}
