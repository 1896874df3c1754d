//! Target graph loading from `BUILD.toml` files and target selection.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use kiln_config::targets::BUILD_FILE;
use kiln_config::{BuildFile, Config};
use kiln_util::RepoPath;

use crate::error::EngineError;
use crate::target::{Target, TargetId};

/// All targets of a repository, keyed by id.
#[derive(Debug)]
pub struct TargetGraph {
    repo_root: PathBuf,
    cell: String,
    targets: BTreeMap<TargetId, Target>,
}

impl TargetGraph {
    /// Discover every package under `repo_root` and load its targets.
    ///
    /// Directories starting with `.` or `__`, the output directory, and the
    /// cache directory are not searched.
    ///
    /// # Errors
    /// Returns an error if a `BUILD.toml` cannot be parsed, a target is
    /// malformed, two targets share an id, or a dependency does not exist.
    pub fn load(repo_root: &Path, config: &Config) -> Result<Self, EngineError> {
        let output_dir = config.output_dir(repo_root);
        let cache_dir = config.cache_dir(repo_root);
        let skip = |dir: &Path| {
            let hidden = dir
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.') || n.starts_with("__"));
            hidden || dir == output_dir.as_path() || dir == cache_dir.as_path()
        };

        let build_files = kiln_util::fs::find_named(repo_root, BUILD_FILE, &skip)?;
        let mut targets = Vec::new();
        for path in &build_files {
            let dir = path.parent().unwrap_or(repo_root);
            let rel = dir.strip_prefix(repo_root).unwrap_or(Path::new(""));
            let package = RepoPath::new(rel)?;
            let file = BuildFile::from_path(path)?;
            tracing::debug!(package = %package, targets = file.targets.len(), "loaded package");
            for raw in &file.targets {
                targets.push(Target::from_raw(raw, &config.project.cell, &package, repo_root)?);
            }
        }
        Self::from_targets(repo_root, &config.project.cell, targets)
    }

    /// Assemble a graph from already-typed targets.
    ///
    /// # Errors
    /// Returns [`EngineError::DuplicateTarget`] or
    /// [`EngineError::DanglingDependency`].
    pub fn from_targets(
        repo_root: &Path,
        cell: &str,
        targets: Vec<Target>,
    ) -> Result<Self, EngineError> {
        let mut map = BTreeMap::new();
        for target in targets {
            if map.contains_key(&target.id) {
                return Err(EngineError::DuplicateTarget {
                    target: target.id.to_string(),
                });
            }
            map.insert(target.id.clone(), target);
        }
        for target in map.values() {
            if let Some(missing) = target.deps().iter().find(|dep| !map.contains_key(*dep)) {
                return Err(EngineError::DanglingDependency {
                    from: target.id.to_string(),
                    missing: missing.to_string(),
                });
            }
        }
        Ok(Self {
            repo_root: repo_root.to_path_buf(),
            cell: cell.to_owned(),
            targets: map,
        })
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn cell(&self) -> &str {
        &self.cell
    }

    pub fn get(&self, id: &TargetId) -> Option<&Target> {
        self.targets.get(id)
    }

    /// Look up a target that must exist.
    ///
    /// # Errors
    /// Returns [`EngineError::UnknownTarget`] if `id` is not in the graph.
    pub fn target(&self, id: &TargetId) -> Result<&Target, EngineError> {
        self.targets.get(id).ok_or_else(|| EngineError::UnknownTarget {
            target: id.to_string(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.targets.values()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Resolve command-line target patterns.
    ///
    /// - `//...` selects everything; `//pkg/...` a package subtree
    /// - `//pkg:` selects every target of one package
    /// - `//pkg:name` and `:name` (root package) select one target
    ///
    /// No patterns selects every target.
    ///
    /// # Errors
    /// Returns [`EngineError::UnknownTarget`] if a pattern matches nothing,
    /// or [`EngineError::InvalidTargetId`] if it is malformed.
    pub fn select(&self, patterns: &[String]) -> Result<Vec<TargetId>, EngineError> {
        if patterns.is_empty() {
            return Ok(self.targets.keys().cloned().collect());
        }
        let mut selected = BTreeSet::new();
        for pattern in patterns {
            let matched = self.matching(pattern)?;
            if matched.is_empty() {
                return Err(EngineError::UnknownTarget {
                    target: pattern.clone(),
                });
            }
            selected.extend(matched);
        }
        Ok(selected.into_iter().collect())
    }

    fn matching(&self, pattern: &str) -> Result<Vec<TargetId>, EngineError> {
        let body = pattern.split_once("//").map_or(pattern, |(_, rest)| rest);

        if let Some(prefix) = body.strip_suffix("...") {
            let prefix = RepoPath::new(prefix.trim_end_matches('/'))?;
            return Ok(self
                .targets
                .keys()
                .filter(|id| id.package().starts_with(&prefix))
                .cloned()
                .collect());
        }
        if let Some(pkg) = body.strip_suffix(':').filter(|_| pattern.contains("//")) {
            let pkg = RepoPath::new(pkg)?;
            return Ok(self
                .targets
                .keys()
                .filter(|id| *id.package() == pkg)
                .cloned()
                .collect());
        }
        let id = TargetId::resolve(pattern, &self.cell, &RepoPath::root())?;
        Ok(if self.targets.contains_key(&id) {
            vec![id]
        } else {
            Vec::new()
        })
    }

    /// `roots` plus every target they transitively depend on, sorted.
    pub fn closure(&self, roots: &[TargetId]) -> Vec<TargetId> {
        let mut seen: BTreeSet<TargetId> = BTreeSet::new();
        let mut stack: Vec<&TargetId> = roots.iter().collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(target) = self.targets.get(id) {
                stack.extend(target.deps().iter().filter(|dep| !seen.contains(*dep)));
            }
        }
        seen.into_iter().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs;

    use super::*;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn genrule(name: &str, srcs: &str) -> String {
        format!(
            "[[target]]\nname = \"{name}\"\nrule = \"genrule\"\nsrcs = [{srcs}]\nouts = [\"{name}.out\"]\ncmd = \"cat $SRCS > $OUT\"\n\n"
        )
    }

    fn sample_repo() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "BUILD.toml", &genrule("top", "\"//lib:a\""));
        write(
            tmp.path(),
            "lib/BUILD.toml",
            &format!("{}{}", genrule("a", "\":b\""), genrule("b", "\"b.txt\"")),
        );
        write(tmp.path(), "lib/b.txt", "b");
        write(tmp.path(), "tools/gen/BUILD.toml", &genrule("g", ""));
        // Ignored locations.
        write(tmp.path(), "kiln-out/x/BUILD.toml", "not toml");
        write(tmp.path(), ".git/BUILD.toml", "not toml");
        write(tmp.path(), "__scratch/BUILD.toml", "not toml");
        tmp
    }

    #[test]
    fn load_discovers_packages() {
        let tmp = sample_repo();
        let graph = TargetGraph::load(tmp.path(), &Config::default()).unwrap();
        assert_eq!(graph.len(), 4);
        let ids: Vec<String> = graph.iter().map(|t| t.id.to_string()).collect();
        assert_eq!(
            ids,
            vec![
                "root//:top",
                "root//lib:a",
                "root//lib:b",
                "root//tools/gen:g"
            ]
        );
    }

    #[test]
    fn closure_follows_deps() {
        let tmp = sample_repo();
        let graph = TargetGraph::load(tmp.path(), &Config::default()).unwrap();
        let closure = graph.closure(&[TargetId::parse("root//:top").unwrap()]);
        let names: Vec<&str> = closure.iter().map(TargetId::name).collect();
        assert_eq!(names, vec!["top", "a", "b"]);
    }

    #[test]
    fn select_patterns() {
        let tmp = sample_repo();
        let graph = TargetGraph::load(tmp.path(), &Config::default()).unwrap();

        assert_eq!(graph.select(&[]).unwrap().len(), 4);
        assert_eq!(graph.select(&["//...".to_owned()]).unwrap().len(), 4);
        assert_eq!(graph.select(&["//lib/...".to_owned()]).unwrap().len(), 2);
        assert_eq!(graph.select(&["//lib:".to_owned()]).unwrap().len(), 2);
        assert_eq!(graph.select(&["//lib:a".to_owned()]).unwrap().len(), 1);
        assert_eq!(graph.select(&[":top".to_owned()]).unwrap().len(), 1);
        assert_eq!(
            graph
                .select(&["//lib:a".to_owned(), "//lib:a".to_owned()])
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn select_unknown_target_fails() {
        let tmp = sample_repo();
        let graph = TargetGraph::load(tmp.path(), &Config::default()).unwrap();
        let err = graph.select(&["//lib:nope".to_owned()]).unwrap_err();
        assert!(matches!(err, EngineError::UnknownTarget { .. }));
        assert!(graph.select(&["//missing/...".to_owned()]).is_err());
    }

    #[test]
    fn dangling_dependency_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "BUILD.toml", &genrule("top", "\"//lib:gone\""));
        let err = TargetGraph::load(tmp.path(), &Config::default()).unwrap_err();
        assert!(matches!(err, EngineError::DanglingDependency { .. }));
    }

    #[test]
    fn duplicate_target_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "BUILD.toml",
            &format!("{}{}", genrule("x", ""), genrule("x", "")),
        );
        let err = TargetGraph::load(tmp.path(), &Config::default()).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateTarget { .. }));
    }

    #[test]
    fn custom_cell_prefixes_ids() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "BUILD.toml", &genrule("x", ""));
        let mut config = Config::default();
        config.project.cell = "mono".to_owned();
        let graph = TargetGraph::load(tmp.path(), &config).unwrap();
        assert_eq!(graph.iter().next().unwrap().id.to_string(), "mono//:x");
    }
}
