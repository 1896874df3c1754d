//! Input rule keys: deterministic content hashes of everything a target's
//! action can observe.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use dashmap::DashMap;
use rayon::prelude::{IntoParallelRefIterator, ParallelIterator};

use kiln_util::hash::{sha256_file, Digest, Fingerprint};
use kiln_util::RepoPath;

use crate::error::EngineError;
use crate::graph::TargetGraph;
use crate::target::{AttrValue, SourceRef, Target, TargetId};
use crate::tools::ToolResolver;

/// Version tag mixed into every rule key. Bump to invalidate all caches.
pub const RULE_KEY_VERSION: &str = "kiln-rulekey-v1";

/// A 256-bit rule key, rendered as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey(Digest);

impl RuleKey {
    pub fn from_digest(digest: Digest) -> Self {
        Self(digest)
    }

    pub fn digest(&self) -> &Digest {
        &self.0
    }

    /// Return the hex string representation of this key.
    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    /// Two-character shard prefix used by the on-disk layout.
    pub fn shard(&self) -> String {
        self.0.shard()
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RuleKey({})", self.0)
    }
}

impl FromStr for RuleKey {
    type Err = kiln_util::error::UtilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Black,
}

/// Computes and memoizes input rule keys over a target graph.
///
/// Keys are computed bottom-up: a target's key covers the keys of every
/// target it references, so a change anywhere below a target changes it.
pub struct RuleKeyComputer<'g> {
    graph: &'g TargetGraph,
    tools: &'g dyn ToolResolver,
    seed: String,
    memo: DashMap<TargetId, RuleKey>,
    file_digests: DashMap<RepoPath, Digest>,
}

impl<'g> RuleKeyComputer<'g> {
    pub fn new(graph: &'g TargetGraph, tools: &'g dyn ToolResolver, seed: &str) -> Self {
        Self {
            graph,
            tools,
            seed: seed.to_owned(),
            memo: DashMap::new(),
            file_digests: DashMap::new(),
        }
    }

    pub fn graph(&self) -> &'g TargetGraph {
        self.graph
    }

    /// A previously computed key, if any.
    pub fn memoized(&self, id: &TargetId) -> Option<RuleKey> {
        self.memo.get(id).map(|entry| *entry.value())
    }

    /// Compute the input rule key of `id` and of everything it depends on.
    ///
    /// Uses an iterative depth-first traversal with three-color marking, so
    /// deep graphs cannot overflow the stack and cycles are reported with
    /// the offending path.
    ///
    /// # Errors
    /// Returns [`EngineError::GraphCycle`], [`EngineError::MissingInput`],
    /// [`EngineError::ToolUnavailable`], or [`EngineError::UnknownTarget`].
    pub fn input_rule_key(&self, id: &TargetId) -> Result<RuleKey, EngineError> {
        if let Some(key) = self.memoized(id) {
            return Ok(key);
        }

        let root = self.graph.target(id)?;
        let mut color: HashMap<&TargetId, Color> = HashMap::new();
        let mut stack = vec![(root, root.deps().iter())];
        color.insert(&root.id, Color::Gray);

        while let Some((target, deps)) = stack.last_mut() {
            let target: &'g Target = *target;
            match deps.next() {
                Some(dep) => {
                    if self.memo.contains_key(dep) {
                        continue;
                    }
                    match color.get(dep) {
                        Some(Color::Black) => {}
                        Some(Color::Gray) => {
                            let start = stack
                                .iter()
                                .position(|(t, _)| t.id == *dep)
                                .unwrap_or(0);
                            let mut cycle: Vec<String> = stack
                                .get(start..)
                                .unwrap_or_default()
                                .iter()
                                .map(|(t, _)| t.id.to_string())
                                .collect();
                            cycle.push(dep.to_string());
                            return Err(EngineError::GraphCycle {
                                cycle: cycle.join(" -> "),
                            });
                        }
                        None => {
                            let next = self.graph.target(dep)?;
                            color.insert(&next.id, Color::Gray);
                            stack.push((next, next.deps().iter()));
                        }
                    }
                }
                None => {
                    let key = self.compute_node(target)?;
                    tracing::trace!(target = %target.id, key = %key, "computed rule key");
                    self.memo.insert(target.id.clone(), key);
                    color.insert(&target.id, Color::Black);
                    stack.pop();
                }
            }
        }

        self.memoized(id).ok_or_else(|| EngineError::Internal {
            message: format!("rule key for {id} missing after traversal"),
        })
    }

    /// Compute keys for every id in parallel.
    ///
    /// Workers may race to compute a shared dependency; the computation is
    /// idempotent so either result is kept.
    ///
    /// # Errors
    /// Returns the first error encountered by any worker.
    pub fn compute_all(&self, ids: &[TargetId]) -> Result<BTreeMap<TargetId, RuleKey>, EngineError> {
        ids.par_iter()
            .map(|id| Ok((id.clone(), self.input_rule_key(id)?)))
            .collect()
    }

    /// Content digest of a source file, memoized per invocation.
    ///
    /// # Errors
    /// Returns [`EngineError::MissingInput`] if the file does not exist.
    pub fn source_digest(&self, owner: &TargetId, path: &RepoPath) -> Result<Digest, EngineError> {
        if let Some(digest) = self.file_digests.get(path) {
            return Ok(*digest.value());
        }
        let on_disk = path.to_path(self.graph.repo_root());
        if !on_disk.is_file() {
            return Err(EngineError::MissingInput {
                target: owner.to_string(),
                path: path.to_string(),
            });
        }
        let digest = sha256_file(&on_disk)?;
        self.file_digests.insert(path.clone(), digest);
        Ok(digest)
    }

    /// Key over the inputs an action reported actually reading.
    ///
    /// `used_inputs` pairs each sandbox-relative path with its content
    /// digest; order is irrelevant.
    ///
    /// # Errors
    /// Returns [`EngineError::ToolUnavailable`] if a tool cannot be resolved.
    pub fn dependency_file_rule_key(
        &self,
        target: &Target,
        used_inputs: &[(String, Digest)],
    ) -> Result<RuleKey, EngineError> {
        let mut fp = Fingerprint::new();
        fp.put_tagged("rule", target.kind.name());
        fp.put_string("used_inputs");
        fp.put_unordered(used_inputs.iter().map(|(path, digest)| (path.as_str(), *digest)));
        self.put_tools(&mut fp, target)?;
        self.put_version(&mut fp);
        Ok(RuleKey(fp.finish()))
    }

    fn compute_node(&self, target: &Target) -> Result<RuleKey, EngineError> {
        let mut fp = Fingerprint::new();
        fp.put_tagged("rule", target.kind.name());

        for spec in target.kind.schema().iter().filter(|spec| spec.keyed) {
            fp.put_string(spec.name);
            match target.attr(spec.name) {
                None => {
                    fp.put_bool(false);
                }
                Some(value) => {
                    fp.put_bool(true);
                    self.put_value(&mut fp, target, value)?;
                }
            }
        }

        self.put_tools(&mut fp, target)?;
        self.put_version(&mut fp);
        Ok(RuleKey(fp.finish()))
    }

    fn put_value(&self, fp: &mut Fingerprint, target: &Target, value: &AttrValue) -> Result<(), EngineError> {
        match value {
            AttrValue::Str(s) => {
                fp.put_string(s);
            }
            AttrValue::Int(n) => {
                fp.put_i64(*n);
            }
            AttrValue::Bool(b) => {
                fp.put_bool(*b);
            }
            AttrValue::Strings(items) => {
                fp.put_ordered(items.iter());
            }
            AttrValue::Sources(entries) => {
                let digests = entries
                    .iter()
                    .map(|entry| self.source_ref_digest(target, entry))
                    .collect::<Result<Vec<Digest>, EngineError>>()?;
                fp.put_unordered(digests.iter());
            }
            AttrValue::Source(path) => {
                fp.put_path(path);
                fp.put_digest(&self.source_digest(&target.id, path)?);
            }
            AttrValue::Targets(ids) => {
                let digests = ids
                    .iter()
                    .map(|id| self.source_ref_digest(target, &SourceRef::Target(id.clone())))
                    .collect::<Result<Vec<Digest>, EngineError>>()?;
                fp.put_unordered(digests.iter());
            }
            AttrValue::StrMap(map) => {
                fp.put_unordered(map.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            }
            AttrValue::Tools(names) => {
                fp.put_unordered(names.iter());
            }
            AttrValue::Tool(name) => {
                fp.put_string(name);
            }
            AttrValue::Outs(outs) => {
                fp.put_ordered(outs.iter());
            }
            AttrValue::Out(out) => {
                fp.put_path(out);
            }
        }
        Ok(())
    }

    fn source_ref_digest(&self, target: &Target, entry: &SourceRef) -> Result<Digest, EngineError> {
        let mut fp = Fingerprint::new();
        match entry {
            SourceRef::Path(path) => {
                fp.put_tagged("path", path);
                fp.put_digest(&self.source_digest(&target.id, path)?);
            }
            SourceRef::Target(id) => {
                let Some(key) = self.memoized(id) else {
                    return Err(EngineError::Internal {
                        message: format!("{}: dependency {id} has no rule key yet", target.id),
                    });
                };
                fp.put_tagged("target", id.to_string().as_str());
                fp.put_digest(key.digest());
            }
        }
        Ok(fp.finish())
    }

    fn put_tools(&self, fp: &mut Fingerprint, target: &Target) -> Result<(), EngineError> {
        // tool_names() is sorted, so tools are hashed in name order.
        for name in target.tool_names() {
            let tool = self.tools.resolve(&name)?;
            fp.put_tagged("tool", &(name.as_str(), tool.digest));
            fp.put_tagged("tool_version", tool.version.as_deref().unwrap_or(""));
        }
        Ok(())
    }

    fn put_version(&self, fp: &mut Fingerprint) {
        fp.put_string(RULE_KEY_VERSION);
        fp.put_string(&self.seed);
    }
}
