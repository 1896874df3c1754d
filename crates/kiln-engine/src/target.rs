//! Target identifiers, rule kinds with their attribute schemas, and typed targets.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use kiln_config::RawTarget;
use kiln_util::RepoPath;

use crate::error::EngineError;

/// Unique identifier of a target: `cell//package:name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId {
    cell: String,
    package: RepoPath,
    name: String,
}

impl TargetId {
    /// Build an id from its parts.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidTargetId`] if the cell or name is malformed.
    pub fn new(cell: &str, package: RepoPath, name: &str) -> Result<Self, EngineError> {
        let rendered = format!("{cell}//{package}:{name}");
        if !is_valid_cell(cell) {
            return Err(EngineError::InvalidTargetId {
                value: rendered,
                reason: "cell must be non-empty and use only [A-Za-z0-9_-]".to_owned(),
            });
        }
        if name.is_empty() || name.contains(['/', ':']) {
            return Err(EngineError::InvalidTargetId {
                value: rendered,
                reason: "name must be non-empty and contain no `/` or `:`".to_owned(),
            });
        }
        Ok(Self {
            cell: cell.to_owned(),
            package,
            name: name.to_owned(),
        })
    }

    /// Parse a fully qualified id such as `root//lib/core:gen`.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidTargetId`] if the text is not a full id.
    pub fn parse(value: &str) -> Result<Self, EngineError> {
        let Some((cell, _)) = value.split_once("//") else {
            return Err(EngineError::InvalidTargetId {
                value: value.to_owned(),
                reason: "expected `cell//package:name`".to_owned(),
            });
        };
        Self::resolve(value, cell, &RepoPath::root())
    }

    /// Resolve a reference written inside `package` of `cell`.
    ///
    /// Accepted forms: `:name` (same package), `//pkg:name` (same cell),
    /// `cell//pkg:name`, and `//pkg` as shorthand for `//pkg:<last component>`.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidTargetId`] if the reference is malformed.
    pub fn resolve(reference: &str, cell: &str, package: &RepoPath) -> Result<Self, EngineError> {
        let invalid = |reason: &str| EngineError::InvalidTargetId {
            value: reference.to_owned(),
            reason: reason.to_owned(),
        };

        if let Some(name) = reference.strip_prefix(':') {
            return Self::new(cell, package.clone(), name);
        }
        let Some((ref_cell, rest)) = reference.split_once("//") else {
            return Err(invalid("target references start with `:` or `//`"));
        };
        let ref_cell = if ref_cell.is_empty() { cell } else { ref_cell };
        let (pkg, name) = match rest.split_once(':') {
            Some((pkg, name)) => (pkg, name.to_owned()),
            None => {
                let Some(last) = rest.rsplit('/').next().filter(|s| !s.is_empty()) else {
                    return Err(invalid("missing target name"));
                };
                (rest, last.to_owned())
            }
        };
        if pkg.starts_with('/') {
            return Err(invalid("package must not start with `/`"));
        }
        let package = RepoPath::new(pkg).map_err(|e| invalid(&e.to_string()))?;
        if package.as_str() != pkg.trim_end_matches('/') {
            return Err(invalid("package path must be normalized"));
        }
        Self::new(ref_cell, package, &name)
    }

    pub fn cell(&self) -> &str {
        &self.cell
    }

    pub fn package(&self) -> &RepoPath {
        &self.package
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory, relative to the output root, that receives this target's outputs.
    ///
    /// # Errors
    /// Returns an error if the joined path cannot be normalized.
    pub fn output_dir(&self) -> Result<RepoPath, EngineError> {
        Ok(self.package.join(&self.name)?)
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}//{}:{}", self.cell, self.package, self.name)
    }
}

/// Whether a source entry refers to another target rather than a file.
pub fn is_target_ref(entry: &str) -> bool {
    entry.starts_with(':')
        || entry
            .split_once("//")
            .is_some_and(|(cell, _)| cell.is_empty() || is_valid_cell(cell))
}

fn is_valid_cell(cell: &str) -> bool {
    !cell.is_empty()
        && cell
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// The built-in rule kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuleKind {
    /// Run a shell command with `$SRCS`, `$OUT`, `$OUTS` and `$OUT_DIR` set.
    Genrule,
    /// Run a named tool with an argument list.
    Command,
    /// Copy one source file into the output tree.
    ExportFile,
}

/// Value type of a schema attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    Str,
    Int,
    Bool,
    /// Ordered list of strings.
    Strings,
    /// Unordered list of source paths, globs, or target references.
    Sources,
    /// A single package-relative source path.
    Source,
    /// Unordered list of target references.
    Targets,
    /// String-to-string map.
    StrMap,
    /// Unordered list of tool names.
    Tools,
    /// A single tool name.
    Tool,
    /// Ordered list of output paths.
    Outs,
    /// A single output path.
    Out,
}

/// One attribute in a rule kind's schema.
#[derive(Debug, Clone, Copy)]
pub struct AttrSpec {
    pub name: &'static str,
    pub ty: AttrType,
    pub required: bool,
    /// Whether the attribute contributes to the rule key.
    pub keyed: bool,
}

const fn attr(name: &'static str, ty: AttrType, required: bool, keyed: bool) -> AttrSpec {
    AttrSpec {
        name,
        ty,
        required,
        keyed,
    }
}

const GENRULE_SCHEMA: &[AttrSpec] = &[
    attr("srcs", AttrType::Sources, false, true),
    attr("outs", AttrType::Outs, true, true),
    attr("cmd", AttrType::Str, true, true),
    attr("env", AttrType::StrMap, false, true),
    attr("tools", AttrType::Tools, false, true),
    attr("depfile", AttrType::Out, false, true),
    attr("deps", AttrType::Targets, false, true),
    attr("timeout_ms", AttrType::Int, false, false),
    attr("cacheable", AttrType::Bool, false, false),
];

const COMMAND_SCHEMA: &[AttrSpec] = &[
    attr("tool", AttrType::Tool, true, true),
    attr("args", AttrType::Strings, false, true),
    attr("srcs", AttrType::Sources, false, true),
    attr("outs", AttrType::Outs, true, true),
    attr("env", AttrType::StrMap, false, true),
    attr("deps", AttrType::Targets, false, true),
    attr("timeout_ms", AttrType::Int, false, false),
    attr("cacheable", AttrType::Bool, false, false),
];

const EXPORT_FILE_SCHEMA: &[AttrSpec] = &[
    attr("src", AttrType::Source, true, true),
    attr("out", AttrType::Out, false, true),
    attr("deps", AttrType::Targets, false, true),
    attr("cacheable", AttrType::Bool, false, false),
];

/// Environment names the engine sets itself.
const RESERVED_ENV: &[&str] = &["SRCS", "OUT", "OUTS", "OUT_DIR", "PATH", "HOME", "TMPDIR"];

impl RuleKind {
    /// The name used in `BUILD.toml`.
    pub fn name(self) -> &'static str {
        match self {
            Self::Genrule => "genrule",
            Self::Command => "command",
            Self::ExportFile => "export_file",
        }
    }

    /// Look up a rule kind by its `BUILD.toml` name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "genrule" => Some(Self::Genrule),
            "command" => Some(Self::Command),
            "export_file" => Some(Self::ExportFile),
            _ => None,
        }
    }

    /// Attributes in schema order. Rule keys hash attributes in this order.
    pub fn schema(self) -> &'static [AttrSpec] {
        match self {
            Self::Genrule => GENRULE_SCHEMA,
            Self::Command => COMMAND_SCHEMA,
            Self::ExportFile => EXPORT_FILE_SCHEMA,
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A source entry after reference resolution and glob expansion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceRef {
    /// A repository-relative file.
    Path(RepoPath),
    /// Every output of another target.
    Target(TargetId),
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Strings(Vec<String>),
    Sources(Vec<SourceRef>),
    Source(RepoPath),
    Targets(Vec<TargetId>),
    StrMap(BTreeMap<String, String>),
    Tools(Vec<String>),
    Tool(String),
    Outs(Vec<RepoPath>),
    Out(RepoPath),
}

/// A declarative build target. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: TargetId,
    pub kind: RuleKind,
    attrs: BTreeMap<String, AttrValue>,
    deps: BTreeSet<TargetId>,
}

impl Target {
    /// Type-check a raw `[[target]]` table declared in `package`.
    ///
    /// Globs in `srcs` are expanded against the package directory under
    /// `repo_root`.
    ///
    /// # Errors
    /// Returns an input error for unknown rules, unknown or missing
    /// attributes, and values of the wrong type.
    pub fn from_raw(
        raw: &RawTarget,
        cell: &str,
        package: &RepoPath,
        repo_root: &Path,
    ) -> Result<Self, EngineError> {
        let id = TargetId::new(cell, package.clone(), &raw.name)?;
        let Some(kind) = RuleKind::from_name(&raw.rule) else {
            return Err(EngineError::UnknownRule {
                target: id.to_string(),
                rule: raw.rule.clone(),
            });
        };

        let schema = kind.schema();
        for name in raw.attrs.keys() {
            if !schema.iter().any(|spec| spec.name == name) {
                return Err(EngineError::MalformedAttribute {
                    target: id.to_string(),
                    attr: name.clone(),
                    message: format!("is not an attribute of `{}`", kind.name()),
                });
            }
        }

        let ctx = AttrContext {
            id: &id,
            cell,
            package,
            package_dir: package.to_path(repo_root),
        };
        let mut attrs = BTreeMap::new();
        for spec in schema {
            match raw.attrs.get(spec.name) {
                Some(value) => {
                    attrs.insert(spec.name.to_owned(), ctx.convert(spec, value)?);
                }
                None if spec.required => {
                    return Err(EngineError::MalformedAttribute {
                        target: id.to_string(),
                        attr: spec.name.to_owned(),
                        message: "is required".to_owned(),
                    });
                }
                None => {}
            }
        }

        if kind == RuleKind::ExportFile && !attrs.contains_key("out") {
            let Some(AttrValue::Source(src)) = attrs.get("src") else {
                return Err(EngineError::Internal {
                    message: format!("{id}: export_file without src survived validation"),
                });
            };
            let Some(file_name) = src.file_name() else {
                return Err(EngineError::MalformedAttribute {
                    target: id.to_string(),
                    attr: "src".to_owned(),
                    message: "must name a file".to_owned(),
                });
            };
            attrs.insert("out".to_owned(), AttrValue::Out(RepoPath::new(file_name)?));
        }

        let mut deps = BTreeSet::new();
        for value in attrs.values() {
            match value {
                AttrValue::Sources(entries) => {
                    deps.extend(entries.iter().filter_map(|entry| match entry {
                        SourceRef::Target(dep) => Some(dep.clone()),
                        SourceRef::Path(_) => None,
                    }));
                }
                AttrValue::Targets(targets) => deps.extend(targets.iter().cloned()),
                _ => {}
            }
        }
        if deps.contains(&id) {
            return Err(EngineError::GraphCycle {
                cycle: format!("{id} -> {id}"),
            });
        }

        Ok(Self {
            id,
            kind,
            attrs,
            deps,
        })
    }

    /// Look up an attribute that was set (or defaulted).
    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    /// Every target this one references, from `srcs`, `src` and `deps`.
    pub fn deps(&self) -> &BTreeSet<TargetId> {
        &self.deps
    }

    /// Declared outputs relative to the target's output directory.
    pub fn outputs(&self) -> Vec<RepoPath> {
        match (self.attr("outs"), self.attr("out")) {
            (Some(AttrValue::Outs(outs)), _) => outs.clone(),
            (_, Some(AttrValue::Out(out))) => vec![out.clone()],
            _ => Vec::new(),
        }
    }

    /// Source entries in declaration order.
    pub fn sources(&self) -> Vec<SourceRef> {
        match (self.attr("srcs"), self.attr("src")) {
            (Some(AttrValue::Sources(entries)), _) => entries.clone(),
            (_, Some(AttrValue::Source(path))) => vec![SourceRef::Path(path.clone())],
            _ => Vec::new(),
        }
    }

    /// Declared environment variables.
    pub fn env(&self) -> BTreeMap<String, String> {
        match self.attr("env") {
            Some(AttrValue::StrMap(map)) => map.clone(),
            _ => BTreeMap::new(),
        }
    }

    /// Tools this target invokes, sorted and deduplicated.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        match self.kind {
            RuleKind::Genrule => {
                names.insert("sh".to_owned());
            }
            RuleKind::ExportFile => {
                names.insert("cp".to_owned());
            }
            RuleKind::Command => {}
        }
        if let Some(AttrValue::Tool(tool)) = self.attr("tool") {
            names.insert(tool.clone());
        }
        if let Some(AttrValue::Tools(tools)) = self.attr("tools") {
            names.extend(tools.iter().cloned());
        }
        names.into_iter().collect()
    }

    /// Per-target timeout, if declared.
    pub fn timeout(&self) -> Option<Duration> {
        match self.attr("timeout_ms") {
            Some(AttrValue::Int(ms)) => u64::try_from(*ms).ok().map(Duration::from_millis),
            _ => None,
        }
    }

    /// Whether outputs may be stored in and served from the cache.
    pub fn cacheable(&self) -> bool {
        !matches!(self.attr("cacheable"), Some(AttrValue::Bool(false)))
    }

    /// Depfile path relative to the output directory, if declared.
    pub fn depfile(&self) -> Option<RepoPath> {
        match self.attr("depfile") {
            Some(AttrValue::Out(path)) => Some(path.clone()),
            _ => None,
        }
    }
}

struct AttrContext<'a> {
    id: &'a TargetId,
    cell: &'a str,
    package: &'a RepoPath,
    package_dir: std::path::PathBuf,
}

impl AttrContext<'_> {
    fn malformed(&self, spec: &AttrSpec, message: impl Into<String>) -> EngineError {
        EngineError::MalformedAttribute {
            target: self.id.to_string(),
            attr: spec.name.to_owned(),
            message: message.into(),
        }
    }

    fn convert(&self, spec: &AttrSpec, value: &toml::Value) -> Result<AttrValue, EngineError> {
        match spec.ty {
            AttrType::Str => Ok(AttrValue::Str(self.string(spec, value)?.to_owned())),
            AttrType::Int => {
                let Some(n) = value.as_integer() else {
                    return Err(self.malformed(spec, "must be an integer"));
                };
                if n <= 0 {
                    return Err(self.malformed(spec, "must be positive"));
                }
                Ok(AttrValue::Int(n))
            }
            AttrType::Bool => value
                .as_bool()
                .map(AttrValue::Bool)
                .ok_or_else(|| self.malformed(spec, "must be a boolean")),
            AttrType::Strings => Ok(AttrValue::Strings(
                self.strings(spec, value)?.into_iter().map(str::to_owned).collect(),
            )),
            AttrType::Sources => {
                let mut entries: Vec<SourceRef> = Vec::new();
                for entry in self.strings(spec, value)? {
                    for resolved in self.source_entry(spec, entry)? {
                        if !entries.contains(&resolved) {
                            entries.push(resolved);
                        }
                    }
                }
                Ok(AttrValue::Sources(entries))
            }
            AttrType::Source => {
                let entry = self.string(spec, value)?;
                if is_target_ref(entry) {
                    return Err(self.malformed(spec, "must be a source path, not a target reference"));
                }
                Ok(AttrValue::Source(self.package_path(spec, entry)?))
            }
            AttrType::Targets => {
                let mut targets = Vec::new();
                for entry in self.strings(spec, value)? {
                    let id = TargetId::resolve(entry, self.cell, self.package)?;
                    if !targets.contains(&id) {
                        targets.push(id);
                    }
                }
                Ok(AttrValue::Targets(targets))
            }
            AttrType::StrMap => {
                let Some(table) = value.as_table() else {
                    return Err(self.malformed(spec, "must be a table of strings"));
                };
                let mut map = BTreeMap::new();
                for (key, val) in table {
                    if !is_env_name(key) {
                        return Err(self.malformed(spec, format!("key `{key}` is not a valid variable name")));
                    }
                    if RESERVED_ENV.contains(&key.as_str()) {
                        return Err(self.malformed(spec, format!("key `{key}` is set by kiln and cannot be overridden")));
                    }
                    let Some(val) = val.as_str() else {
                        return Err(self.malformed(spec, format!("value of `{key}` must be a string")));
                    };
                    map.insert(key.clone(), val.to_owned());
                }
                Ok(AttrValue::StrMap(map))
            }
            AttrType::Tools => {
                let mut tools: Vec<String> = Vec::new();
                for name in self.strings(spec, value)? {
                    let name = self.tool_name(spec, name)?;
                    if !tools.contains(&name) {
                        tools.push(name);
                    }
                }
                Ok(AttrValue::Tools(tools))
            }
            AttrType::Tool => Ok(AttrValue::Tool(self.tool_name(spec, self.string(spec, value)?)?)),
            AttrType::Outs => {
                let names = self.strings(spec, value)?;
                if names.is_empty() {
                    return Err(self.malformed(spec, "must declare at least one output"));
                }
                let mut outs: Vec<RepoPath> = Vec::new();
                for name in names {
                    let out = self.output_path(spec, name)?;
                    if outs.contains(&out) {
                        return Err(self.malformed(spec, format!("declares `{out}` twice")));
                    }
                    outs.push(out);
                }
                Ok(AttrValue::Outs(outs))
            }
            AttrType::Out => Ok(AttrValue::Out(self.output_path(spec, self.string(spec, value)?)?)),
        }
    }

    fn string<'v>(&self, spec: &AttrSpec, value: &'v toml::Value) -> Result<&'v str, EngineError> {
        value
            .as_str()
            .ok_or_else(|| self.malformed(spec, "must be a string"))
    }

    fn strings<'v>(&self, spec: &AttrSpec, value: &'v toml::Value) -> Result<Vec<&'v str>, EngineError> {
        let Some(items) = value.as_array() else {
            return Err(self.malformed(spec, "must be a list of strings"));
        };
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .ok_or_else(|| self.malformed(spec, "must be a list of strings"))
            })
            .collect()
    }

    fn source_entry(&self, spec: &AttrSpec, entry: &str) -> Result<Vec<SourceRef>, EngineError> {
        if is_target_ref(entry) {
            return Ok(vec![SourceRef::Target(TargetId::resolve(
                entry,
                self.cell,
                self.package,
            )?)]);
        }
        if kiln_util::fs::is_glob(entry) {
            let matches = kiln_util::fs::expand_glob(&self.package_dir, entry)?;
            return matches
                .iter()
                .map(|rel| -> Result<SourceRef, EngineError> {
                    Ok(SourceRef::Path(self.package_path(spec, &rel.to_string_lossy())?))
                })
                .collect();
        }
        Ok(vec![SourceRef::Path(self.package_path(spec, entry)?)])
    }

    fn package_path(&self, spec: &AttrSpec, entry: &str) -> Result<RepoPath, EngineError> {
        if entry.is_empty() || Path::new(entry).is_absolute() {
            return Err(self.malformed(spec, format!("path `{entry}` must be relative to the package")));
        }
        let path = self
            .package
            .join(entry)
            .map_err(|e| self.malformed(spec, e.to_string()))?;
        if path.is_root() {
            return Err(self.malformed(spec, format!("path `{entry}` does not name a file")));
        }
        Ok(path)
    }

    fn output_path(&self, spec: &AttrSpec, name: &str) -> Result<RepoPath, EngineError> {
        if name.is_empty() || Path::new(name).is_absolute() {
            return Err(self.malformed(spec, format!("output `{name}` must be a relative path")));
        }
        let out = RepoPath::new(name).map_err(|e| self.malformed(spec, e.to_string()))?;
        if out.is_root() {
            return Err(self.malformed(spec, format!("output `{name}` does not name a file")));
        }
        Ok(out)
    }

    fn tool_name(&self, spec: &AttrSpec, name: &str) -> Result<String, EngineError> {
        if name.is_empty() || name.contains(['/', ' ']) {
            return Err(self.malformed(spec, format!("`{name}` is not a tool name")));
        }
        Ok(name.to_owned())
    }
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use kiln_config::BuildFile;

    fn raw(text: &str) -> RawTarget {
        BuildFile::parse(text, Path::new("BUILD.toml"))
            .unwrap()
            .targets
            .into_iter()
            .next()
            .unwrap()
    }

    fn load(text: &str) -> Result<Target, EngineError> {
        let tmp = tempfile::tempdir().unwrap();
        Target::from_raw(&raw(text), "root", &RepoPath::new("pkg").unwrap(), tmp.path())
    }

    #[test]
    fn target_id_display_and_parse() {
        let id = TargetId::parse("root//lib/core:gen").unwrap();
        assert_eq!(id.cell(), "root");
        assert_eq!(id.package().as_str(), "lib/core");
        assert_eq!(id.name(), "gen");
        assert_eq!(id.to_string(), "root//lib/core:gen");
    }

    #[test]
    fn resolve_relative_forms() {
        let pkg = RepoPath::new("app").unwrap();
        assert_eq!(
            TargetId::resolve(":lib", "root", &pkg).unwrap().to_string(),
            "root//app:lib"
        );
        assert_eq!(
            TargetId::resolve("//lib/core:x", "root", &pkg).unwrap().to_string(),
            "root//lib/core:x"
        );
        assert_eq!(
            TargetId::resolve("//lib/core", "root", &pkg).unwrap().to_string(),
            "root//lib/core:core"
        );
        assert_eq!(
            TargetId::resolve("other//a:b", "root", &pkg).unwrap().to_string(),
            "other//a:b"
        );
    }

    #[test]
    fn resolve_rejects_malformed() {
        let pkg = RepoPath::root();
        assert!(TargetId::resolve("lib:x", "root", &pkg).is_err());
        assert!(TargetId::resolve("//", "root", &pkg).is_err());
        assert!(TargetId::resolve(":", "root", &pkg).is_err());
        assert!(TargetId::resolve("//a/../b:x", "root", &pkg).is_err());
        assert!(TargetId::parse(":x").is_err());
    }

    #[test]
    fn target_ref_detection() {
        assert!(is_target_ref(":gen"));
        assert!(is_target_ref("//lib:gen"));
        assert!(is_target_ref("root//lib:gen"));
        assert!(!is_target_ref("src/main.c"));
        assert!(!is_target_ref("*.c"));
    }

    #[test]
    fn genrule_attributes_are_typed() {
        let target = load(
            r#"
[[target]]
name = "gen"
rule = "genrule"
srcs = ["a.txt", ":other", "//lib:x", "a.txt"]
outs = ["out/b.txt", "c.txt"]
cmd = "cat $SRCS > $OUT"
env = { MODE = "fast" }
tools = ["python3"]
timeout_ms = 500
cacheable = false
"#,
        )
        .unwrap();
        assert_eq!(target.kind, RuleKind::Genrule);
        assert_eq!(target.id.to_string(), "root//pkg:gen");
        assert_eq!(
            target.sources(),
            vec![
                SourceRef::Path(RepoPath::new("pkg/a.txt").unwrap()),
                SourceRef::Target(TargetId::parse("root//pkg:other").unwrap()),
                SourceRef::Target(TargetId::parse("root//lib:x").unwrap()),
            ]
        );
        assert_eq!(
            target.outputs(),
            vec![RepoPath::new("out/b.txt").unwrap(), RepoPath::new("c.txt").unwrap()]
        );
        assert_eq!(target.deps().len(), 2);
        assert_eq!(target.env().get("MODE").map(String::as_str), Some("fast"));
        assert_eq!(target.tool_names(), vec!["python3".to_owned(), "sh".to_owned()]);
        assert_eq!(target.timeout(), Some(Duration::from_millis(500)));
        assert!(!target.cacheable());
    }

    #[test]
    fn export_file_defaults_out_to_file_name() {
        let target = load(
            "[[target]]\nname = \"cfg\"\nrule = \"export_file\"\nsrc = \"conf/app.ini\"\n",
        )
        .unwrap();
        assert_eq!(target.outputs(), vec![RepoPath::new("app.ini").unwrap()]);
        assert_eq!(target.tool_names(), vec!["cp".to_owned()]);
        assert!(target.cacheable());
    }

    #[test]
    fn command_requires_tool() {
        let err = load("[[target]]\nname = \"c\"\nrule = \"command\"\nouts = [\"o\"]\n").unwrap_err();
        assert!(matches!(err, EngineError::MalformedAttribute { ref attr, .. } if attr == "tool"));
    }

    #[test]
    fn unknown_rule_is_rejected() {
        let err = load("[[target]]\nname = \"x\"\nrule = \"cc_binary\"\n").unwrap_err();
        assert!(matches!(err, EngineError::UnknownRule { .. }));
    }

    #[test]
    fn unknown_attribute_is_rejected() {
        let err = load(
            "[[target]]\nname = \"x\"\nrule = \"genrule\"\nouts = [\"o\"]\ncmd = \"true\"\ncompiler = \"gcc\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("compiler"));
    }

    #[test]
    fn wrong_types_are_rejected() {
        assert!(load("[[target]]\nname = \"x\"\nrule = \"genrule\"\nouts = \"o\"\ncmd = \"true\"\n").is_err());
        assert!(load("[[target]]\nname = \"x\"\nrule = \"genrule\"\nouts = [\"o\"]\ncmd = 3\n").is_err());
        assert!(load("[[target]]\nname = \"x\"\nrule = \"genrule\"\nouts = [\"o\"]\ncmd = \"true\"\ntimeout_ms = 0\n").is_err());
    }

    #[test]
    fn outputs_must_stay_inside_output_dir() {
        assert!(load("[[target]]\nname = \"x\"\nrule = \"genrule\"\nouts = [\"../o\"]\ncmd = \"true\"\n").is_err());
        assert!(load("[[target]]\nname = \"x\"\nrule = \"genrule\"\nouts = [\"/o\"]\ncmd = \"true\"\n").is_err());
        assert!(load("[[target]]\nname = \"x\"\nrule = \"genrule\"\nouts = []\ncmd = \"true\"\n").is_err());
        assert!(load("[[target]]\nname = \"x\"\nrule = \"genrule\"\nouts = [\"o\", \"./o\"]\ncmd = \"true\"\n").is_err());
    }

    #[test]
    fn reserved_env_names_are_rejected() {
        let err = load(
            "[[target]]\nname = \"x\"\nrule = \"genrule\"\nouts = [\"o\"]\ncmd = \"true\"\nenv = { OUT = \"x\" }\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("OUT"));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = load("[[target]]\nname = \"x\"\nrule = \"genrule\"\nsrcs = [\":x\"]\nouts = [\"o\"]\ncmd = \"true\"\n")
            .unwrap_err();
        assert!(matches!(err, EngineError::GraphCycle { .. }));
    }

    #[test]
    fn globs_expand_against_package_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let pkg_dir = tmp.path().join("pkg");
        std::fs::create_dir_all(pkg_dir.join("src")).unwrap();
        std::fs::write(pkg_dir.join("src").join("b.c"), "").unwrap();
        std::fs::write(pkg_dir.join("src").join("a.c"), "").unwrap();
        std::fs::write(pkg_dir.join("src").join("a.h"), "").unwrap();

        let target = Target::from_raw(
            &raw("[[target]]\nname = \"x\"\nrule = \"genrule\"\nsrcs = [\"src/*.c\"]\nouts = [\"o\"]\ncmd = \"true\"\n"),
            "root",
            &RepoPath::new("pkg").unwrap(),
            tmp.path(),
        )
        .unwrap();
        assert_eq!(
            target.sources(),
            vec![
                SourceRef::Path(RepoPath::new("pkg/src/a.c").unwrap()),
                SourceRef::Path(RepoPath::new("pkg/src/b.c").unwrap()),
            ]
        );
    }
}
