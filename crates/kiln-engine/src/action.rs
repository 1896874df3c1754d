//! Actions: the deterministic unit of work a target projects to.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kiln_util::RepoPath;

use crate::error::EngineError;
use crate::graph::TargetGraph;
use crate::target::{AttrValue, RuleKind, SourceRef, Target, TargetId};
use crate::tools::{ToolIdentity, ToolResolver};

/// Sandbox directory that receives an action's own outputs.
pub const SANDBOX_OUT_DIR: &str = "__out__";
/// Sandbox directory holding the outputs of other actions.
pub const SANDBOX_GEN_DIR: &str = "__gen__";
/// Sandbox directory used as `TMPDIR`.
pub const SANDBOX_TMP_DIR: &str = "__tmp__";

/// Identifies an action. Every target projects to exactly one action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(TargetId);

impl ActionId {
    pub fn new(target: TargetId) -> Self {
        Self(target)
    }

    pub fn target(&self) -> &TargetId {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A logical file reference consumed by an action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Artifact {
    /// A repository-relative source file.
    Source(RepoPath),
    /// A declared output of another action, relative to that action's
    /// output directory.
    Generated { producer: ActionId, path: RepoPath },
}

impl Artifact {
    /// Where the artifact is placed inside a sandbox.
    ///
    /// # Errors
    /// Returns an error if the producer's output directory cannot be joined.
    pub fn sandbox_path(&self) -> Result<RepoPath, EngineError> {
        match self {
            Self::Source(path) => Ok(path.clone()),
            Self::Generated { producer, path } => {
                let dir = producer.target().output_dir()?;
                Ok(RepoPath::new(SANDBOX_GEN_DIR)?.join(dir.as_str())?.join(path.as_str())?)
            }
        }
    }
}

/// What to run: a tool, its arguments and the declared environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Tool name as written in the target.
    pub tool: String,
    /// Resolved executable.
    pub program: PathBuf,
    /// Arguments, not including the program.
    pub argv: Vec<String>,
    /// Environment set on top of the sandbox base environment.
    pub env: BTreeMap<String, String>,
}

/// A unit of deterministic work. Immutable once projected.
#[derive(Debug, Clone)]
pub struct Action {
    pub id: ActionId,
    pub kind: RuleKind,
    /// Every artifact the action may read, sorted and deduplicated.
    pub inputs: Vec<Artifact>,
    /// Declared outputs, relative to the action's output directory.
    pub outputs: Vec<RepoPath>,
    pub command: CommandSpec,
    pub timeout: Option<Duration>,
    pub cacheable: bool,
    /// Makefile-style dependency file written next to the outputs.
    pub depfile: Option<RepoPath>,
    /// Every tool the action invokes, sorted by name.
    pub tools: Vec<Arc<ToolIdentity>>,
}

impl Action {
    /// Project `target` into its action.
    ///
    /// # Errors
    /// Returns an error if a referenced target is missing, a tool cannot be
    /// resolved, or a path cannot be formed.
    pub fn from_target(
        target: &Target,
        graph: &TargetGraph,
        tools: &dyn ToolResolver,
    ) -> Result<Self, EngineError> {
        let mut srcs: Vec<RepoPath> = Vec::new();
        let mut inputs: Vec<Artifact> = Vec::new();
        for entry in target.sources() {
            for artifact in artifacts_of(&entry, graph)? {
                srcs.push(artifact.sandbox_path()?);
                inputs.push(artifact);
            }
        }
        if let Some(AttrValue::Targets(deps)) = target.attr("deps") {
            for dep in deps {
                inputs.extend(artifacts_of(&SourceRef::Target(dep.clone()), graph)?);
            }
        }
        srcs.sort();
        srcs.dedup();
        inputs.sort();
        inputs.dedup();

        let outputs = target.outputs();
        let resolved = target
            .tool_names()
            .iter()
            .map(|name| tools.resolve(name))
            .collect::<Result<Vec<_>, EngineError>>()?;

        let projection = Projection {
            target,
            srcs: &srcs,
            outputs: &outputs,
        };
        let (tool, argv, env) = match target.kind {
            RuleKind::Genrule => projection.genrule()?,
            RuleKind::Command => projection.command()?,
            RuleKind::ExportFile => projection.export_file()?,
        };
        let Some(program) = resolved.iter().find(|t| t.name == tool).map(|t| t.path.clone()) else {
            return Err(EngineError::Internal {
                message: format!("{}: tool `{tool}` was not resolved", target.id),
            });
        };

        Ok(Self {
            id: ActionId::new(target.id.clone()),
            kind: target.kind,
            inputs,
            outputs,
            command: CommandSpec {
                tool,
                program,
                argv,
                env,
            },
            timeout: target.timeout(),
            cacheable: target.cacheable(),
            depfile: target.depfile(),
            tools: resolved,
        })
    }

    /// Directory, relative to the output root, holding this action's outputs.
    ///
    /// # Errors
    /// Returns an error if the target's output directory cannot be formed.
    pub fn output_dir(&self) -> Result<RepoPath, EngineError> {
        self.id.target().output_dir()
    }

    /// Declared outputs relative to the output root.
    ///
    /// # Errors
    /// Returns an error if a path cannot be joined.
    pub fn output_paths(&self) -> Result<Vec<RepoPath>, EngineError> {
        let dir = self.output_dir()?;
        self.outputs
            .iter()
            .map(|out| -> Result<RepoPath, EngineError> { Ok(dir.join(out.as_str())?) })
            .collect()
    }

    /// Producers of generated inputs, deduplicated.
    pub fn producers(&self) -> Vec<&ActionId> {
        let mut producers: Vec<&ActionId> = self
            .inputs
            .iter()
            .filter_map(|input| match input {
                Artifact::Generated { producer, .. } => Some(producer),
                Artifact::Source(_) => None,
            })
            .collect();
        producers.dedup();
        producers
    }
}

/// Every artifact a source entry stands for: the file itself, or all
/// outputs of the referenced target.
fn artifacts_of(entry: &SourceRef, graph: &TargetGraph) -> Result<Vec<Artifact>, EngineError> {
    match entry {
        SourceRef::Path(path) => Ok(vec![Artifact::Source(path.clone())]),
        SourceRef::Target(dep) => {
            let producer = graph.target(dep)?;
            Ok(producer
                .outputs()
                .into_iter()
                .map(|path| Artifact::Generated {
                    producer: ActionId::new(dep.clone()),
                    path,
                })
                .collect())
        }
    }
}

type Projected = (String, Vec<String>, BTreeMap<String, String>);

struct Projection<'a> {
    target: &'a Target,
    srcs: &'a [RepoPath],
    outputs: &'a [RepoPath],
}

impl Projection<'_> {
    fn sandbox_outputs(&self) -> Result<Vec<String>, EngineError> {
        let out_dir = RepoPath::new(SANDBOX_OUT_DIR)?;
        self.outputs
            .iter()
            .map(|out| -> Result<String, EngineError> { Ok(out_dir.join(out.as_str())?.to_string()) })
            .collect()
    }

    fn first_output(&self) -> Result<String, EngineError> {
        self.sandbox_outputs()?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::MalformedAttribute {
                target: self.target.id.to_string(),
                attr: "outs".to_owned(),
                message: "must declare at least one output".to_owned(),
            })
    }

    fn joined_srcs(&self) -> String {
        self.srcs
            .iter()
            .map(RepoPath::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn genrule(&self) -> Result<Projected, EngineError> {
        let Some(AttrValue::Str(cmd)) = self.target.attr("cmd") else {
            return Err(EngineError::Internal {
                message: format!("{}: genrule without cmd", self.target.id),
            });
        };
        let mut env = self.target.env();
        env.insert("SRCS".to_owned(), self.joined_srcs());
        env.insert("OUT".to_owned(), self.first_output()?);
        env.insert("OUTS".to_owned(), self.sandbox_outputs()?.join(" "));
        env.insert("OUT_DIR".to_owned(), SANDBOX_OUT_DIR.to_owned());
        if let Some(depfile) = self.target.depfile() {
            env.insert(
                "DEPFILE".to_owned(),
                RepoPath::new(SANDBOX_OUT_DIR)?.join(depfile.as_str())?.to_string(),
            );
        }
        Ok(("sh".to_owned(), vec!["-c".to_owned(), cmd.clone()], env))
    }

    fn command(&self) -> Result<Projected, EngineError> {
        let Some(AttrValue::Tool(tool)) = self.target.attr("tool") else {
            return Err(EngineError::Internal {
                message: format!("{}: command without tool", self.target.id),
            });
        };
        let args: &[String] = match self.target.attr("args") {
            Some(AttrValue::Strings(args)) => args,
            _ => &[],
        };
        let out = self.first_output()?;
        let srcs = self.joined_srcs();

        let mut argv = Vec::with_capacity(args.len());
        for arg in args {
            if arg == "$SRCS" {
                argv.extend(self.srcs.iter().map(ToString::to_string));
                continue;
            }
            // $OUT_DIR first so that $OUT does not eat its prefix.
            argv.push(
                arg.replace("$OUT_DIR", SANDBOX_OUT_DIR)
                    .replace("$OUT", &out)
                    .replace("$SRCS", &srcs),
            );
        }
        Ok((tool.clone(), argv, self.target.env()))
    }

    fn export_file(&self) -> Result<Projected, EngineError> {
        let Some(src) = self.srcs.first() else {
            return Err(EngineError::Internal {
                message: format!("{}: export_file without src", self.target.id),
            });
        };
        Ok((
            "cp".to_owned(),
            vec![src.to_string(), self.first_output()?],
            self.target.env(),
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testutil::{load_graph, static_tools, write};

    fn project(build: &str, id: &str) -> Action {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "lib/a.txt", "a");
        write(tmp.path(), "lib/b.txt", "b");
        write(tmp.path(), "lib/BUILD.toml", build);
        let graph = load_graph(tmp.path());
        let target = graph.target(&TargetId::parse(id).unwrap()).unwrap();
        Action::from_target(target, &graph, &static_tools()).unwrap()
    }

    #[test]
    fn genrule_projects_to_shell() {
        let action = project(
            r#"
[[target]]
name = "gen"
rule = "genrule"
srcs = ["b.txt", "a.txt"]
outs = ["x/out.txt", "log.txt"]
cmd = "cat $SRCS > $OUT"
env = { MODE = "fast" }
"#,
            "root//lib:gen",
        );
        assert_eq!(action.command.tool, "sh");
        assert_eq!(action.command.program, PathBuf::from("/bin/sh"));
        assert_eq!(action.command.argv, vec!["-c", "cat $SRCS > $OUT"]);
        let env = &action.command.env;
        assert_eq!(env.get("SRCS").unwrap(), "lib/a.txt lib/b.txt");
        assert_eq!(env.get("OUT").unwrap(), "__out__/x/out.txt");
        assert_eq!(env.get("OUTS").unwrap(), "__out__/x/out.txt __out__/log.txt");
        assert_eq!(env.get("OUT_DIR").unwrap(), "__out__");
        assert_eq!(env.get("MODE").unwrap(), "fast");
        assert_eq!(
            action.output_paths().unwrap(),
            vec![
                RepoPath::new("lib/gen/x/out.txt").unwrap(),
                RepoPath::new("lib/gen/log.txt").unwrap()
            ]
        );
    }

    #[test]
    fn command_substitutes_placeholders() {
        let action = project(
            r#"
[[target]]
name = "c"
rule = "command"
tool = "cat"
args = ["--in", "$SRCS", "--out=$OUT", "--dir=$OUT_DIR"]
srcs = ["a.txt", "b.txt"]
outs = ["o.txt"]
"#,
            "root//lib:c",
        );
        assert_eq!(action.command.program, PathBuf::from("/bin/cat"));
        assert_eq!(
            action.command.argv,
            vec![
                "--in",
                "lib/a.txt",
                "lib/b.txt",
                "--out=__out__/o.txt",
                "--dir=__out__"
            ]
        );
    }

    #[test]
    fn export_file_copies_source() {
        let action = project(
            "[[target]]\nname = \"e\"\nrule = \"export_file\"\nsrc = \"a.txt\"\n",
            "root//lib:e",
        );
        assert_eq!(action.command.tool, "cp");
        assert_eq!(action.command.argv, vec!["lib/a.txt", "__out__/a.txt"]);
    }

    #[test]
    fn target_sources_become_generated_inputs() {
        let action = project(
            r#"
[[target]]
name = "first"
rule = "genrule"
outs = ["one", "two"]
cmd = "touch $OUTS"

[[target]]
name = "second"
rule = "genrule"
srcs = [":first", "a.txt"]
outs = ["o"]
cmd = "cat $SRCS > $OUT"
"#,
            "root//lib:second",
        );
        let producer = ActionId::new(TargetId::parse("root//lib:first").unwrap());
        assert_eq!(action.producers(), vec![&producer]);
        assert_eq!(
            action.command.env.get("SRCS").unwrap(),
            "__gen__/lib/first/one __gen__/lib/first/two lib/a.txt"
        );
        assert_eq!(action.inputs.len(), 3);
    }
}
