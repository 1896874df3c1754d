//! Build orchestration: load targets, compute keys, schedule actions, report.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::{IntoParallelRefIterator, ParallelIterator};

use kiln_config::{Config, MaterializeMode};
use kiln_util::fs::{Filesystem, LocalFs};
use kiln_util::CancelToken;

use crate::action::{Action, ActionId};
use crate::coordinator::CacheCoordinator;
use crate::dag::ActionDag;
use crate::error::EngineError;
use crate::events::{EventListener, EventSink, FanoutListener, JsonLinesListener, ProgressListener, TracingListener};
use crate::executor::{Executor, ProcessExecutor};
use crate::graph::TargetGraph;
use crate::rulekey::{RuleKey, RuleKeyComputer};
use crate::sandbox::SandboxRoots;
use crate::scheduler::{NodeResult, Scheduler, SchedulerSettings};
use crate::store::{ArtifactStore, EvictionReport};
use crate::summary::Summary;
use crate::target::TargetId;
use crate::tools::ConfigToolResolver;

/// Options controlling a build invocation. `None` fields fall back to
/// `kiln.toml`.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Target patterns; empty builds every target.
    pub targets: Vec<String>,
    pub keep_going: Option<bool>,
    pub concurrency: Option<usize>,
    pub materialize_mode: Option<MaterializeMode>,
    pub cache_dir: Option<PathBuf>,
    /// Print `Building`/`Cached`/`Failed` lines to stderr.
    pub progress: bool,
    /// Append every event as a JSON line to this file.
    pub event_log: Option<PathBuf>,
    pub cancel: CancelToken,
}

/// Result of a build that ran to completion, successful or not.
#[derive(Debug)]
pub struct BuildReport {
    pub summary: Summary,
    pub results: BTreeMap<ActionId, NodeResult>,
    pub rule_keys: BTreeMap<TargetId, RuleKey>,
    pub output_root: PathBuf,
    /// Low-priority events lost to backpressure.
    pub dropped_events: u64,
    pub eviction: Option<EvictionReport>,
    pub duration: Duration,
}

/// Run a build with the local process executor and the listeners selected
/// by `options`.
///
/// # Errors
/// Returns an error if configuration, targets, or the graph are invalid, or
/// on an internal failure. Action failures are reported in the
/// [`BuildReport`] instead.
pub fn build(repo_root: &Path, options: &BuildOptions) -> Result<BuildReport, EngineError> {
    let mut listener = FanoutListener::new().with(Box::new(TracingListener));
    if options.progress {
        listener = listener.with(Box::new(ProgressListener));
    }
    if let Some(path) = &options.event_log {
        if let Some(parent) = path.parent() {
            kiln_util::fs::ensure_dir(parent)?;
        }
        let file = std::fs::File::create(path).map_err(|source| EngineError::io(path, source))?;
        listener = listener.with(Box::new(JsonLinesListener::new(std::io::BufWriter::new(file))));
    }
    build_with(repo_root, options, &ProcessExecutor, Box::new(listener))
}

/// Run a build with an explicit executor and event listener.
///
/// On an internal error a diagnostic bundle is written under the output
/// directory before the error is returned.
///
/// # Errors
/// See [`build`].
pub fn build_with(
    repo_root: &Path,
    options: &BuildOptions,
    executor: &dyn Executor,
    listener: Box<dyn EventListener>,
) -> Result<BuildReport, EngineError> {
    let config = Config::from_path(&repo_root.join("kiln.toml"))?;
    let result = run_build(repo_root, &config, options, executor, listener);
    if let Err(e) = &result {
        if e.wants_diagnostics() {
            match crate::diagnostics::write_bundle(&config.output_dir(repo_root), repo_root, e, &options.targets) {
                Ok(path) => eprintln!("note: diagnostic bundle written to {}", path.display()),
                Err(write_err) => tracing::warn!(error = %write_err, "cannot write diagnostic bundle"),
            }
        }
    }
    result
}

/// Steps:
/// 1. Load every `BUILD.toml` into the target graph
/// 2. Select the requested targets and their dependency closure
/// 3. Project each target into its action and freeze the DAG
/// 4. Compute input rule keys (fails early on missing inputs and cycles)
/// 5. Schedule, with the cache in front of every cacheable action
/// 6. Trim the cache to `cache_max_bytes` and summarize
fn run_build(
    repo_root: &Path,
    config: &Config,
    options: &BuildOptions,
    executor: &dyn Executor,
    listener: Box<dyn EventListener>,
) -> Result<BuildReport, EngineError> {
    let start = Instant::now();

    // 1. Load targets.
    let graph = TargetGraph::load(repo_root, config)?;

    // 2. Select.
    let roots = graph.select(&options.targets)?;
    let ids = graph.closure(&roots);
    tracing::info!(requested = roots.len(), closure = ids.len(), "selected targets");

    // 3. Project and freeze.
    let tools = ConfigToolResolver::new(repo_root, config.tools.clone(), std::env::var_os("PATH"));
    let actions = ids
        .par_iter()
        .map(|id| Action::from_target(graph.target(id)?, &graph, &tools))
        .collect::<Result<Vec<_>, EngineError>>()?;
    let dag = ActionDag::new(actions)?;

    // 4. Rule keys.
    let rule_keys = RuleKeyComputer::new(&graph, &tools, &config.build.rule_key_seed);
    let keys = rule_keys.compute_all(&ids)?;

    // 5. Schedule.
    let fs: Arc<dyn Filesystem> = Arc::new(LocalFs);
    let cache_dir = options
        .cache_dir
        .clone()
        .unwrap_or_else(|| config.cache_dir(repo_root));
    let store = ArtifactStore::open(&cache_dir, Arc::clone(&fs))?;
    let coordinator = CacheCoordinator::new(store, config.build.lru_capacity, config.build.cache_max_bytes);
    let output_root = config.output_dir(repo_root);
    kiln_util::fs::ensure_dir(&output_root)?;

    let events = EventSink::spawn(config.build.event_buffer, listener);
    let scheduler = Scheduler {
        dag: &dag,
        rule_keys: &rule_keys,
        coordinator: &coordinator,
        executor,
        events: &events,
        fs,
        roots: SandboxRoots {
            repo_root: repo_root.to_path_buf(),
            output_root: output_root.clone(),
            host_path: std::env::var("PATH").ok(),
            keep: config.build.keep_sandboxes,
        },
        settings: SchedulerSettings {
            concurrency: options.concurrency.unwrap_or_else(|| config.concurrency()),
            keep_going: options.keep_going.unwrap_or(config.build.keep_going),
            materialize_mode: options
                .materialize_mode
                .unwrap_or(config.build.materialize_mode),
            default_timeout: config.build.action_default_timeout_ms.map(Duration::from_millis),
            kill_grace: Duration::from_millis(config.build.kill_grace_ms),
        },
        cancel: options.cancel.clone(),
    };
    let report = scheduler.run();
    let dropped_events = events.close();
    let report = report?;
    if dropped_events > 0 {
        tracing::debug!(dropped = dropped_events, "low-priority events dropped");
    }

    // 6. Trim and summarize.
    let eviction = match coordinator.enforce_limit() {
        Ok(eviction) => eviction,
        Err(e) => {
            tracing::warn!(error = %e, "cache eviction failed");
            None
        }
    };
    if let Some(eviction) = &eviction {
        if eviction.entries_removed > 0 {
            tracing::info!(
                entries = eviction.entries_removed,
                blobs = eviction.blobs_removed,
                bytes = eviction.bytes_freed,
                "evicted cache entries"
            );
        }
    }

    let summary = Summary::from_report(&report);
    Ok(BuildReport {
        summary,
        results: report.results,
        rule_keys: keys,
        output_root,
        dropped_events,
        eviction,
        duration: start.elapsed(),
    })
}

/// Compute input rule keys for the selected targets without building.
///
/// # Errors
/// Returns an error if configuration, targets, or inputs are invalid.
pub fn rule_keys(repo_root: &Path, patterns: &[String]) -> Result<BTreeMap<TargetId, RuleKey>, EngineError> {
    let config = Config::from_path(&repo_root.join("kiln.toml"))?;
    let graph = TargetGraph::load(repo_root, &config)?;
    let roots = graph.select(patterns)?;
    let tools = ConfigToolResolver::new(repo_root, config.tools.clone(), std::env::var_os("PATH"));
    let computer = RuleKeyComputer::new(&graph, &tools, &config.build.rule_key_seed);
    computer.compute_all(&roots)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::events::CollectingListener;
    use crate::testutil::write;

    fn repo() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "kiln.toml", "[build]\nconcurrency = 2\n");
        write(tmp.path(), "src/in.txt", "data\n");
        write(
            tmp.path(),
            "src/BUILD.toml",
            r#"
[[target]]
name = "copy"
rule = "export_file"
src = "in.txt"

[[target]]
name = "twice"
rule = "genrule"
srcs = [":copy"]
outs = ["twice.txt"]
cmd = "cat $SRCS $SRCS > $OUT"
"#,
        );
        tmp
    }

    #[test]
    fn build_options_defaults() {
        let options = BuildOptions::default();
        assert!(options.targets.is_empty());
        assert!(options.keep_going.is_none());
        assert!(!options.progress);
        assert!(!options.cancel.is_cancelled());
    }

    #[test]
    fn builds_selected_closure() {
        let tmp = repo();
        let options = BuildOptions {
            targets: vec!["//src:twice".to_owned()],
            ..BuildOptions::default()
        };
        let report = build_with(tmp.path(), &options, &ProcessExecutor, Box::new(CollectingListener::new())).unwrap();
        assert!(report.summary.is_success());
        assert_eq!(report.summary.built, 2);
        assert_eq!(report.rule_keys.len(), 2);
        assert_eq!(
            std::fs::read_to_string(report.output_root.join("src/twice/twice.txt")).unwrap(),
            "data\ndata\n"
        );
        assert!(tmp.path().join(".kiln/cache/cas").is_dir());
    }

    #[test]
    fn unknown_target_is_an_error() {
        let tmp = repo();
        let options = BuildOptions {
            targets: vec!["//src:nope".to_owned()],
            ..BuildOptions::default()
        };
        let err = build_with(tmp.path(), &options, &ProcessExecutor, Box::new(CollectingListener::new())).unwrap_err();
        assert!(matches!(err, EngineError::UnknownTarget { .. }));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn rule_keys_match_build() {
        let tmp = repo();
        let keys = rule_keys(tmp.path(), &[]).unwrap();
        let report = build_with(
            tmp.path(),
            &BuildOptions::default(),
            &ProcessExecutor,
            Box::new(CollectingListener::new()),
        )
        .unwrap();
        assert_eq!(keys, report.rule_keys);
    }

    #[test]
    fn event_log_is_json_lines() {
        let tmp = repo();
        let log = tmp.path().join("logs/events.jsonl");
        let options = BuildOptions {
            event_log: Some(log.clone()),
            ..BuildOptions::default()
        };
        build(tmp.path(), &options).unwrap();
        let content = std::fs::read_to_string(&log).unwrap();
        let kinds: Vec<String> = content
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["kind"].as_str().unwrap().to_owned()
            })
            .collect();
        assert!(kinds.iter().any(|k| k == "Built"));
        assert!(kinds.iter().any(|k| k == "Running"));
        assert!(kinds.iter().all(|k| k != "Failed"));
    }
}
