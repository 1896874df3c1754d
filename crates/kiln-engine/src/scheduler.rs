//! Parallel execution of the action DAG.
//!
//! A coordinator loop on the calling thread owns the ready queue and every
//! state transition out of `Running`; workers on a bounded rayon pool run
//! one node each and report back over a channel.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::Sender;
use kiln_config::MaterializeMode;
use kiln_util::fs::Filesystem;
use kiln_util::process::Termination;
use kiln_util::CancelToken;

use crate::action::{Action, ActionId, Artifact};
use crate::coordinator::{CacheCoordinator, FlightOutcome, FlightResult, LockResult};
use crate::dag::{ActionDag, DagNode, NodeIndex};
use crate::error::EngineError;
use crate::events::{EventKind, EventSink};
use crate::executor::Executor;
use crate::rulekey::{RuleKey, RuleKeyComputer};
use crate::sandbox::{Sandbox, SandboxRoots};
use crate::state::NodeState;
use crate::store::{CacheEntry, EntryMetadata, OutputFile};

/// Why an action failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// The command exited with a non-zero status or was killed by a signal.
    NonZeroExit,
    /// The command succeeded but a declared output is missing.
    MissingOutput,
    /// The command ran past its timeout.
    Timeout,
    /// Outputs could not be recorded in the cache or placed under the
    /// output root.
    CacheStore,
    /// The sandbox could not be prepared.
    Sandbox,
    /// The command could not be started.
    Launch,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NonZeroExit => "non-zero exit",
            Self::MissingOutput => "missing output",
            Self::Timeout => "timeout",
            Self::CacheStore => "cache store",
            Self::Sandbox => "sandbox",
            Self::Launch => "launch",
        };
        f.write_str(s)
    }
}

/// Diagnostics for a failed action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionFailure {
    pub id: ActionId,
    pub cause: FailureCause,
    pub message: String,
    /// Captured standard error, lossily decoded.
    pub stderr: String,
}

/// Why a node never ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// An input producer failed.
    DependencyFailed(ActionId),
    /// The invocation was cancelled.
    Cancelled,
    /// Dispatch stopped after a failure without `keep_going`.
    Aborted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DependencyFailed(_) => f.write_str("dependency-failed"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

/// Terminal result of one node.
#[derive(Debug, Clone)]
pub enum NodeResult {
    /// Outputs came from the cache. `single_flight` is set when another
    /// node with the same key produced them during this invocation.
    CacheHit { single_flight: bool },
    Built { duration: Duration },
    Failed(Arc<ActionFailure>),
    Skipped(SkipReason),
}

impl NodeResult {
    /// The node state this result ends in.
    pub fn state(&self) -> NodeState {
        match self {
            Self::CacheHit { .. } => NodeState::CacheHit,
            Self::Built { .. } => NodeState::Built,
            Self::Failed(_) => NodeState::Failed,
            Self::Skipped(_) => NodeState::Skipped,
        }
    }
}

impl FlightResult for Result<NodeResult, EngineError> {
    fn flight_outcome(&self) -> FlightOutcome {
        match self {
            Ok(NodeResult::CacheHit { .. } | NodeResult::Built { .. }) => FlightOutcome::Succeeded,
            Ok(NodeResult::Failed(failure)) => FlightOutcome::Failed(Arc::clone(failure)),
            Ok(NodeResult::Skipped(_)) => FlightOutcome::Cancelled,
            Err(_) => FlightOutcome::Abandoned,
        }
    }
}

/// Knobs for one scheduler run.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub concurrency: usize,
    pub keep_going: bool,
    pub materialize_mode: MaterializeMode,
    /// Applied to actions that declare no timeout of their own.
    pub default_timeout: Option<Duration>,
    pub kill_grace: Duration,
}

/// Every node's result, keyed by action.
#[derive(Debug, Clone, Default)]
pub struct ScheduleReport {
    pub results: BTreeMap<ActionId, NodeResult>,
    /// Cancellation was requested during the run.
    pub cancelled: bool,
}

/// Everything a run needs, borrowed for its duration.
pub struct Scheduler<'a> {
    pub dag: &'a ActionDag,
    pub rule_keys: &'a RuleKeyComputer<'a>,
    pub coordinator: &'a CacheCoordinator,
    pub executor: &'a dyn Executor,
    pub events: &'a EventSink,
    pub fs: Arc<dyn Filesystem>,
    pub roots: SandboxRoots,
    pub settings: SchedulerSettings,
    pub cancel: CancelToken,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyEntry {
    weight: usize,
    order: Reverse<u64>,
    index: NodeIndex,
}

type Completion = (NodeIndex, Result<NodeResult, EngineError>);

/// Coordinator-loop bookkeeping.
struct Run {
    remaining: Vec<usize>,
    results: Vec<Option<NodeResult>>,
    ready: BinaryHeap<ReadyEntry>,
    next_order: u64,
    in_flight: usize,
    stop: bool,
    fatal: Option<EngineError>,
}

impl Run {
    fn record(&mut self, index: NodeIndex, result: NodeResult) {
        if let Some(slot) = self.results.get_mut(index) {
            *slot = Some(result);
        }
    }
}

impl<'a> Scheduler<'a> {
    /// Run every node to a terminal state.
    ///
    /// # Errors
    /// Returns an error only for invariant violations or failures outside
    /// any single action (e.g. the worker pool cannot start). Action
    /// failures are reported in the [`ScheduleReport`].
    pub fn run(&self) -> Result<ScheduleReport, EngineError> {
        let workers = self.settings.concurrency.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("kiln-worker-{i}"))
            .build()
            .map_err(|e| EngineError::Internal {
                message: format!("cannot start worker pool: {e}"),
            })?;
        let (sender, receiver) = crossbeam_channel::unbounded::<Completion>();

        let mut run = Run {
            remaining: (0..self.dag.len()).map(|i| self.dag.inputs(i).len()).collect(),
            results: vec![None; self.dag.len()],
            ready: BinaryHeap::new(),
            next_order: 0,
            in_flight: 0,
            stop: false,
            fatal: None,
        };

        tracing::info!(actions = self.dag.len(), workers, "scheduling");
        for (_, node) in self.dag.nodes() {
            self.events.post_simple(&node.action.id, EventKind::Queued);
        }
        for index in self.dag.roots() {
            if let Err(e) = self.make_ready(&mut run, index) {
                self.abort(&mut run, e);
            }
        }

        pool.in_place_scope(|scope| loop {
            if let Err(e) = self.dispatch(scope, &mut run, &sender) {
                self.abort(&mut run, e);
            }
            if run.in_flight == 0 {
                break;
            }
            let Ok((index, result)) = receiver.recv() else {
                break;
            };
            run.in_flight = run.in_flight.saturating_sub(1);
            if let Err(e) = result.and_then(|r| self.finish(&mut run, index, r)) {
                self.abort(&mut run, e);
            }
        });

        self.settle_leftovers(&mut run)?;
        if let Some(fatal) = run.fatal {
            return Err(fatal);
        }

        let mut report = ScheduleReport {
            results: BTreeMap::new(),
            cancelled: self.cancel.is_cancelled(),
        };
        for (index, result) in run.results.into_iter().enumerate() {
            let node = self.node(index)?;
            let Some(result) = result else {
                return Err(EngineError::Internal {
                    message: format!("{} has no result", node.action.id),
                });
            };
            report.results.insert(node.action.id.clone(), result);
        }
        Ok(report)
    }

    fn node(&self, index: NodeIndex) -> Result<&'a DagNode, EngineError> {
        self.dag.node(index).ok_or_else(|| EngineError::Internal {
            message: format!("node {index} is out of range"),
        })
    }

    fn abort(&self, run: &mut Run, error: EngineError) {
        tracing::error!(error = %error, "aborting build");
        run.stop = true;
        run.fatal.get_or_insert(error);
        self.cancel.cancel();
    }

    fn make_ready(&self, run: &mut Run, index: NodeIndex) -> Result<(), EngineError> {
        let node = self.node(index)?;
        node.state().transition(NodeState::Waiting, NodeState::Ready)?;
        self.events.post_simple(&node.action.id, EventKind::Ready);
        run.ready.push(ReadyEntry {
            weight: self.dag.weight(index),
            order: Reverse(run.next_order),
            index,
        });
        run.next_order += 1;
        Ok(())
    }

    fn dispatch<'s>(
        &'s self,
        scope: &rayon::Scope<'s>,
        run: &mut Run,
        sender: &Sender<Completion>,
    ) -> Result<(), EngineError> {
        while !run.stop && !self.cancel.is_cancelled() && run.in_flight < self.settings.concurrency.max(1) {
            let Some(entry) = run.ready.pop() else {
                break;
            };
            let node = self.node(entry.index)?;
            node.state().transition(NodeState::Ready, NodeState::Running)?;
            self.events.post_simple(&node.action.id, EventKind::Running);
            run.in_flight += 1;

            let sender = sender.clone();
            let index = entry.index;
            scope.spawn(move |_| {
                let result = self.execute_node(index);
                // The receiver outlives every worker.
                let _ = sender.send((index, result));
            });
        }
        Ok(())
    }

    /// Record a worker's result and release or skip its dependents.
    fn finish(&self, run: &mut Run, index: NodeIndex, result: NodeResult) -> Result<(), EngineError> {
        let node = self.node(index)?;
        node.state().transition(NodeState::Running, result.state())?;
        self.post_terminal(&node.action, &result);

        match &result {
            NodeResult::CacheHit { .. } | NodeResult::Built { .. } => {
                for &dependent in self.dag.dependents(index) {
                    let Some(count) = run.remaining.get_mut(dependent) else {
                        continue;
                    };
                    *count = count.saturating_sub(1);
                    if *count == 0 && self.node(dependent)?.state().load() == NodeState::Waiting {
                        self.make_ready(run, dependent)?;
                    }
                }
            }
            NodeResult::Failed(failure) => {
                tracing::warn!(action = %node.action.id, cause = %failure.cause, "{}", failure.message);
                self.skip_dependents(run, index)?;
                if !self.settings.keep_going {
                    run.stop = true;
                }
            }
            NodeResult::Skipped(_) => {}
        }
        run.record(index, result);
        Ok(())
    }

    fn skip_dependents(&self, run: &mut Run, failed: NodeIndex) -> Result<(), EngineError> {
        let failed_id = self.node(failed)?.action.id.clone();
        let mut stack: Vec<NodeIndex> = self.dag.dependents(failed).to_vec();
        while let Some(index) = stack.pop() {
            let node = self.node(index)?;
            if node.state().load() != NodeState::Waiting {
                continue;
            }
            node.state().transition(NodeState::Waiting, NodeState::Skipped)?;
            let reason = SkipReason::DependencyFailed(failed_id.clone());
            self.post_skipped(&node.action.id, &reason);
            run.record(index, NodeResult::Skipped(reason));
            stack.extend_from_slice(self.dag.dependents(index));
        }
        Ok(())
    }

    /// Every node that never started ends `Skipped`.
    fn settle_leftovers(&self, run: &mut Run) -> Result<(), EngineError> {
        let reason = if self.cancel.is_cancelled() && run.fatal.is_none() {
            SkipReason::Cancelled
        } else {
            SkipReason::Aborted
        };
        for (index, node) in self.dag.nodes() {
            let state = node.state().load();
            if !matches!(state, NodeState::Waiting | NodeState::Ready) {
                continue;
            }
            node.state().transition(state, NodeState::Skipped)?;
            self.post_skipped(&node.action.id, &reason);
            run.record(index, NodeResult::Skipped(reason.clone()));
        }
        Ok(())
    }

    fn post_skipped(&self, id: &ActionId, reason: &SkipReason) {
        let mut detail = BTreeMap::new();
        detail.insert("reason".to_owned(), reason.to_string());
        if let SkipReason::DependencyFailed(dep) = reason {
            detail.insert("dependency".to_owned(), dep.to_string());
        }
        self.events.post(id, EventKind::Skipped, detail);
    }

    fn post_terminal(&self, action: &Action, result: &NodeResult) {
        let mut detail = BTreeMap::new();
        let kind = match result {
            NodeResult::CacheHit { single_flight } => {
                if *single_flight {
                    detail.insert("single_flight".to_owned(), "true".to_owned());
                }
                EventKind::CacheHit
            }
            NodeResult::Built { duration } => {
                detail.insert("duration_ms".to_owned(), duration.as_millis().to_string());
                EventKind::Built
            }
            NodeResult::Failed(failure) => {
                detail.insert("cause".to_owned(), failure.cause.to_string());
                detail.insert("message".to_owned(), failure.message.clone());
                EventKind::Failed
            }
            NodeResult::Skipped(reason) => {
                detail.insert("reason".to_owned(), reason.to_string());
                EventKind::Cancelled
            }
        };
        if let Some(key) = self.rule_keys.memoized(action.id.target()) {
            detail.insert("rule_key".to_owned(), key.to_hex());
        }
        self.events.post(&action.id, kind, detail);
    }

    /// Worker body: bring one node's outputs into place.
    fn execute_node(&self, index: NodeIndex) -> Result<NodeResult, EngineError> {
        let action = &self.node(index)?.action;
        if self.cancel.is_cancelled() {
            return Ok(NodeResult::Skipped(SkipReason::Cancelled));
        }
        if !action.cacheable {
            return self.run_action(action, None);
        }

        let key = self.rule_keys.input_rule_key(action.id.target())?;
        if let Some(entry) = self.coordinator.lookup(&key) {
            tracing::debug!(action = %action.id, key = %key, "cache hit");
            return Ok(self.place_hit(action, &entry, false));
        }
        tracing::debug!(action = %action.id, key = %key, "cache miss");

        loop {
            let locked = self.coordinator.with_fingerprint_lock(&key, &self.cancel, || {
                // Someone may have stored it between our lookup and the lock.
                if let Some(entry) = self.coordinator.lookup(&key) {
                    return Ok(self.place_hit(action, &entry, false));
                }
                self.run_action(action, Some(&key))
            });
            match locked {
                LockResult::Leader(result) => return result,
                LockResult::Follower(FlightOutcome::Succeeded) => {
                    if let Some(entry) = self.coordinator.lookup(&key) {
                        return Ok(self.place_hit(action, &entry, true));
                    }
                    tracing::debug!(action = %action.id, key = %key, "leader's entry vanished; retrying");
                }
                LockResult::Follower(FlightOutcome::Failed(leader)) => {
                    return Ok(NodeResult::Failed(Arc::new(ActionFailure {
                        id: action.id.clone(),
                        cause: leader.cause,
                        message: format!("{} (shared with {})", leader.message, leader.id),
                        stderr: leader.stderr.clone(),
                    })));
                }
                LockResult::Follower(FlightOutcome::Cancelled | FlightOutcome::Abandoned) => {
                    return Ok(NodeResult::Skipped(SkipReason::Cancelled));
                }
            }
        }
    }

    fn output_root_dir(&self, action: &Action) -> Result<PathBuf, EngineError> {
        Ok(action.output_dir()?.to_path(&self.roots.output_root))
    }

    fn materialize(&self, action: &Action, entry: &CacheEntry) -> Result<(), EngineError> {
        let dest = self.output_root_dir(action)?;
        self.coordinator
            .store()
            .materialize(entry, &dest, self.settings.materialize_mode)
    }

    /// Place a cached entry's outputs, failing the action if they cannot be.
    fn place_hit(&self, action: &Action, entry: &CacheEntry, single_flight: bool) -> NodeResult {
        match self.materialize(action, entry) {
            Ok(()) => NodeResult::CacheHit { single_flight },
            Err(e) => failed(action, FailureCause::CacheStore, e.to_string(), &[]),
        }
    }

    /// Run the action's command in a fresh sandbox and place its outputs.
    /// With a key, outputs are stored in the cache first.
    fn run_action(&self, action: &Action, key: Option<&RuleKey>) -> Result<NodeResult, EngineError> {
        if self.cancel.is_cancelled() {
            return Ok(NodeResult::Skipped(SkipReason::Cancelled));
        }
        let sandbox = match Sandbox::prepare(action, &self.roots, Arc::clone(&self.fs)) {
            Ok(sandbox) => sandbox,
            Err(e) => return Ok(failed(action, FailureCause::Sandbox, e.to_string(), &[])),
        };
        let timeout = action.timeout.or(self.settings.default_timeout);
        let request = sandbox.request(action, &self.roots, timeout, self.settings.kill_grace);

        if self.cancel.is_cancelled() {
            return Ok(NodeResult::Skipped(SkipReason::Cancelled));
        }
        let started = Instant::now();
        let outcome = match self.executor.execute(&request, &self.cancel) {
            Ok(outcome) => outcome,
            Err(e) => return Ok(failed(action, FailureCause::Launch, e.to_string(), &[])),
        };
        let duration = started.elapsed();

        match outcome.termination {
            Termination::Cancelled => return Ok(NodeResult::Skipped(SkipReason::Cancelled)),
            Termination::TimedOut => {
                let limit = timeout.map_or(0, |t| t.as_millis());
                return Ok(failed(
                    action,
                    FailureCause::Timeout,
                    format!("timed out after {limit}ms"),
                    &outcome.stderr,
                ));
            }
            Termination::Exited if !outcome.success() => {
                let message = match outcome.exit_code {
                    Some(code) => format!("exited with status {code}"),
                    None => "killed by a signal".to_owned(),
                };
                return Ok(failed(action, FailureCause::NonZeroExit, message, &outcome.stderr));
            }
            Termination::Exited => {}
        }

        let outputs = match sandbox.collect_outputs(action) {
            Ok(outputs) => outputs,
            Err(missing) => {
                let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
                return Ok(failed(
                    action,
                    FailureCause::MissingOutput,
                    format!("did not produce declared output(s): {}", names.join(", ")),
                    &outcome.stderr,
                ));
            }
        };

        let placed = match key {
            Some(key) => self
                .metadata(action, key, &sandbox, duration)
                .and_then(|metadata| self.coordinator.insert(key, &outputs, &metadata))
                .and_then(|entry| self.materialize(action, &entry)),
            None => self.place_uncached(action, &outputs),
        };
        if let Err(e) = placed {
            return Ok(failed(action, FailureCause::CacheStore, e.to_string(), &outcome.stderr));
        }
        tracing::info!(action = %action.id, duration_ms = duration.as_millis(), "built");
        Ok(NodeResult::Built { duration })
    }

    fn place_uncached(&self, action: &Action, outputs: &[OutputFile]) -> Result<(), EngineError> {
        let dest = self.output_root_dir(action)?;
        for output in outputs {
            kiln_util::fs::materialize(self.fs.as_ref(), &output.source, &output.path.to_path(&dest), false)?;
        }
        Ok(())
    }

    fn metadata(
        &self,
        action: &Action,
        key: &RuleKey,
        sandbox: &Sandbox,
        duration: Duration,
    ) -> Result<EntryMetadata, EngineError> {
        let mut inputs = BTreeMap::new();
        for input in &action.inputs {
            let digest = match input {
                Artifact::Source(path) => self.rule_keys.source_digest(action.id.target(), path)?,
                Artifact::Generated { .. } => {
                    kiln_util::hash::sha256_file(&input.sandbox_path()?.to_path(sandbox.dir()))?
                }
            };
            inputs.insert(input.sandbox_path()?.to_string(), digest.to_hex());
        }

        let depfile_key = match &action.depfile {
            Some(depfile) => match sandbox.read_depfile(depfile) {
                Ok(Some(used)) => {
                    let target = self.rule_keys.graph().target(action.id.target())?;
                    Some(self.rule_keys.dependency_file_rule_key(target, &used)?.to_hex())
                }
                Ok(None) => {
                    tracing::warn!(action = %action.id, depfile = %depfile, "declared depfile was not written");
                    None
                }
                Err(e) => {
                    tracing::warn!(action = %action.id, depfile = %depfile, error = %e, "ignoring unreadable depfile");
                    None
                }
            },
            None => None,
        };

        Ok(EntryMetadata {
            key: key.to_hex(),
            target: action.id.to_string(),
            rule_kind: action.kind.name().to_owned(),
            argv: std::iter::once(action.command.tool.clone())
                .chain(action.command.argv.iter().cloned())
                .collect(),
            tool_digests: action
                .tools
                .iter()
                .map(|tool| (tool.name.clone(), tool.digest.to_hex()))
                .collect(),
            inputs,
            outputs: action.outputs.iter().map(ToString::to_string).collect(),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            host: kiln_util::process::hostname(),
            kiln_version: crate::KILN_VERSION.to_owned(),
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
            depfile_key,
        })
    }
}

fn failed(action: &Action, cause: FailureCause, message: String, stderr: &[u8]) -> NodeResult {
    tracing::debug!(action = %action.id, cause = %cause, message = %message, "action failed");
    NodeResult::Failed(Arc::new(ActionFailure {
        id: action.id.clone(),
        cause,
        message,
        stderr: String::from_utf8_lossy(stderr).into_owned(),
    }))
}
