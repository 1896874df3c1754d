//! Rule keys, action graph, artifact cache, and parallel scheduler for Kiln.

pub mod action;
pub mod build;
pub mod coordinator;
pub mod dag;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod init;
pub mod rulekey;
pub mod sandbox;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod summary;
pub mod target;
#[cfg(test)]
mod testutil;
pub mod tools;

pub use action::{Action, ActionId, Artifact, CommandSpec};
pub use build::{build, build_with, rule_keys, BuildOptions, BuildReport};
pub use coordinator::{CacheCoordinator, FlightOutcome};
pub use dag::ActionDag;
pub use error::{EngineError, ErrorKind};
pub use events::{
    CollectingListener, Event, EventKind, EventListener, EventSink, JsonLinesListener, ProgressListener,
};
pub use executor::{Executor, ProcessExecutor};
pub use graph::TargetGraph;
pub use init::init_repo;
pub use rulekey::{RuleKey, RuleKeyComputer};
pub use scheduler::{ActionFailure, FailureCause, NodeResult, ScheduleReport, SkipReason};
pub use state::NodeState;
pub use store::{ArtifactStore, CacheEntry, EntryMetadata, EvictionReport, StoreStats};
pub use summary::Summary;
pub use target::{RuleKind, Target, TargetId};
pub use tools::{ToolIdentity, ToolResolver};

/// Engine version recorded in cache provenance.
pub const KILN_VERSION: &str = env!("CARGO_PKG_VERSION");
