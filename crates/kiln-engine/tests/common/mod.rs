//! Fixtures shared by the integration tests.

#![allow(clippy::unwrap_used, dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use kiln_engine::{
    build_with, BuildOptions, BuildReport, CollectingListener, EngineError, Event, EventKind, Executor,
    ProcessExecutor,
};
use kiln_util::process::{ProcessOutcome, ProcessRequest};
use kiln_util::CancelToken;

/// Counts launches and forwards them to the real executor.
#[derive(Debug, Default)]
pub struct CountingExecutor {
    launches: AtomicUsize,
}

impl CountingExecutor {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl Executor for CountingExecutor {
    fn execute(&self, request: &ProcessRequest, cancel: &CancelToken) -> Result<ProcessOutcome, EngineError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        ProcessExecutor.execute(request, cancel)
    }
}

/// A scratch repository with a counting executor.
pub struct Repo {
    dir: tempfile::TempDir,
    pub executor: CountingExecutor,
}

impl Repo {
    pub fn new(kiln_toml: &str) -> Self {
        let repo = Self {
            dir: tempfile::tempdir().unwrap(),
            executor: CountingExecutor::default(),
        };
        repo.write("kiln.toml", kiln_toml);
        repo
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.dir.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    pub fn output(&self, rel: &str) -> PathBuf {
        self.dir.path().join("kiln-out").join(rel)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.dir.path().join(".kiln").join("cache")
    }

    pub fn build(&self, options: &BuildOptions) -> (Result<BuildReport, EngineError>, Vec<Event>) {
        let listener = CollectingListener::new();
        let result = build_with(self.root(), options, &self.executor, Box::new(listener.clone()));
        (result, listener.events())
    }

    pub fn build_ok(&self) -> (BuildReport, Vec<Event>) {
        let (result, events) = self.build(&BuildOptions::default());
        (result.unwrap(), events)
    }
}

pub fn events_of<'a>(events: &'a [Event], action: &str, kind: EventKind) -> Vec<&'a Event> {
    events
        .iter()
        .filter(|e| e.action_id == action && e.kind == kind)
        .collect()
}

pub fn terminal_of<'a>(events: &'a [Event], action: &str) -> &'a Event {
    events
        .iter()
        .find(|e| e.action_id == action && e.kind.is_terminal())
        .unwrap()
}
