//! Launching action commands.

use kiln_util::process::{run_process, ProcessOutcome, ProcessRequest};
use kiln_util::CancelToken;

use crate::error::EngineError;

/// Runs a prepared command. The scheduler owns sandboxing and output
/// verification; an executor only launches and waits.
pub trait Executor: Send + Sync {
    /// Run `request` to completion, honoring its timeout and `cancel`.
    ///
    /// # Errors
    /// Returns an error only if the process could not be launched or
    /// waited on. Non-zero exits and timeouts are reported in the outcome.
    fn execute(&self, request: &ProcessRequest, cancel: &CancelToken) -> Result<ProcessOutcome, EngineError>;
}

/// Executes commands as local child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutor;

impl Executor for ProcessExecutor {
    fn execute(&self, request: &ProcessRequest, cancel: &CancelToken) -> Result<ProcessOutcome, EngineError> {
        tracing::debug!(
            program = %request.program.display(),
            cwd = %request.cwd.display(),
            args = ?request.args,
            "executing"
        );
        Ok(run_process(request, cancel)?)
    }
}
