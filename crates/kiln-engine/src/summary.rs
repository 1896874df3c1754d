//! End-of-invocation summary.

use std::fmt::Write as _;
use std::sync::Arc;

use crate::scheduler::{ActionFailure, NodeResult, ScheduleReport, SkipReason};

/// Lines of captured stderr shown per failure.
pub const STDERR_TAIL_LINES: usize = 20;

/// Aggregate counts and failures of one invocation.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub built: usize,
    pub cache_hits: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
    /// Failures in action-id order.
    pub failures: Vec<Arc<ActionFailure>>,
}

impl Summary {
    pub fn from_report(report: &ScheduleReport) -> Self {
        let mut summary = Self {
            cancelled: report.cancelled,
            ..Self::default()
        };
        for result in report.results.values() {
            match result {
                NodeResult::Built { .. } => summary.built += 1,
                NodeResult::CacheHit { .. } => summary.cache_hits += 1,
                NodeResult::Failed(failure) => {
                    summary.failed += 1;
                    summary.failures.push(Arc::clone(failure));
                }
                NodeResult::Skipped(reason) => {
                    summary.skipped += 1;
                    if *reason == SkipReason::Cancelled {
                        summary.cancelled = true;
                    }
                }
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.built + self.cache_hits + self.failed + self.skipped
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }

    /// `0` on success, `130` if cancelled, `1` if any action failed.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            130
        } else if self.failed > 0 {
            1
        } else {
            0
        }
    }

    /// One-line count summary.
    pub fn counts_line(&self) -> String {
        format!(
            "{} built, {} cached, {} failed, {} skipped",
            self.built, self.cache_hits, self.failed, self.skipped
        )
    }

    /// Every failure with the tail of its stderr.
    pub fn render_failures(&self) -> String {
        let mut out = String::new();
        for failure in &self.failures {
            let _ = writeln!(out, "error: {} failed ({}): {}", failure.id, failure.cause, failure.message);
            for line in stderr_tail(&failure.stderr, STDERR_TAIL_LINES) {
                let _ = writeln!(out, "  | {line}");
            }
        }
        out
    }
}

/// The last `n` lines of `stderr`.
pub fn stderr_tail(stderr: &str, n: usize) -> Vec<&str> {
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines.into_iter().skip(start).collect()
}
