//! Process execution with timeouts, cancellation, and process-group kills.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::UtilError;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A fully specified child process launch.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    /// Program to execute (absolute path or a name resolved by the OS).
    pub program: PathBuf,
    /// Arguments, not including the program itself.
    pub args: Vec<String>,
    /// The complete child environment. Nothing is inherited from the parent.
    pub env: BTreeMap<String, String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Bytes fed to stdin; `None` connects stdin to `/dev/null`.
    pub stdin: Option<Vec<u8>>,
    /// Wall-clock limit after which the process group is killed.
    pub timeout: Option<Duration>,
    /// Delay between SIGTERM and SIGKILL when the process must be stopped.
    pub kill_grace: Duration,
}

/// How a process came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process exited (or died from a signal) on its own.
    Exited,
    /// The process exceeded its timeout and was killed.
    TimedOut,
    /// Cancellation was requested; the process was killed or never started.
    Cancelled,
}

/// Captured result of a process run.
#[derive(Debug)]
pub struct ProcessOutcome {
    /// The exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
    /// How the process ended.
    pub termination: Termination,
    /// Wall-clock time from spawn to reap.
    pub duration: Duration,
}

impl ProcessOutcome {
    /// Whether the process exited on its own with status 0.
    pub fn success(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == Some(0)
    }

    fn not_started() -> Self {
        Self {
            exit_code: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            termination: Termination::Cancelled,
            duration: Duration::ZERO,
        }
    }
}

/// Run `request` to completion, honoring its timeout and `cancel`.
///
/// The child runs in its own process group so that a timeout or cancellation
/// reaches every process it spawned: the group receives SIGTERM, then SIGKILL
/// once `kill_grace` has elapsed. If `cancel` is already set, nothing is
/// launched.
///
/// # Errors
/// Returns an error if the process cannot be spawned or waited on. A non-zero
/// exit code is **not** an error; check [`ProcessOutcome::success`] instead.
pub fn run_process(request: &ProcessRequest, cancel: &CancelToken) -> Result<ProcessOutcome, UtilError> {
    if cancel.is_cancelled() {
        return Ok(ProcessOutcome::not_started());
    }

    let program = request.program.display().to_string();
    let exec_err = |source| UtilError::CommandExec {
        program: program.clone(),
        source,
    };

    let mut cmd = Command::new(&request.program);
    cmd.args(&request.args)
        .env_clear()
        .envs(&request.env)
        .current_dir(&request.cwd)
        .stdin(if request.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(exec_err)?;
    tracing::debug!(program = %program, pid = child.id(), "spawned process");

    let stdin_writer = match (child.stdin.take(), request.stdin.clone()) {
        (Some(mut pipe), Some(bytes)) => Some(std::thread::spawn(move || {
            // The child may exit without reading; a broken pipe is not an error.
            let _ = pipe.write_all(&bytes);
        })),
        _ => None,
    };
    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let (status, termination) = loop {
        if let Some(status) = child.try_wait().map_err(exec_err)? {
            break (status, Termination::Exited);
        }
        if cancel.is_cancelled() {
            tracing::debug!(program = %program, "cancelling process");
            break (terminate(&mut child, request.kill_grace).map_err(exec_err)?, Termination::Cancelled);
        }
        if request.timeout.is_some_and(|limit| started.elapsed() >= limit) {
            tracing::debug!(program = %program, "process timed out");
            break (terminate(&mut child, request.kill_grace).map_err(exec_err)?, Termination::TimedOut);
        }
        std::thread::sleep(POLL_INTERVAL);
    };
    let duration = started.elapsed();

    if let Some(handle) = stdin_writer {
        let _ = handle.join();
    }
    let stdout = join_reader(stdout_reader);
    let stderr = join_reader(stderr_reader);

    Ok(ProcessOutcome {
        exit_code: status.code(),
        stdout,
        stderr,
        termination,
        duration,
    })
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Stop `child` and its process group: SIGTERM, wait up to `grace`, SIGKILL.
fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    signal_group(child, false);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait()? {
            // The leader is gone; make sure no stragglers keep the pipes open.
            signal_group(child, true);
            return Ok(status);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    signal_group(child, true);
    child.wait()
}

#[cfg(unix)]
fn signal_group(child: &mut Child, force: bool) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(e) = killpg(Pid::from_raw(raw), signal) {
        // ESRCH: the group has already exited.
        tracing::trace!(pid = raw, error = %e, "killpg failed");
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _force: bool) {
    let _ = child.kill();
}

/// Name of this host, for cache provenance.
#[cfg(unix)]
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_owned())
}

/// Name of this host, for cache provenance.
#[cfg(not(unix))]
pub fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_owned())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessRequest {
        let mut env = BTreeMap::new();
        env.insert(
            "PATH".to_owned(),
            std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_owned()),
        );
        ProcessRequest {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_owned(), script.to_owned()],
            env,
            cwd: std::env::temp_dir(),
            stdin: None,
            timeout: None,
            kill_grace: Duration::from_millis(200),
        }
    }

    #[test]
    fn captures_stdout_and_exit_code() {
        let out = run_process(&sh("echo hello"), &CancelToken::new()).unwrap();
        assert!(out.success());
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "hello");
        assert_eq!(out.exit_code, Some(0));
    }

    #[test]
    fn non_zero_exit_is_not_an_error() {
        let out = run_process(&sh("echo err >&2; exit 3"), &CancelToken::new()).unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.termination, Termination::Exited);
        assert!(String::from_utf8_lossy(&out.stderr).contains("err"));
    }

    #[test]
    fn missing_binary_is_an_error() {
        let mut req = sh("");
        req.program = PathBuf::from("nonexistent_binary_xyz_123");
        assert!(run_process(&req, &CancelToken::new()).is_err());
    }

    #[test]
    fn environment_is_not_inherited() {
        std::env::set_var("KILN_PROCESS_TEST_LEAK", "1");
        let out = run_process(
            &sh("echo \"leak=${KILN_PROCESS_TEST_LEAK:-none}\""),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "leak=none");
    }

    #[test]
    fn stdin_is_piped() {
        let mut req = sh("cat");
        req.stdin = Some(b"from stdin".to_vec());
        let out = run_process(&req, &CancelToken::new()).unwrap();
        assert_eq!(out.stdout, b"from stdin");
    }

    #[test]
    fn timeout_kills_process() {
        let mut req = sh("sleep 30");
        req.timeout = Some(Duration::from_millis(100));
        let started = Instant::now();
        let out = run_process(&req, &CancelToken::new()).unwrap();
        assert_eq!(out.termination, Termination::TimedOut);
        assert!(!out.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn sigterm_ignoring_child_is_killed_after_grace() {
        let mut req = sh("trap '' TERM; sleep 30");
        req.timeout = Some(Duration::from_millis(100));
        req.kill_grace = Duration::from_millis(100);
        let started = Instant::now();
        let out = run_process(&req, &CancelToken::new()).unwrap();
        assert_eq!(out.termination, Termination::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn cancel_before_launch_starts_nothing() {
        let token = CancelToken::new();
        token.cancel();
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let out = run_process(&sh(&format!("touch {}", marker.display())), &token).unwrap();
        assert_eq!(out.termination, Termination::Cancelled);
        assert!(!marker.exists());
    }

    #[test]
    fn cancel_during_run_kills_process() {
        let token = CancelToken::new();
        let trigger = token.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });
        let started = Instant::now();
        let out = run_process(&sh("sleep 30"), &token).unwrap();
        canceller.join().unwrap();
        assert_eq!(out.termination, Termination::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn hostname_is_not_empty() {
        assert!(!hostname().is_empty());
    }
}
