//! Process runner
//!
//! Starts one [`Step`] detached from the runner's session, merges its stdout
//! and stderr into one buffer and supervises it until it exits, times out or
//! the job is cancelled. Timeouts and cancellation kill the whole process
//! group, so tools that fork helpers do not outlive the job.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::JobPaths;
use crate::family::{CommandPlan, Environment, Step};

/// How long output readers may take to drain once the process is gone
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
#[cfg(windows)]
const DETACHED_PROCESS: u32 = 0x0000_0008;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("unable to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exited(ExitStatus),
    /// Killed after running longer than the given duration
    TimedOut(Duration),
    /// Killed because the job was cancelled
    Cancelled,
    /// The exit status could not be collected
    WaitFailed(String),
}

impl ProcessOutcome {
    fn from_wait(status: std::io::Result<ExitStatus>) -> Self {
        match status {
            Ok(status) => Self::Exited(status),
            Err(e) => Self::WaitFailed(e.to_string()),
        }
    }
}

/// Result of a finished process
#[derive(Debug)]
pub struct ProcessOutput {
    pub outcome: ProcessOutcome,
    /// Merged stdout and stderr
    pub stdout: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        matches!(self.outcome, ProcessOutcome::Exited(status) if status.success())
    }

    /// Failure text recorded as the job explanation, `None` on success
    pub fn explanation(&self) -> Option<String> {
        match &self.outcome {
            ProcessOutcome::Exited(status) if status.success() => None,
            ProcessOutcome::Exited(status) => Some(exit_explanation(*status)),
            ProcessOutcome::TimedOut(timeout) => Some(format!(
                "signal: killed (timed out after {}s)",
                timeout.as_secs()
            )),
            ProcessOutcome::Cancelled => Some("signal: killed (job cancelled)".to_string()),
            ProcessOutcome::WaitFailed(error) => Some(format!("wait: {}", error)),
        }
    }
}

fn exit_explanation(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit status {}", code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal: {}", signal);
        }
    }

    status.to_string()
}

/// Runs `step` in `cwd` with exactly `env` as its environment
///
/// Errors are only returned when the process could not be started. A non-zero
/// exit, a timeout, a cancellation or a failed wait is a normal outcome and
/// keeps whatever output was captured.
pub async fn run_step(
    step: &Step,
    env: &Environment,
    cwd: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ProcessOutput, ProcessError> {
    let mut command = Command::new(&step.program);
    command
        .args(step.invocation_args())
        .current_dir(cwd)
        .env_clear()
        .envs(env.iter())
        .stdin(if step.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    detach(&mut command);

    debug!("Spawning {:?} in {}", step.audit_args(), cwd.display());
    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: step.program.clone(),
        source,
    })?;
    let pid = child.id();

    if let (Some(input), Some(mut stdin)) = (&step.stdin, child.stdin.take()) {
        if let Err(e) = stdin.write_all(input.expose().as_bytes()).await {
            warn!("Unable to write stdin of {}: {}", step.program, e);
        }
        // dropping the handle closes the pipe
        drop(stdin);
    }

    let buffer = Arc::new(Mutex::new(Vec::new()));
    let readers = [
        spawn_reader(child.stdout.take(), Arc::clone(&buffer)),
        spawn_reader(child.stderr.take(), Arc::clone(&buffer)),
    ];

    let outcome = tokio::select! {
        status = child.wait() => {
            let outcome = ProcessOutcome::from_wait(status);
            if let ProcessOutcome::WaitFailed(error) = &outcome {
                warn!("Unable to wait for {} (pid {:?}): {}, killing", step.program, pid, error);
                kill_tree(&mut child, pid).await;
            }
            outcome
        }
        _ = tokio::time::sleep(timeout) => {
            info!("{} (pid {:?}) timed out after {:?}, killing", step.program, pid, timeout);
            kill_tree(&mut child, pid).await;
            ProcessOutcome::TimedOut(timeout)
        }
        _ = cancel.cancelled() => {
            info!("{} (pid {:?}) cancelled, killing", step.program, pid);
            kill_tree(&mut child, pid).await;
            ProcessOutcome::Cancelled
        }
    };

    for mut reader in readers {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader)
            .await
            .is_err()
        {
            warn!("Output of {} did not close, dropping the rest", step.program);
            reader.abort();
        }
    }

    let stdout = {
        let bytes = buffer.lock().unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    };

    Ok(ProcessOutput { outcome, stdout })
}

fn spawn_reader<R>(reader: Option<R>, buffer: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return;
        };

        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => buffer.lock().unwrap().extend_from_slice(&chunk[..n]),
                Err(e) => {
                    debug!("Output reader stopped: {}", e);
                    break;
                }
            }
        }
    })
}

/// Puts the child in its own session so it has no controlling terminal
#[cfg(unix)]
fn detach(command: &mut Command) {
    // SAFETY: only async-signal-safe calls between fork and exec
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(windows)]
fn detach(command: &mut Command) {
    command.creation_flags(CREATE_NEW_PROCESS_GROUP | DETACHED_PROCESS);
}

/// Kills the process group led by the child, then the child itself
async fn kill_tree(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) {
        // SAFETY: kill(2) has no memory safety requirements
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Err(e) = child.kill().await {
        debug!("Kill after group kill failed: {}", e);
    }
}

/// Wraps every step of `plan` in proot
///
/// The job scratch directories are bound over the system locations the tools
/// write to, so concurrent jobs never see each other's files.
pub fn sandbox(plan: CommandPlan, paths: &JobPaths, config: &Config, project_root: &Path) -> CommandPlan {
    let bind = |from: &Path, to: &Path| format!("{}:{}", from.display(), to.display());
    let same = |path: &Path| bind(path, path);

    let args = vec![
        "-v".to_string(),
        "0".to_string(),
        "-r".to_string(),
        "/".to_string(),
        "-b".to_string(),
        bind(&paths.etc, Path::new("/etc/keel")),
        "-b".to_string(),
        bind(&paths.tmp, Path::new("/tmp")),
        "-b".to_string(),
        bind(&paths.var_lib, Path::new("/var/lib/keel")),
        "-b".to_string(),
        bind(&paths.job_status, Path::new("/var/lib/keel/job_status")),
        "-b".to_string(),
        bind(&paths.projects, &config.projects_home),
        "-b".to_string(),
        bind(&paths.var_log, Path::new("/var/log")),
        "-b".to_string(),
        same(&paths.tmp_rand),
        "-b".to_string(),
        same(&paths.credentials),
        "-b".to_string(),
        same(project_root),
        "-b".to_string(),
        same(&config.data_dir),
        "-w".to_string(),
        plan.working_dir.display().to_string(),
    ];

    plan.map_steps(|step| step.wrapped("proot", args.clone()))
}
