//! Subprocess execution
//!
//! Argv execution for internal tooling (git) and `/bin/sh -c` execution for
//! the user-supplied recipe command. Every run has a working directory, a
//! deadline and captured streams, and observes the shutdown token. On
//! deadline or cancellation the child gets SIGTERM, then SIGKILL after a
//! grace period.

use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::errors::AgentError;
use crate::shutdown::ShutdownToken;

const KILL_GRACE: Duration = Duration::from_secs(5);

/// Captured output of a finished subprocess
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run a program with arguments, returning trimmed stdout.
pub async fn exec_command(
    program_and_args: &[&str],
    cwd: &Path,
    deadline: Duration,
    shutdown: &ShutdownToken,
) -> Result<String, AgentError> {
    let (program, args) = program_and_args.split_first().ok_or_else(|| {
        AgentError::CmdLine {
            program: String::new(),
            detail: "empty command".to_string(),
        }
    })?;

    let mut command = Command::new(program);
    command.args(args).current_dir(cwd);
    let output = run_child(command, program, deadline, shutdown).await?;
    Ok(output.stdout.trim_end_matches('\n').to_string())
}

/// Run a user-supplied command through `/bin/sh -c`.
///
/// The command string is passed to the shell verbatim; it may contain pipes
/// and `cd`. Nothing is ever interpolated into it.
pub async fn shell_command(
    cmd: &str,
    cwd: &Path,
    env: &HashMap<String, String>,
    deadline: Duration,
    shutdown: &ShutdownToken,
) -> Result<CmdOutput, AgentError> {
    let mut command = Command::new("/bin/sh");
    command.arg("-c").arg(cmd).current_dir(cwd);
    for (key, value) in env {
        command.env(key, value);
    }
    run_child(command, cmd, deadline, shutdown).await
}

enum RunOutcome {
    Done(std::io::Result<(ExitStatus, Vec<u8>, Vec<u8>)>),
    TimedOut,
    Cancelled,
}

async fn run_child(
    mut command: Command,
    label: &str,
    deadline: Duration,
    shutdown: &ShutdownToken,
) -> Result<CmdOutput, AgentError> {
    if shutdown.is_cancelled() {
        return Err(AgentError::Cancelled);
    }

    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    debug!("running command: {}", label);

    let mut child = command.spawn().map_err(|e| AgentError::CmdLine {
        program: label.to_string(),
        detail: format!("failed to spawn: {}", e),
    })?;

    let mut stdout_pipe = child.stdout.take().ok_or_else(|| AgentError::CmdLine {
        program: label.to_string(),
        detail: "stdout not captured".to_string(),
    })?;
    let mut stderr_pipe = child.stderr.take().ok_or_else(|| AgentError::CmdLine {
        program: label.to_string(),
        detail: "stderr not captured".to_string(),
    })?;

    let outcome = {
        let collect = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let (out_res, err_res) = tokio::join!(
                stdout_pipe.read_to_end(&mut stdout),
                stderr_pipe.read_to_end(&mut stderr)
            );
            out_res?;
            err_res?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, stdout, stderr))
        };
        tokio::select! {
            result = tokio::time::timeout(deadline, collect) => match result {
                Ok(inner) => RunOutcome::Done(inner),
                Err(_) => RunOutcome::TimedOut,
            },
            _ = shutdown.cancelled() => RunOutcome::Cancelled,
        }
    };

    match outcome {
        RunOutcome::Done(result) => {
            let (status, stdout, stderr) = result.map_err(|e| AgentError::CmdLine {
                program: label.to_string(),
                detail: e.to_string(),
            })?;
            let stdout = String::from_utf8_lossy(&stdout).into_owned();
            let stderr = String::from_utf8_lossy(&stderr).into_owned();
            debug!("command exited with {:?}", status.code());
            if !status.success() {
                return Err(AgentError::CmdLine {
                    program: label.to_string(),
                    detail: if stderr.is_empty() {
                        format!("exit status {:?}", status.code())
                    } else {
                        stderr
                    },
                });
            }
            Ok(CmdOutput { stdout, stderr })
        }
        RunOutcome::TimedOut => {
            warn!("command '{}' exceeded its {}s deadline", label, deadline.as_secs());
            terminate(&mut child).await;
            Err(AgentError::CmdTimeout {
                program: label.to_string(),
            })
        }
        RunOutcome::Cancelled => {
            terminate(&mut child).await;
            Err(AgentError::Cancelled)
        }
    }
}

/// SIGTERM, then SIGKILL after the grace period.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = Command::new("kill").arg(pid.to_string()).status().await;
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}
