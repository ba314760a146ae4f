//! Firewall command execution.
//!
//! The synchronizer never talks to `tokio::process` directly. It goes through
//! [`CommandRunner`], which spawns a command and hands back its standard
//! output as a stream together with a future resolving when the command
//! exits. Tests substitute a scripted runner.

use crate::error::RedirectError;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use tokio::io::AsyncRead;

/// Standard output of a spawned command
pub type CommandOutput = Box<dyn AsyncRead + Send + Unpin>;

/// Resolves when the command has exited; errors if waiting fails or the exit
/// status is unsuccessful
pub type CommandCompletion = Pin<Box<dyn Future<Output = Result<(), RedirectError>> + Send>>;

/// A running command
pub struct RunningCommand {
    /// Streamed standard output
    pub stdout: CommandOutput,
    /// Exit of the command
    pub completion: CommandCompletion,
}

/// Runs firewall commands
pub trait CommandRunner: Send + Sync {
    /// Spawn `program` with `args`
    ///
    /// # Errors
    ///
    /// Returns `RedirectError::Spawn` if the command cannot be started.
    fn spawn(&self, program: &str, args: &[String]) -> Result<RunningCommand, RedirectError>;
}

/// Run a command to completion, discarding its output
///
/// Output is drained while waiting so the command cannot block on a full
/// pipe.
///
/// # Errors
///
/// Returns the spawn, wait or exit status error of the command.
pub async fn run(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[String],
) -> Result<(), RedirectError> {
    let RunningCommand {
        mut stdout,
        completion,
    } = runner.spawn(program, args)?;

    let mut sink = tokio::io::sink();
    let drain = tokio::io::copy(&mut stdout, &mut sink);
    let (drained, completed) = tokio::join!(drain, completion);
    if let Err(e) = drained {
        tracing::debug!("Discarding unreadable output of {}: {}", program, e);
    }
    completed
}

/// Runs commands as child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn spawn(&self, program: &str, args: &[String]) -> Result<RunningCommand, RedirectError> {
        tracing::debug!("Run {} {}", program, args.join(" "));

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RedirectError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let stdout: CommandOutput = match child.stdout.take() {
            Some(stdout) => Box::new(stdout),
            None => Box::new(tokio::io::empty()),
        };

        let program = program.to_string();
        let joined = args.join(" ");
        let completion: CommandCompletion = Box::pin(async move {
            let status = child.wait().await.map_err(|source| RedirectError::Wait {
                program: program.clone(),
                source,
            })?;
            if status.success() {
                Ok(())
            } else {
                Err(RedirectError::CommandFailed {
                    program,
                    args: joined,
                    status: status.to_string(),
                })
            }
        });

        Ok(RunningCommand { stdout, completion })
    }
}
