//! External tool invocation
//!
//! Media tools run as child processes through [`CommandRunner`] so engines can
//! be exercised against a scripted runner in tests.

use async_trait::async_trait;
use std::ffi::OsString;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Captured output of a finished process. The streams are kept apart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// stdout followed by stderr.
    pub fn combined(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.stdout.len() + self.stderr.len());
        out.extend_from_slice(&self.stdout);
        out.extend_from_slice(&self.stderr);
        out
    }

    /// Last few hundred bytes of the combined output, for error messages.
    pub fn tail(&self) -> String {
        const TAIL_BYTES: usize = 512;
        let combined = self.combined();
        let start = combined.len().saturating_sub(TAIL_BYTES);
        String::from_utf8_lossy(&combined[start..]).trim().to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with status {}: {}", describe_status(.status), .output.tail())]
    Failed {
        program: String,
        /// Exit code, `None` when terminated by a signal.
        status: Option<i32>,
        output: CommandOutput,
    },

    #[error("{program} was cancelled")]
    Cancelled { program: String },
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` to completion, killing it if `cancel` fires first.
    async fn run(
        &self,
        program: &str,
        args: &[OsString],
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError>;
}

/// Runs real child processes with `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    #[tracing::instrument(skip(self, args, cancel), fields(process.executable.name = %program))]
    async fn run(
        &self,
        program: &str,
        args: &[OsString],
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError> {
        let start = std::time::Instant::now();

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?;

        // Dropping the wait future on cancel drops the child, which kills it.
        let output = tokio::select! {
            result = child.wait_with_output() => result.map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?,
            _ = cancel.cancelled() => {
                tracing::warn!(program = %program, "Command cancelled, child process killed");
                return Err(CommandError::Cancelled {
                    program: program.to_string(),
                });
            }
        };

        let captured = CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
        };

        tracing::debug!(
            program = %program,
            duration_ms = start.elapsed().as_millis() as u64,
            success = output.status.success(),
            "Command finished"
        );

        if !output.status.success() {
            return Err(CommandError::Failed {
                program: program.to_string(),
                status: output.status.code(),
                output: captured,
            });
        }

        Ok(captured)
    }
}
