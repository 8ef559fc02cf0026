use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("'{0}' was not found. Is it installed and on PATH?")]
    NotFound(String),
    #[error("Could not parse command line: {0}")]
    Parse(String),
    #[error("Failed to start process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Failed to query process status: {0}")]
    Wait(#[source] std::io::Error),
    #[error("Failed to signal process: {0}")]
    Signal(String),
}

/// Output captured from a child's stdout and stderr pipes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn is_empty(&self) -> bool {
        self.stdout.trim().is_empty() && self.stderr.trim().is_empty()
    }

    /// Picks the text that best explains why a process stopped: stderr first,
    /// then stdout, then `fallback`.
    pub fn summary_or(&self, fallback: &str) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        fallback.to_string()
    }
}

/// A running external process whose output is captured.
///
/// Implementations own the OS-level resources (process handle, pipe
/// descriptors) and must release them exactly once, either in `terminate` or
/// when the process is dropped after a natural exit.
#[async_trait]
pub trait ProcessHandle: Send {
    /// The OS process id, while the process has not been reaped.
    fn id(&self) -> Option<u32>;

    /// Non-blocking liveness probe.
    fn poll_alive(&mut self) -> Result<bool, ProcessError>;

    /// Like `poll_alive`, treating a failed probe as "not alive".
    fn is_alive(&mut self) -> bool {
        self.poll_alive().unwrap_or(false)
    }

    /// Exit code once the process has exited and been reaped.
    fn exit_code(&self) -> Option<i32>;

    /// Drains whatever output has been buffered so far. Never blocks.
    fn read_captured_output(&mut self) -> CapturedOutput;

    /// Waits up to `timeout` for the output pipes to reach end-of-file if the
    /// process has exited, then drains the buffers.
    async fn drain_output(&mut self, timeout: Duration) -> CapturedOutput;

    /// Asks the process to stop, force-kills it once `grace` has elapsed and
    /// waits for the final exit.
    async fn terminate(&mut self, grace: Duration) -> Result<(), ProcessError>;
}

/// Starts processes from a full command line.
pub trait ProcessLauncher: Send + Sync + 'static {
    type Handle: ProcessHandle + 'static;

    fn start(&self, command_line: &str) -> Result<Self::Handle, ProcessError>;
}
