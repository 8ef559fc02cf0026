use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use iptunnel_traits::process::{CapturedOutput, ProcessError, ProcessHandle, ProcessLauncher};

/// Upper bound per stream; older output is discarded first.
const MAX_CAPTURED_BYTES: usize = 64 * 1024;

/// How long `terminate` waits for the pipe readers after the final exit.
const TERMINATE_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Launches tunnel commands as `tokio` child processes.
///
/// On Windows the line is handed to PowerShell, so anything that works in a
/// PowerShell prompt works here. Elsewhere it is split into words and the
/// first word is executed directly.
#[derive(Debug, Clone, Default)]
pub struct TokioLauncher;

impl TokioLauncher {
    #[cfg(windows)]
    fn build_command(command_line: &str) -> Result<(String, Command), ProcessError> {
        let program = "powershell.exe".to_string();
        let mut cmd = Command::new(&program);
        cmd.arg("-NoProfile")
            .arg("-NonInteractive")
            .arg("-Command")
            .arg(command_line)
            .creation_flags(CREATE_NO_WINDOW);
        Ok((program, cmd))
    }

    #[cfg(not(windows))]
    fn build_command(command_line: &str) -> Result<(String, Command), ProcessError> {
        let words = crate::command::split_command_line(command_line)?;
        let (program, args) = words
            .split_first()
            .ok_or_else(|| ProcessError::Parse("command line is empty".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok((program.clone(), cmd))
    }
}

impl ProcessLauncher for TokioLauncher {
    type Handle = TokioProcess;

    fn start(&self, command_line: &str) -> Result<TokioProcess, ProcessError> {
        let (program, mut cmd) = Self::build_command(command_line)?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!("Spawning tunnel command: {}", command_line);

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::NotFound(program)
            } else {
                ProcessError::Spawn(e)
            }
        })?;

        Ok(TokioProcess::new(child))
    }
}

/// A running tunnel process with its stdout and stderr captured in memory.
pub struct TokioProcess {
    child: Child,
    pid: Option<u32>,
    exit_status: Option<ExitStatus>,
    output: Arc<Mutex<CapturedOutput>>,
    readers: Vec<JoinHandle<()>>,
    // Held so the child's stdin stays open for the lifetime of the tunnel.
    _stdin: Option<ChildStdin>,
}

impl TokioProcess {
    fn new(mut child: Child) -> Self {
        let pid = child.id();
        debug!("Tunnel process started with PID {:?}", pid);

        let output = Arc::new(Mutex::new(CapturedOutput::default()));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(stdout, Stream::Stdout, output.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(stderr, Stream::Stderr, output.clone())));
        }
        let stdin = child.stdin.take();

        Self {
            child,
            pid,
            exit_status: None,
            output,
            readers,
            _stdin: stdin,
        }
    }

    async fn join_readers(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        for reader in std::mem::take(&mut self.readers) {
            if tokio::time::timeout_at(deadline, reader).await.is_err() {
                debug!("Output pipes still open after {:?}, draining what we have", timeout);
                break;
            }
        }
    }

    #[cfg(unix)]
    fn request_stop(&mut self) -> Result<(), ProcessError> {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let pid = i32::try_from(pid)
            .map_err(|_| ProcessError::Signal(format!("PID {} is out of range", pid)))?;
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ProcessError::Signal(e.to_string())),
        }
    }

    // Windows has no graceful signal for a console-less child.
    #[cfg(not(unix))]
    fn request_stop(&mut self) -> Result<(), ProcessError> {
        self.child
            .start_kill()
            .map_err(|e| ProcessError::Signal(e.to_string()))
    }
}

#[async_trait]
impl ProcessHandle for TokioProcess {
    fn id(&self) -> Option<u32> {
        if self.exit_status.is_some() {
            None
        } else {
            self.pid
        }
    }

    fn poll_alive(&mut self) -> Result<bool, ProcessError> {
        if self.exit_status.is_some() {
            return Ok(false);
        }
        match self.child.try_wait().map_err(ProcessError::Wait)? {
            Some(status) => {
                info!("Tunnel process exited with status: {}", status);
                self.exit_status = Some(status);
                Ok(false)
            }
            None => Ok(true),
        }
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_status.and_then(|status| status.code())
    }

    fn read_captured_output(&mut self) -> CapturedOutput {
        std::mem::take(&mut *self.output.lock())
    }

    async fn drain_output(&mut self, timeout: Duration) -> CapturedOutput {
        if !self.is_alive() {
            self.join_readers(timeout).await;
        }
        self.read_captured_output()
    }

    async fn terminate(&mut self, grace: Duration) -> Result<(), ProcessError> {
        if !self.poll_alive()? {
            return Ok(());
        }

        info!("Stopping tunnel process (PID {:?})...", self.pid);
        self.request_stop()?;

        let waited = tokio::time::timeout(grace, self.child.wait()).await;
        let status = match waited {
            Ok(status) => status.map_err(ProcessError::Wait)?,
            Err(_) => {
                warn!("Tunnel process did not exit within {:?}, killing it", grace);
                if let Err(e) = self.child.kill().await {
                    error!("Failed to kill tunnel process: {}", e);
                    return Err(ProcessError::Signal(e.to_string()));
                }
                self.child.wait().await.map_err(ProcessError::Wait)?
            }
        };

        info!("Tunnel process stopped with status: {}", status);
        self.exit_status = Some(status);
        self.join_readers(TERMINATE_DRAIN_TIMEOUT).await;
        Ok(())
    }
}

/// Copies one pipe into the shared buffer, logging each line as it arrives.
async fn pump<R>(pipe: R, stream: Stream, output: Arc<Mutex<CapturedOutput>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                match stream {
                    Stream::Stdout => info!("[ssh] {}", text.trim_end()),
                    Stream::Stderr => warn!("[ssh] {}", text.trim_end()),
                }
                let mut output = output.lock();
                let buffer = match stream {
                    Stream::Stdout => &mut output.stdout,
                    Stream::Stderr => &mut output.stderr,
                };
                push_bounded(buffer, &text);
            }
            Err(e) => {
                debug!("Stopped reading {:?}: {}", stream, e);
                break;
            }
        }
    }
}

fn push_bounded(buffer: &mut String, text: &str) {
    buffer.push_str(text);
    if buffer.len() > MAX_CAPTURED_BYTES {
        let mut cut = buffer.len() - MAX_CAPTURED_BYTES;
        while !buffer.is_char_boundary(cut) {
            cut += 1;
        }
        buffer.drain(..cut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_bounded_keeps_tail() {
        let mut buffer = String::new();
        let chunk = "x".repeat(MAX_CAPTURED_BYTES - 2);
        push_bounded(&mut buffer, &chunk);
        push_bounded(&mut buffer, "tail\n");
        assert_eq!(buffer.len(), MAX_CAPTURED_BYTES);
        assert!(buffer.ends_with("tail\n"));
    }

    #[test]
    fn test_push_bounded_respects_char_boundaries() {
        let mut buffer = "é".repeat(MAX_CAPTURED_BYTES / 2);
        push_bounded(&mut buffer, "a");
        assert!(buffer.len() <= MAX_CAPTURED_BYTES);
        assert!(buffer.ends_with('a'));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_program() {
        let err = TokioLauncher
            .start("iptunnel-no-such-program --flag")
            .err()
            .expect("spawn should fail");
        assert!(matches!(err, ProcessError::NotFound(ref p) if p == "iptunnel-no-such-program"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unclosed_quote_is_a_parse_error() {
        let err = TokioLauncher.start("ssh 'host").err().expect("parse should fail");
        assert!(matches!(err, ProcessError::Parse(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_captures_output_of_exited_process() {
        let mut process = TokioLauncher
            .start("sh -c 'echo hello; echo boom >&2; exit 3'")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!process.is_alive());
        assert_eq!(process.exit_code(), Some(3));
        assert_eq!(process.id(), None);

        let output = process.drain_output(Duration::from_secs(1)).await;
        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.stderr, "boom\n");

        // Draining empties the buffers.
        assert!(process.read_captured_output().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_graceful() {
        let mut process = TokioLauncher.start("sleep 30").unwrap();
        assert!(process.is_alive());
        assert!(process.id().is_some());

        let started = std::time::Instant::now();
        process.terminate(Duration::from_secs(3)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!process.is_alive());
        // Killed by SIGTERM, so there is no exit code.
        assert_eq!(process.exit_code(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_forces_kill_after_grace() {
        let mut process = TokioLauncher
            .start("sh -c 'trap \"\" TERM; sleep 30'")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        process.terminate(Duration::from_millis(300)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(!process.is_alive());

        // A second terminate is a no-op.
        process.terminate(Duration::from_millis(300)).await.unwrap();
    }
}
