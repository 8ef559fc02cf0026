use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use iptunnel_traits::process::{ProcessHandle, ProcessLauncher};
use iptunnel_traits::status::{ConnectionState, StatusEvent, StatusObserver};
use iptunnel_traits::supervisor::{CONNECTED_MESSAGE, DISCONNECTED_MESSAGE, SupervisorError};

use crate::notifier::StatusNotifier;
use crate::process::TokioLauncher;

const EARLY_EXIT_FALLBACK: &str = "SSH process terminated immediately";
const CONNECTION_LOST: &str = "Connection lost";

/// Timing knobs of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorTimings {
    /// How long a fresh process must survive before it counts as connected.
    pub startup_grace: Duration,
    /// Interval between watchdog liveness checks.
    pub watchdog_interval: Duration,
    /// How long `disconnect` waits after the graceful signal before killing.
    pub termination_grace: Duration,
    /// How long to wait for trailing output once the process has died.
    pub output_drain: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(1),
            watchdog_interval: Duration::from_secs(2),
            termination_grace: Duration::from_secs(3),
            output_drain: Duration::from_millis(500),
        }
    }
}

struct Session<H> {
    id: u64,
    pid: Option<u32>,
    started_at: Instant,
    process: Arc<AsyncMutex<H>>,
    cancel: CancellationToken,
    watchdog: Option<JoinHandle<()>>,
}

struct Shared<H> {
    state: ConnectionState,
    session: Option<Session<H>>,
    last_error: Option<String>,
    sessions_started: u64,
}

/// Launches and supervises a single tunnel process.
///
/// All state transitions are decided under one lock, which is also what the
/// watchdog takes before reporting a lost connection. `connect` and
/// `disconnect` are additionally serialised against each other, so a
/// `disconnect` issued during the startup grace period waits for the outcome
/// of that `connect`.
pub struct ConnectionSupervisor<L: ProcessLauncher = TokioLauncher> {
    launcher: L,
    timings: SupervisorTimings,
    shared: Arc<Mutex<Shared<L::Handle>>>,
    notifier: Arc<StatusNotifier>,
    lifecycle: AsyncMutex<()>,
}

impl ConnectionSupervisor<TokioLauncher> {
    pub fn new() -> Self {
        Self::with_launcher(TokioLauncher, SupervisorTimings::default())
    }
}

impl Default for ConnectionSupervisor<TokioLauncher> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ProcessLauncher> ConnectionSupervisor<L> {
    pub fn with_launcher(launcher: L, timings: SupervisorTimings) -> Self {
        Self {
            launcher,
            timings,
            shared: Arc::new(Mutex::new(Shared {
                state: ConnectionState::Disconnected,
                session: None,
                last_error: None,
                sessions_started: 0,
            })),
            notifier: Arc::new(StatusNotifier::new()),
            lifecycle: AsyncMutex::new(()),
        }
    }

    pub fn set_observer<O>(&self, observer: O)
    where
        O: StatusObserver + 'static,
    {
        self.notifier.set_observer(observer);
    }

    /// Routes status events into a bounded channel.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<StatusEvent> {
        self.notifier.subscribe(capacity)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// `(true, "Connected")` while connected, otherwise `false` with the most
    /// recent failure, if any.
    pub fn status(&self) -> (bool, String) {
        let shared = self.shared.lock();
        match shared.state {
            ConnectionState::Connected => (true, "Connected".to_string()),
            ConnectionState::Connecting => (false, "Connecting".to_string()),
            ConnectionState::Disconnected => (
                false,
                shared
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "Disconnected".to_string()),
            ),
        }
    }

    /// Time since the current tunnel process was started.
    pub fn uptime(&self) -> Duration {
        let shared = self.shared.lock();
        match (&shared.state, &shared.session) {
            (ConnectionState::Connected, Some(session)) => session.started_at.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn process_id(&self) -> Option<u32> {
        self.shared.lock().session.as_ref().and_then(|s| s.pid)
    }

    pub async fn is_process_running(&self) -> bool {
        let process = self
            .shared
            .lock()
            .session
            .as_ref()
            .map(|s| s.process.clone());
        match process {
            Some(process) => process.lock().await.is_alive(),
            None => false,
        }
    }

    /// Starts the tunnel and waits out the startup grace period.
    pub async fn connect(&self, command_line: &str) -> Result<String, SupervisorError> {
        self.check_can_connect(command_line)?;

        let _lifecycle = self.lifecycle.lock().await;
        {
            let mut shared = self.shared.lock();
            if shared.state != ConnectionState::Disconnected {
                return Err(SupervisorError::AlreadyConnected);
            }
            shared.state = ConnectionState::Connecting;
        }
        let _connecting = ConnectingGuard {
            shared: &*self.shared,
        };

        let mut process = match self.launcher.start(command_line) {
            Ok(process) => process,
            Err(e) => {
                error!("Failed to launch tunnel: {}", e);
                let err = SupervisorError::Launch(e);
                self.revert_to_disconnected(&err);
                return Err(err);
            }
        };
        let started_at = Instant::now();
        let pid = process.id();

        tokio::time::sleep(self.timings.startup_grace).await;

        if !process.is_alive() {
            let output = process.drain_output(self.timings.output_drain).await;
            let err = SupervisorError::EarlyExit(output.summary_or(EARLY_EXIT_FALLBACK));
            warn!("Tunnel exited during startup: {}", err);
            self.revert_to_disconnected(&err);
            return Err(err);
        }

        let process = Arc::new(AsyncMutex::new(process));
        let cancel = CancellationToken::new();
        let session_id = {
            let mut shared = self.shared.lock();
            shared.sessions_started += 1;
            let id = shared.sessions_started;
            shared.state = ConnectionState::Connected;
            shared.last_error = None;
            shared.session = Some(Session {
                id,
                pid,
                started_at,
                process: process.clone(),
                cancel: cancel.clone(),
                watchdog: None,
            });
            id
        };

        info!("Tunnel connected (PID {:?})", pid);
        self.notifier.notify(true, "Connected");

        let watchdog = tokio::spawn(watch(
            session_id,
            process,
            cancel,
            self.shared.clone(),
            self.notifier.clone(),
            self.timings,
        ));
        {
            let mut shared = self.shared.lock();
            if let Some(session) = shared.session.as_mut().filter(|s| s.id == session_id) {
                session.watchdog = Some(watchdog);
            }
        }

        Ok(CONNECTED_MESSAGE.to_string())
    }

    /// Stops the watchdog, then terminates the tunnel process.
    pub async fn disconnect(&self) -> Result<String, SupervisorError> {
        if self.state() == ConnectionState::Disconnected {
            return Err(SupervisorError::NotConnected);
        }

        let _lifecycle = self.lifecycle.lock().await;
        let session = {
            let mut shared = self.shared.lock();
            if shared.state == ConnectionState::Disconnected {
                return Err(SupervisorError::NotConnected);
            }
            let Some(session) = shared.session.take() else {
                shared.state = ConnectionState::Disconnected;
                return Err(SupervisorError::NotConnected);
            };
            session.cancel.cancel();
            session
        };

        let Session {
            pid,
            process,
            watchdog,
            ..
        } = session;

        if let Some(watchdog) = watchdog {
            if let Err(e) = watchdog.await {
                error!("Watchdog task failed: {}", e);
            }
        }

        info!("Disconnecting tunnel (PID {:?})...", pid);
        let result = {
            let mut process = process.lock().await;
            process.terminate(self.timings.termination_grace).await
        };

        let outcome = result.map_err(SupervisorError::Termination);
        {
            let mut shared = self.shared.lock();
            shared.state = ConnectionState::Disconnected;
            shared.last_error = outcome.as_ref().err().map(SupervisorError::detail);
        }

        match outcome {
            Ok(()) => {
                info!("Tunnel disconnected");
                self.notifier.notify(false, "Disconnected from server");
                Ok(DISCONNECTED_MESSAGE.to_string())
            }
            Err(err) => {
                error!("{}", err);
                self.notifier.notify(false, &err.to_string());
                Err(err)
            }
        }
    }

    fn check_can_connect(&self, command_line: &str) -> Result<(), SupervisorError> {
        if self.state() != ConnectionState::Disconnected {
            return Err(SupervisorError::AlreadyConnected);
        }
        if command_line.trim().is_empty() {
            return Err(SupervisorError::InvalidCommand);
        }
        Ok(())
    }

    fn revert_to_disconnected(&self, err: &SupervisorError) {
        let mut shared = self.shared.lock();
        shared.state = ConnectionState::Disconnected;
        shared.last_error = Some(err.detail());
    }
}

/// Puts a supervisor left in `Connecting` back to `Disconnected` when a
/// `connect` future is dropped before it reaches an outcome.
struct ConnectingGuard<'a, H> {
    shared: &'a Mutex<Shared<H>>,
}

impl<H> Drop for ConnectingGuard<'_, H> {
    fn drop(&mut self) {
        let mut shared = self.shared.lock();
        if shared.state == ConnectionState::Connecting {
            debug!("Connect abandoned during startup");
            shared.state = ConnectionState::Disconnected;
        }
    }
}

impl<L: ProcessLauncher> Drop for ConnectionSupervisor<L> {
    fn drop(&mut self) {
        // Stopping the watchdog releases the last reference to the process,
        // whose handle kills it on drop.
        if let Some(session) = self.shared.lock().session.take() {
            debug!("Supervisor dropped while connected, stopping watchdog");
            session.cancel.cancel();
        }
    }
}

/// Watches one session until it is cancelled or its process dies.
async fn watch<H: ProcessHandle>(
    session_id: u64,
    process: Arc<AsyncMutex<H>>,
    cancel: CancellationToken,
    shared: Arc<Mutex<Shared<H>>>,
    notifier: Arc<StatusNotifier>,
    timings: SupervisorTimings,
) {
    debug!("Watchdog started for session {}", session_id);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Watchdog for session {} cancelled", session_id);
                return;
            }
            _ = tokio::time::sleep(timings.watchdog_interval) => {}
        }

        let err = {
            let mut handle = process.lock().await;
            match handle.poll_alive() {
                Ok(true) => continue,
                Ok(false) => SupervisorError::RuntimeLoss(
                    handle
                        .drain_output(timings.output_drain)
                        .await
                        .summary_or(CONNECTION_LOST),
                ),
                Err(e) => SupervisorError::Monitor(e),
            }
        };

        let claimed = {
            let mut shared = shared.lock();
            let current = shared.session.as_ref().is_some_and(|s| s.id == session_id);
            if current && !cancel.is_cancelled() {
                shared.session = None;
                shared.state = ConnectionState::Disconnected;
                shared.last_error = Some(err.detail());
                true
            } else {
                false
            }
        };

        if claimed {
            warn!("Tunnel lost: {}", err);
            notifier.notify(false, &err.to_string());
        } else {
            debug!("Watchdog for session {} lost the race to disconnect", session_id);
        }
        return;
    }
}
