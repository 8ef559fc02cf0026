//! End-to-end supervisor behaviour against real child processes.
#![cfg(unix)]

use std::time::Duration;

use iptunnel_ssh::{
    ConnectionState, ConnectionSupervisor, StatusEvent, SupervisorError, SupervisorTimings,
    TokioLauncher,
};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::sync::mpsc::Receiver;

fn timings() -> SupervisorTimings {
    SupervisorTimings {
        startup_grace: Duration::from_millis(200),
        watchdog_interval: Duration::from_millis(200),
        termination_grace: Duration::from_secs(1),
        output_drain: Duration::from_millis(500),
    }
}

fn supervisor() -> (ConnectionSupervisor, Receiver<StatusEvent>) {
    let supervisor = ConnectionSupervisor::with_launcher(TokioLauncher, timings());
    let events = supervisor.subscribe(16);
    (supervisor, events)
}

async fn next_event(events: &mut Receiver<StatusEvent>) -> StatusEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for a status event")
        .expect("status channel closed")
}

async fn assert_quiet(events: &mut Receiver<StatusEvent>) {
    tokio::time::sleep(timings().watchdog_interval * 3).await;
    assert!(events.try_recv().is_err(), "unexpected extra status event");
}

fn pid_exists(pid: u32) -> bool {
    !matches!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH))
}

#[tokio::test]
async fn test_successful_connect() {
    let (supervisor, mut events) = supervisor();

    let message = supervisor.connect("sleep 30").await.unwrap();
    assert_eq!(message, "Connected successfully");
    assert_eq!(supervisor.state(), ConnectionState::Connected);
    assert!(supervisor.is_process_running().await);
    assert!(supervisor.uptime() >= timings().startup_grace);
    assert_eq!(next_event(&mut events).await, StatusEvent::new(true, "Connected"));

    supervisor.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_early_death_reports_stderr() {
    let (supervisor, mut events) = supervisor();

    let err = supervisor
        .connect("sh -c 'echo boom >&2; exit 1'")
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::EarlyExit(_)));
    assert_eq!(err.to_string(), "Connection failed: boom");
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    assert_eq!(supervisor.process_id(), None);

    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn test_missing_executable() {
    let (supervisor, mut events) = supervisor();

    let err = supervisor
        .connect("iptunnel-missing-ssh -N host")
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::Launch(_)));
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_runtime_loss_after_external_kill() {
    let (supervisor, mut events) = supervisor();
    supervisor.connect("sleep 30").await.unwrap();
    next_event(&mut events).await;

    let pid = supervisor.process_id().expect("connected process has a PID");
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();

    let event = next_event(&mut events).await;
    assert_eq!(event, StatusEvent::new(false, "Disconnected: Connection lost"));
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    assert_eq!(supervisor.status(), (false, "Connection lost".to_string()));

    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn test_runtime_loss_carries_output() {
    let (supervisor, mut events) = supervisor();
    supervisor
        .connect("sh -c 'sleep 0.5; echo remote host closed >&2; exit 255'")
        .await
        .unwrap();
    next_event(&mut events).await;

    let event = next_event(&mut events).await;
    assert!(!event.connected);
    assert_eq!(event.message, "Disconnected: remote host closed");
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn test_abandoned_connect_can_be_retried() {
    let (supervisor, mut events) = supervisor();

    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), supervisor.connect("sleep 30")).await;
    assert!(abandoned.is_err());
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);

    supervisor.connect("sleep 30").await.unwrap();
    assert_eq!(next_event(&mut events).await, StatusEvent::new(true, "Connected"));
    supervisor.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_graceful_disconnect_releases_process() {
    let (supervisor, mut events) = supervisor();
    supervisor.connect("sleep 30").await.unwrap();
    next_event(&mut events).await;
    let pid = supervisor.process_id().unwrap();

    let message = supervisor.disconnect().await.unwrap();
    assert_eq!(message, "Disconnected successfully");
    assert!(!supervisor.is_process_running().await);
    assert!(!pid_exists(pid));
    assert_eq!(
        next_event(&mut events).await,
        StatusEvent::new(false, "Disconnected from server")
    );

    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn test_double_disconnect() {
    let (supervisor, mut events) = supervisor();
    supervisor.connect("sleep 30").await.unwrap();
    next_event(&mut events).await;

    let first = supervisor.disconnect().await;
    let second = supervisor.disconnect().await;
    assert!(first.is_ok());
    assert!(matches!(second, Err(SupervisorError::NotConnected)));

    next_event(&mut events).await;
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn test_reconnect_after_loss() {
    let (supervisor, mut events) = supervisor();
    supervisor.connect("sleep 0.4").await.unwrap();
    next_event(&mut events).await;
    assert!(!next_event(&mut events).await.connected);

    supervisor.connect("sleep 30").await.unwrap();
    assert_eq!(next_event(&mut events).await, StatusEvent::new(true, "Connected"));
    supervisor.disconnect().await.unwrap();
}
