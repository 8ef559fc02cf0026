use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// A connection status change, pushed from the supervisor to its observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub connected: bool,
    pub message: String,
}

impl StatusEvent {
    pub fn new(connected: bool, message: impl Into<String>) -> Self {
        Self {
            connected,
            message: message.into(),
        }
    }
}

pub type ObserverResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Receives status events. Errors returned here are logged by the notifier
/// and never reach the supervisor.
pub trait StatusObserver: Send + Sync {
    fn on_status(&self, event: &StatusEvent) -> ObserverResult;
}

impl<F> StatusObserver for F
where
    F: Fn(&StatusEvent) -> ObserverResult + Send + Sync,
{
    fn on_status(&self, event: &StatusEvent) -> ObserverResult {
        self(event)
    }
}
