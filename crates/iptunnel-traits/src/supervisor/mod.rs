use thiserror::Error;

use crate::process::ProcessError;

pub const CONNECTED_MESSAGE: &str = "Connected successfully";
pub const DISCONNECTED_MESSAGE: &str = "Disconnected successfully";

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("SSH command is empty")]
    InvalidCommand,
    #[error("Already connected. Disconnect first.")]
    AlreadyConnected,
    #[error("Not connected")]
    NotConnected,
    #[error("Connection error: {0}")]
    Launch(#[from] ProcessError),
    #[error("Connection failed: {0}")]
    EarlyExit(String),
    #[error("Disconnected: {0}")]
    RuntimeLoss(String),
    #[error("Monitor error: {0}")]
    Monitor(#[source] ProcessError),
    #[error("Disconnect error: {0}")]
    Termination(#[source] ProcessError),
}

impl SupervisorError {
    /// The text kept as the last error: the process output for early exits
    /// and lost connections, the full message otherwise.
    pub fn detail(&self) -> String {
        match self {
            Self::EarlyExit(detail) | Self::RuntimeLoss(detail) => detail.clone(),
            other => other.to_string(),
        }
    }
}
