//! Supervision of the external SSH tunnel process.
//!
//! [`ConnectionSupervisor`] owns at most one running tunnel, checks that it
//! survives its first second, and watches it in the background until the user
//! disconnects or the process dies. Status changes go out through a
//! [`StatusNotifier`].

mod command;
mod notifier;
mod process;
mod supervisor;

pub use command::split_command_line;
pub use notifier::StatusNotifier;
pub use process::{TokioLauncher, TokioProcess};
pub use supervisor::{ConnectionSupervisor, SupervisorTimings};

pub use iptunnel_traits::process::{CapturedOutput, ProcessError, ProcessHandle, ProcessLauncher};
pub use iptunnel_traits::status::{ConnectionState, ObserverResult, StatusEvent, StatusObserver};
pub use iptunnel_traits::supervisor::SupervisorError;
