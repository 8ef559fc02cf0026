use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Unknown log level '{0}'")]
    UnknownLevel(String),
    #[error("A global logger is already installed: {0}")]
    AlreadyInitialized(String),
}

/// Installs the process-wide `tracing` subscriber.
pub trait LoggingService {
    fn init_logging(level: &str, use_color: bool) -> Result<(), LoggingError>;
}
