use std::str::FromStr;

use colored::*;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::{FmtContext, Layer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub use iptunnel_traits::logging::{LoggingError, LoggingService};

/// Formats events as `2024-05-01 12:30:05  INFO iptunnel_ssh: message`.
struct TunnelFormatter {
    use_color: bool,
}

impl<S, N> FormatEvent<S, N> for TunnelFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let time = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let target = short_target(metadata.target());

        if self.use_color {
            write!(
                writer,
                "{} {} {}: ",
                time.to_string().dimmed(),
                level_label(*metadata.level(), true),
                target.dimmed()
            )?;
        } else {
            write!(
                writer,
                "{} {} {}: ",
                time,
                level_label(*metadata.level(), false),
                target
            )?;
        }

        ctx.format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

fn level_label(level: Level, use_color: bool) -> ColoredString {
    let label = match level {
        Level::TRACE => "TRACE",
        Level::DEBUG => "DEBUG",
        Level::INFO => " INFO",
        Level::WARN => " WARN",
        Level::ERROR => "ERROR",
    };
    if !use_color {
        return label.normal();
    }
    match level {
        Level::TRACE => label.magenta().bold(),
        Level::DEBUG => label.blue().bold(),
        Level::INFO => label.green().bold(),
        Level::WARN => label.yellow().bold(),
        Level::ERROR => label.red().bold(),
    }
}

/// Keeps the crate name of a module path: `iptunnel_ssh::supervisor` becomes
/// `iptunnel_ssh`.
fn short_target(target: &str) -> &str {
    target.split("::").next().unwrap_or(target)
}

/// Parses a level name such as `info` or `WARN`.
pub fn parse_level(level: &str) -> Result<Level, LoggingError> {
    Level::from_str(level.trim()).map_err(|_| LoggingError::UnknownLevel(level.to_string()))
}

pub struct LoggingServiceImpl;

impl LoggingService for LoggingServiceImpl {
    /// Installs the global subscriber. `RUST_LOG` takes precedence over
    /// `level`.
    fn init_logging(level: &str, use_color: bool) -> Result<(), LoggingError> {
        let level = parse_level(level)?;

        let env_filter = EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy();

        let layer = Layer::default().event_format(TunnelFormatter { use_color });

        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .try_init()
            .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
    }
}

/// Shorthand for [`LoggingServiceImpl::init_logging`].
pub fn init_logging(level: &str, use_color: bool) -> Result<(), LoggingError> {
    LoggingServiceImpl::init_logging(level, use_color)
}
