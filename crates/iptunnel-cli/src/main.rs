use std::path::PathBuf;

use anyhow::{anyhow, bail};
use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use iptunnel_config::{expand_tilde, Config, ConfigStore, JsonConfigStore};
use iptunnel_keys::{CredentialProvisioner, KeyGenOptions, SshKeygenProvisioner};
use iptunnel_logging::init_logging;
use iptunnel_ssh::{ConnectionSupervisor, StatusEvent};
use merge::Merge;
use tokio::signal;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to the configuration file.
    #[arg(long, global = true, env = "IPTUNNEL_CONFIG")]
    pub config: Option<String>,
    #[arg(long, global = true)]
    pub log_level: Option<String>,
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Starts the tunnel and supervises it until Ctrl+C or until it drops.
    Connect {
        /// Run this command instead of the stored one.
        #[arg(long)]
        command: Option<String>,
    },
    /// Stores the SSH tunnel command.
    SetCommand { command: String },
    /// Prints the stored SSH tunnel command.
    ShowCommand,
    /// Manages the SSH key pair.
    #[command(subcommand)]
    Keys(KeysCommand),
    /// Manages the configuration file.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
pub enum KeysCommand {
    /// Reports whether a key pair exists.
    Check,
    /// Creates a new key pair with ssh-keygen.
    Generate {
        #[arg(long)]
        comment: Option<String>,
        #[arg(long, default_value = "rsa")]
        key_type: String,
        #[arg(long, default_value_t = 2048)]
        bits: u32,
        /// Replace an existing key pair.
        #[arg(long)]
        force: bool,
    },
    /// Prints the public key, ready to paste into authorized_keys.
    Show,
    /// Deletes the key pair.
    Delete,
    /// Prints the private key path.
    Path,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    Show,
    /// Resets every setting to its default.
    Clear,
    Export { path: String },
    Import { path: String },
    SetAutoConnect {
        #[arg(action = ArgAction::Set)]
        enabled: bool,
    },
    SetMinimizeToTray {
        #[arg(action = ArgAction::Set)]
        enabled: bool,
    },
    SetNotifications {
        #[arg(action = ArgAction::Set)]
        enabled: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- Configuration Setup ---
    let mut store = match cli.config.as_deref() {
        Some(path) => JsonConfigStore::open(resolve_path(path)?),
        None => JsonConfigStore::open_default()?,
    };

    let cli_config = Config {
        log_level: cli.log_level.clone(),
        ..Config::empty()
    };
    let mut effective = store.config().clone();
    effective.merge(cli_config);

    // --- Logging ---
    init_logging(effective.log_level.as_deref().unwrap_or("info"), !cli.no_color)
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    debug!("Configuration file: {}", store.path().display());
    debug!("Final configuration: {:#?}", effective);

    match cli.command {
        Some(Commands::Connect { command }) => connect(&store, command).await,
        Some(Commands::SetCommand { command }) => {
            store.set_command(&command)?;
            info!("Server command saved to {}", store.path().display());
            Ok(())
        }
        Some(Commands::ShowCommand) => {
            if !store.has_command() {
                bail!("No server command configured");
            }
            println!("{}", store.command());
            Ok(())
        }
        Some(Commands::Keys(cmd)) => keys(cmd).await,
        Some(Commands::Config(cmd)) => config(&mut store, cmd),
        None if store.auto_connect() && store.has_command() => {
            info!("Auto-connect is enabled, connecting with the stored command");
            connect(&store, None).await
        }
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    }
}

fn resolve_path(path: &str) -> anyhow::Result<PathBuf> {
    expand_tilde(path).ok_or_else(|| anyhow!("Cannot resolve '{}': no home directory", path))
}

async fn connect(store: &JsonConfigStore, command: Option<String>) -> anyhow::Result<()> {
    let command = match command {
        Some(command) => command,
        None if store.has_command() => store.command(),
        None => bail!("No server command configured. Run `iptunnel set-command \"ssh ...\"` first."),
    };

    match SshKeygenProvisioner::new() {
        Ok(keys) if !keys.keys_exist() => warn!(
            "No SSH key pair at {}. Run `iptunnel keys generate` if the server expects key authentication.",
            keys.private_key_path().display()
        ),
        Ok(_) => {}
        Err(e) => debug!("Skipping key check: {}", e),
    }

    let supervisor = ConnectionSupervisor::new();
    let mut events = supervisor.subscribe(16);

    info!("Connecting...");
    let message = supervisor.connect(&command).await?;
    info!("{}", message);
    info!("Press Ctrl+C to disconnect.");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => report_event(&event)?,
                None => break,
            },
            _ = signal::ctrl_c() => {
                warn!("Received shutdown signal. Disconnecting...");
                info!("Tunnel was up for {}s", supervisor.uptime().as_secs());
                let message = supervisor.disconnect().await?;
                info!("{}", message);
                break;
            }
        }
    }

    Ok(())
}

/// Logs a connected event; a disconnect reported by the watchdog ends the
/// session with an error.
fn report_event(event: &StatusEvent) -> anyhow::Result<()> {
    if !event.connected {
        bail!("Tunnel stopped: {}", event.message);
    }
    info!("Status: {}", event.message);
    Ok(())
}

async fn keys(cmd: KeysCommand) -> anyhow::Result<()> {
    let keys = SshKeygenProvisioner::new()?;
    match cmd {
        KeysCommand::Check => {
            if keys.keys_exist() {
                println!("SSH key pair found at {}", keys.private_key_path().display());
            } else {
                println!("No SSH key pair at {}", keys.private_key_path().display());
            }
        }
        KeysCommand::Generate {
            comment,
            key_type,
            bits,
            force,
        } => {
            if keys.keys_exist() || keys.public_key_path().exists() {
                if !force {
                    bail!(
                        "An SSH key pair already exists at {}. Pass --force to replace it.",
                        keys.private_key_path().display()
                    );
                }
                info!("{}", keys.delete_keys()?);
            }
            let options = KeyGenOptions {
                comment,
                key_type,
                bits,
            };
            info!("{}", keys.generate(&options).await?);
            println!("{}", keys.public_key_text()?);
        }
        KeysCommand::Show => println!("{}", keys.public_key_text()?),
        KeysCommand::Delete => println!("{}", keys.delete_keys()?),
        KeysCommand::Path => println!("{}", keys.private_key_path().display()),
    }
    Ok(())
}

fn config(store: &mut JsonConfigStore, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show => {
            println!("# {}", store.path().display());
            println!("{}", serde_json::to_string_pretty(store.config())?);
        }
        ConfigCommand::Clear => {
            store.clear()?;
            info!("Configuration reset to defaults");
        }
        ConfigCommand::Export { path } => store.export_to(&resolve_path(&path)?)?,
        ConfigCommand::Import { path } => store.import_from(&resolve_path(&path)?)?,
        ConfigCommand::SetAutoConnect { enabled } => store.set_auto_connect(enabled)?,
        ConfigCommand::SetMinimizeToTray { enabled } => store.set_minimize_to_tray(enabled)?,
        ConfigCommand::SetNotifications { enabled } => store.set_show_notifications(enabled)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_report_event() {
        assert!(report_event(&StatusEvent::new(true, "Connected")).is_ok());

        let err = report_event(&StatusEvent::new(false, "Disconnected: Connection lost"))
            .unwrap_err();
        assert_eq!(err.to_string(), "Tunnel stopped: Disconnected: Connection lost");
    }

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from([
            "iptunnel",
            "--log-level",
            "debug",
            "connect",
            "--command",
            "ssh -N host",
        ])
        .unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(
            cli.command,
            Some(Commands::Connect { command: Some(ref c) }) if c == "ssh -N host"
        ));

        let cli = Cli::try_parse_from(["iptunnel", "config", "set-auto-connect", "false"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Config(ConfigCommand::SetAutoConnect { enabled: false }))
        ));

        let cli = Cli::try_parse_from(["iptunnel", "keys", "generate", "--bits", "4096"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Keys(KeysCommand::Generate { bits: 4096, force: false, .. }))
        ));

        let cli = Cli::try_parse_from(["iptunnel"]).unwrap();
        assert!(cli.command.is_none());
    }
}
