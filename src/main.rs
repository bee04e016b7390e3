use clap::Parser;
use hcalory_control::domain::settings::SettingsService;
use hcalory_control::infrastructure::logging;
use hcalory_control::{BtleTransport, Command, ConnectionManager, HeaterSession};
use std::path::PathBuf;
use tracing::{error, info, warn};

/// Control an HCalory heater over Bluetooth LE
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Command to send
    #[arg(value_enum)]
    command: Command,

    /// Bluetooth MAC address of heater (defaults to the last one used)
    #[arg(long)]
    address: Option<String>,

    /// Bluetooth timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Maximum connection attempts
    #[arg(long)]
    max_retries: Option<u32>,

    /// Settings file to use instead of the default location
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match cli.config {
        Some(path) => SettingsService::from_path(path),
        None => SettingsService::new()?,
    };
    if let Some(timeout) = cli.timeout {
        settings.get_mut().bluetooth_timeout_secs = timeout;
    }
    if let Some(max_retries) = cli.max_retries {
        settings.get_mut().max_retries = max_retries;
    }

    let _log_guard = logging::init_logger(&settings.get().log_settings)?;
    info!("Using settings from {}", settings.path().display());

    let address = cli
        .address
        .or_else(|| settings.get().last_connected_address.clone())
        .ok_or_else(|| anyhow::anyhow!("no --address given and no previously used address"))?;

    let transport = BtleTransport::new().await?;
    let connection = ConnectionManager::new(transport, settings.get().connection_config());
    let mut session = HeaterSession::new(connection, settings.get().session_config()?);

    let outcome = tokio::select! {
        result = session.run_workflow(cli.command, &address) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    let Some(result) = outcome else {
        warn!("Interrupted, disconnecting");
        session.disconnect().await;
        anyhow::bail!("interrupted");
    };

    let result = match result {
        Ok(result) => result,
        Err(e) => {
            error!("{} failed: {}", cli.command, e);
            return Err(e.into());
        }
    };

    if let Err(e) = settings.remember_address(&address) {
        warn!("Could not save settings: {}", e);
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
