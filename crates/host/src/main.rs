//! usb-midi-host
//!
//! Watches the USB bus for a MIDI keyboard, claims its streaming interface
//! and logs every note played.

use anyhow::{Context, Result};
use clap::Parser;
use common::{create_note_channel, setup_logging};
use host::config::{HostConfig, expand_path};
use host::monitor::{KeyboardLayout, run_monitor};
use host::usb::{Driver, RusbSession, spawn_poller};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "usb-midi-host")]
#[command(author, version, about = "USB-MIDI host - stream notes from a USB keyboard")]
#[command(long_about = "
Discovers USB devices, claims the MIDI streaming interface of each one and
logs the notes played on it.

EXAMPLES:
    # Run with default config
    usb-midi-host

    # Run with custom config
    usb-midi-host --config ~/keyboard.toml

    # List USB devices and exit
    usb-midi-host --list-devices

    # Run with debug logging
    usb-midi-host --log-level debug

CONFIGURATION:
    The host looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-midi-host/host.toml
    3. /etc/usb-midi-host/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = HostConfig::default();
        let path = HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        HostConfig::load(Some(expand_path(path))).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.host.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-midi-host v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let session =
        Arc::new(RusbSession::new(config.profile.bus).context("Failed to initialize libusb")?);

    if args.list_devices {
        return list_devices(&session);
    }

    run(config, session).await
}

/// Print every device on the bus and exit
fn list_devices(session: &RusbSession) -> Result<()> {
    let devices = session.enumerate().context("Failed to enumerate devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for (bus, device) in devices {
        println!(
            "  Bus {:03} Device {:03}: {:04x}:{:04x} Speed: {:?} Config: {}",
            bus,
            device.address,
            device.vendor_id,
            device.product_id,
            device.speed,
            device.configuration_value
        );
    }
    Ok(())
}

async fn run(config: HostConfig, session: Arc<RusbSession>) -> Result<()> {
    let driver = Arc::new(
        Driver::new(session, config.driver.clone(), config.profile.clone())
            .context("Failed to create driver")?,
    );

    let (tx, rx) = create_note_channel(config.sink.capacity);
    let poller = spawn_poller(driver.clone()).context("Failed to spawn poller thread")?;

    // Binding after the poller is running is fine; notes before this are dropped
    driver.set_note_sender(tx);
    let monitor = tokio::spawn(run_monitor(rx, KeyboardLayout::default()));

    info!("Press Ctrl+C to shutdown");

    let stopper = driver.clone();
    let mut poller = tokio::task::spawn_blocking(move || poller.join());
    let result = tokio::select! {
        signal = signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                Err(e) => error!("Error waiting for Ctrl+C: {}", e),
            }
            stopper.stop();
            (&mut poller).await
        }
        joined = &mut poller => joined,
    };

    // Closing the sink ends the monitor once it has drained
    driver.sink().unbind();
    if let Err(e) = monitor.await {
        error!("Note monitor failed: {}", e);
    }

    match result.context("Poller task failed")? {
        Ok(Ok(())) => {
            info!("Shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => Err(e).context("Driver stopped with an error"),
        Err(_) => Err(anyhow::anyhow!("Poller thread panicked")),
    }
}
