mod config;
mod control;
mod fan;
mod mqtt;
mod relays;
mod settings;
mod sht3x;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::control::Control;
use crate::mqtt::{EventLoop, Mqtt};
use crate::settings::Settings;

/// Closed-loop HVAC controller daemon.
#[derive(Parser)]
#[command(name = "thermostatd", version)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;

    info!("thermostat is starting");

    let (mqtt, connection) = Mqtt::new(&config.mqtt, config.topic());
    let mut control = Control::new(&config.thermostat, mqtt.clone())
        .context("failed to start the control loop")?;
    let settings = Arc::new(Settings::new(
        mqtt.clone(),
        control.handle(),
        config.thermostat.settings_file.clone(),
    ));
    let events = EventLoop::spawn(connection, Arc::clone(&settings))
        .context("failed to start the mqtt event loop")?;

    info!("thermostat is started");

    let mut signals =
        Signals::new([SIGINT, SIGTERM, SIGHUP]).context("failed to install signal handlers")?;
    if let Some(signal) = signals.forever().next() {
        info!("caught signal {signal}");
    }

    info!("thermostat is stopping");
    control.stop();
    mqtt.disconnect();
    events.stop();
    info!("thermostat is stopped");

    Ok(())
}
