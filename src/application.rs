//! Application entry point and builder pattern implementation.

use std::time::Duration;

use anyhow::{Context, Result};
use log::info;
use tokio_util::sync::CancellationToken;

use crate::{
    chassis::{Chassis, IpmiWriter},
    config::Config,
    control_loop::ControlLoop,
    pid::Pid,
    smart::{self, SmartSource},
};

/// Main application structure wiring configuration into the control loop.
///
/// Owns the complete lifecycle: device enumeration, component construction,
/// signal handling and the loop itself.
pub struct Application {
    config: Config,
}

impl Application {
    /// Creates a new ApplicationBuilder for constructing Application instances.
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::new()
    }

    /// Runs the daemon until a termination signal arrives.
    ///
    /// Returns `Ok(())` after the signal-triggered safety shutdown; any error
    /// is a fatal environment failure.
    pub async fn run(self) -> Result<()> {
        let devices = smart::enumerate_devices(&self.config.smart)
            .await
            .context("Error reading block devices")?;
        info!(
            "Monitoring {} storage devices, target {}°C",
            devices.len(),
            self.config.general.target_temperature
        );

        let mut pid = Pid::new(&self.config.pid);
        pid.set_target_value(self.config.general.target_temperature);

        let chassis = Chassis::new(
            &self.config.chassis,
            Box::new(IpmiWriter::new(self.config.chassis.ipmitool.clone())),
        );

        let sampler = SmartSource::new(self.config.smart.clone());

        let control_loop = ControlLoop::new(
            pid,
            chassis,
            Box::new(sampler),
            devices,
            self.config.smart.workers,
            Duration::from_secs_f64(self.config.general.polling_interval),
        );

        let shutdown = CancellationToken::new();
        spawn_signal_listener(shutdown.clone())?;

        control_loop.run(shutdown).await
    }
}

/// Cancels the token on SIGINT or SIGTERM. The loop observes the token at
/// tick boundaries and performs the safety write before exiting.
fn spawn_signal_listener(shutdown: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating safety shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating safety shutdown"),
        }
        shutdown.cancel();
    });

    Ok(())
}

/// Builder pattern for creating Application instances.
pub struct ApplicationBuilder {
    config: Option<Config>,
}

impl ApplicationBuilder {
    fn new() -> Self {
        Self { config: None }
    }

    /// Sets the configuration snapshot for the application.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Builds the Application instance with the provided configuration.
    pub fn build(self) -> Result<Application> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("Configuration is required"))?;

        Ok(Application { config })
    }
}
