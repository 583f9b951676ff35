//! Chassis fan actuation over the IPMI raw interface.
//!
//! A requested duty cycle is clamped to the configured bounds, mapped onto
//! the four fan zones of the chassis and written through `ipmitool`. A zone
//! code of `0x00` hands that zone back to BIOS automatic control. Writes are
//! suppressed when the duty cycle has not changed, so the fan controller is
//! only touched on actual transitions.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::{debug, info};
use tokio::process::Command;

use crate::config::ChassisCfg;

/// Rear fans run at half duty below this raw code, full duty above it.
const REAR_HALF_SPEED_BELOW: u32 = 40;

/// Rear codes below this are unreliable on the fan controller; the zone is
/// handed back to BIOS control instead.
const REAR_AUTO_BELOW: u32 = 20;

/// Raw duty codes for the four addressable fan zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneCodes {
    pub cpu: u32,
    pub rear: u32,
    pub front1: u32,
    pub front2: u32,
}

impl ZoneCodes {
    /// Maps a clamped duty code onto the zones.
    ///
    /// The CPU zone always stays under BIOS control. Both front intakes take
    /// the duty as-is. The rear exhaust runs at half duty while the duty is
    /// low (quieter), at full duty once it crosses the threshold, and drops
    /// to auto-mode entirely when the halved code is too low to be reliable.
    pub fn from_duty(value: u32) -> Self {
        let rear = if value < REAR_HALF_SPEED_BELOW {
            value / 2
        } else {
            value
        };
        let rear = if rear < REAR_AUTO_BELOW { 0 } else { rear };

        Self {
            cpu: 0,
            rear,
            front1: value,
            front2: value,
        }
    }
}

/// Hardware write seam, mocked in tests.
#[async_trait]
pub trait PwmWriter: Send + Sync {
    async fn write_zones(&self, zones: &ZoneCodes) -> Result<()>;
}

/// Writes zone codes through `ipmitool raw`.
pub struct IpmiWriter {
    ipmitool: PathBuf,
}

impl IpmiWriter {
    pub fn new(ipmitool: PathBuf) -> Self {
        Self { ipmitool }
    }

    /// Builds the raw command arguments. The byte layout is fixed by the
    /// board firmware: command bytes 0x3a 0x01, then
    /// CPU 0x00 REAR 0x00 FRNT1 FRNT2 0x00 0x00.
    pub fn raw_args(zones: &ZoneCodes) -> Vec<String> {
        vec![
            "raw".to_string(),
            "0x3a".to_string(),
            "0x01".to_string(),
            format_code(zones.cpu),
            "0x00".to_string(),
            format_code(zones.rear),
            "0x00".to_string(),
            format_code(zones.front1),
            format_code(zones.front2),
            "0x00".to_string(),
            "0x00".to_string(),
        ]
    }
}

/// Zone codes go over the wire as 0-padded 2-digit codes prefixed `0x`.
fn format_code(code: u32) -> String {
    format!("0x{code:02}")
}

#[async_trait]
impl PwmWriter for IpmiWriter {
    async fn write_zones(&self, zones: &ZoneCodes) -> Result<()> {
        let args = Self::raw_args(zones);
        debug!("ipmitool {}", args.join(" "));

        let output = Command::new(&self.ipmitool)
            .args(&args)
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", self.ipmitool.display()))?;

        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.ipmitool.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(())
    }
}

/// Chassis fan state and actuation policy.
///
/// Owns the PWM accumulators (`current_value`, `previous_value`); they are
/// mutated only through [`Chassis::set_pwm`].
pub struct Chassis {
    pwm_min: u32,
    pwm_max: u32,
    pwm_safety: u32,
    fan_percent: f64,
    current_value: u32,
    previous_value: u32,
    writer: Box<dyn PwmWriter>,
}

impl Chassis {
    pub fn new(cfg: &ChassisCfg, writer: Box<dyn PwmWriter>) -> Self {
        Self {
            pwm_min: cfg.pwm_min,
            pwm_max: cfg.pwm_max,
            pwm_safety: cfg.pwm_safety,
            fan_percent: 0.0,
            current_value: 0,
            previous_value: 0,
            writer,
        }
    }

    /// Sets the raw fan duty code.
    ///
    /// Values above `pwm_max` are clamped down; values below `pwm_min` hand
    /// the fans back to BIOS control (code 0) as a safety floor. The hardware
    /// write is skipped when the value did not change since the last call.
    pub async fn set_pwm(&mut self, value: u32) -> Result<()> {
        let mut value = value.min(self.pwm_max);

        if value < self.pwm_min {
            debug!("PWM value {value} is less than the minimum. Setting fans to BIOS control");
            value = 0;
        }

        self.current_value = value;

        if self.previous_value == value {
            debug!("PWM value unchanged");
            return Ok(());
        }

        info!("PWM value changed. Updating fan speed");
        self.writer.write_zones(&ZoneCodes::from_duty(value)).await?;
        self.previous_value = value;

        Ok(())
    }

    /// Sets fan speed as a percentage of full duty.
    pub async fn set_fan_speed_percent(&mut self, percent: f64) -> Result<()> {
        let percent = percent.clamp(0.0, 100.0);
        self.fan_percent = percent;

        let pwm = (percent * self.pwm_max as f64 / 100.0).round() as u32;
        self.set_pwm(pwm).await
    }

    /// Drives the fans to the configured protective speed. Used on shutdown
    /// so an unsupervised chassis is not left at a low setting.
    pub async fn set_safety(&mut self) -> Result<()> {
        self.set_pwm(self.pwm_safety).await
    }

    /// Conservative startup state.
    pub async fn set_startup(&mut self) -> Result<()> {
        self.set_pwm(self.pwm_min).await
    }

    pub fn current_pwm(&self) -> u32 {
        self.current_value
    }

    pub fn fan_percent(&self) -> f64 {
        self.fan_percent
    }
}
