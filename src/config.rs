//! Configuration for the storagefand daemon.
//!
//! Handles loading, parsing, and validation of the YAML configuration file
//! that defines the control target, PID gains, PWM bounds and the SMART
//! sampling setup. The configuration is loaded once at startup and treated
//! as an immutable snapshot for the lifetime of the process.

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};

/// Main configuration structure for the storagefand daemon.
///
/// # Example
///
/// ```yaml
/// version: 1
///
/// general:
///   target_temperature: 40
///   polling_interval: 30
///
/// pid:
///   p: 2
///   i: 0.05
///   d: 0
///   i_max: 100
///   i_min: -100
///
/// chassis:
///   pwm_min: 20
///   pwm_max: 64
///   pwm_safety: 32
///
/// smart:
///   boot_device: "ada0"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version for compatibility checking.
    pub version: u8,

    pub general: GeneralCfg,
    pub pid: PidCfg,
    pub chassis: ChassisCfg,

    #[serde(default)]
    pub smart: SmartCfg,
}

/// Control target and loop timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralCfg {
    /// Target temperature of the hottest drive, degrees Celsius.
    pub target_temperature: i64,

    /// Polling interval in seconds. Fractional values are allowed.
    #[serde(default = "defaults::polling_interval")]
    pub polling_interval: f64,

    /// Lock file enforcing a single running instance.
    #[serde(default = "defaults::lock_file")]
    pub lock_file: PathBuf,
}

/// PID gains and integrator bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidCfg {
    pub p: f64,
    pub i: f64,
    pub d: f64,

    /// Initial integrator value.
    #[serde(default)]
    pub i_start: i64,

    pub i_max: i64,
    pub i_min: i64,
}

/// PWM bounds and the fan driver tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChassisCfg {
    /// Below this raw code the fans are handed back to BIOS control.
    pub pwm_min: u32,

    /// Raw code corresponding to 100% duty.
    pub pwm_max: u32,

    /// Protective speed applied on shutdown.
    pub pwm_safety: u32,

    #[serde(default = "defaults::ipmitool")]
    pub ipmitool: PathBuf,
}

/// SMART sampling setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartCfg {
    /// Only devices whose name starts with this prefix are monitored.
    /// An empty string monitors everything the enumeration tool reports.
    #[serde(default = "defaults::device_filter")]
    pub device_filter: String,

    /// Boot device excluded from monitoring.
    #[serde(default = "defaults::boot_device")]
    pub boot_device: String,

    /// Width of the sampling worker pool.
    #[serde(default = "defaults::workers")]
    pub workers: usize,

    #[serde(default = "defaults::smartctl")]
    pub smartctl: PathBuf,

    /// SMART attribute label holding the drive temperature.
    #[serde(default = "defaults::attribute")]
    pub attribute: String,

    /// Column distance between the attribute label and its value.
    #[serde(default = "defaults::distance")]
    pub distance: usize,

    /// Command that lists the block devices at startup.
    #[serde(default = "defaults::enumerate_command")]
    pub enumerate_command: Vec<String>,
}

impl Default for SmartCfg {
    fn default() -> Self {
        Self {
            device_filter: defaults::device_filter(),
            boot_device: defaults::boot_device(),
            workers: defaults::workers(),
            smartctl: defaults::smartctl(),
            attribute: defaults::attribute(),
            distance: defaults::distance(),
            enumerate_command: defaults::enumerate_command(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    pub fn polling_interval() -> f64 {
        30.0
    }

    pub fn lock_file() -> PathBuf {
        PathBuf::from("/var/run/storagefand.lock")
    }

    pub fn ipmitool() -> PathBuf {
        PathBuf::from("/usr/local/bin/ipmitool")
    }

    pub fn device_filter() -> String {
        String::new()
    }

    pub fn boot_device() -> String {
        String::new()
    }

    pub fn workers() -> usize {
        24
    }

    pub fn smartctl() -> PathBuf {
        PathBuf::from("/usr/local/sbin/smartctl")
    }

    pub fn attribute() -> String {
        "Temperature_Celsius".to_string()
    }

    pub fn distance() -> usize {
        10
    }

    pub fn enumerate_command() -> Vec<String> {
        ["geom", "part", "status", "-s"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }
}

impl Config {
    /// Loads configuration from the given path or from standard locations.
    ///
    /// Searches in the following order:
    /// 1. Provided path parameter
    /// 2. STORAGEFAND_CONFIG environment variable
    /// 3. XDG_CONFIG_HOME/storagefand/config.yml or ~/.config/storagefand/config.yml
    /// 4. /etc/storagefand/config.yml
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => locate_config().context("No configuration file found")?,
        };

        info!("Loading config from: {}", config_path.display());
        Self::load_from_path(&config_path)
    }

    fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML in: {}", path.display()))?;

        if config.version != 1 {
            anyhow::bail!(
                "Unsupported config version {} in file: {}",
                config.version,
                path.display()
            );
        }

        config
            .validate()
            .with_context(|| format!("Configuration validation failed for: {}", path.display()))?;

        Ok(config)
    }

    /// Validates the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.general.polling_interval <= 0.0 {
            anyhow::bail!("polling_interval must be positive");
        }

        if self.pid.i_min > self.pid.i_max {
            anyhow::bail!(
                "integrator bounds are inverted: i_min {} > i_max {}",
                self.pid.i_min,
                self.pid.i_max
            );
        }

        if self.chassis.pwm_min > self.chassis.pwm_max {
            anyhow::bail!(
                "pwm_min {} exceeds pwm_max {}",
                self.chassis.pwm_min,
                self.chassis.pwm_max
            );
        }

        if self.chassis.pwm_safety < self.chassis.pwm_min
            || self.chassis.pwm_safety > self.chassis.pwm_max
        {
            anyhow::bail!(
                "pwm_safety {} is outside [{}, {}]",
                self.chassis.pwm_safety,
                self.chassis.pwm_min,
                self.chassis.pwm_max
            );
        }

        if self.smart.workers == 0 {
            anyhow::bail!("smart.workers must be at least 1");
        }

        if self.smart.attribute.is_empty() {
            anyhow::bail!("smart.attribute cannot be empty");
        }

        if self.smart.enumerate_command.is_empty() {
            anyhow::bail!("smart.enumerate_command cannot be empty");
        }

        Ok(())
    }
}

fn locate_config() -> Result<PathBuf> {
    // 1) ENV
    if let Ok(env_path) = env::var("STORAGEFAND_CONFIG") {
        return Ok(PathBuf::from(env_path));
    }

    // 2) XDG_CONFIG_HOME or $HOME/.config
    if let Some(mut cfg_dir) = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|h| Path::new(&h).join(".config")))
    {
        cfg_dir.push("storagefand/config.yml");
        if cfg_dir.exists() {
            return Ok(cfg_dir);
        }
    }

    // 3) /etc
    let etc = Path::new("/etc/storagefand/config.yml");
    if etc.exists() {
        return Ok(etc.to_path_buf());
    }

    anyhow::bail!("Configuration file not found in any standard location")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();
        temp_file.flush().unwrap();
        temp_file
    }

    fn valid_config() -> Config {
        Config {
            version: 1,
            general: GeneralCfg {
                target_temperature: 40,
                polling_interval: 30.0,
                lock_file: defaults::lock_file(),
            },
            pid: PidCfg {
                p: 2.0,
                i: 0.05,
                d: 0.0,
                i_start: 0,
                i_max: 100,
                i_min: -100,
            },
            chassis: ChassisCfg {
                pwm_min: 20,
                pwm_max: 64,
                pwm_safety: 32,
                ipmitool: defaults::ipmitool(),
            },
            smart: SmartCfg::default(),
        }
    }

    #[test]
    fn config_load_valid_yaml() {
        let yaml_content = r#"
version: 1

general:
  target_temperature: 40
  polling_interval: 12.5

pid:
  p: 2
  i: 0.05
  d: 0
  i_start: 4
  i_max: 100
  i_min: -100

chassis:
  pwm_min: 20
  pwm_max: 64
  pwm_safety: 32

smart:
  device_filter: "sd"
  boot_device: "ada0"
  workers: 8
"#;
        let temp_file = create_temp_config(yaml_content);
        let config = Config::load(Some(temp_file.path().to_path_buf())).unwrap();

        assert_eq!(config.version, 1);
        assert_eq!(config.general.target_temperature, 40);
        assert_eq!(config.general.polling_interval, 12.5);
        assert_eq!(config.pid.i_start, 4);
        assert_eq!(config.chassis.pwm_max, 64);
        assert_eq!(config.smart.device_filter, "sd");
        assert_eq!(config.smart.boot_device, "ada0");
        assert_eq!(config.smart.workers, 8);
        // Untouched fields fall back to defaults.
        assert_eq!(config.smart.attribute, "Temperature_Celsius");
        assert_eq!(config.smart.distance, 10);
    }

    #[test]
    fn config_load_rejects_unknown_version() {
        let yaml_content = r#"
version: 2
general:
  target_temperature: 40
pid:
  p: 1
  i: 0
  d: 0
  i_max: 10
  i_min: -10
chassis:
  pwm_min: 1
  pwm_max: 64
  pwm_safety: 32
"#;
        let temp_file = create_temp_config(yaml_content);
        let result = Config::load(Some(temp_file.path().to_path_buf()));
        assert!(result.is_err());
        assert!(format!("{:#}", result.unwrap_err()).contains("version"));
    }

    #[test]
    fn config_validate_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn config_validate_inverted_integrator_bounds() {
        let mut config = valid_config();
        config.pid.i_min = 50;
        config.pid.i_max = -50;
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("inverted"));
    }

    #[test]
    fn config_validate_pwm_safety_outside_bounds() {
        let mut config = valid_config();
        config.chassis.pwm_safety = 200;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validate_zero_workers() {
        let mut config = valid_config();
        config.smart.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validate_nonpositive_interval() {
        let mut config = valid_config();
        config.general.polling_interval = 0.0;
        assert!(config.validate().is_err());
    }
}
