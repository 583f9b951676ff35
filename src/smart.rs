//! SMART-based drive temperature sampling.
//!
//! Temperatures are read by shelling out to `smartctl` per device and picking
//! the configured attribute out of its columnar output. Sampling across the
//! device set is fanned out over a bounded worker pool; the reduction keeps
//! only the hottest reading, since the fans have to protect the hottest unit.

use std::collections::BTreeSet;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use log::{debug, warn};
use tokio::process::Command;

use crate::config::SmartCfg;

/// Source of per-device temperature readings.
///
/// An unparseable reading maps to `Ok(0)`; `Err` is reserved for environment
/// failures (tool missing, enumeration broken) that make further sampling
/// pointless and must terminate the daemon.
#[async_trait]
pub trait DriveSampler: Send + Sync {
    async fn temperature(&self, device: &str) -> Result<i64>;
}

/// Samples drive temperatures through the `smartctl` utility.
pub struct SmartSource {
    cfg: SmartCfg,
}

impl SmartSource {
    pub fn new(cfg: SmartCfg) -> Self {
        Self { cfg }
    }

    async fn raw_smart_data(&self, device: &str) -> Result<String> {
        let output = Command::new(&self.cfg.smartctl)
            .arg("-a")
            .arg(format!("/dev/{device}"))
            .output()
            .await
            .with_context(|| {
                format!(
                    "Failed to execute {}; is smartmontools installed?",
                    self.cfg.smartctl.display()
                )
            })?;

        if !output.status.success() {
            bail!(
                "{} exited with {} for /dev/{device}",
                self.cfg.smartctl.display(),
                output.status
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl DriveSampler for SmartSource {
    async fn temperature(&self, device: &str) -> Result<i64> {
        let data = self.raw_smart_data(device).await?;

        let reading = parse_attribute(&data, &self.cfg.attribute, self.cfg.distance)
            .and_then(|value| value.parse::<i64>().ok());

        Ok(match reading {
            Some(temp) => {
                debug!("Temperature of {device}: {temp}°C");
                temp
            }
            None => {
                // Sentinel reading: keeps the pass alive but can mask a dying
                // sensor, so it is logged where operators will see it.
                warn!(
                    "Could not parse attribute '{}' for {device}; assuming 0°C",
                    self.cfg.attribute
                );
                0
            }
        })
    }
}

/// Extracts an attribute value from raw SMART output.
///
/// The value sits `distance` columns to the right of the attribute label,
/// where columns are runs separated by triple spaces. SMART output is often a
/// bit of a mess: when fewer columns exist the distance is clamped to the last
/// one, and when the expected column holds no value the next column is tried.
pub fn parse_attribute(data: &str, parameter: &str, distance: usize) -> Option<String> {
    let start = data.find(parameter)? + parameter.len();
    let rest = data[start..].lines().next()?;

    let cols: Vec<&str> = rest.split("   ").collect();
    let mut distance = distance;
    if cols.len() <= distance {
        distance = cols.len().checked_sub(1)?;
    }

    column_value(&cols, distance).or_else(|| column_value(&cols, distance + 1))
}

fn column_value(cols: &[&str], idx: usize) -> Option<String> {
    cols.get(idx)?.split(' ').nth(1).map(str::to_string)
}

/// Returns the hottest reading across the device set.
///
/// One sampler call per device, at most `workers` in flight at a time,
/// fork-join: the pass completes only when every dispatched sample has been
/// merged. An empty device set reduces to the `0` baseline.
pub async fn highest_temperature<S>(
    sampler: &S,
    devices: &BTreeSet<String>,
    workers: usize,
) -> Result<i64>
where
    S: DriveSampler + ?Sized,
{
    let samples: Vec<_> = devices
        .iter()
        .map(|device| sampler.temperature(device))
        .collect();
    stream::iter(samples)
        .buffer_unordered(workers.max(1))
        .try_fold(0, |hottest, temp| async move { Ok(hottest.max(temp)) })
        .await
}

/// Enumerates the block devices to monitor. Runs once at startup; the
/// resulting set is immutable for the process lifetime.
pub async fn enumerate_devices(cfg: &SmartCfg) -> Result<BTreeSet<String>> {
    let (program, args) = cfg
        .enumerate_command
        .split_first()
        .context("Empty device enumeration command")?;

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to execute device enumeration tool '{program}'"))?;

    if !output.status.success() {
        bail!("Device enumeration tool '{program}' exited with {}", output.status);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_device_list(&stdout, &cfg.device_filter, &cfg.boot_device))
}

/// Parses the enumeration tool output: one device per line, name in the third
/// whitespace column, boot device discarded, optional name-prefix filter.
pub fn parse_device_list(stdout: &str, device_filter: &str, boot_device: &str) -> BTreeSet<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().nth(2))
        .filter(|name| device_filter.is_empty() || name.starts_with(device_filter))
        .filter(|name| *name != boot_device)
        .map(str::to_string)
        .collect()
}
