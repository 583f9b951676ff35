//! The closed control loop: sample, regulate, actuate, sleep.
//!
//! The loop itself is single-threaded and strictly sequential: each tick
//! finishes completely, including the blocking hardware write, before the
//! next one starts. The only parallelism lives inside the sampling fan-out.
//! Termination is observed at tick boundaries through a cancellation token,
//! and every exit path drives the fans to the protective safety speed first.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Result;
use log::info;
use tokio::time::interval;
use tokio_stream::{StreamExt, wrappers::IntervalStream};
use tokio_util::sync::CancellationToken;

use crate::chassis::Chassis;
use crate::pid::Pid;
use crate::smart::{self, DriveSampler};

pub struct ControlLoop {
    pid: Pid,
    chassis: Chassis,
    sampler: Box<dyn DriveSampler>,
    devices: BTreeSet<String>,
    workers: usize,
    tick_interval: Duration,
}

impl ControlLoop {
    pub fn new(
        pid: Pid,
        chassis: Chassis,
        sampler: Box<dyn DriveSampler>,
        devices: BTreeSet<String>,
        workers: usize,
        tick_interval: Duration,
    ) -> Self {
        Self {
            pid,
            chassis,
            sampler,
            devices,
            workers,
            tick_interval,
        }
    }

    /// Runs the loop until the token is cancelled or a fatal error occurs.
    ///
    /// Returns `Ok(())` only for a signal-triggered shutdown, after the
    /// safety speed has been written.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        // Conservative startup state until the first sample arrives.
        self.chassis.set_startup().await?;

        let mut ticks = IntervalStream::new(interval(self.tick_interval));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticks.next() => {
                    if let Err(e) = self.tick().await {
                        // Crash loudly, but try not to leave the chassis at a
                        // low speed with nobody supervising it.
                        let _ = self.chassis.set_safety().await;
                        return Err(e);
                    }
                }
            }
        }

        info!("Termination requested. Applying safety fan speed before exit");
        self.chassis.set_safety().await?;

        Ok(())
    }

    async fn tick(&mut self) -> Result<()> {
        let temperature =
            smart::highest_temperature(self.sampler.as_ref(), &self.devices, self.workers).await?;

        let output = self.pid.update(temperature);
        self.chassis.set_fan_speed_percent(output).await?;

        self.log_cycle(temperature);
        Ok(())
    }

    fn log_cycle(&self, temperature: i64) {
        let pid = self.pid.snapshot();
        info!(
            "Temp: {:2} | Fan: {:3.0}% | PWM: {:3} | P={:6.1} | I={:6.1} | D={:6.1} | Err={:3}|",
            temperature,
            self.chassis.fan_percent(),
            self.chassis.current_pwm(),
            pid.p_value,
            pid.i_value,
            pid.d_value,
            pid.error,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chassis::{PwmWriter, ZoneCodes};
    use crate::config::{ChassisCfg, PidCfg};
    use anyhow::bail;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingWriter {
        writes: Arc<Mutex<Vec<ZoneCodes>>>,
    }

    #[async_trait]
    impl PwmWriter for RecordingWriter {
        async fn write_zones(&self, zones: &ZoneCodes) -> Result<()> {
            self.writes.lock().unwrap().push(*zones);
            Ok(())
        }
    }

    struct SteadySampler(i64);

    #[async_trait]
    impl DriveSampler for SteadySampler {
        async fn temperature(&self, _device: &str) -> Result<i64> {
            Ok(self.0)
        }
    }

    struct BrokenSampler;

    #[async_trait]
    impl DriveSampler for BrokenSampler {
        async fn temperature(&self, _device: &str) -> Result<i64> {
            bail!("smartctl missing")
        }
    }

    fn chassis_cfg() -> ChassisCfg {
        ChassisCfg {
            pwm_min: 20,
            pwm_max: 64,
            pwm_safety: 32,
            ipmitool: PathBuf::from("/usr/local/bin/ipmitool"),
        }
    }

    fn pid_for_target(target: i64) -> Pid {
        let mut pid = Pid::new(&PidCfg {
            p: 2.0,
            i: 0.01,
            d: 0.0,
            i_start: 0,
            i_max: 100,
            i_min: -100,
        });
        pid.set_target_value(target);
        pid
    }

    fn devices() -> BTreeSet<String> {
        ["da0", "da1"].into_iter().map(str::to_string).collect()
    }

    #[tokio::test]
    async fn steady_overheat_rises_then_shutdown_applies_safety() {
        let writer = RecordingWriter::default();
        let chassis = Chassis::new(&chassis_cfg(), Box::new(writer.clone()));
        // Error of 25°C: P alone asks for ~50%, and the integrator keeps
        // nudging the duty upwards tick after tick.
        let control_loop = ControlLoop::new(
            pid_for_target(35),
            chassis,
            Box::new(SteadySampler(60)),
            devices(),
            4,
            Duration::from_millis(5),
        );

        let shutdown = CancellationToken::new();
        let canceller = shutdown.clone();
        let handle = tokio::spawn(control_loop.run(shutdown));

        tokio::time::sleep(Duration::from_millis(60)).await;
        canceller.cancel();
        handle.await.unwrap().unwrap();

        let writes = writer.writes.lock().unwrap();
        // First write is the conservative startup minimum.
        assert_eq!(writes[0], ZoneCodes::from_duty(20));
        // Last write is the protective safety speed.
        assert_eq!(*writes.last().unwrap(), ZoneCodes::from_duty(32));
        // In between, the duty never decreases while the error is steady.
        let duties: Vec<u32> = writes[1..writes.len() - 1].iter().map(|z| z.front1).collect();
        assert!(!duties.is_empty(), "at least one control tick must have run");
        assert!(duties.windows(2).all(|w| w[0] <= w[1]));
        assert!(duties.iter().all(|&d| d <= 64));
    }

    #[tokio::test]
    async fn fatal_sampling_error_still_attempts_safety_speed() {
        let writer = RecordingWriter::default();
        let chassis = Chassis::new(&chassis_cfg(), Box::new(writer.clone()));
        let control_loop = ControlLoop::new(
            pid_for_target(35),
            chassis,
            Box::new(BrokenSampler),
            devices(),
            4,
            Duration::from_millis(5),
        );

        let result = control_loop.run(CancellationToken::new()).await;
        assert!(result.is_err());

        let writes = writer.writes.lock().unwrap();
        assert_eq!(
            *writes,
            vec![ZoneCodes::from_duty(20), ZoneCodes::from_duty(32)]
        );
    }

    #[tokio::test]
    async fn empty_device_set_regulates_against_zero_baseline() {
        let writer = RecordingWriter::default();
        let chassis = Chassis::new(&chassis_cfg(), Box::new(writer.clone()));
        let control_loop = ControlLoop::new(
            pid_for_target(35),
            chassis,
            Box::new(SteadySampler(45)),
            BTreeSet::new(),
            4,
            Duration::from_millis(5),
        );

        let shutdown = CancellationToken::new();
        let canceller = shutdown.clone();
        let handle = tokio::spawn(control_loop.run(shutdown));

        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
        handle.await.unwrap().unwrap();

        // Baseline 0 sits far below target: negative output clamps to 0%,
        // which lands below pwm_min and hands the fans to BIOS control. The
        // only real writes are startup and safety.
        let writes = writer.writes.lock().unwrap();
        assert_eq!(writes[0], ZoneCodes::from_duty(20));
        assert_eq!(writes[1], ZoneCodes::from_duty(0));
        assert_eq!(*writes.last().unwrap(), ZoneCodes::from_duty(32));
    }
}
