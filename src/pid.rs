//! Discrete PID controller that turns a temperature error into a fan duty
//! percentage.
//!
//! The arithmetic reproduces the control law this daemon has always shipped
//! with, including its unconventional derivative term: `d` is computed from
//! `error + derivator` (the sum of the current and previous error), not the
//! difference. Tuning data in the field depends on this behaviour, so it must
//! not be "corrected" to a textbook derivative without retuning.

use crate::config::PidCfg;

/// Last computed terms of a control step, exposed for the cycle log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidSnapshot {
    pub error: i64,
    pub p_value: f64,
    pub i_value: f64,
    pub d_value: f64,
}

/// Controller state. One instance per process, owned by the control loop and
/// mutated only through [`Pid::update`].
#[derive(Debug, Clone)]
pub struct Pid {
    kp: f64,
    ki: f64,
    kd: f64,

    set_point: i64,
    error: i64,
    derivator: i64,
    integrator: i64,
    integrator_min: i64,
    integrator_max: i64,

    p_value: f64,
    i_value: f64,
    d_value: f64,
}

impl Pid {
    pub fn new(cfg: &PidCfg) -> Self {
        Self {
            kp: cfg.p,
            ki: cfg.i,
            kd: cfg.d,
            set_point: 0,
            error: 0,
            derivator: 0,
            integrator: cfg.i_start.clamp(cfg.i_min, cfg.i_max),
            integrator_min: cfg.i_min,
            integrator_max: cfg.i_max,
            p_value: 0.0,
            i_value: 0.0,
            d_value: 0.0,
        }
    }

    /// Sets the target temperature. Called once at initialization.
    pub fn set_target_value(&mut self, set_point: i64) {
        self.set_point = set_point;
    }

    /// Calculates the controller output for the given feedback value.
    pub fn update(&mut self, current_value: i64) -> f64 {
        self.error = current_value - self.set_point;

        self.p_value = self.kp * self.error as f64;
        // Legacy derivative term: previous error is added, not subtracted.
        self.d_value = self.kd * (self.error + self.derivator) as f64;
        self.derivator = self.error;

        self.integrator =
            (self.integrator + self.error).clamp(self.integrator_min, self.integrator_max);
        self.i_value = self.ki * self.integrator as f64;

        self.p_value + self.i_value + self.d_value
    }

    pub fn snapshot(&self) -> PidSnapshot {
        PidSnapshot {
            error: self.error,
            p_value: self.p_value,
            i_value: self.i_value,
            d_value: self.d_value,
        }
    }
}
