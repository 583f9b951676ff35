//! # storagefand
//!
//! A daemon that controls chassis fan speed through PWM based on the
//! temperature of the hottest storage drive in the system.
//!
//! ## How it works
//!
//! - **Sampling**: drive temperatures are read via `smartctl`, fanned out
//!   over a bounded worker pool, and reduced to the single hottest reading.
//! - **Regulation**: a discrete PID controller with integrator clamping
//!   turns the temperature error into a fan duty percentage.
//! - **Actuation**: the duty is mapped onto four fan zones and written
//!   through `ipmitool`, with safety clamping and write suppression.
//! - **Lifecycle**: the loop runs on a fixed interval until SIGINT/SIGTERM,
//!   then drives the fans to a protective safety speed before exiting.
//!
//! ## Example
//!
//! ```no_run
//! use storagefand::{application::Application, config::Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!     Application::builder()
//!         .with_config(config)
//!         .build()?
//!         .run()
//!         .await
//! }
//! ```

pub mod application;
pub mod chassis;
pub mod cli;
pub mod config;
pub mod control_loop;
pub mod lock;
pub mod pid;
pub mod smart;
