use std::fs::File;
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use daemonize::Daemonize;
use log::{LevelFilter, error, info};
use syslog::{BasicLogger, Facility, Formatter3164};

use storagefand::{
    application::Application,
    cli::Cli,
    config::Config,
    lock::{InstanceLock, LockOutcome},
};

/// Exit code signalling that another instance already holds the lock.
const EXIT_ALREADY_RUNNING: u8 = 2;

fn init_log() -> Result<()> {
    syslog::unix(Formatter3164 {
        facility: Facility::LOG_DAEMON,
        hostname: None,
        process: "storagefand".into(),
        pid: 0,
    })
    .map_err(|e| anyhow!("{e}"))
    .and_then(|logger| {
        log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
            .map(|_| log::set_max_level(LevelFilter::Info))
            .map_err(|e| anyhow!("{e}"))
    })
}

fn into_daemon() -> Result<()> {
    File::create("/var/tmp/storagefand.log")
        .and_then(|out| Ok((out.try_clone()?, out)))
        .map_err(|e| anyhow!("{e}"))
        .and_then(|(stderr, stdout)| {
            Daemonize::new()
                .stdout(stdout)
                .stderr(stderr)
                .start()
                .map_err(|e| anyhow!("{e}"))
        })
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_log() {
        eprintln!("Failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    // Two controllers fighting over the same fans would be worse than none.
    let _lock = match InstanceLock::acquire(&config.general.lock_file) {
        Ok(LockOutcome::Acquired(lock)) => lock,
        Ok(LockOutcome::AlreadyRunning) => {
            error!("Another instance already running");
            return ExitCode::from(EXIT_ALREADY_RUNNING);
        }
        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    // Fork before the runtime starts; the flock survives into the child.
    if cli.daemonize {
        if let Err(e) = into_daemon() {
            error!("Failed to daemonize: {e:#}");
            return ExitCode::FAILURE;
        }
    }

    let outcome = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")
        .and_then(|runtime| {
            runtime.block_on(async {
                Application::builder().with_config(config).build()?.run().await
            })
        });

    match outcome {
        Ok(()) => {
            // Signal-triggered shutdown: the safety speed has been written.
            // The process is long-running, so even this path exits non-zero.
            info!("Shutdown complete");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
