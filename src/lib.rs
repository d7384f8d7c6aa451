use std::env;
use std::str::FromStr;
use std::time::Duration;
use log::{error, info, LevelFilter};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cli::Cli;
use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::device::connection::{start_device, DeviceOptions};
use crate::device::monitor::DeviceMonitor;
use crate::device::types::DeviceState;
use crate::error::{readable_thread_panic_error, AppRunError};

pub mod cli;
pub mod config;
pub mod device;
pub mod error;

pub fn init_logging() {
    let level = env::var("LOG_LEVEL")
        .ok()
        .and_then(|level| LevelFilter::from_str(&level).ok())
        .unwrap_or(LevelFilter::Info);

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(
            fern::log_file(log_file).expect("Failed to open LOG_FILE")
        );
    }

    dispatch.apply().expect("Failed to initialize logger");
}

fn print_values(monitor: &DeviceMonitor, config: &Config) {
    for name in config.measurement.names() {
        let (value, ok) = monitor.measured_value::<u8>(name, 0);
        if ok {
            println!("{:>12} = {}", name, value);
        } else {
            println!("{:>12} = -", name);
        }
    }
}

async fn run_monitor(cli: Cli) -> Result<(), AppRunError> {
    let mut config_io = match &cli.config {
        Some(path) => ConfigIO::open(path)?,
        None => ConfigIO::new_sync()?,
    };
    let mut locker = config_io.locker()?;
    let _lock = locker.lock()?;

    let mut config = config_io.read_or_init().await?;
    if let Some(address) = cli.address {
        config.target_address = address;
    }

    let mut options = DeviceOptions::new(config.target_address()?, config.measurement.clone());
    options.scan_timeout = cli.scan_timeout.into();
    options.update_interval = cli.update_interval.into();

    info!("Looking for {}", options.target);

    let cancel = CancellationToken::new();
    let (monitor, handle) = start_device(options, cancel.child_token()).await?;

    let mut poll = interval(Duration::from(cli.poll_interval));
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut previous_state: Option<DeviceState> = None;

    'mainloop: loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                break 'mainloop;
            },
            _ = poll.tick() => {
                let state = monitor.state();
                if previous_state != Some(state) {
                    info!("Device state: {}", state);
                    previous_state = Some(state);
                }

                if state == DeviceState::Connected {
                    print_values(&monitor, &config);
                }
            },
        }
    }

    cancel.cancel();
    if let Err(err) = handle.await {
        if err.is_panic() {
            error!("Device driver failed: {}", readable_thread_panic_error(&err.into_panic()));
        }
    }

    Ok(())
}

pub fn run(cli: Cli) -> Result<(), AppRunError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run_monitor(cli))
}
