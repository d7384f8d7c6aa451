use std::path::PathBuf;
use std::time::Duration;
use clap::Parser;

use crate::device::constants::{POLL_DELAY, SCAN_TIMEOUT, UPDATE_DEVICE_INTERVAL};

/// Connects to a BLE peripheral and prints the latest value of each configured characteristic.
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
pub struct Cli {
    /// Config file to use instead of the portable or per-user one
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address of the peripheral, overrides the config file
    #[arg(long)]
    pub address: Option<String>,

    /// How often the state and values are printed
    #[arg(long, default_value_t = Duration::from_millis(POLL_DELAY).into())]
    pub poll_interval: humantime::Duration,

    /// How long a single scan for the peripheral may take
    #[arg(long, default_value_t = Duration::from_millis(SCAN_TIMEOUT).into())]
    pub scan_timeout: humantime::Duration,

    /// How often the device state is re-evaluated
    #[arg(long, default_value_t = Duration::from_millis(UPDATE_DEVICE_INTERVAL).into())]
    pub update_interval: humantime::Duration,
}
