use clap::Parser;
use log::{error, info};
use ble_simple_device::{init_logging, run};
use ble_simple_device::cli::Cli;
use ble_simple_device::error::{AppRunError, ConfigError};

fn main() -> Result<(), AppRunError> {
    init_logging();
    info!(concat!("BLE Simple Device ", env!("CARGO_PKG_VERSION")));

    let cli = Cli::parse();

    match run(cli) {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            error!("This application has already been started");
            Ok(())
        },
        Err(err) => {
            error!("Unexpected error: {}", err);
            Err(err)
        },
        Ok(_) => Ok(()),
    }
}
