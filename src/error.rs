use std::any::Any;
use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use btleplug;
use btleplug::api::ParseBDAddrError;
use serde_json;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },

    #[error("Invalid target device address {address:?}: {source}")]
    InvalidAddress { address: String, source: ParseBDAddrError },
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter is available")]
    NoAdapter,

    #[error("Peripheral {address} has not been seen by the current scan")]
    UnknownPeripheral { address: String },

    #[error("Characteristic {characteristic} is not available on the connected peripheral")]
    MissingCharacteristic { characteristic: uuid::Uuid },

    #[error("The device driver task has stopped")]
    DriverStopped,

    #[error("The device driver is busy, try again later")]
    DriverBusy,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("No value has been received for {name:?}")]
    Absent { name: String },

    #[error("Value for {name:?} is {actual} bytes wide, expected {expected}")]
    WidthMismatch { name: String, expected: usize, actual: usize },
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (device): {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Failed to start application (runtime): {source}")]
    Runtime { #[from] source: io::Error },
}

pub fn readable_thread_panic_error(error: &Box<dyn Any + Send + 'static>) -> String {
    let mut stringified = String::from("???");

    if let Some(s) = error.downcast_ref::<&str>() {
        stringified = format!("{}", s);
    }
    else if let Some(s) = error.downcast_ref::<String>() {
        stringified = format!("{}", s);
    }

    format!("panic from task: [{}]", stringified)
}
