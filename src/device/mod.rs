pub mod connection;
pub mod constants;
pub mod measurement;
pub mod monitor;
pub mod session;
pub mod state_machine;
pub mod types;
pub mod values;
