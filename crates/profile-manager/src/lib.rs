//! Profile registry, port allocation and wireproxy process supervision.

pub mod binary;
pub mod error;
pub mod importer;
pub mod manager;
pub mod ports;
pub mod proxy_log;
pub mod store;
pub mod supervisor;
pub mod wireguard;

#[cfg(test)]
mod test_utils;

pub use error::{ManagerError, Result};
pub use manager::{ConnectOptions, ManagerConfig, ProfileManager, HEALTH_INTERVAL};
pub use ports::PortRange;
