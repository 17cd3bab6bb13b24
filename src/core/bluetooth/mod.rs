//! Bluetooth functionality for the smart-socket companion
//! This module handles all BLE operations including adapter lifecycle,
//! scanning, GATT resolution, device sessions and reachability monitoring.

pub mod adapter;
pub mod bluest_platform;
pub mod commands;
pub mod communicator;
pub mod connection;
pub mod constants;
pub mod error;
pub mod manager;
#[cfg(test)]
pub(crate) mod mock;
pub mod monitor;
pub mod notification;
pub mod platform;
pub mod protocol;
pub mod resolver;
pub mod scanner;
pub mod types;

// Re-export types that should be publicly accessible
pub use adapter::AdapterManager;
pub use bluest_platform::BluestPlatform;
pub use commands::{CommandExecutor, CommandSender, DeviceCommand};
pub use communicator::{DeviceCommunicator, InboundMessage, SessionState};
pub use connection::ConnectionManager;
pub use error::{BluetoothError, ResolutionError};
pub use manager::BluetoothManager;
pub use monitor::{CheckSummary, ConnectionMonitor, ReachabilityProbe};
pub use notification::{DeviceFrame, NotificationHandler};
pub use platform::BlePlatform;
pub use protocol::{InboundFrame, PowerTelemetry};
pub use resolver::GattResolver;
pub use scanner::{BluetoothScanner, DeviceTarget, ScannerEvent};
pub use types::{AdapterState, DiscoveredDevice, GattEndpoint, PlatformEvent, ScanOptions};
