//! The seam between the device layer and the radio stack.

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::core::bluetooth::error::BluetoothError;
use crate::core::bluetooth::types::{
    AdapterState, GattCharacteristic, GattService, PlatformEvent, ScanOptions,
};

/// Asynchronous BLE central operations.
///
/// Every identity passed in is the opaque `id` carried by a previous
/// [`PlatformEvent::DeviceFound`]. Radio-originated data (advertisements,
/// connection changes, notifications) only ever arrives through
/// [`BlePlatform::subscribe`].
#[async_trait]
pub trait BlePlatform: Send + Sync {
    /// Powers the radio stack in central mode.
    async fn open_adapter(&self) -> Result<(), BluetoothError>;

    /// Releases the radio stack.
    async fn close_adapter(&self) -> Result<(), BluetoothError>;

    /// Queries the current adapter state from the platform, not from a cache.
    async fn adapter_state(&self) -> Result<AdapterState, BluetoothError>;

    async fn start_discovery(&self, options: ScanOptions) -> Result<(), BluetoothError>;

    async fn stop_discovery(&self) -> Result<(), BluetoothError>;

    /// Establishes the link layer connection.
    async fn connect(&self, id: &str) -> Result<(), BluetoothError>;

    async fn disconnect(&self, id: &str) -> Result<(), BluetoothError>;

    /// Enumerates services in the order the device exposes them.
    async fn services(&self, id: &str) -> Result<Vec<GattService>, BluetoothError>;

    /// Enumerates characteristics of one service in device order.
    async fn characteristics(
        &self,
        id: &str,
        service: Uuid,
    ) -> Result<Vec<GattCharacteristic>, BluetoothError>;

    async fn set_notify(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), BluetoothError>;

    async fn write(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), BluetoothError>;

    async fn request_mtu(&self, id: &str, mtu: u16) -> Result<(), BluetoothError>;

    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent>;
}
