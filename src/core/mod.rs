//! Core functionality for the smart-socket companion
//! This module contains the BLE transport and the device domain built on top of it

pub mod bluetooth;
pub mod device;
pub mod notice;

// Re-export commonly used types
pub use bluetooth::BluetoothManager;
pub use device::{DeviceRecord, DeviceStore};
pub use notice::{Notice, NoticeBus, NoticeLevel, NoticeStyle};
