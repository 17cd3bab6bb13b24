//! Smart-socket companion library
//! BLE transport, device registry and remote sync for smart-socket devices.

// Module declarations
pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
pub mod storage;
pub mod sync;
pub mod utils;
