//! Constants used throughout the application
//! This module contains the constant values of the BLE link, such as UUIDs,
//! timeouts, and the positional convention used for non-conforming firmware.

use uuid::Uuid;

/// Name fragment advertised by the smart-socket module family
pub const DEVICE_FAMILY_NAME: &str = "ai-thinker";

/// Vendor "transparent UART" service advertised by conforming firmware
pub const UUID_STANDARD_SERVICE: Uuid = Uuid::from_u128(0x55535343_fe7d_4ae5_8fa9_9fafd205e455);

/// Write characteristic inside the standard service
pub const UUID_STANDARD_WRITE_CHAR: Uuid = Uuid::from_u128(0x49535343_8841_43f4_a8d4_ecbe34729bb3);

/// Notify characteristic inside the standard service
pub const UUID_STANDARD_NOTIFY_CHAR: Uuid = Uuid::from_u128(0x49535343_1e4d_4bd9_ba61_23c647249616);

/// Fallback layout: the usable service is third from the end of the service list.
pub const HEURISTIC_SERVICE_OFFSET_FROM_END: usize = 3;

/// Fallback layout: characteristic indices inside the selected service.
pub const HEURISTIC_WRITE_CHAR_INDEX: usize = 0;
pub const HEURISTIC_NOTIFY_CHAR_INDEX: usize = 1;

/// Transfer unit requested after connecting
pub const PREFERRED_MTU: u16 = 230;

/// Delay between adapter close and reopen during a reset in milliseconds
pub const ADAPTER_SETTLE_DELAY_MS: u64 = 2000;

/// Maximum number of connection retries
pub const MAX_CONNECT_RETRIES: u32 = 3;

/// Delay between connection retries in milliseconds
pub const CONNECT_RETRY_DELAY_MS: u64 = 1000;

/// Timeout for a single platform connect call in seconds
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Caller-side search timeout when reconnecting a known device
pub const DEFAULT_SEARCH_TIMEOUT_SECS: u64 = 30;

/// Caller-side search timeout when pairing from a scanned code
pub const SCAN_PAIR_TIMEOUT_SECS: u64 = 15;

/// Delay between consecutive commands of one multi-command update
pub const COMMAND_DELAY_MS: u64 = 300;

/// Number of inbound messages kept per session for diagnostics
pub const RECEIVE_HISTORY_LIMIT: usize = 200;

/// Connection monitor periodic interval in seconds
pub const MONITOR_INTERVAL_SECS: u64 = 60;

/// Connection monitor first check delay in seconds
pub const MONITOR_INITIAL_DELAY_SECS: u64 = 3;

/// Delay between two probes of one reconciliation pass in milliseconds
pub const MONITOR_PROBE_DELAY_MS: u64 = 500;

/// Upper bound for a single reachability probe in seconds
pub const MONITOR_PROBE_TIMEOUT_SECS: u64 = 5;

/// Capacity of the platform event channel
pub const PLATFORM_EVENT_CAPACITY: usize = 256;
