//! Error taxonomy of the BLE layer.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BluetoothError {
    /// Radio unavailable or permission denied. The user has to enable Bluetooth.
    #[error("Bluetooth adapter unavailable: {0}")]
    Adapter(String),

    /// Discovery could not be started
    #[error("Failed to start device discovery: {0}")]
    Scan(String),

    /// The device's GATT layout did not match a supported pattern
    #[error("GATT resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    /// Write or link failure on an otherwise resolved device; the operation may be retried
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl BluetoothError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Adapter and scan failures need user action and are shown as a modal notice.
    pub fn requires_user_action(&self) -> bool {
        matches!(self, Self::Adapter(_) | Self::Scan(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("no services")]
    NoServices,

    #[error("standard service missing notify characteristic")]
    StandardServiceMissingNotify,

    #[error("insufficient services: found {found}, need at least {required}")]
    InsufficientServices { found: usize, required: usize },

    #[error("insufficient characteristics in service {service}: found {found}, need at least 2")]
    InsufficientCharacteristics { service: Uuid, found: usize },

    #[error("characteristic {characteristic} does not support write or write without response")]
    WriteUnsupported { characteristic: Uuid },

    #[error("characteristic {characteristic} does not support notify or indicate")]
    NotifyUnsupported { characteristic: Uuid },

    #[error("failed to enable notifications on {characteristic}: {reason}")]
    EnableNotifications { characteristic: Uuid, reason: String },

    #[error("discovery failed: {0}")]
    Discovery(String),
}
