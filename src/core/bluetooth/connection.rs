//! Link-layer connection handling for smart sockets
//! This module handles connecting to and disconnecting from a device

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::timeout;

use crate::config::BluetoothConfig;
use crate::core::bluetooth::error::BluetoothError;
use crate::core::bluetooth::platform::BlePlatform;

/// Connection manager for smart sockets
#[derive(Clone)]
pub struct ConnectionManager {
    platform: Arc<dyn BlePlatform>,
    max_retries: u32,
    retry_delay: Duration,
    connect_timeout: Duration,
    mtu: u16,
}

impl ConnectionManager {
    pub fn new(platform: Arc<dyn BlePlatform>, config: &BluetoothConfig) -> Self {
        Self {
            platform,
            max_retries: config.max_connect_retries.max(1),
            retry_delay: Duration::from_millis(config.connect_retry_delay_ms),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            mtu: config.preferred_mtu,
        }
    }

    /// Connect to the device with retry mechanism.
    ///
    /// Each attempt is bounded by the connect timeout. After the link is up the
    /// preferred MTU is requested; a refusal there is not fatal.
    pub async fn connect_with_retry(&self, id: &str) -> Result<(), BluetoothError> {
        let mut last_error = None;

        for attempt in 1..=self.max_retries {
            match self.try_connect(id).await {
                Ok(()) => {
                    info!("Successfully connected to {}", id);
                    self.negotiate_mtu(id).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!("Connection attempt {} to {} failed: {}", attempt, id, e);
                    last_error = Some(e);
                    if attempt < self.max_retries {
                        info!("Retrying connection in {:?}...", self.retry_delay);
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            BluetoothError::transport(format!(
                "failed to connect after {} attempts",
                self.max_retries
            ))
        }))
    }

    async fn try_connect(&self, id: &str) -> Result<(), BluetoothError> {
        info!("Initiating connection to {}...", id);
        match timeout(self.connect_timeout, self.platform.connect(id)).await {
            Ok(result) => result,
            Err(_) => {
                // Leave no half-open link behind the timed-out attempt.
                let _ = self.platform.disconnect(id).await;
                Err(BluetoothError::Timeout {
                    operation: "connect",
                    after: self.connect_timeout,
                })
            }
        }
    }

    async fn negotiate_mtu(&self, id: &str) {
        match self.platform.request_mtu(id, self.mtu).await {
            Ok(()) => debug!("Requested MTU {} for {}", self.mtu, id),
            Err(e) => warn!("MTU request for {} refused, keeping default: {}", id, e),
        }
    }

    /// Disconnect from the device
    pub async fn disconnect(&self, id: &str) -> Result<(), BluetoothError> {
        info!("Disconnecting from device {}", id);
        self.platform.disconnect(id).await?;
        info!("Successfully disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::mock::{Call, MockDevice, MockPlatform};

    fn manager(platform: &Arc<MockPlatform>) -> ConnectionManager {
        ConnectionManager::new(platform.clone(), &BluetoothConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_the_link_comes_up() {
        let platform = MockPlatform::new();
        platform.add_device(
            "AA:BB",
            MockDevice {
                failing_connects: 2,
                ..MockDevice::standard()
            },
        );

        manager(&platform).connect_with_retry("AA:BB").await.unwrap();

        let connects = platform
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Connect(_)))
            .count();
        assert_eq!(connects, 3);
        assert!(platform.calls().contains(&Call::RequestMtu("AA:BB".into(), 230)));
        assert!(platform.is_device_connected("AA:BB"));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let platform = MockPlatform::new();
        platform.add_device(
            "AA:BB",
            MockDevice {
                failing_connects: 10,
                ..MockDevice::standard()
            },
        );

        let err = manager(&platform).connect_with_retry("AA:BB").await.unwrap_err();
        assert!(matches!(err, BluetoothError::Transport(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_connect_times_out() {
        let platform = MockPlatform::new();
        platform.add_device(
            "AA:BB",
            MockDevice {
                hang_connect: true,
                ..MockDevice::standard()
            },
        );

        let err = manager(&platform).connect_with_retry("AA:BB").await.unwrap_err();
        assert!(matches!(err, BluetoothError::Timeout { operation: "connect", .. }));
        assert!(platform.calls().contains(&Call::Disconnect("AA:BB".into())));
    }
}
