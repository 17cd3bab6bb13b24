//! Adapter lifecycle: open, close, reset and state-change fan-out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::core::bluetooth::error::BluetoothError;
use crate::core::bluetooth::platform::BlePlatform;
use crate::core::bluetooth::types::{AdapterState, PlatformEvent};

/// Owns the radio adapter. Constructed once per process and shared by reference.
pub struct AdapterManager {
    platform: Arc<dyn BlePlatform>,
    settle_delay: Duration,
    shared: Arc<SharedState>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

struct SharedState {
    last_known: Mutex<AdapterState>,
    observers: broadcast::Sender<AdapterState>,
}

impl SharedState {
    /// Records the state and notifies observers if it differs from the last one.
    fn publish(&self, state: AdapterState) {
        let changed = {
            let Ok(mut last) = self.last_known.lock() else {
                return;
            };
            let changed = *last != state;
            *last = state;
            changed
        };
        if changed {
            info!(
                "Adapter state changed: available={}, discovering={}",
                state.available, state.discovering
            );
            let _ = self.observers.send(state);
        }
    }
}

impl AdapterManager {
    pub fn new(platform: Arc<dyn BlePlatform>, settle_delay: Duration) -> Self {
        let (observers, _) = broadcast::channel(32);
        Self {
            platform,
            settle_delay,
            shared: Arc::new(SharedState {
                last_known: Mutex::new(AdapterState::default()),
                observers,
            }),
            listener: Mutex::new(None),
        }
    }

    /// Powers the radio stack in central mode.
    pub async fn open(&self) -> Result<(), BluetoothError> {
        self.ensure_listener();
        info!("Opening Bluetooth adapter (central mode)");
        self.platform.open_adapter().await.map_err(|e| match e {
            BluetoothError::Adapter(_) => e,
            other => BluetoothError::Adapter(other.to_string()),
        })?;
        self.state().await?;
        Ok(())
    }

    /// Releases the radio. Failures are logged and otherwise ignored.
    pub async fn close(&self) {
        info!("Closing Bluetooth adapter");
        if let Err(e) = self.platform.close_adapter().await {
            warn!("Closing the adapter failed, continuing: {}", e);
        }
    }

    /// close, settle, reopen; in that order. Only the reopen can fail.
    pub async fn reset(&self) -> Result<(), BluetoothError> {
        info!("Resetting Bluetooth adapter");
        self.close().await;
        sleep(self.settle_delay).await;
        match self.open().await {
            Ok(()) => {
                info!("Bluetooth adapter reset complete");
                Ok(())
            }
            Err(e) => {
                error!("Reopening the adapter after reset failed: {}", e);
                Err(e)
            }
        }
    }

    /// Queries the platform so radios toggled outside the app are noticed.
    pub async fn state(&self) -> Result<AdapterState, BluetoothError> {
        let state = self.platform.adapter_state().await?;
        self.shared.publish(state);
        Ok(state)
    }

    /// Last state observed without querying the platform.
    pub fn last_known(&self) -> AdapterState {
        self.shared
            .last_known
            .lock()
            .map(|state| *state)
            .unwrap_or_default()
    }

    /// Observers receive every state transition; dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<AdapterState> {
        self.shared.observers.subscribe()
    }

    /// Subscribes to platform state changes exactly once.
    fn ensure_listener(&self) {
        let Ok(mut listener) = self.listener.lock() else {
            return;
        };
        if listener.is_some() {
            return;
        }
        let mut events = self.platform.subscribe();
        let shared = self.shared.clone();
        *listener = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(PlatformEvent::AdapterStateChanged(state)) => shared.publish(state),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Adapter listener lagged by {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }
}

impl Drop for AdapterManager {
    fn drop(&mut self) {
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(handle) = listener.take() {
                handle.abort();
            }
        }
    }
}
