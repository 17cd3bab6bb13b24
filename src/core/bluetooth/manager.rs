//! Bluetooth manager for the smart-socket companion
//! This module provides the main interface for bluetooth operations

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::AppConfig;
use crate::core::bluetooth::adapter::AdapterManager;
use crate::core::bluetooth::commands::{CommandSender, DeviceCommand};
use crate::core::bluetooth::communicator::DeviceCommunicator;
use crate::core::bluetooth::connection::ConnectionManager;
use crate::core::bluetooth::error::BluetoothError;
use crate::core::bluetooth::monitor::ReachabilityProbe;
use crate::core::bluetooth::platform::BlePlatform;
use crate::core::bluetooth::resolver::GattResolver;
use crate::core::bluetooth::scanner::{BluetoothScanner, DeviceTarget, ScannerEvent};
use crate::core::bluetooth::types::{DiscoveredDevice, PlatformEvent};
use crate::core::notice::NoticeBus;

/// How long the watcher waits for a session to confirm a reported link loss.
const LINK_LOSS_CONFIRMATION: Duration = Duration::from_millis(500);

struct CurrentSession {
    generation: u64,
    communicator: Arc<DeviceCommunicator>,
}

type CurrentSlot = Arc<Mutex<Option<CurrentSession>>>;

/// Manages Bluetooth operations around a single current device
pub struct BluetoothManager {
    platform: Arc<dyn BlePlatform>,
    adapter: Arc<AdapterManager>,
    scanner: BluetoothScanner,
    resolver: Arc<GattResolver>,
    connection_manager: ConnectionManager,
    probe: Arc<ReachabilityProbe>,
    notices: NoticeBus,
    /// Currently connected device
    current: CurrentSlot,
    generation: u64,
    history_limit: usize,
    watcher: JoinHandle<()>,
}

impl BluetoothManager {
    /// Creates a new BluetoothManager. Must be called inside a tokio runtime.
    pub fn new(platform: Arc<dyn BlePlatform>, config: &AppConfig, notices: NoticeBus) -> Self {
        let adapter = Arc::new(AdapterManager::new(
            platform.clone(),
            config.bluetooth.settle_delay(),
        ));
        let resolver = Arc::new(GattResolver::new(platform.clone()));
        let scanner = BluetoothScanner::new(
            platform.clone(),
            adapter.clone(),
            &config.bluetooth,
            notices.clone(),
        );
        let probe = Arc::new(ReachabilityProbe::new(
            platform.clone(),
            resolver.clone(),
            adapter.clone(),
            &config.monitor,
        ));
        let current: CurrentSlot = Arc::new(Mutex::new(None));
        let watcher = Self::spawn_watcher(platform.subscribe(), current.clone());

        Self {
            connection_manager: ConnectionManager::new(platform.clone(), &config.bluetooth),
            platform,
            adapter,
            scanner,
            resolver,
            probe,
            notices,
            current,
            generation: 0,
            history_limit: config.bluetooth.receive_history_limit,
            watcher,
        }
    }

    pub fn platform(&self) -> Arc<dyn BlePlatform> {
        self.platform.clone()
    }

    pub fn adapter(&self) -> Arc<AdapterManager> {
        self.adapter.clone()
    }

    pub fn probe(&self) -> Arc<ReachabilityProbe> {
        self.probe.clone()
    }

    /// One process-wide subscription that keeps `current` from pointing at a dead session.
    fn spawn_watcher(
        mut events: broadcast::Receiver<PlatformEvent>,
        current: CurrentSlot,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let suspect = match events.recv().await {
                    Ok(PlatformEvent::ConnectionStateChanged {
                        id,
                        connected: false,
                    }) => Some(id),
                    Ok(PlatformEvent::AdapterStateChanged(state)) if !state.available => None,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Manager watcher lagged by {} events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let session = {
                    let Ok(slot) = current.lock() else { break };
                    match slot.as_ref() {
                        Some(s)
                            if suspect.as_deref().is_none_or(|id| id == s.communicator.id()) =>
                        {
                            Some((s.generation, s.communicator.clone()))
                        }
                        _ => None,
                    }
                };
                let Some((generation, communicator)) = session else {
                    continue;
                };

                // A late event from an earlier session with the same identity is not
                // confirmed by the live one and is ignored.
                let mut connection = communicator.subscribe_connection();
                let confirmed =
                    timeout(LINK_LOSS_CONFIRMATION, connection.wait_for(|connected| !*connected))
                        .await
                        .is_ok();
                if !confirmed {
                    debug!("Ignoring stale disconnect for {}", communicator.id());
                    continue;
                }

                let dead = {
                    let Ok(mut slot) = current.lock() else { break };
                    match slot.as_ref() {
                        Some(s) if s.generation == generation => slot.take(),
                        _ => None,
                    }
                };
                if let Some(dead) = dead {
                    info!(
                        "Current device {} disconnected, clearing session",
                        dead.communicator.id()
                    );
                    dead.communicator.destroy();
                }
            }
        })
    }

    /// Opens the adapter. Failure needs the user to enable Bluetooth.
    pub async fn initialize(&self) -> Result<(), BluetoothError> {
        if let Err(e) = self.adapter.open().await {
            error!("Bluetooth initialization failed: {}", e);
            self.notices.modal(
                "Bluetooth unavailable",
                "Please turn on Bluetooth and allow access, then try again.",
            );
            return Err(e);
        }
        Ok(())
    }

    pub async fn start_search(&mut self) -> Result<(), BluetoothError> {
        self.scanner.start_search().await
    }

    pub async fn stop_search(&mut self) {
        self.scanner.stop_search().await
    }

    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.scanner.devices()
    }

    pub fn subscribe_scanner(&self) -> broadcast::Receiver<ScannerEvent> {
        self.scanner.subscribe()
    }

    /// Searches until a device matching `target` shows up or `wait` elapses.
    /// The search is stopped either way.
    pub async fn find_device(
        &mut self,
        target: &DeviceTarget,
        wait: Duration,
    ) -> Result<DiscoveredDevice, BluetoothError> {
        let mut events = self.scanner.subscribe();
        self.scanner.start_search().await?;

        let scanner = &self.scanner;
        let search = async {
            loop {
                match events.recv().await {
                    Ok(ScannerEvent::DevicesChanged(snapshot)) => {
                        if let Some(found) = snapshot.into_iter().find(|d| target.matches(d)) {
                            return Some(found);
                        }
                    }
                    Ok(ScannerEvent::StateChanged(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let found = scanner.devices().into_iter().find(|d| target.matches(d));
                        if found.is_some() {
                            return found;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };
        let outcome = timeout(wait, search).await;
        self.scanner.stop_search().await;

        match outcome {
            Ok(Some(device)) => {
                info!("Found target device {} ({})", device.name, device.id);
                Ok(device)
            }
            Ok(None) => Err(BluetoothError::Scan("scanner stopped".into())),
            Err(_) => {
                warn!("Device not found within {:?}", wait);
                Err(BluetoothError::Timeout {
                    operation: "device search",
                    after: wait,
                })
            }
        }
    }

    /// Connects to a device, replacing the current session.
    ///
    /// The new session becomes current only once connected and fully resolved;
    /// any failure leaves no session behind.
    pub async fn connect_device(
        &mut self,
        device_id: &str,
    ) -> Result<Arc<DeviceCommunicator>, BluetoothError> {
        self.teardown_current().await;
        self.generation += 1;
        let generation = self.generation;

        info!("Connecting to device {}", device_id);
        self.connection_manager.connect_with_retry(device_id).await?;

        let communicator = Arc::new(DeviceCommunicator::new(
            device_id,
            self.platform.clone(),
            self.resolver.clone(),
            self.history_limit,
        ));
        if let Err(e) = communicator.initialize().await {
            error!("Setting up {} failed: {}", device_id, e);
            communicator.destroy();
            if let Err(e) = self.connection_manager.disconnect(device_id).await {
                debug!("Disconnect after failed setup also failed: {}", e);
            }
            return Err(e);
        }

        if let Ok(mut slot) = self.current.lock() {
            *slot = Some(CurrentSession {
                generation,
                communicator: communicator.clone(),
            });
        }
        info!("Device {} successfully connected and stored as current.", device_id);
        Ok(communicator)
    }

    async fn teardown_current(&mut self) {
        let previous = self.current.lock().ok().and_then(|mut slot| slot.take());
        if let Some(previous) = previous {
            info!("Tearing down session for {}", previous.communicator.id());
            previous.communicator.disconnect().await;
            previous.communicator.destroy();
        }
    }

    /// Disconnects from the current device, if any.
    pub async fn disconnect(&mut self) {
        if self.current_device_id().is_none() {
            debug!("disconnect called without a current device");
        }
        self.teardown_current().await;
    }

    pub fn current_communicator(&self) -> Option<Arc<DeviceCommunicator>> {
        self.current
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|s| s.communicator.clone()))
    }

    /// Returns the ID of the currently connected device
    pub fn current_device_id(&self) -> Option<String> {
        self.current_communicator().map(|c| c.id().to_string())
    }

    pub fn has_connected_device(&self) -> bool {
        self.current_communicator()
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    pub async fn send_message(&self, text: &str) -> Result<(), BluetoothError> {
        let communicator = self
            .current_communicator()
            .ok_or_else(|| BluetoothError::transport("no connected device"))?;
        communicator.send_message(text).await
    }

    /// Disconnect, stop searching, reset the adapter. Every step runs; only the
    /// adapter reopen can fail the call.
    pub async fn reset(&mut self) -> Result<(), BluetoothError> {
        info!("Resetting Bluetooth stack");
        self.teardown_current().await;
        self.scanner.stop_search().await;
        self.resolver.clear();
        self.adapter.reset().await
    }

    pub async fn check_device_connection_state(&self, device_id: &str) -> bool {
        self.probe.probe(device_id).await
    }

    pub async fn check_all_devices_connection_state(
        &self,
        device_ids: &[String],
    ) -> HashMap<String, bool> {
        self.probe.probe_all(device_ids).await.into_iter().collect()
    }

    pub async fn destroy(&mut self) {
        info!("Shutting down Bluetooth manager");
        self.teardown_current().await;
        self.scanner.stop_search().await;
        self.watcher.abort();
        self.resolver.clear();
        self.adapter.close().await;
    }
}

impl Drop for BluetoothManager {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

#[async_trait]
impl CommandSender for BluetoothManager {
    async fn send_command(&self, command: DeviceCommand) -> Result<(), BluetoothError> {
        info!("Sending command to current device: {:?}", command);
        self.send_message(&command.to_frame()).await
    }
}
