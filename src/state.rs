//! Application state management
//! This module wires the BLE stack, the device registry and the remote store together.

use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::core::bluetooth::communicator::DeviceCommunicator;
use crate::core::bluetooth::error::BluetoothError;
use crate::core::bluetooth::monitor::ConnectionMonitor;
use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::platform::BlePlatform;
use crate::core::device::{DeviceRecord, DeviceStore};
use crate::core::notice::NoticeBus;
use crate::core::BluetoothManager;
use crate::storage::{JsonFileStateCache, StateCache};
use crate::sync::{InMemoryRemoteStore, RemoteStore, SyncService};

/// Global application state
pub struct AppState {
    pub config: AppConfig,
    pub notices: NoticeBus,
    pub devices: Arc<DeviceStore>,
    /// The Bluetooth manager instance
    pub bluetooth_manager: Arc<Mutex<BluetoothManager>>,
    pub monitor: ConnectionMonitor,
    pub notifications: NotificationHandler,
    pub sync: SyncService,
    notification_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AppState {
    /// Builds the state from the on-disk configuration and connection cache.
    pub async fn new(platform: Arc<dyn BlePlatform>) -> Result<Self> {
        let config_dir = AppConfig::config_dir()?;
        let config = AppConfig::load(&config_dir).await;
        let cache: Arc<dyn StateCache> = Arc::new(JsonFileStateCache::open(&config_dir)?);
        info!("Initializing BluetoothManager...");
        Ok(Self::with_parts(
            platform,
            config,
            cache,
            Arc::new(InMemoryRemoteStore::default()),
        ))
    }

    /// Must be called inside a tokio runtime.
    pub fn with_parts(
        platform: Arc<dyn BlePlatform>,
        config: AppConfig,
        cache: Arc<dyn StateCache>,
        store: Arc<dyn RemoteStore>,
    ) -> Self {
        let notices = NoticeBus::default();
        let devices = Arc::new(DeviceStore::new(cache));
        let manager = BluetoothManager::new(platform.clone(), &config, notices.clone());
        let monitor = ConnectionMonitor::new(
            platform,
            manager.adapter(),
            manager.probe(),
            devices.clone(),
            notices.clone(),
            &config.monitor,
        );
        let notifications = NotificationHandler::new(devices.clone(), notices.clone());
        let sync = SyncService::new(store, config.sync.owner_id.clone());
        Self {
            config,
            notices,
            devices,
            bluetooth_manager: Arc::new(Mutex::new(manager)),
            monitor,
            notifications,
            sync,
            notification_task: std::sync::Mutex::new(None),
        }
    }

    /// Opens the adapter and starts periodic reconciliation.
    pub async fn initialize(&self) -> Result<(), BluetoothError> {
        self.bluetooth_manager.lock().await.initialize().await?;
        self.monitor.start_monitoring();
        Ok(())
    }

    /// Routes the session's inbound messages to the notification handler,
    /// replacing the consumer of any previous session.
    pub fn attach_notifications(&self, communicator: &DeviceCommunicator) {
        let task = self.notifications.attach(communicator);
        if let Ok(mut slot) = self.notification_task.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }
    }

    /// Best-effort upsert; a failure never affects local state.
    pub async fn sync_record(&self, record: &DeviceRecord) {
        if let Err(e) = self.sync.sync_device(record).await {
            warn!("Syncing device {} failed: {}", record.device_id, e);
        }
    }

    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.monitor.destroy();
        if let Ok(mut slot) = self.notification_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        self.bluetooth_manager.lock().await.destroy().await;
    }
}
