use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, error, info, warn};
use regex::Regex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BluetoothConfig;
use crate::core::bluetooth::adapter::AdapterManager;
use crate::core::bluetooth::error::BluetoothError;
use crate::core::bluetooth::platform::BlePlatform;
use crate::core::bluetooth::types::{AdapterState, DiscoveredDevice, PlatformEvent, ScanOptions};
use crate::core::notice::NoticeBus;

/// Scanner output. Device events always carry the full filtered snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum ScannerEvent {
    DevicesChanged(Vec<DiscoveredDevice>),
    StateChanged(AdapterState),
}

type DeviceSet = Arc<Mutex<Vec<DiscoveredDevice>>>;

pub struct BluetoothScanner {
    platform: Arc<dyn BlePlatform>,
    adapter: Arc<AdapterManager>,
    name_filters: Arc<Vec<String>>,
    options: ScanOptions,
    devices: DeviceSet,
    events: broadcast::Sender<ScannerEvent>,
    notices: NoticeBus,
    cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<()>>,
    state_task_handle: JoinHandle<()>,
}

impl BluetoothScanner {
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        adapter: Arc<AdapterManager>,
        config: &BluetoothConfig,
        notices: NoticeBus,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let devices: DeviceSet = Arc::new(Mutex::new(Vec::new()));
        let state_task_handle =
            Self::spawn_state_task(adapter.subscribe(), devices.clone(), events.clone());

        Self {
            platform,
            adapter,
            name_filters: Arc::new(
                config
                    .device_name_filters
                    .iter()
                    .map(|f| f.to_lowercase())
                    .collect(),
            ),
            options: config.scan_options(),
            devices,
            events,
            notices,
            cancel_token: CancellationToken::new(),
            scan_task_handle: None,
            state_task_handle,
        }
    }

    /// Mirrors adapter state; a dead radio empties the discovered set.
    fn spawn_state_task(
        mut states: broadcast::Receiver<AdapterState>,
        devices: DeviceSet,
        events: broadcast::Sender<ScannerEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match states.recv().await {
                    Ok(state) => {
                        let _ = events.send(ScannerEvent::StateChanged(state));
                        if !state.available {
                            info!("Adapter unavailable, clearing discovered devices");
                            if let Ok(mut set) = devices.lock() {
                                set.clear();
                            }
                            let _ = events.send(ScannerEvent::DevicesChanged(Vec::new()));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Scanner state listener lagged by {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn start_search(&mut self) -> Result<(), BluetoothError> {
        if self.scan_task_handle.is_some() {
            self.stop_search().await;
        }

        let available = self
            .adapter
            .state()
            .await
            .map(|s| s.available)
            .unwrap_or(false);
        if !available {
            if let Err(e) = self.adapter.open().await {
                error!("Cannot start search, adapter did not open: {}", e);
                self.notices.modal(
                    "Bluetooth unavailable",
                    "Please turn on Bluetooth and allow access, then try again.",
                );
                return Err(BluetoothError::Scan(e.to_string()));
            }
        }

        // Clear existing devices
        self.clear();

        self.cancel_token = CancellationToken::new();
        // Subscribe before discovery starts so the first advertisements are not missed.
        let platform_events = self.platform.subscribe();
        let handle = tokio::spawn(Self::internal_scan_task(
            platform_events,
            self.devices.clone(),
            self.events.clone(),
            self.cancel_token.clone(),
            self.name_filters.clone(),
        ));
        self.scan_task_handle = Some(handle);

        if let Err(e) = self.platform.start_discovery(self.options.clone()).await {
            error!("Failed to start discovery: {}", e);
            self.cancel_token.cancel();
            if let Some(handle) = self.scan_task_handle.take() {
                let _ = handle.await;
            }
            self.notices.modal(
                "Bluetooth unavailable",
                "Device search could not start. Is Bluetooth turned on?",
            );
            return Err(BluetoothError::Scan(e.to_string()));
        }

        let _ = self.adapter.state().await;
        info!("Device search started.");
        Ok(())
    }

    async fn internal_scan_task(
        mut platform_events: broadcast::Receiver<PlatformEvent>,
        devices: DeviceSet,
        events: broadcast::Sender<ScannerEvent>,
        cancel_token: CancellationToken,
        name_filters: Arc<Vec<String>>,
    ) {
        loop {
            tokio::select! {
                result = platform_events.recv() => {
                    match result {
                        Ok(PlatformEvent::DeviceFound(advertisement)) => {
                            let name = advertisement.name.as_deref().unwrap_or_default();
                            if !matches_family(name, &name_filters) {
                                continue;
                            }
                            debug!("Found device - ID: {}, Name: {}, RSSI: {:?}",
                                advertisement.id, name, advertisement.rssi);
                            let snapshot = {
                                let Ok(mut set) = devices.lock() else { break };
                                match set.iter_mut().find(|d| d.id == advertisement.id) {
                                    Some(existing) => existing.update(&advertisement),
                                    None => set
                                        .push(DiscoveredDevice::from_advertisement(&advertisement)),
                                }
                                set.clone()
                            };
                            let _ = events.send(ScannerEvent::DevicesChanged(snapshot));
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Scan task lagged, {} platform events skipped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("Platform event stream has ended.");
                            break;
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
    }

    /// Stops discovery. Calling it while not searching does nothing.
    pub async fn stop_search(&mut self) {
        let Some(handle) = self.scan_task_handle.take() else {
            debug!("stop_search called while not searching");
            return;
        };
        info!("Stopping device search.");
        self.cancel_token.cancel();
        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                error!("Scan task finished with an unexpected join error: {:?}", e);
            }
        }
        if let Err(e) = self.platform.stop_discovery().await {
            warn!("Stopping discovery failed: {}", e);
        }
        let _ = self.adapter.state().await;
    }

    pub fn is_searching(&self) -> bool {
        self.scan_task_handle.is_some()
    }

    /// Current filtered snapshot
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.devices.lock().map(|set| set.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut set) = self.devices.lock() {
            set.clear();
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScannerEvent> {
        self.events.subscribe()
    }
}

impl Drop for BluetoothScanner {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        self.state_task_handle.abort();
    }
}

/// Advertisers outside the device family are noise and never reach the snapshot.
pub fn matches_family(name: &str, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }
    let name = name.to_lowercase();
    filters.iter().any(|f| name.contains(f.as_str()))
}

fn mac_pattern() -> &'static Regex {
    static MAC: OnceLock<Regex> = OnceLock::new();
    MAC.get_or_init(|| {
        Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").expect("valid MAC pattern")
    })
}

/// Pulls the last MAC-looking fragment out of a platform identity.
pub fn extract_mac_address(device_id: &str) -> Option<String> {
    mac_pattern()
        .find_iter(device_id)
        .last()
        .map(|m| m.as_str().to_uppercase().replace('-', ":"))
}

/// Upper-case identity with separators removed, for comparisons only.
pub fn normalize_identity(device_id: &str) -> String {
    let id = extract_mac_address(device_id).unwrap_or_else(|| device_id.to_string());
    id.to_uppercase().replace([':', '-'], "")
}

/// Which device a caller is waiting for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceTarget {
    pub identity: Option<String>,
    pub name: Option<String>,
    pub serial_number: Option<String>,
}

impl DeviceTarget {
    pub fn known(identity: &str, name: &str) -> Self {
        Self {
            identity: Some(identity.to_string()),
            name: (!name.is_empty()).then(|| name.to_string()),
            serial_number: None,
        }
    }

    /// Parses a scanned code: a JSON object with `name`, `mac`/`address`, `sn`/`serial`,
    /// or a bare MAC address.
    pub fn parse(code: &str) -> Option<Self> {
        let input = code.trim();
        if let Ok(Value::Object(json)) = serde_json::from_str::<Value>(input) {
            let field = |keys: &[&str]| {
                keys.iter()
                    .find_map(|k| json.get(*k).and_then(Value::as_str))
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            };
            let target = Self {
                identity: field(&["mac", "address"]).map(|m| m.to_uppercase().replace('-', ":")),
                name: field(&["name"]),
                serial_number: field(&["sn", "serial"]),
            };
            return (target.identity.is_some() || target.name.is_some()).then_some(target);
        }

        let whole_mac = mac_pattern()
            .find(input)
            .filter(|m| m.start() == 0 && m.end() == input.len());
        if whole_mac.is_some() {
            return Some(Self {
                identity: Some(input.to_uppercase().replace('-', ":")),
                ..Default::default()
            });
        }
        warn!("Unrecognised device code: {}", input);
        None
    }

    pub fn matches(&self, device: &DiscoveredDevice) -> bool {
        if let Some(identity) = &self.identity {
            if device.id == *identity
                || normalize_identity(&device.id) == normalize_identity(identity)
            {
                return true;
            }
        }
        match &self.name {
            Some(name) if !device.name.is_empty() => {
                let wanted = name.to_lowercase();
                let seen = device.name.to_lowercase();
                seen == wanted || seen.contains(&wanted)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::mock::{Call, MockPlatform};
    use std::time::Duration;

    async fn scanner(platform: &Arc<MockPlatform>) -> (Arc<AdapterManager>, BluetoothScanner) {
        let adapter = Arc::new(AdapterManager::new(platform.clone(), Duration::from_millis(10)));
        let scanner = BluetoothScanner::new(
            platform.clone(),
            adapter.clone(),
            &BluetoothConfig::default(),
            NoticeBus::default(),
        );
        (adapter, scanner)
    }

    async fn next_snapshot(
        events: &mut broadcast::Receiver<ScannerEvent>,
    ) -> Vec<DiscoveredDevice> {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .expect("scanner event")
                .expect("open channel");
            if let ScannerEvent::DevicesChanged(snapshot) = event {
                return snapshot;
            }
        }
    }

    #[tokio::test]
    async fn re_advertisement_updates_in_place() {
        let platform = MockPlatform::new();
        let (_adapter, mut scanner) = scanner(&platform).await;
        let mut events = scanner.subscribe();
        scanner.start_search().await.unwrap();

        platform.advertise("AA:BB", "ai-thinker", -70);
        platform.advertise("CC:DD", "Mi Band", -40);
        platform.advertise("AA:BB", "ai-thinker", -52);
        platform.advertise("EE:FF", "AI-Thinker-2", -60);

        assert_eq!(next_snapshot(&mut events).await.len(), 1);
        let second = next_snapshot(&mut events).await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].rssi, -52);
        let third = next_snapshot(&mut events).await;
        assert_eq!(
            third.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            vec!["AA:BB", "EE:FF"]
        );
        scanner.stop_search().await;
    }

    #[tokio::test]
    async fn start_search_without_radio_is_a_scan_error() {
        let platform = MockPlatform::new();
        platform.set_powered(false);
        let adapter = Arc::new(AdapterManager::new(platform.clone(), Duration::from_millis(10)));
        let notices = NoticeBus::default();
        let mut notice_rx = notices.subscribe();
        let mut scanner =
            BluetoothScanner::new(platform.clone(), adapter, &BluetoothConfig::default(), notices);

        assert!(matches!(scanner.start_search().await, Err(BluetoothError::Scan(_))));
        let notice = notice_rx.try_recv().unwrap();
        assert_eq!(notice.style, crate::core::notice::NoticeStyle::Modal);
        assert!(!scanner.is_searching());
    }

    #[tokio::test]
    async fn search_asks_for_one_report_per_device() {
        let platform = MockPlatform::new();
        let (_adapter, mut scanner) = scanner(&platform).await;

        scanner.start_search().await.unwrap();

        let discovery: Vec<Call> = platform
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::StartDiscovery(_)))
            .collect();
        assert_eq!(
            discovery,
            vec![Call::StartDiscovery(ScanOptions {
                allow_duplicates: false,
                interval: Duration::ZERO,
                services: Vec::new(),
            })]
        );
        scanner.stop_search().await;
    }

    #[tokio::test]
    async fn stop_search_when_idle_is_a_no_op() {
        let platform = MockPlatform::new();
        let (_adapter, mut scanner) = scanner(&platform).await;
        scanner.stop_search().await;
        assert!(platform.calls().is_empty());
    }

    #[tokio::test]
    async fn radio_loss_clears_the_set() {
        let platform = MockPlatform::new();
        let (_adapter, mut scanner) = scanner(&platform).await;
        let mut events = scanner.subscribe();
        scanner.start_search().await.unwrap();
        platform.advertise("AA:BB", "ai-thinker", -70);
        assert_eq!(next_snapshot(&mut events).await.len(), 1);

        platform.set_powered(false);

        assert!(next_snapshot(&mut events).await.is_empty());
        assert!(scanner.devices().is_empty());
    }

    #[test]
    fn parse_codes() {
        assert_eq!(
            DeviceTarget::parse("aa-bb-cc-dd-ee-ff"),
            Some(DeviceTarget {
                identity: Some("AA:BB:CC:DD:EE:FF".into()),
                ..Default::default()
            })
        );
        let json =
            DeviceTarget::parse(r#"{"name":"socket-7","mac":"11:22:33:44:55:66","sn":"SN1"}"#)
                .unwrap();
        assert_eq!(json.name.as_deref(), Some("socket-7"));
        assert_eq!(json.serial_number.as_deref(), Some("SN1"));
        assert_eq!(DeviceTarget::parse("hello"), None);
        assert_eq!(DeviceTarget::parse(r#"{"sn":"only"}"#), None);
    }

    #[test]
    fn target_matches_normalised_identity() {
        let device = DiscoveredDevice {
            id: "BluetoothLE#BluetoothLE00:00:00:00:00:01-aa:bb:cc:dd:ee:ff".into(),
            name: "ai-thinker".into(),
            rssi: -60,
            advertised_services: Default::default(),
            advertisement: Vec::new(),
        };
        assert!(DeviceTarget::parse("AA:BB:CC:DD:EE:FF").unwrap().matches(&device));
        assert!(!DeviceTarget::parse("AA:BB:CC:DD:EE:00").unwrap().matches(&device));
        assert!(DeviceTarget::known("gone", "AI-THINKER").matches(&device));
    }
}
