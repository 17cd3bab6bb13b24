//! Reconciles believed connection state with what the radio actually reports.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::config::MonitorConfig;
use crate::core::bluetooth::adapter::AdapterManager;
use crate::core::bluetooth::platform::BlePlatform;
use crate::core::bluetooth::resolver::GattResolver;
use crate::core::bluetooth::types::{AdapterState, PlatformEvent};
use crate::core::device::DeviceStore;
use crate::core::notice::{NoticeBus, NoticeLevel};

/// Active reachability check: a GATT query only succeeds on a live link.
pub struct ReachabilityProbe {
    platform: Arc<dyn BlePlatform>,
    resolver: Arc<GattResolver>,
    adapter: Arc<AdapterManager>,
    probe_timeout: Duration,
    probe_delay: Duration,
}

impl ReachabilityProbe {
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        resolver: Arc<GattResolver>,
        adapter: Arc<AdapterManager>,
        config: &MonitorConfig,
    ) -> Self {
        Self {
            platform,
            resolver,
            adapter,
            probe_timeout: config.probe_timeout(),
            probe_delay: config.probe_delay(),
        }
    }

    async fn adapter_available(&self) -> bool {
        self.adapter
            .state()
            .await
            .map(|state| state.available)
            .unwrap_or(false)
    }

    /// Probes one identity, using the cached endpoint to keep the query small.
    pub async fn probe(&self, id: &str) -> bool {
        if !self.adapter_available().await {
            return false;
        }
        self.probe_link(id).await
    }

    async fn probe_link(&self, id: &str) -> bool {
        let query = async {
            match self.resolver.cached(id) {
                Some(endpoint) => self
                    .platform
                    .characteristics(id, endpoint.service)
                    .await
                    .map(|_| ()),
                None => self.platform.services(id).await.map(|_| ()),
            }
        };
        match timeout(self.probe_timeout, query).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", id, e);
                false
            }
            Err(_) => {
                debug!("Probe of {} timed out after {:?}", id, self.probe_timeout);
                false
            }
        }
    }

    /// Probes sequentially with a pause in between. A dead radio answers
    /// `false` for everyone without touching the platform.
    pub async fn probe_all(&self, ids: &[String]) -> Vec<(String, bool)> {
        if !self.adapter_available().await {
            return ids.iter().map(|id| (id.clone(), false)).collect();
        }
        let mut results = Vec::with_capacity(ids.len());
        for (index, id) in ids.iter().enumerate() {
            if index > 0 {
                sleep(self.probe_delay).await;
            }
            results.push((id.clone(), self.probe_link(id).await));
        }
        results
    }
}

/// Outcome of an on-demand check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckSummary {
    pub changed: usize,
    pub unchanged: usize,
}

struct MonitorInner {
    probe: Arc<ReachabilityProbe>,
    devices: Arc<DeviceStore>,
    notices: NoticeBus,
    beliefs: Mutex<HashMap<String, bool>>,
}

impl MonitorInner {
    /// Stores the new belief and returns the previous one.
    fn set_belief(&self, id: &str, connected: bool) -> Option<bool> {
        self.beliefs
            .lock()
            .ok()
            .and_then(|mut beliefs| beliefs.insert(id.to_string(), connected))
    }

    fn forget(&self, id: &str) {
        if let Ok(mut beliefs) = self.beliefs.lock() {
            beliefs.remove(id);
        }
    }

    /// Applies one observed state to a tracked device. Returns true when it
    /// disagreed with the belief; only then is a notice published. Identities
    /// with no belief yet start from the record's flag.
    fn apply(&self, id: &str, connected: bool, announce: bool) -> bool {
        let Some(record) = self.devices.find(id) else {
            debug!("Ignoring state of untracked device {}", id);
            return false;
        };
        let believed = self.set_belief(id, connected).unwrap_or(record.connected);
        self.devices.update_status(id, connected);
        if believed == connected {
            return false;
        }
        info!("Device {} is now {}", id, if connected { "connected" } else { "disconnected" });
        if announce {
            let name = if record.name.is_empty() {
                record.device_id
            } else {
                record.name
            };
            if connected {
                self.notices.toast(NoticeLevel::Success, format!("{name} connected"));
            } else {
                self.notices.toast(NoticeLevel::Info, format!("{name} disconnected"));
            }
        }
        true
    }

    fn mark_all_offline(&self) {
        warn!("Bluetooth unavailable, marking all devices offline");
        for id in self.devices.identities() {
            self.set_belief(&id, false);
            self.devices.update_status(&id, false);
        }
        self.notices
            .toast(NoticeLevel::Warning, "Bluetooth unavailable, devices are offline");
    }

    async fn reconcile(&self, announce: bool) -> CheckSummary {
        let ids = self.devices.identities();
        if let Ok(mut beliefs) = self.beliefs.lock() {
            beliefs.retain(|id, _| ids.contains(id));
        }
        let mut summary = CheckSummary::default();
        for (id, connected) in self.probe.probe_all(&ids).await {
            if self.apply(&id, connected, announce) {
                summary.changed += 1;
            } else {
                summary.unchanged += 1;
            }
        }
        summary
    }
}

pub struct ConnectionMonitor {
    inner: Arc<MonitorInner>,
    check_interval: Duration,
    initial_delay: Duration,
    schedule: Mutex<Option<CancellationToken>>,
    event_task: JoinHandle<()>,
}

impl ConnectionMonitor {
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        adapter: Arc<AdapterManager>,
        probe: Arc<ReachabilityProbe>,
        devices: Arc<DeviceStore>,
        notices: NoticeBus,
        config: &MonitorConfig,
    ) -> Self {
        let beliefs = devices
            .devices()
            .into_iter()
            .map(|d| (d.device_id, d.connected))
            .collect();
        let inner = Arc::new(MonitorInner {
            probe,
            devices,
            notices,
            beliefs: Mutex::new(beliefs),
        });
        let event_task =
            Self::spawn_event_task(inner.clone(), platform.subscribe(), adapter.subscribe());
        Self {
            inner,
            check_interval: config.check_interval(),
            initial_delay: config.initial_delay(),
            schedule: Mutex::new(None),
            event_task,
        }
    }

    /// Radio-reported link losses are authoritative and applied immediately.
    fn spawn_event_task(
        inner: Arc<MonitorInner>,
        mut platform_events: broadcast::Receiver<PlatformEvent>,
        mut adapter_states: broadcast::Receiver<AdapterState>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = platform_events.recv() => match event {
                        Ok(PlatformEvent::ConnectionStateChanged { id, connected: false }) => {
                            inner.apply(&id, false, true);
                        }
                        // A link is only usable once resolved; the session owner reports it.
                        Ok(PlatformEvent::ConnectionStateChanged { id, connected: true }) => {
                            debug!("Link to {} is up", id);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Monitor lagged by {} platform events", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    state = adapter_states.recv() => match state {
                        Ok(state) if !state.available => inner.mark_all_offline(),
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    /// Starts periodic reconciliation. Calling it while running only logs.
    pub fn start_monitoring(&self) {
        let Ok(mut schedule) = self.schedule.lock() else {
            return;
        };
        if schedule.is_some() {
            info!("Connection monitoring is already running");
            return;
        }
        info!("Starting connection monitoring");
        let token = CancellationToken::new();
        let inner = self.inner.clone();
        let cancel = token.clone();
        let initial_delay = self.initial_delay;
        let check_interval = self.check_interval;
        tokio::spawn(async move {
            let mut wait = initial_delay;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(wait) => {}
                }
                debug!("Running periodic connection check");
                let summary = inner.reconcile(true).await;
                debug!("Periodic check: {:?}", summary);
                wait = check_interval;
            }
        });
        *schedule = Some(token);
    }

    /// Safe to call when not running.
    pub fn stop_monitoring(&self) {
        if let Ok(mut schedule) = self.schedule.lock() {
            if let Some(token) = schedule.take() {
                info!("Stopping connection monitoring");
                token.cancel();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.schedule.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// On-demand pass over every known device, with one summary notice.
    pub async fn check_all_devices(&self) -> CheckSummary {
        info!("Checking connection state of all devices");
        let summary = self.inner.reconcile(false).await;
        if summary.changed > 0 {
            self.inner.notices.toast(
                NoticeLevel::Success,
                format!("{} device states updated", summary.changed),
            );
        } else {
            self.inner
                .notices
                .toast(NoticeLevel::Success, "All devices are up to date");
        }
        summary
    }

    pub async fn check_single_device(&self, id: &str) -> bool {
        let connected = self.inner.probe.probe(id).await;
        self.inner.apply(id, connected, true);
        connected
    }

    /// Entry point for connection changes observed outside the radio event stream.
    pub fn handle_connection_state_change(&self, id: &str, connected: bool) -> bool {
        self.inner.apply(id, connected, true)
    }

    /// Records a freshly adopted session without a notice; the caller announces it.
    pub fn acknowledge_session(&self, id: &str) -> bool {
        self.inner.apply(id, true, false)
    }

    /// Drops the belief for an identity that left the list or was renamed.
    pub fn forget(&self, id: &str) {
        self.inner.forget(id);
    }

    pub fn connection_states(&self) -> HashMap<String, bool> {
        self.inner
            .beliefs
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    pub fn destroy(&self) {
        self.stop_monitoring();
        if let Ok(mut beliefs) = self.inner.beliefs.lock() {
            beliefs.clear();
        }
        self.event_task.abort();
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        self.stop_monitoring();
        self.event_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BluetoothConfig;
    use crate::core::bluetooth::mock::{Call, MockDevice, MockPlatform};
    use crate::core::bluetooth::scanner::{BluetoothScanner, ScannerEvent};
    use crate::core::notice::{drain, Notice};
    use crate::storage::MemoryStateCache;

    struct Fixture {
        platform: Arc<MockPlatform>,
        adapter: Arc<AdapterManager>,
        devices: Arc<DeviceStore>,
        notices: NoticeBus,
        monitor: ConnectionMonitor,
    }

    async fn fixture(ids: &[&str]) -> Fixture {
        let platform = MockPlatform::new();
        let adapter = Arc::new(AdapterManager::new(platform.clone(), Duration::from_millis(10)));
        adapter.open().await.unwrap();
        let devices = Arc::new(DeviceStore::new(Arc::new(MemoryStateCache::default())));
        for id in ids {
            platform.add_device(id, MockDevice::standard());
            platform.connect(id).await.unwrap();
            devices.add_and_connect(id, Some(id), None);
        }
        let config = MonitorConfig::default();
        let probe = Arc::new(ReachabilityProbe::new(
            platform.clone(),
            Arc::new(GattResolver::new(platform.clone())),
            adapter.clone(),
            &config,
        ));
        let notices = NoticeBus::default();
        let monitor = ConnectionMonitor::new(
            platform.clone(),
            adapter.clone(),
            probe,
            devices.clone(),
            notices.clone(),
            &config,
        );
        Fixture {
            platform,
            adapter,
            devices,
            notices,
            monitor,
        }
    }

    fn toasts(notices: &mut broadcast::Receiver<Notice>) -> Vec<String> {
        drain(notices).into_iter().map(|n| n.title).collect()
    }

    async fn settle() {
        sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn link_loss_flips_the_record_once() {
        let f = fixture(&["AA:BB"]).await;
        let mut notices = f.notices.subscribe();

        f.platform.drop_link("AA:BB");
        f.platform.drop_link("AA:BB");
        settle().await;

        assert!(!f.devices.find("AA:BB").unwrap().connected);
        assert_eq!(toasts(&mut notices), vec!["AA:BB disconnected".to_string()]);
        assert_eq!(f.monitor.connection_states().get("AA:BB"), Some(&false));

        // A later probe agrees and stays quiet.
        assert_eq!(
            f.monitor.check_all_devices().await,
            CheckSummary { changed: 0, unchanged: 1 }
        );
        assert_eq!(toasts(&mut notices), vec!["All devices are up to date".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn check_all_probes_sequentially_and_summarises() {
        let f = fixture(&["AA:BB", "CC:DD"]).await;
        // Silent link loss: no event, only a probe can notice.
        f.platform.update_device("CC:DD", |d| d.connected = false);
        f.platform.clear_calls();

        let summary = f.monitor.check_all_devices().await;

        assert_eq!(summary, CheckSummary { changed: 1, unchanged: 1 });
        assert_eq!(
            f.platform.calls(),
            vec![Call::Services("AA:BB".into()), Call::Services("CC:DD".into())]
        );
        assert!(!f.devices.find("CC:DD").unwrap().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_checks_run_after_the_initial_delay() {
        let f = fixture(&["AA:BB"]).await;
        f.platform.clear_calls();

        f.monitor.start_monitoring();
        f.monitor.start_monitoring();
        assert!(f.monitor.is_running());

        sleep(Duration::from_secs(2)).await;
        assert!(f.platform.calls().is_empty());
        sleep(Duration::from_secs(2)).await;
        assert_eq!(f.platform.calls().len(), 1);
        sleep(Duration::from_secs(60)).await;
        assert_eq!(f.platform.calls().len(), 2);

        f.monitor.stop_monitoring();
        f.monitor.stop_monitoring();
        sleep(Duration::from_secs(120)).await;
        assert_eq!(f.platform.calls().len(), 2);
        assert!(!f.monitor.is_running());
    }

    #[tokio::test]
    async fn single_check_reports_reconnection() {
        let f = fixture(&["AA:BB"]).await;
        f.monitor.handle_connection_state_change("AA:BB", false);
        let mut notices = f.notices.subscribe();

        assert!(f.monitor.check_single_device("AA:BB").await);

        assert!(f.devices.find("AA:BB").unwrap().connected);
        assert_eq!(toasts(&mut notices), vec!["AA:BB connected".to_string()]);
    }

    #[tokio::test]
    async fn reachability_is_compared_with_beliefs() {
        let f = fixture(&["AA:BB"]).await;
        // The record drifted but the belief did not, so the check is no news.
        f.devices.update_status("AA:BB", false);
        let mut notices = f.notices.subscribe();

        assert!(f.monitor.check_single_device("AA:BB").await);

        assert!(toasts(&mut notices).is_empty());
        assert!(f.devices.find("AA:BB").unwrap().connected);
        assert_eq!(
            f.monitor.check_all_devices().await,
            CheckSummary { changed: 0, unchanged: 1 }
        );
    }

    #[tokio::test]
    async fn link_up_events_wait_for_the_session() {
        let f = fixture(&["AA:BB"]).await;
        f.monitor.handle_connection_state_change("AA:BB", false);
        let mut notices = f.notices.subscribe();

        f.platform.emit(PlatformEvent::ConnectionStateChanged {
            id: "AA:BB".into(),
            connected: true,
        });
        settle().await;

        assert!(!f.devices.find("AA:BB").unwrap().connected);
        assert!(toasts(&mut notices).is_empty());

        assert!(f.monitor.acknowledge_session("AA:BB"));
        assert!(f.devices.find("AA:BB").unwrap().connected);
        assert!(toasts(&mut notices).is_empty());
    }

    #[tokio::test]
    async fn untracked_and_forgotten_identities() {
        let f = fixture(&["AA:BB"]).await;

        assert!(!f.monitor.handle_connection_state_change("99:99", false));
        assert!(!f.monitor.connection_states().contains_key("99:99"));

        f.monitor.forget("AA:BB");
        assert!(f.monitor.connection_states().is_empty());
        // With no belief the record's flag is the baseline.
        assert!(!f.monitor.handle_connection_state_change("AA:BB", true));
        assert_eq!(f.monitor.connection_states().get("AA:BB"), Some(&true));
    }

    #[tokio::test]
    async fn adapter_down_cascades_to_devices_and_scanner() {
        let f = fixture(&["AA:BB", "CC:DD"]).await;
        let mut scanner = BluetoothScanner::new(
            f.platform.clone(),
            f.adapter.clone(),
            &BluetoothConfig::default(),
            f.notices.clone(),
        );
        let mut scanner_events = scanner.subscribe();
        scanner.start_search().await.unwrap();
        f.platform.advertise("EE:FF", "ai-thinker", -50);
        loop {
            if let Ok(ScannerEvent::DevicesChanged(snapshot)) = scanner_events.recv().await {
                if !snapshot.is_empty() {
                    break;
                }
            }
        }
        f.platform.clear_calls();

        f.platform.set_powered(false);
        settle().await;

        assert!(f.devices.devices().iter().all(|d| !d.connected));
        assert!(scanner.devices().is_empty());
        // Nothing was probed; the adapter signal alone did it.
        assert!(!f
            .platform
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Services(_) | Call::Characteristics(..))));
    }

    #[tokio::test]
    async fn probes_skip_a_dead_radio() {
        let f = fixture(&["AA:BB"]).await;
        f.platform.set_powered(false);
        f.platform.clear_calls();

        assert!(!f.monitor.check_single_device("AA:BB").await);
        assert!(f.platform.calls().is_empty());
    }
}
