//! One live link to one device: framing, inbound delivery, connection tracking.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::commands::{CommandSender, DeviceCommand};
use crate::core::bluetooth::error::BluetoothError;
use crate::core::bluetooth::platform::BlePlatform;
use crate::core::bluetooth::protocol::{decode, encode};
use crate::core::bluetooth::resolver::GattResolver;
use crate::core::bluetooth::types::{GattEndpoint, PlatformEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Initializing,
    Ready,
    /// Terminal; a new communicator is needed for the next connection
    Disconnected,
}

/// A decoded notification, tagged on arrival
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundMessage {
    pub id: String,
    pub text: String,
    pub received_at: DateTime<Local>,
}

struct Session {
    state: SessionState,
    endpoint: Option<GattEndpoint>,
    history: VecDeque<InboundMessage>,
    subscriber: Option<mpsc::UnboundedSender<InboundMessage>>,
    destroyed: bool,
}

pub struct DeviceCommunicator {
    id: String,
    platform: Arc<dyn BlePlatform>,
    resolver: Arc<GattResolver>,
    history_limit: usize,
    session: Arc<Mutex<Session>>,
    connected: Arc<watch::Sender<bool>>,
    cancel_token: CancellationToken,
    pump_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceCommunicator {
    pub fn new(
        id: impl Into<String>,
        platform: Arc<dyn BlePlatform>,
        resolver: Arc<GattResolver>,
        history_limit: usize,
    ) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            id: id.into(),
            platform,
            resolver,
            history_limit,
            session: Arc::new(Mutex::new(Session {
                state: SessionState::Initializing,
                endpoint: None,
                history: VecDeque::new(),
                subscriber: None,
                destroyed: false,
            })),
            connected: Arc::new(connected),
            cancel_token: CancellationToken::new(),
            pump_handle: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.session
            .lock()
            .map(|s| s.state)
            .unwrap_or(SessionState::Disconnected)
    }

    pub fn endpoint(&self) -> Option<GattEndpoint> {
        self.session.lock().ok().and_then(|s| s.endpoint)
    }

    pub fn is_destroyed(&self) -> bool {
        self.session.lock().map(|s| s.destroyed).unwrap_or(true)
    }

    /// Resolves the endpoint and starts delivering notifications.
    ///
    /// The session only becomes `Ready` (and reports connected) once resolution,
    /// including the notification enable, has succeeded.
    pub async fn initialize(&self) -> Result<GattEndpoint, BluetoothError> {
        if self.state() != SessionState::Initializing || self.is_destroyed() {
            return Err(BluetoothError::transport("session already used"));
        }
        // Subscribe first so notifications racing the resolution are not lost.
        let events = self.platform.subscribe();
        let endpoint = self.resolver.resolve(&self.id).await?;

        {
            let mut session = self
                .session
                .lock()
                .map_err(|_| BluetoothError::transport("session state poisoned"))?;
            if session.destroyed {
                return Err(BluetoothError::transport("session destroyed during initialization"));
            }
            session.state = SessionState::Ready;
            session.endpoint = Some(endpoint);
        }
        self.connected.send_replace(true);

        let handle = tokio::spawn(Self::pump(
            self.id.clone(),
            endpoint,
            events,
            self.session.clone(),
            self.connected.clone(),
            self.cancel_token.clone(),
            self.history_limit,
        ));
        if let Ok(mut slot) = self.pump_handle.lock() {
            *slot = Some(handle);
        }
        info!("Session for {} is ready", self.id);
        Ok(endpoint)
    }

    async fn pump(
        id: String,
        endpoint: GattEndpoint,
        mut events: broadcast::Receiver<PlatformEvent>,
        session: Arc<Mutex<Session>>,
        connected: Arc<watch::Sender<bool>>,
        cancel_token: CancellationToken,
        history_limit: usize,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel_token.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(PlatformEvent::ValueChanged {
                    id: source,
                    service,
                    characteristic,
                    value,
                }) => {
                    if source != id
                        || service != endpoint.service
                        || Some(characteristic) != endpoint.notify_characteristic
                    {
                        continue;
                    }
                    let message = InboundMessage {
                        id: id.clone(),
                        text: decode(&value),
                        received_at: Local::now(),
                    };
                    debug!("Received from {}: {:?}", id, message.text);
                    let Ok(mut session) = session.lock() else { break };
                    if session.destroyed {
                        break;
                    }
                    session.history.push_back(message.clone());
                    while session.history.len() > history_limit {
                        session.history.pop_front();
                    }
                    let receiver_gone = session
                        .subscriber
                        .as_ref()
                        .is_some_and(|subscriber| subscriber.send(message).is_err());
                    if receiver_gone {
                        session.subscriber = None;
                    }
                }
                Ok(PlatformEvent::ConnectionStateChanged {
                    id: source,
                    connected: false,
                }) if source == id => {
                    warn!("Radio reported {} disconnected", id);
                    Self::mark_disconnected(&session, &connected);
                    break;
                }
                Ok(PlatformEvent::AdapterStateChanged(state)) if !state.available => {
                    warn!("Adapter went away, dropping session for {}", id);
                    Self::mark_disconnected(&session, &connected);
                    break;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    error!("Session {} lost {} platform events", id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    Self::mark_disconnected(&session, &connected);
                    break;
                }
            }
        }
    }

    fn mark_disconnected(session: &Mutex<Session>, connected: &watch::Sender<bool>) {
        if let Ok(mut session) = session.lock() {
            session.state = SessionState::Disconnected;
        }
        connected.send_if_modified(|flag| std::mem::replace(flag, false));
    }

    /// Registers the single message consumer, replacing any previous one.
    pub fn subscribe_messages(&self) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Ok(mut session) = self.session.lock() {
            if !session.destroyed {
                session.subscriber = Some(sender);
            }
        }
        receiver
    }

    /// Connected flag; flips to false once and stays there.
    pub fn subscribe_connection(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub async fn send_message(&self, text: &str) -> Result<(), BluetoothError> {
        let (service, characteristic) = {
            let session = self
                .session
                .lock()
                .map_err(|_| BluetoothError::transport("session state poisoned"))?;
            match (session.state, session.endpoint) {
                (
                    SessionState::Ready,
                    Some(GattEndpoint {
                        service,
                        write_characteristic: Some(write),
                        ..
                    }),
                ) => (service, write),
                (SessionState::Ready, Some(_)) => {
                    return Err(BluetoothError::transport("device has no write characteristic"));
                }
                _ => return Err(BluetoothError::transport("not connected")),
            }
        };

        let bytes = encode(text)?;
        debug!("Writing {} bytes to {}", bytes.len(), self.id);
        self.platform
            .write(&self.id, service, characteristic, &bytes)
            .await
            .map_err(|e| match e {
                BluetoothError::Transport(_) => e,
                other => BluetoothError::transport(other.to_string()),
            })
    }

    /// Best-effort teardown of the link; always ends `Disconnected`.
    pub async fn disconnect(&self) {
        if let Some(endpoint) = self.endpoint() {
            if let Some(notify) = endpoint.notify_characteristic {
                if let Err(e) = self
                    .platform
                    .set_notify(&self.id, endpoint.service, notify, false)
                    .await
                {
                    debug!("Disabling notifications on {} failed: {}", self.id, e);
                }
            }
        }
        if let Err(e) = self.platform.disconnect(&self.id).await {
            warn!("Disconnecting {} failed, treating as disconnected: {}", self.id, e);
        }
        self.cancel_token.cancel();
        Self::mark_disconnected(&self.session, &self.connected);
    }

    /// Detaches every consumer and drops the history. Safe to call repeatedly.
    pub fn destroy(&self) {
        {
            let Ok(mut session) = self.session.lock() else {
                return;
            };
            if session.destroyed {
                return;
            }
            session.destroyed = true;
            session.subscriber = None;
            session.history.clear();
        }
        debug!("Destroying session for {}", self.id);
        self.cancel_token.cancel();
        Self::mark_disconnected(&self.session, &self.connected);
        self.resolver.invalidate(&self.id);
    }

    /// Received text of this session, oldest first.
    pub fn receive_text(&self) -> String {
        self.session
            .lock()
            .map(|s| s.history.iter().map(|m| m.text.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn clear_receive_text(&self) {
        if let Ok(mut session) = self.session.lock() {
            session.history.clear();
        }
    }
}

impl Drop for DeviceCommunicator {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[async_trait]
impl CommandSender for DeviceCommunicator {
    async fn send_command(&self, command: DeviceCommand) -> Result<(), BluetoothError> {
        info!("Sending command to {}: {:?}", self.id, command);
        self.send_message(&command.to_frame()).await
    }
}

#[async_trait]
impl CommandSender for Arc<DeviceCommunicator> {
    async fn send_command(&self, command: DeviceCommand) -> Result<(), BluetoothError> {
        self.as_ref().send_command(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::{
        RECEIVE_HISTORY_LIMIT, UUID_STANDARD_NOTIFY_CHAR, UUID_STANDARD_SERVICE,
        UUID_STANDARD_WRITE_CHAR,
    };
    use crate::core::bluetooth::mock::{Call, MockDevice, MockPlatform};
    use std::time::Duration;

    async fn ready(platform: &Arc<MockPlatform>, id: &str) -> DeviceCommunicator {
        platform.add_device(id, MockDevice::standard());
        platform.connect(id).await.unwrap();
        let communicator = DeviceCommunicator::new(
            id,
            platform.clone(),
            Arc::new(GattResolver::new(platform.clone())),
            RECEIVE_HISTORY_LIMIT,
        );
        communicator.initialize().await.unwrap();
        communicator
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<InboundMessage>) -> InboundMessage {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("message in time")
            .expect("open channel")
    }

    #[tokio::test]
    async fn send_before_ready_fails() {
        let platform = MockPlatform::new();
        platform.add_device("AA:BB", MockDevice::standard());
        let communicator = DeviceCommunicator::new(
            "AA:BB",
            platform.clone(),
            Arc::new(GattResolver::new(platform.clone())),
            10,
        );
        let err = communicator.send_message("CHARGE:1\r\n").await.unwrap_err();
        assert_eq!(err.to_string(), "Transport error: not connected");
        assert!(!communicator.is_connected());
    }

    #[tokio::test]
    async fn failed_resolution_stays_unready() {
        let platform = MockPlatform::new();
        platform.add_device("AA:BB", MockDevice::default());
        platform.connect("AA:BB").await.unwrap();
        let communicator = DeviceCommunicator::new(
            "AA:BB",
            platform.clone(),
            Arc::new(GattResolver::new(platform.clone())),
            10,
        );
        assert!(matches!(
            communicator.initialize().await,
            Err(BluetoothError::Resolution(_))
        ));
        assert_eq!(communicator.state(), SessionState::Initializing);
        assert!(!communicator.is_connected());
    }

    #[tokio::test]
    async fn writes_bytes_to_the_write_characteristic() {
        let platform = MockPlatform::new();
        let communicator = ready(&platform, "AA:BB").await;

        communicator.send_message("CHARGE:1\r\n").await.unwrap();

        assert!(platform.calls().contains(&Call::Write(
            "AA:BB".into(),
            UUID_STANDARD_WRITE_CHAR,
            b"CHARGE:1\r\n".to_vec()
        )));
    }

    #[tokio::test]
    async fn platform_write_failure_is_transport() {
        let platform = MockPlatform::new();
        let communicator = ready(&platform, "AA:BB").await;
        platform.update_device("AA:BB", |d| d.fail_write = true);
        assert!(matches!(
            communicator.send_message("X").await,
            Err(BluetoothError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn notifications_arrive_in_order_without_coalescing() {
        let platform = MockPlatform::new();
        let communicator = ready(&platform, "AA:BB").await;
        let mut rx = communicator.subscribe_messages();

        for text in ["one", "two", "three"] {
            platform.notify("AA:BB", UUID_STANDARD_SERVICE, UUID_STANDARD_NOTIFY_CHAR, text);
        }
        // Wrong characteristic and wrong identity are ignored.
        platform.notify("AA:BB", UUID_STANDARD_SERVICE, UUID_STANDARD_WRITE_CHAR, "nope");
        platform.notify("CC:DD", UUID_STANDARD_SERVICE, UUID_STANDARD_NOTIFY_CHAR, "nope");
        platform.notify("AA:BB", UUID_STANDARD_SERVICE, UUID_STANDARD_NOTIFY_CHAR, "four");

        let texts: Vec<String> = [
            recv(&mut rx).await,
            recv(&mut rx).await,
            recv(&mut rx).await,
            recv(&mut rx).await,
        ]
        .into_iter()
        .map(|m| m.text)
        .collect();
        assert_eq!(texts, vec!["one", "two", "three", "four"]);
        assert_eq!(communicator.receive_text(), "onetwothreefour");
    }

    #[tokio::test]
    async fn receive_history_is_bounded() {
        let platform = MockPlatform::new();
        platform.add_device("AA:BB", MockDevice::standard());
        platform.connect("AA:BB").await.unwrap();
        let communicator = DeviceCommunicator::new(
            "AA:BB",
            platform.clone(),
            Arc::new(GattResolver::new(platform.clone())),
            2,
        );
        communicator.initialize().await.unwrap();
        let mut rx = communicator.subscribe_messages();

        for text in ["a", "b", "c"] {
            platform.notify("AA:BB", UUID_STANDARD_SERVICE, UUID_STANDARD_NOTIFY_CHAR, text);
        }
        for _ in 0..3 {
            recv(&mut rx).await;
        }
        assert_eq!(communicator.receive_text(), "bc");
        communicator.clear_receive_text();
        assert_eq!(communicator.receive_text(), "");
    }

    #[tokio::test]
    async fn link_loss_flips_connected_once() {
        let platform = MockPlatform::new();
        let communicator = ready(&platform, "AA:BB").await;
        let mut connection = communicator.subscribe_connection();
        assert!(*connection.borrow_and_update());

        platform.drop_link("AA:BB");
        platform.drop_link("AA:BB");

        tokio::time::timeout(Duration::from_secs(1), connection.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(!*connection.borrow_and_update());
        assert_eq!(communicator.state(), SessionState::Disconnected);
        assert!(!connection.has_changed().unwrap());
        assert!(communicator.send_message("X").await.is_err());
    }

    #[tokio::test]
    async fn disconnect_tolerates_platform_failure() {
        let platform = MockPlatform::new();
        let communicator = ready(&platform, "AA:BB").await;
        // The device vanishes from the platform, so the close call fails.
        platform.remove_device("AA:BB");

        communicator.disconnect().await;

        assert_eq!(communicator.state(), SessionState::Disconnected);
        assert!(!communicator.is_connected());
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_drops_late_messages() {
        let platform = MockPlatform::new();
        let resolver = Arc::new(GattResolver::new(platform.clone()));
        platform.add_device("AA:BB", MockDevice::standard());
        platform.connect("AA:BB").await.unwrap();
        let communicator = DeviceCommunicator::new("AA:BB", platform.clone(), resolver.clone(), 10);
        communicator.initialize().await.unwrap();
        let mut rx = communicator.subscribe_messages();

        communicator.destroy();
        communicator.destroy();
        platform.notify("AA:BB", UUID_STANDARD_SERVICE, UUID_STANDARD_NOTIFY_CHAR, "late");

        assert!(rx.recv().await.is_none());
        assert!(communicator.is_destroyed());
        assert!(resolver.cached("AA:BB").is_none());
        assert_eq!(communicator.receive_text(), "");
    }
}
