//! Notification handling for smart sockets
//! This module turns a session's inbound messages into notices and device record updates

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::core::bluetooth::communicator::{DeviceCommunicator, InboundMessage};
use crate::core::bluetooth::protocol::InboundFrame;
use crate::core::device::DeviceStore;
use crate::core::notice::{NoticeBus, NoticeLevel};

/// A classified frame together with the device that sent it
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceFrame {
    pub device_id: String,
    pub frame: InboundFrame,
}

/// Notification handler for device status lines
#[derive(Clone)]
pub struct NotificationHandler {
    devices: Arc<DeviceStore>,
    notices: NoticeBus,
    frames: broadcast::Sender<DeviceFrame>,
}

impl NotificationHandler {
    pub fn new(devices: Arc<DeviceStore>, notices: NoticeBus) -> Self {
        let (frames, _) = broadcast::channel(64);
        Self {
            devices,
            notices,
            frames,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceFrame> {
        self.frames.subscribe()
    }

    /// Becomes the session's message consumer. The task ends with the session.
    pub fn attach(&self, communicator: &DeviceCommunicator) -> JoinHandle<()> {
        info!("Listening for notifications from {}", communicator.id());
        let messages = communicator.subscribe_messages();
        let handler = self.clone();
        tokio::spawn(async move {
            handler.process_notifications(messages).await;
        })
    }

    async fn process_notifications(&self, mut messages: mpsc::UnboundedReceiver<InboundMessage>) {
        while let Some(message) = messages.recv().await {
            self.handle_message(&message);
        }
        debug!("Notification stream ended");
    }

    /// Classifies every line of one notification, in order.
    pub fn handle_message(&self, message: &InboundMessage) -> Vec<InboundFrame> {
        let frames = InboundFrame::parse_all(&message.text);
        for frame in &frames {
            match frame {
                InboundFrame::Error(line) => {
                    error!("Device {} reported an error: {}", message.id, line);
                    self.notices.toast(NoticeLevel::Error, "Device error");
                }
                InboundFrame::ChargeComplete => {
                    info!("Device {} finished charging", message.id);
                    self.notices.toast(NoticeLevel::Success, "Charging complete");
                }
                InboundFrame::BatteryLow => {
                    warn!("Device {} reports low battery", message.id);
                    self.notices.toast(NoticeLevel::Warning, "Battery low");
                }
                InboundFrame::Power(power) => {
                    debug!(
                        "Device {} power: {} V, {} A, {} W",
                        message.id, power.voltage, power.current, power.power
                    );
                    self.devices
                        .record_telemetry(&message.id, Some(power.clone()), &message.text);
                }
                InboundFrame::Telemetry(line) => {
                    debug!("Device {} telemetry: {}", message.id, line);
                }
            }
            let _ = self.frames.send(DeviceFrame {
                device_id: message.id.clone(),
                frame: frame.clone(),
            });
        }
        if !frames.iter().any(|f| matches!(f, InboundFrame::Power(_))) {
            self.devices.record_telemetry(&message.id, None, &message.text);
        }
        frames
    }
}
