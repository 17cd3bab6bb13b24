//! User-visible notices (toasts and modal prompts).

use log::debug;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NoticeStyle {
    /// Blocking prompt; the user has to act (e.g. enable Bluetooth)
    Modal,
    /// Short-lived, non-blocking
    Toast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NoticeLevel {
    Success,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub style: NoticeStyle,
    pub level: NoticeLevel,
    pub title: String,
    pub detail: Option<String>,
}

/// Fan-out of notices to whatever surface renders them.
#[derive(Clone)]
pub struct NoticeBus {
    sender: broadcast::Sender<Notice>,
}

impl NoticeBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.sender.subscribe()
    }

    pub fn publish(&self, notice: Notice) {
        debug!("Notice: {:?}", notice);
        // No subscriber is fine; notices are fire-and-forget.
        let _ = self.sender.send(notice);
    }

    pub fn toast(&self, level: NoticeLevel, title: impl Into<String>) {
        self.publish(Notice {
            style: NoticeStyle::Toast,
            level,
            title: title.into(),
            detail: None,
        });
    }

    pub fn modal(&self, title: impl Into<String>, detail: impl Into<String>) {
        self.publish(Notice {
            style: NoticeStyle::Modal,
            level: NoticeLevel::Error,
            title: title.into(),
            detail: Some(detail.into()),
        });
    }
}

impl Default for NoticeBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
pub(crate) fn drain(receiver: &mut broadcast::Receiver<Notice>) -> Vec<Notice> {
    let mut notices = Vec::new();
    while let Ok(notice) = receiver.try_recv() {
        notices.push(notice);
    }
    notices
}
