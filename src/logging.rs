use chrono::Local;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use serde::Serialize;
use std::sync::OnceLock;
use tokio::sync::broadcast;

static LOGGER: OnceLock<ForwardingLogger> = OnceLock::new();

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

/// Writes through `env_logger` and mirrors every enabled record to subscribers.
pub struct ForwardingLogger {
    inner: env_logger::Logger,
    sender: broadcast::Sender<LogMessage>,
}

impl ForwardingLogger {
    pub fn new(level: LevelFilter) -> Self {
        // RUST_LOG still overrides the default level
        let inner = env_logger::Builder::new()
            .filter_level(level)
            .parse_default_env()
            .build();
        let (sender, _) = broadcast::channel(256);
        Self { inner, sender }
    }

    pub fn init(level: LevelFilter) -> Result<&'static ForwardingLogger, SetLoggerError> {
        let logger = LOGGER.get_or_init(|| ForwardingLogger::new(level));
        log::set_logger(logger).map(|()| log::set_max_level(logger.inner.filter()))?;
        Ok(logger)
    }

    /// The installed logger, if `init` succeeded.
    pub fn global() -> Option<&'static ForwardingLogger> {
        LOGGER.get()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogMessage> {
        self.sender.subscribe()
    }

    fn forward(&self, record: &Record) {
        let log_message = LogMessage {
            level: record.level().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        };
        // Nobody listening is fine
        let _ = self.sender.send(log_message);
    }
}

impl Log for ForwardingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.inner.matches(record) {
            self.inner.log(record);
            self.forward(record);
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Installs the forwarding logger, falling back to a plain `env_logger`.
pub fn setup(level: LevelFilter) -> Option<&'static ForwardingLogger> {
    match ForwardingLogger::init(level) {
        Ok(logger) => Some(logger),
        Err(e) => {
            eprintln!("Failed to install forwarding logger: {}", e);
            let _ = env_logger::builder().filter_level(level).try_init();
            None
        }
    }
}
