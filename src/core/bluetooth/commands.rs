//! Smart-socket commands implementation
//! This module contains all the commands that can be sent to the device

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use std::time::Duration;
use tokio::time::sleep;

use crate::core::bluetooth::error::BluetoothError;
use crate::core::bluetooth::protocol::FRAME_TERMINATOR;

/// Device commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Switch the output on or off (`CHARGE:1` / `CHARGE:0`)
    Charge(bool),
    /// Select the indicator colour by palette index (`SET_LED:<idx>`)
    SetLed(u8),
    /// Indicator brightness in percent (`SET_BRIGHTNESS:<0-100>`)
    SetBrightness(u8),
    /// Switch off after the given number of minutes, 0 disables (`SET_DELAY_OFF:<min>`)
    SetDelayOff(u32),
    /// Operating mode (`SET_DEV_MODE:<mode>`)
    SetDevMode(u8),
    /// Indicator animation by index (`SET_ANIMAL:<idx>`)
    SetAnimation(u8),
    /// Device clock in unix seconds (`SYNC_DATE:<secs>`)
    SyncDate(i64),
}

impl DeviceCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Charge(_) => "CHARGE",
            Self::SetLed(_) => "SET_LED",
            Self::SetBrightness(_) => "SET_BRIGHTNESS",
            Self::SetDelayOff(_) => "SET_DELAY_OFF",
            Self::SetDevMode(_) => "SET_DEV_MODE",
            Self::SetAnimation(_) => "SET_ANIMAL",
            Self::SyncDate(_) => "SYNC_DATE",
        }
    }

    fn argument(&self) -> String {
        match *self {
            Self::Charge(on) => u8::from(on).to_string(),
            Self::SetLed(index) => index.to_string(),
            Self::SetBrightness(percent) => percent.min(100).to_string(),
            Self::SetDelayOff(minutes) => minutes.to_string(),
            Self::SetDevMode(mode) => mode.to_string(),
            Self::SetAnimation(index) => index.to_string(),
            Self::SyncDate(secs) => secs.to_string(),
        }
    }

    /// Convert the command to its wire line
    pub fn to_frame(&self) -> String {
        format!("{}:{}{}", self.name(), self.argument(), FRAME_TERMINATOR)
    }
}

/// Command sender trait
#[async_trait]
pub trait CommandSender {
    /// Send a command to the device
    async fn send_command(&self, command: DeviceCommand) -> Result<(), BluetoothError>;
}

/// Command executor for the device
pub struct CommandExecutor<T: CommandSender> {
    command_sender: T,
    command_delay: Duration,
}

impl<T: CommandSender> CommandExecutor<T> {
    /// Create a new CommandExecutor
    pub fn new(command_sender: T, command_delay: Duration) -> Self {
        Self {
            command_sender,
            command_delay,
        }
    }

    /// Post-connect handshake: align the device clock with ours.
    pub async fn initialize_device(&self) -> Result<(), BluetoothError> {
        let now = Utc::now().timestamp();
        info!("Synchronising device clock to {}", now);
        self.command_sender
            .send_command(DeviceCommand::SyncDate(now))
            .await
    }

    /// Sends the commands one after another, stopping at the first failure.
    pub async fn execute_all(&self, commands: &[DeviceCommand]) -> Result<(), BluetoothError> {
        for (index, command) in commands.iter().enumerate() {
            if index > 0 {
                sleep(self.command_delay).await;
            }
            debug!("Sending command: {:?}", command);
            self.command_sender.send_command(*command).await?;
        }
        Ok(())
    }

    pub async fn set_power(&self, on: bool) -> Result<(), BluetoothError> {
        info!("Switching output {}", if on { "on" } else { "off" });
        self.command_sender
            .send_command(DeviceCommand::Charge(on))
            .await
    }
}
