//! User-initiated actions
//! Every action here publishes a toast naming the action and its outcome.

use std::sync::Arc;

use log::{error, info, warn};
use thiserror::Error;

use crate::core::bluetooth::commands::{CommandExecutor, DeviceCommand};
use crate::core::bluetooth::communicator::DeviceCommunicator;
use crate::core::bluetooth::error::BluetoothError;
use crate::core::bluetooth::monitor::CheckSummary;
use crate::core::bluetooth::scanner::DeviceTarget;
use crate::core::device::DeviceRecord;
use crate::core::notice::NoticeLevel;
use crate::state::AppState;
use crate::sync::SyncError;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Unknown device {0}")]
    UnknownDevice(String),

    #[error("Invalid device code")]
    InvalidCode,

    #[error("Device {0} is not connected")]
    NotConnected(String),

    #[error(transparent)]
    Bluetooth(#[from] BluetoothError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Result of a delete request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Removed remotely and locally
    Deleted,
    /// Removed locally only, on request
    DeletedLocally,
    /// The remote step failed and nothing was removed; retry with `local_only`
    RemoteFailed(String),
}

fn display_name(record: &DeviceRecord) -> &str {
    if record.name.is_empty() {
        &record.device_id
    } else {
        &record.name
    }
}

fn connect_failure_title(err: &BluetoothError) -> &'static str {
    match err {
        BluetoothError::Timeout {
            operation: "device search",
            ..
        } => "Device not found",
        _ => "Connection failed",
    }
}

/// Post-connect bookkeeping shared by both connect paths.
async fn adopt_session(
    state: &AppState,
    communicator: Arc<DeviceCommunicator>,
    name: Option<&str>,
    serial_number: Option<&str>,
) -> Option<DeviceRecord> {
    state.attach_notifications(&communicator);
    let executor =
        CommandExecutor::new(communicator.clone(), state.config.bluetooth.command_delay());
    if let Err(e) = executor.initialize_device().await {
        warn!("Clock sync with {} failed: {}", communicator.id(), e);
    }
    let record = state
        .devices
        .add_and_connect(communicator.id(), name, serial_number)?;
    state.monitor.acknowledge_session(communicator.id());
    state.sync_record(&record).await;
    Some(record)
}

/// Re-keys a known device found under a new radio identity. The old remote
/// record is soft-deleted best-effort; the new one is synced on adoption.
async fn move_identity(state: &AppState, old_id: &str, new_id: &str) {
    info!("Device {} now reachable as {}", old_id, new_id);
    if state.devices.rename(old_id, new_id).is_none() {
        warn!("Could not move {} to {}", old_id, new_id);
        return;
    }
    state.monitor.forget(old_id);
    if let Err(e) = state.sync.delete_device(old_id).await {
        warn!("Remote cleanup of {} failed: {}", old_id, e);
    }
}

/// Reconnects a device already in the local list.
pub async fn connect_known_device(
    state: &AppState,
    device_id: &str,
) -> Result<DeviceRecord, ActionError> {
    let Some(record) = state.devices.find(device_id) else {
        state.notices.toast(NoticeLevel::Error, "Device not found");
        return Err(ActionError::UnknownDevice(device_id.to_string()));
    };
    info!("Connecting to known device {}", device_id);

    let connected = {
        let mut manager = state.bluetooth_manager.lock().await;
        async {
            manager.reset().await?;
            let target = DeviceTarget::known(&record.device_id, &record.name);
            let found = manager
                .find_device(&target, state.config.bluetooth.search_timeout())
                .await?;
            manager.connect_device(&found.id).await
        }
        .await
    };

    let communicator = match connected {
        Ok(communicator) => communicator,
        Err(e) => {
            error!("Connecting to {} failed: {}", device_id, e);
            state.notices.toast(NoticeLevel::Error, connect_failure_title(&e));
            return Err(e.into());
        }
    };

    if communicator.id() != record.device_id {
        move_identity(state, &record.device_id, communicator.id()).await;
    }
    let record = adopt_session(
        state,
        communicator,
        Some(record.name.as_str()),
        Some(record.serial_number.as_str()),
    )
    .await
    .ok_or_else(|| ActionError::UnknownDevice(device_id.to_string()))?;
    state
        .notices
        .toast(NoticeLevel::Success, format!("Connected to {}", display_name(&record)));
    Ok(record)
}

/// Pairs the device described by a scanned code and adds it to the list.
pub async fn connect_scanned_code(
    state: &AppState,
    code: &str,
) -> Result<DeviceRecord, ActionError> {
    let Some(target) = DeviceTarget::parse(code) else {
        state.notices.toast(NoticeLevel::Error, "Invalid device code");
        return Err(ActionError::InvalidCode);
    };
    info!("Pairing from scanned code: {:?}", target);

    let connected = {
        let mut manager = state.bluetooth_manager.lock().await;
        async {
            let found = manager
                .find_device(&target, state.config.bluetooth.scan_pair_timeout())
                .await?;
            let communicator = manager.connect_device(&found.id).await?;
            Ok::<_, BluetoothError>((found, communicator))
        }
        .await
    };

    let (found, communicator) = match connected {
        Ok(connected) => connected,
        Err(e) => {
            error!("Pairing failed: {}", e);
            state.notices.toast(NoticeLevel::Error, connect_failure_title(&e));
            return Err(e.into());
        }
    };

    let name = target
        .name
        .clone()
        .or_else(|| (!found.name.is_empty()).then(|| found.name.clone()));
    let record = adopt_session(
        state,
        communicator,
        name.as_deref(),
        target.serial_number.as_deref(),
    )
    .await
    .ok_or_else(|| ActionError::UnknownDevice(found.id.clone()))?;
    state
        .notices
        .toast(NoticeLevel::Success, format!("{} added", display_name(&record)));
    Ok(record)
}

/// The session for `device_id`, if it is the current one and still connected.
async fn session_for(
    state: &AppState,
    device_id: &str,
) -> Result<Arc<DeviceCommunicator>, ActionError> {
    if state.devices.find(device_id).is_none() {
        return Err(ActionError::UnknownDevice(device_id.to_string()));
    }
    state
        .bluetooth_manager
        .lock()
        .await
        .current_communicator()
        .filter(|c| c.id() == device_id && c.is_connected())
        .ok_or_else(|| ActionError::NotConnected(device_id.to_string()))
}

/// Sends the commands, then applies `update` locally, then syncs best-effort.
async fn apply_setting(
    state: &AppState,
    device_id: &str,
    action: &str,
    commands: &[DeviceCommand],
    update: impl FnOnce(&mut DeviceRecord),
) -> Result<DeviceRecord, ActionError> {
    let communicator = match session_for(state, device_id).await {
        Ok(communicator) => communicator,
        Err(e) => {
            warn!("{} on {} refused: {}", action, device_id, e);
            state
                .notices
                .toast(NoticeLevel::Warning, "Device is not connected");
            return Err(e);
        }
    };

    let executor = CommandExecutor::new(communicator, state.config.bluetooth.command_delay());
    if let Err(e) = executor.execute_all(commands).await {
        error!("{} on {} failed: {}", action, device_id, e);
        state
            .notices
            .toast(NoticeLevel::Error, format!("{action} failed"));
        return Err(e.into());
    }

    let record = state
        .devices
        .update(device_id, update)
        .ok_or_else(|| ActionError::UnknownDevice(device_id.to_string()))?;
    state.sync_record(&record).await;
    state
        .notices
        .toast(NoticeLevel::Success, format!("{action} done"));
    Ok(record)
}

/// Switches the output to the opposite of its recorded state.
pub async fn toggle_power(state: &AppState, device_id: &str) -> Result<DeviceRecord, ActionError> {
    let on = !state
        .devices
        .find(device_id)
        .ok_or_else(|| ActionError::UnknownDevice(device_id.to_string()))?
        .power_on;
    let action = if on { "Power on" } else { "Power off" };
    apply_setting(state, device_id, action, &[DeviceCommand::Charge(on)], |r| {
        r.power_on = on
    })
    .await
}

pub async fn set_indicator_color(
    state: &AppState,
    device_id: &str,
    color: u8,
) -> Result<DeviceRecord, ActionError> {
    apply_setting(state, device_id, "Colour change", &[DeviceCommand::SetLed(color)], |r| {
        r.indicator_color = color
    })
    .await
}

pub async fn set_indicator_brightness(
    state: &AppState,
    device_id: &str,
    brightness: u8,
) -> Result<DeviceRecord, ActionError> {
    let brightness = brightness.min(100);
    apply_setting(
        state,
        device_id,
        "Brightness change",
        &[DeviceCommand::SetBrightness(brightness)],
        |r| r.indicator_brightness = brightness,
    )
    .await
}

pub async fn set_mode(
    state: &AppState,
    device_id: &str,
    mode: u8,
) -> Result<DeviceRecord, ActionError> {
    apply_setting(state, device_id, "Mode change", &[DeviceCommand::SetDevMode(mode)], |r| {
        r.mode = mode
    })
    .await
}

pub async fn set_delay_off(
    state: &AppState,
    device_id: &str,
    minutes: u32,
) -> Result<DeviceRecord, ActionError> {
    apply_setting(
        state,
        device_id,
        "Timer change",
        &[DeviceCommand::SetDelayOff(minutes)],
        |r| r.delay_off_minutes = minutes,
    )
    .await
}

pub async fn set_animation(
    state: &AppState,
    device_id: &str,
    animation: u8,
) -> Result<DeviceRecord, ActionError> {
    apply_setting(
        state,
        device_id,
        "Animation change",
        &[DeviceCommand::SetAnimation(animation)],
        |r| r.animation = animation,
    )
    .await
}

/// Deletes a device. The remote soft delete runs first unless `local_only`;
/// when it fails nothing is removed and the caller may retry locally.
pub async fn delete_device(
    state: &AppState,
    device_id: &str,
    local_only: bool,
) -> Result<DeleteOutcome, ActionError> {
    if state.devices.find(device_id).is_none() {
        state.notices.toast(NoticeLevel::Error, "Device not found");
        return Err(ActionError::UnknownDevice(device_id.to_string()));
    }

    if !local_only {
        if let Err(e) = state.sync.delete_device(device_id).await {
            warn!("Remote delete of {} failed: {}", device_id, e);
            state
                .notices
                .toast(NoticeLevel::Warning, "Remote delete failed");
            return Ok(DeleteOutcome::RemoteFailed(e.to_string()));
        }
    }

    {
        let mut manager = state.bluetooth_manager.lock().await;
        if manager.current_device_id().as_deref() == Some(device_id) {
            manager.disconnect().await;
        }
    }
    state.devices.remove(device_id);
    state.monitor.forget(device_id);
    state.notices.toast(NoticeLevel::Success, "Device deleted");
    Ok(if local_only {
        DeleteOutcome::DeletedLocally
    } else {
        DeleteOutcome::Deleted
    })
}

/// Replaces the local list with the remote one.
pub async fn refresh_devices(state: &AppState) -> Result<usize, ActionError> {
    match state.sync.fetch_devices().await {
        Ok(records) => {
            let count = records.len();
            state.devices.replace_all(records);
            state.notices.toast(NoticeLevel::Success, "Devices refreshed");
            Ok(count)
        }
        Err(e) => {
            error!("Refreshing devices failed: {}", e);
            state
                .notices
                .toast(NoticeLevel::Error, "Failed to refresh devices");
            Err(e.into())
        }
    }
}

pub async fn check_devices(state: &AppState) -> CheckSummary {
    state.monitor.check_all_devices().await
}
