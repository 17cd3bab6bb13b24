//! Remote device record store, reached through a request/response RPC.
//!
//! The store is keyed by an opaque owner identity plus the device identity.
//! Local state is always authoritative; everything here is best-effort.

mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::core::device::DeviceRecord;

pub use memory::InMemoryRemoteStore;

/// Logical operations understood by the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RpcOperation {
    GetUserDevices,
    SyncDeviceInfo,
    DeleteDevice,
}

impl RpcOperation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetUserDevices => "getUserDevices",
            Self::SyncDeviceInfo => "syncDeviceInfo",
            Self::DeleteDevice => "deleteDevice",
        }
    }
}

/// Response envelope of every RPC call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(data: Option<Value>, message: Option<&str>) -> Self {
        Self {
            success: true,
            data,
            message: message.map(str::to_string),
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// The call never produced a response
    #[error("RPC {operation} failed: {reason}")]
    Rpc {
        operation: &'static str,
        reason: String,
    },

    /// The store answered with `success: false`
    #[error("{operation} rejected: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },

    #[error("Malformed response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn call(&self, operation: RpcOperation, payload: Value)
    -> Result<RpcResponse, SyncError>;
}

/// Typed client over a [`RemoteStore`] for one owner.
#[derive(Clone)]
pub struct SyncService {
    store: Arc<dyn RemoteStore>,
    owner_id: String,
}

impl SyncService {
    pub fn new(store: Arc<dyn RemoteStore>, owner_id: impl Into<String>) -> Self {
        Self {
            store,
            owner_id: owner_id.into(),
        }
    }

    async fn invoke(
        &self,
        operation: RpcOperation,
        payload: Value,
    ) -> Result<RpcResponse, SyncError> {
        debug!("Calling {} for owner {}", operation.name(), self.owner_id);
        let response = self.store.call(operation, payload).await?;
        if !response.success {
            let reason = response
                .error
                .or(response.message)
                .unwrap_or_else(|| "unknown error".to_string());
            warn!("{} rejected: {}", operation.name(), reason);
            return Err(SyncError::Rejected {
                operation: operation.name(),
                reason,
            });
        }
        Ok(response)
    }

    /// Live (not soft-deleted) records of this owner.
    pub async fn fetch_devices(&self) -> Result<Vec<DeviceRecord>, SyncError> {
        let response = self
            .invoke(RpcOperation::GetUserDevices, json!({ "ownerId": self.owner_id }))
            .await?;
        let records: Vec<DeviceRecord> = match response.data {
            Some(data) => serde_json::from_value(data)?,
            None => Vec::new(),
        };
        info!("Fetched {} devices from the remote store", records.len());
        Ok(records)
    }

    /// Inserts the record, or merges it into the stored one.
    pub async fn sync_device(&self, record: &DeviceRecord) -> Result<(), SyncError> {
        let payload = json!({
            "ownerId": self.owner_id,
            "deviceInfo": serde_json::to_value(record)?,
        });
        self.invoke(RpcOperation::SyncDeviceInfo, payload).await?;
        debug!("Synced device {}", record.device_id);
        Ok(())
    }

    /// Soft delete; a later `sync_device` for the same identity reactivates it.
    pub async fn delete_device(&self, device_id: &str) -> Result<(), SyncError> {
        let payload = json!({ "ownerId": self.owner_id, "deviceId": device_id });
        self.invoke(RpcOperation::DeleteDevice, payload).await?;
        info!("Marked device {} deleted remotely", device_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(device_id: &str, name: &str) -> DeviceRecord {
        DeviceRecord {
            id: format!("local-{device_id}"),
            name: name.into(),
            device_id: device_id.into(),
            ..Default::default()
        }
    }

    fn service() -> (Arc<InMemoryRemoteStore>, SyncService) {
        let store = Arc::new(InMemoryRemoteStore::default());
        (store.clone(), SyncService::new(store, "owner-1"))
    }

    #[tokio::test]
    async fn upsert_merges_instead_of_duplicating() {
        let (store, sync) = service();
        sync.sync_device(&record("AA:BB", "Desk")).await.unwrap();
        sync.sync_device(&record("AA:BB", "Kitchen")).await.unwrap();

        let devices = sync.fetch_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "Kitchen");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn deleted_records_are_hidden_then_reactivated() {
        let (store, sync) = service();
        sync.sync_device(&record("AA:BB", "Desk")).await.unwrap();
        sync.delete_device("AA:BB").await.unwrap();
        assert!(sync.fetch_devices().await.unwrap().is_empty());
        assert_eq!(store.get("owner-1", "AA:BB").unwrap()["deleted"], true);

        sync.sync_device(&record("AA:BB", "Desk")).await.unwrap();
        sync.sync_device(&record("AA:BB", "Desk")).await.unwrap();

        let stored = store.get("owner-1", "AA:BB").unwrap();
        assert_eq!(stored["deleted"], false);
        assert!(stored["reactivatedAt"].is_string());
        assert_eq!(store.len(), 1);
        assert_eq!(sync.fetch_devices().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn owners_do_not_see_each_other() {
        let (store, sync) = service();
        let other = SyncService::new(store, "owner-2");
        sync.sync_device(&record("AA:BB", "Desk")).await.unwrap();

        assert!(other.fetch_devices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsuccessful_response_is_rejected() {
        let (_, sync) = service();
        let err = sync.delete_device("missing").await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Rejected {
                operation: "deleteDevice",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unreachable_store_is_an_rpc_error() {
        let (store, sync) = service();
        store.set_reachable(false);
        let err = sync.fetch_devices().await.unwrap_err();
        assert!(matches!(err, SyncError::Rpc { .. }));
    }
}
