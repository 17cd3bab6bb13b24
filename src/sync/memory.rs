use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use serde_json::{Map, Value};

use super::{RemoteStore, RpcOperation, RpcResponse, SyncError};

type Key = (String, String);

/// Process-local record store with soft-delete semantics.
pub struct InMemoryRemoteStore {
    records: Mutex<BTreeMap<Key, Map<String, Value>>>,
    reachable: AtomicBool,
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            reachable: AtomicBool::new(true),
        }
    }
}

impl InMemoryRemoteStore {
    /// Simulates the network dropping every call when `false`.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// The stored record, deleted or not.
    pub fn get(&self, owner_id: &str, device_id: &str) -> Option<Value> {
        let records = self.records.lock().ok()?;
        records
            .get(&(owner_id.to_string(), device_id.to_string()))
            .cloned()
            .map(Value::Object)
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fetch(records: &BTreeMap<Key, Map<String, Value>>, owner_id: &str) -> RpcResponse {
        let live: Vec<Value> = records
            .iter()
            .filter(|((owner, _), record)| {
                owner == owner_id
                    && !record.get("deleted").and_then(Value::as_bool).unwrap_or(false)
            })
            .map(|(_, record)| Value::Object(record.clone()))
            .collect();
        RpcResponse::ok(Some(Value::Array(live)), None)
    }

    fn upsert(
        records: &mut BTreeMap<Key, Map<String, Value>>,
        owner_id: &str,
        device: Map<String, Value>,
    ) -> RpcResponse {
        let Some(device_id) = device
            .get("deviceId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
        else {
            return RpcResponse::rejected("incomplete device info");
        };
        let now = Value::String(Utc::now().to_rfc3339());
        let key = (owner_id.to_string(), device_id);

        match records.get_mut(&key) {
            Some(stored) => {
                let was_deleted = stored.get("deleted").and_then(Value::as_bool).unwrap_or(false);
                stored.extend(device);
                if was_deleted {
                    stored.insert("deleted".into(), Value::Bool(false));
                    stored.remove("deletedAt");
                    stored.insert("reactivatedAt".into(), now.clone());
                    debug!("Reactivated device {}", key.1);
                }
                stored.insert("updatedAt".into(), now);
            }
            None => {
                let mut stored = device;
                stored.insert("ownerId".into(), Value::String(owner_id.to_string()));
                stored.insert("deleted".into(), Value::Bool(false));
                stored.insert("createdAt".into(), now.clone());
                stored.insert("updatedAt".into(), now);
                records.insert(key, stored);
            }
        }
        RpcResponse::ok(None, Some("device info synced"))
    }

    fn soft_delete(
        records: &mut BTreeMap<Key, Map<String, Value>>,
        owner_id: &str,
        device_id: &str,
    ) -> RpcResponse {
        match records.get_mut(&(owner_id.to_string(), device_id.to_string())) {
            Some(stored) => {
                let now = Value::String(Utc::now().to_rfc3339());
                stored.insert("deleted".into(), Value::Bool(true));
                stored.insert("deletedAt".into(), now.clone());
                stored.insert("updatedAt".into(), now);
                RpcResponse::ok(None, Some("device deleted"))
            }
            None => RpcResponse::rejected("device not found"),
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn call(
        &self,
        operation: RpcOperation,
        payload: Value,
    ) -> Result<RpcResponse, SyncError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(SyncError::Rpc {
                operation: operation.name(),
                reason: "store unreachable".into(),
            });
        }
        let owner_id = payload
            .get("ownerId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut records = self.records.lock().map_err(|_| SyncError::Rpc {
            operation: operation.name(),
            reason: "store poisoned".into(),
        })?;

        let response = match operation {
            RpcOperation::GetUserDevices => Self::fetch(&records, &owner_id),
            RpcOperation::SyncDeviceInfo => match payload.get("deviceInfo") {
                Some(Value::Object(device)) => {
                    Self::upsert(&mut records, &owner_id, device.clone())
                }
                _ => RpcResponse::rejected("incomplete device info"),
            },
            RpcOperation::DeleteDevice => match payload.get("deviceId").and_then(Value::as_str) {
                Some(device_id) => Self::soft_delete(&mut records, &owner_id, device_id),
                None => RpcResponse::rejected("missing deviceId"),
            },
        };
        Ok(response)
    }
}
