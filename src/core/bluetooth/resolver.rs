//! Locates the write/notify characteristic pair on a connected device.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    HEURISTIC_NOTIFY_CHAR_INDEX, HEURISTIC_SERVICE_OFFSET_FROM_END, HEURISTIC_WRITE_CHAR_INDEX,
    UUID_STANDARD_NOTIFY_CHAR, UUID_STANDARD_SERVICE, UUID_STANDARD_WRITE_CHAR,
};
use crate::core::bluetooth::error::{BluetoothError, ResolutionError};
use crate::core::bluetooth::platform::BlePlatform;
use crate::core::bluetooth::types::{GattEndpoint, GattService};

pub struct GattResolver {
    platform: Arc<dyn BlePlatform>,
    cache: Mutex<HashMap<String, GattEndpoint>>,
}

impl GattResolver {
    pub fn new(platform: Arc<dyn BlePlatform>) -> Self {
        Self {
            platform,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves the endpoint for a connected device and enables notifications on it.
    ///
    /// The standard service wins whenever it is present. Only firmware without it
    /// falls back to the positional layout. A cached result is returned as is.
    pub async fn resolve(&self, id: &str) -> Result<GattEndpoint, BluetoothError> {
        if let Some(endpoint) = self.cached(id) {
            debug!("Using cached GATT endpoint for {}", id);
            return Ok(endpoint);
        }

        let services = self
            .platform
            .services(id)
            .await
            .map_err(|e| ResolutionError::Discovery(e.to_string()))?;
        if services.is_empty() {
            return Err(ResolutionError::NoServices.into());
        }

        let endpoint = if services.iter().any(|s| s.uuid == UUID_STANDARD_SERVICE) {
            self.resolve_standard(id).await?
        } else {
            self.resolve_positional(id, &services).await?
        };

        // Enabling notifications is part of resolving: an endpoint that cannot notify is unusable.
        if let Some(notify) = endpoint.notify_characteristic {
            self.platform
                .set_notify(id, endpoint.service, notify, true)
                .await
                .map_err(|e| ResolutionError::EnableNotifications {
                    characteristic: notify,
                    reason: e.to_string(),
                })?;
        }

        info!(
            "Resolved {}: service {}, write {:?}, notify {:?}",
            id, endpoint.service, endpoint.write_characteristic, endpoint.notify_characteristic
        );
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(id.to_string(), endpoint);
        }
        Ok(endpoint)
    }

    async fn resolve_standard(&self, id: &str) -> Result<GattEndpoint, BluetoothError> {
        let characteristics = self
            .platform
            .characteristics(id, UUID_STANDARD_SERVICE)
            .await
            .map_err(|e| ResolutionError::Discovery(e.to_string()))?;

        let has = |uuid: Uuid| characteristics.iter().any(|c| c.uuid == uuid);
        if !has(UUID_STANDARD_NOTIFY_CHAR) {
            return Err(ResolutionError::StandardServiceMissingNotify.into());
        }
        let write_characteristic =
            has(UUID_STANDARD_WRITE_CHAR).then_some(UUID_STANDARD_WRITE_CHAR);
        if write_characteristic.is_none() {
            warn!("{} exposes the standard service without a write characteristic", id);
        }

        Ok(GattEndpoint {
            service: UUID_STANDARD_SERVICE,
            write_characteristic,
            notify_characteristic: Some(UUID_STANDARD_NOTIFY_CHAR),
        })
    }

    /// Older firmware keeps the pair at a fixed position: the third service from the
    /// end, write first, notify second.
    async fn resolve_positional(
        &self,
        id: &str,
        services: &[GattService],
    ) -> Result<GattEndpoint, BluetoothError> {
        let required = HEURISTIC_SERVICE_OFFSET_FROM_END;
        if services.len() < required {
            return Err(ResolutionError::InsufficientServices {
                found: services.len(),
                required,
            }
            .into());
        }
        let service = services[services.len() - required].uuid;
        debug!("Standard service absent on {}, trying service {}", id, service);

        let characteristics = self
            .platform
            .characteristics(id, service)
            .await
            .map_err(|e| ResolutionError::Discovery(e.to_string()))?;
        let needed = HEURISTIC_WRITE_CHAR_INDEX.max(HEURISTIC_NOTIFY_CHAR_INDEX) + 1;
        if characteristics.len() < needed {
            return Err(ResolutionError::InsufficientCharacteristics {
                service,
                found: characteristics.len(),
            }
            .into());
        }

        let write = characteristics[HEURISTIC_WRITE_CHAR_INDEX];
        let notify = characteristics[HEURISTIC_NOTIFY_CHAR_INDEX];
        if !write.properties.can_write() {
            return Err(ResolutionError::WriteUnsupported {
                characteristic: write.uuid,
            }
            .into());
        }
        if !notify.properties.can_notify() {
            return Err(ResolutionError::NotifyUnsupported {
                characteristic: notify.uuid,
            }
            .into());
        }

        Ok(GattEndpoint {
            service,
            write_characteristic: Some(write.uuid),
            notify_characteristic: Some(notify.uuid),
        })
    }

    pub fn cached(&self, id: &str) -> Option<GattEndpoint> {
        self.cache.lock().ok().and_then(|cache| cache.get(id).copied())
    }

    pub fn invalidate(&self, id: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(id);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }
}
