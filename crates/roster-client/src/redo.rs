//! Redo service for replaying registrations after a lost session

use dashmap::DashMap;
use roster_api::{InstanceRecord, codec};
use roster_store::{CreateMode, StoreConnection, StoreError};
use tracing::{debug, error, info};

/// Remembers every instance a registration service wrote so they can be
/// re-created on a new session.
///
/// When a session is lost the store drops its ephemeral nodes. Persistent
/// nodes survive and are left alone.
#[derive(Default)]
pub struct RedoService {
    /// key = instance node path
    registered: DashMap<String, InstanceRecord>,
}

impl RedoService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&self, node_path: &str, record: InstanceRecord) {
        self.registered.insert(node_path.to_string(), record);
    }

    pub fn forget(&self, node_path: &str) -> Option<InstanceRecord> {
        self.registered.remove(node_path).map(|(_, v)| v)
    }

    /// Forget every instance under `service_path`.
    pub fn forget_service(&self, service_path: &str) {
        let prefix = format!("{}/", service_path);
        self.registered.retain(|key, _| !key.starts_with(&prefix));
    }

    pub fn clear(&self) {
        self.registered.clear();
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    /// Re-create the remembered ephemeral nodes on `connection`.
    ///
    /// Returns how many nodes were written. Failures are logged per node and
    /// do not stop the replay.
    pub async fn redo_all(&self, connection: &dyn StoreConnection) -> usize {
        let pending: Vec<(String, InstanceRecord)> = self
            .registered
            .iter()
            .filter(|e| e.value().service_type().is_ephemeral())
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        if pending.is_empty() {
            return 0;
        }

        info!("Starting redo of {} registrations", pending.len());
        let mut restored = 0;
        for (node_path, record) in pending {
            let data = match codec::encode(&record) {
                Ok(data) => data,
                Err(e) => {
                    error!("Failed to encode {} for redo: {}", node_path, e);
                    continue;
                }
            };
            match connection
                .create_node(&node_path, data, CreateMode::Ephemeral)
                .await
            {
                Ok(_) => restored += 1,
                Err(StoreError::NodeExists(_)) => debug!("{} still registered", node_path),
                Err(e) => error!("Failed to redo registration {}: {}", node_path, e),
            }
        }
        info!("Redo complete, restored {} registrations", restored);
        restored
    }
}
