//! Server-side service registration
//!
//! Provides `RegistrationService` for writing and removing instance records.
//! DYNAMIC records are ephemeral nodes owned by the service's session; when
//! that session is lost they are re-created on a new one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use roster_api::{InstanceRecord, ServiceType, codec, path};
use roster_store::{ConnectionState, CreateMode, StoreConnection, StoreConnector, StoreError, with_session};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{ClientError, Result};
use crate::naming::watcher::{ConnectionHandler, ConnectionWatcher};
use crate::redo::RedoService;

/// Registers instances of services under a base path.
///
/// Uniqueness of a registration is decided by (name, address, port). The
/// check and the create are separate store operations, so two processes
/// registering the same triple at once may both succeed.
#[derive(Clone)]
pub struct RegistrationService {
    inner: Arc<RegistrationInner>,
}

struct RegistrationSession {
    generation: u64,
    connection: Arc<dyn StoreConnection>,
}

struct RegistrationInner {
    self_ref: Weak<RegistrationInner>,
    base_path: String,
    service_type: ServiceType,
    connector: Arc<dyn StoreConnector>,
    session: Mutex<Option<RegistrationSession>>,
    generation: AtomicU64,
    redo: RedoService,
    closed: AtomicBool,
}

impl RegistrationService {
    /// Create a service writing `service_type` records under `base_path`.
    pub fn new(
        service_type: ServiceType,
        base_path: &str,
        connector: Arc<dyn StoreConnector>,
    ) -> Result<Self> {
        path::validate(base_path).map_err(|e| ClientError::Config(e.to_string()))?;
        let inner = Arc::new_cyclic(|self_ref| RegistrationInner {
            self_ref: self_ref.clone(),
            base_path: base_path.to_string(),
            service_type,
            connector,
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            redo: RedoService::new(),
            closed: AtomicBool::new(false),
        });
        Ok(Self { inner })
    }

    pub fn service_type(&self) -> ServiceType {
        self.inner.service_type
    }

    /// Number of sessions opened so far.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Instances remembered for redo.
    pub fn registered_count(&self) -> usize {
        self.inner.redo.len()
    }

    /// Register an instance unless one with the same name, address and port
    /// already exists.
    ///
    /// Returns `false` for a duplicate.
    pub async fn regist(&self, name: &str, address: &str, port: u16, description: &str) -> Result<bool> {
        path::validate_segment(name)?;
        if let Some(existing) = self.exist(name, address, port).await? {
            warn!(
                "regist service failure, the service [{}-{}:{}] already exists as {}",
                name,
                address,
                port,
                existing.id()
            );
            return Ok(false);
        }

        let record = InstanceRecord::builder(name)
            .address(address)
            .port(port)
            .payload(description)
            .service_type(self.inner.service_type)
            .build();
        self.register_instance(record).await
    }

    /// Write `record` as-is. Returns `false` if its node already exists.
    pub async fn register_instance(&self, record: InstanceRecord) -> Result<bool> {
        path::validate_segment(record.name())?;
        path::validate_segment(record.id())?;
        let connection = self.inner.connection().await?;
        let node_path = self.instance_path(&record);
        let data = codec::encode(&record)?;

        match connection
            .create_node(&node_path, data, create_mode(record.service_type()))
            .await
        {
            Ok(_) => {
                info!("Registered {}", record);
                self.inner.redo.remember(&node_path, record);
                Ok(true)
            }
            Err(StoreError::NodeExists(_)) => {
                warn!("Instance node {} already exists", node_path);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The registered instance matching name, address and port.
    pub async fn exist(&self, name: &str, address: &str, port: u16) -> Result<Option<InstanceRecord>> {
        let instances = self.get_service_list(name).await?;
        Ok(instances.into_iter().find(|i| i.matches(name, address, port)))
    }

    /// Delete the instance matching name, address and port.
    ///
    /// Returns `false` if there was none.
    pub async fn remove_service(&self, name: &str, address: &str, port: u16) -> Result<bool> {
        let Some(instance) = self.exist(name, address, port).await? else {
            return Ok(false);
        };
        let connection = self.inner.connection().await?;
        let node_path = self.instance_path(&instance);
        connection.delete_node(&node_path).await?;
        self.inner.redo.forget(&node_path);
        info!("Unregistered {}", instance);
        Ok(true)
    }

    /// Read every instance of `name` directly from the store.
    ///
    /// A missing service yields an empty list; undecodable nodes are skipped.
    pub async fn get_service_list(&self, name: &str) -> Result<Vec<InstanceRecord>> {
        path::validate_segment(name)?;
        let connection = self.inner.connection().await?;
        let service_path = path::service_path(&self.inner.base_path, name);

        let children = match connection.list_children(&service_path).await {
            Ok(children) => children,
            Err(StoreError::NodeNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut instances = Vec::with_capacity(children.len());
        for child in children {
            let child_path = path::join(&service_path, &child);
            match connection.get_data(&child_path).await {
                Ok(data) => match codec::decode(&data) {
                    Ok(record) => instances.push(record),
                    Err(e) => warn!("Skipping undecodable instance at {}: {}", child_path, e),
                },
                Err(StoreError::NodeNotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        debug!("Found {} instances of {}", instances.len(), name);
        Ok(instances)
    }

    /// Replace the record stored at `record`'s id.
    ///
    /// Watchers observe a deletion followed by a creation.
    pub async fn update_service(&self, record: InstanceRecord) -> Result<()> {
        path::validate_segment(record.name())?;
        path::validate_segment(record.id())?;
        let connection = self.inner.connection().await?;
        let node_path = self.instance_path(&record);
        let data = codec::encode(&record)?;

        connection.delete_node(&node_path).await?;
        connection
            .create_node(&node_path, data, create_mode(record.service_type()))
            .await?;
        info!("Updated {}", record);
        self.inner.redo.remember(&node_path, record);
        Ok(())
    }

    /// Delete every instance node of `name` through a one-off session.
    ///
    /// Returns the number of nodes deleted.
    pub async fn force_delete(&self, name: &str) -> Result<usize> {
        path::validate_segment(name)?;
        let service_path = path::service_path(&self.inner.base_path, name);
        let target = service_path.clone();

        let deleted = with_session(self.inner.connector.as_ref(), |connection| async move {
            let children = match connection.list_children(&target).await {
                Ok(children) => children,
                Err(StoreError::NodeNotFound(_)) => return Ok::<usize, ClientError>(0),
                Err(e) => return Err(e.into()),
            };
            for child in &children {
                let child_path = path::join(&target, child);
                info!("delete node: {}", child_path);
                connection.delete_node(&child_path).await?;
            }
            Ok(children.len())
        })
        .await?;

        self.inner.redo.forget_service(&service_path);
        Ok(deleted)
    }

    /// Re-create remembered DYNAMIC registrations on the current session.
    pub async fn redo(&self) -> Result<usize> {
        let connection = self.inner.connection().await?;
        Ok(self.inner.redo.redo_all(connection.as_ref()).await)
    }

    /// Close the session. Its DYNAMIC registrations disappear.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(session) = self.inner.session.lock().await.take() {
            session.connection.close().await;
        }
        self.inner.redo.clear();
        info!("Registration service for {} closed", self.inner.base_path);
    }

    fn instance_path(&self, record: &InstanceRecord) -> String {
        path::instance_path(&self.inner.base_path, record.name(), record.id())
    }
}

fn create_mode(service_type: ServiceType) -> CreateMode {
    if service_type.is_ephemeral() {
        CreateMode::Ephemeral
    } else {
        CreateMode::Persistent
    }
}

impl RegistrationInner {
    async fn connection(&self) -> Result<Arc<dyn StoreConnection>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref()
            && session.connection.state() != ConnectionState::Lost
        {
            return Ok(session.connection.clone());
        }
        self.replace_session(&mut guard).await
    }

    /// Open a new session in place of the current one and replay
    /// remembered registrations onto it.
    async fn replace_session(
        &self,
        slot: &mut Option<RegistrationSession>,
    ) -> Result<Arc<dyn StoreConnection>> {
        if let Some(old) = slot.take() {
            old.connection.close().await;
        }

        let connection = self.connector.connect().await?;
        let states = connection.connection_states();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        ConnectionWatcher::spawn(self.self_ref.clone(), generation, states);
        info!(
            "Registration session {} opened on {} (generation {})",
            connection.session_id(),
            self.connector.describe(),
            generation
        );

        *slot = Some(RegistrationSession {
            generation,
            connection: connection.clone(),
        });
        self.redo.redo_all(connection.as_ref()).await;
        Ok(connection)
    }
}

#[async_trait]
impl ConnectionHandler for RegistrationInner {
    async fn on_state_change(&self, generation: u64, state: ConnectionState) {
        match state {
            ConnectionState::Lost => {
                if self.closed.load(Ordering::SeqCst) {
                    return;
                }
                let mut guard = self.session.lock().await;
                if guard.as_ref().map(|s| s.generation) != Some(generation) {
                    debug!("Ignoring LOST from stale registration generation {}", generation);
                    return;
                }
                warn!(
                    "Registration session lost, re-registering {} instances",
                    self.redo.len()
                );
                if let Err(e) = self.replace_session(&mut guard).await {
                    error!("Failed to rebuild registration session: {}", e);
                }
            }
            ConnectionState::Suspended => warn!("Registration session suspended"),
            ConnectionState::Reconnected => info!("Registration session reconnected"),
            ConnectionState::Connected => {}
        }
    }
}
