//! Service discovery (naming) client
//!
//! Provides `DiscoveryClient` for resolving service names to live instances.
//! Each service is mirrored by a `ServiceCache` kept current by subtree
//! watches; when the store session is lost the client discards every cache
//! and rebuilds its connection.

pub mod balancer;
pub mod cache_registry;
pub mod listener;
pub mod service_cache;
pub mod state;
pub mod watcher;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use roster_api::{InstanceRecord, path};
use roster_store::{ConnectionState, StoreConnection, StoreConnector};
use tokio::sync::{RwLock, watch};
use tracing::{debug, error, info, warn};

use crate::config::DiscoveryConfig;
use crate::error::{ClientError, Result};
use crate::metrics::DiscoveryMetrics;

pub use self::cache_registry::CacheRegistry;
pub use self::service_cache::ServiceCache;
pub use self::state::{ClientState, StateAction};

use self::balancer::Balancer;
use self::listener::{EventListener, Subscriptions};
use self::watcher::{ConnectionHandler, ConnectionWatcher};

/// Clients handed out by [`DiscoveryClient::shared`], keyed by base path.
static SHARED_CLIENTS: LazyLock<DashMap<String, DiscoveryClient>> = LazyLock::new(DashMap::new);

/// Resolves service names to live instances from locally cached views.
///
/// Cheap to clone; clones share the same session and caches.
#[derive(Clone)]
pub struct DiscoveryClient {
    inner: Arc<DiscoveryInner>,
}

/// One store session and the caches built on it.
struct Session {
    generation: u64,
    connection: Arc<dyn StoreConnection>,
    registry: CacheRegistry,
}

struct DiscoveryInner {
    self_ref: Weak<DiscoveryInner>,
    base_path: String,
    connector: Arc<dyn StoreConnector>,
    /// Readers hold the read guard while resolving a cache; a rebuild takes
    /// the write guard, so no reader sees a cache from a discarded session.
    session: RwLock<Option<Session>>,
    state: watch::Sender<ClientState>,
    generation: AtomicU64,
    ever_connected: AtomicBool,
    closed: AtomicBool,
    subscriptions: Arc<Subscriptions>,
    metrics: Arc<DiscoveryMetrics>,
}

impl DiscoveryClient {
    /// Create a client for services registered under `base_path`.
    ///
    /// No connection is made until the first lookup.
    pub fn new(base_path: &str, connector: Arc<dyn StoreConnector>) -> Result<Self> {
        path::validate(base_path).map_err(|e| ClientError::Config(e.to_string()))?;
        let metrics = Arc::new(DiscoveryMetrics::new()?);
        let (state, _) = watch::channel(ClientState::Disconnected);

        let inner = Arc::new_cyclic(|self_ref| DiscoveryInner {
            self_ref: self_ref.clone(),
            base_path: base_path.to_string(),
            connector,
            session: RwLock::new(None),
            state,
            generation: AtomicU64::new(0),
            ever_connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            subscriptions: Arc::new(Subscriptions::new()),
            metrics,
        });
        Ok(Self { inner })
    }

    /// Create a client from loaded configuration.
    pub fn from_config(config: &DiscoveryConfig, connector: Arc<dyn StoreConnector>) -> Result<Self> {
        Self::new(&config.base_path, connector)
    }

    /// Process-wide client for the configured base path.
    ///
    /// The first call creates the client; concurrent first calls still
    /// yield a single instance. Later calls ignore `connector`.
    pub fn shared(config: &DiscoveryConfig, connector: Arc<dyn StoreConnector>) -> Result<Self> {
        let base_path = config.base_path.as_str();
        if let Some(client) = SHARED_CLIENTS.get(base_path) {
            return Ok(client.clone());
        }
        match SHARED_CLIENTS.entry(base_path.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let client = Self::new(base_path, connector)?;
                entry.insert(client.clone());
                info!("Created shared discovery client for {}", base_path);
                Ok(client)
            }
        }
    }

    pub fn base_path(&self) -> &str {
        &self.inner.base_path
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    /// Watch connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    /// Number of sessions established so far.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> &Arc<DiscoveryMetrics> {
        &self.inner.metrics
    }

    /// Connect eagerly instead of on the first lookup.
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect_if_absent().await
    }

    /// One instance of `service_name`, chosen uniformly at random.
    pub async fn get_service(&self, service_name: &str) -> Result<InstanceRecord> {
        let instances = self.get_all_services(service_name).await?;
        Balancer::select_host(service_name, &instances)
    }

    /// Every live instance of `service_name`.
    ///
    /// An unknown service yields an empty list. While the store is
    /// unreachable the last known view is served; `StoreUnavailable` is only
    /// returned if the client never connected.
    pub async fn get_all_services(&self, service_name: &str) -> Result<Vec<InstanceRecord>> {
        path::validate_segment(service_name)?;
        self.inner.snapshot(service_name, None).await
    }

    /// The instance of `service_name` with record id `id`, if live.
    pub async fn get_instance(&self, service_name: &str, id: &str) -> Result<Option<InstanceRecord>> {
        let instances = self.get_all_services(service_name).await?;
        Ok(Balancer::select_by_id(&instances, id))
    }

    /// Register `listener` for changes to `service_name` and return the
    /// current instances.
    ///
    /// Subscriptions survive connection rebuilds.
    pub async fn subscribe(
        &self,
        service_name: &str,
        listener: Arc<dyn EventListener>,
    ) -> Result<Vec<InstanceRecord>> {
        path::validate_segment(service_name)?;
        self.inner.subscriptions.add(service_name, listener.clone());
        self.inner.snapshot(service_name, Some(&listener)).await
    }

    /// Drop every listener registered for `service_name`.
    pub async fn unsubscribe(&self, service_name: &str) {
        self.inner.subscriptions.remove(service_name);
        let guard = self.inner.session.read().await;
        if let Some(session) = guard.as_ref()
            && let Some(cache) = session.registry.get(service_name)
        {
            cache.clear_listeners();
        }
    }

    /// Number of service caches held by the current session.
    pub async fn cached_services(&self) -> usize {
        let guard = self.inner.session.read().await;
        guard.as_ref().map_or(0, |s| s.registry.len())
    }

    /// Discard the current session and every cache, then connect anew.
    pub async fn rebuild_connection(&self) -> Result<()> {
        self.inner.rebuild(None).await
    }

    /// Close the session and stop every cache. Later calls fail with `Closed`.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut guard = self.inner.session.write().await;
            if let Some(session) = guard.take() {
                session.registry.clear();
                session.connection.close().await;
            }
        }
        self.inner.set_state(ClientState::Disconnected);
        SHARED_CLIENTS.remove_if(&self.inner.base_path, |_, client| {
            Arc::ptr_eq(&client.inner, &self.inner)
        });
        info!("Discovery client for {} closed", self.inner.base_path);
    }
}

impl DiscoveryInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    fn set_state(&self, state: ClientState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("Discovery client state {} -> {}", previous, state);
        }
    }

    async fn snapshot(
        &self,
        service_name: &str,
        listener: Option<&Arc<dyn EventListener>>,
    ) -> Result<Vec<InstanceRecord>> {
        for _ in 0..2 {
            self.ensure_open()?;
            {
                let guard = self.session.read().await;
                if let Some(session) = guard.as_ref() {
                    return Ok(match session.registry.get_or_create(service_name).await {
                        Ok(cache) => {
                            if let Some(listener) = listener {
                                cache.add_listener(listener.clone());
                            }
                            cache.snapshot()
                        }
                        Err(e) => {
                            warn!(
                                "Failed to build cache for {}: {}, serving empty list",
                                service_name, e
                            );
                            Vec::new()
                        }
                    });
                }
            }
            if let Err(e) = self.connect_if_absent().await {
                return self.degrade(service_name, e);
            }
        }
        // A rebuild discarded the session we just created
        self.degrade(
            service_name,
            ClientError::StoreUnavailable(self.connector.describe()),
        )
    }

    /// Serve an empty list once the client has ever connected.
    fn degrade(&self, service_name: &str, err: ClientError) -> Result<Vec<InstanceRecord>> {
        if matches!(err, ClientError::Closed) || !self.ever_connected.load(Ordering::SeqCst) {
            return Err(err);
        }
        warn!("Store unavailable for {}: {}, serving empty list", service_name, err);
        Ok(Vec::new())
    }

    async fn connect_if_absent(&self) -> Result<()> {
        let mut guard = self.session.write().await;
        if guard.is_some() {
            return Ok(());
        }
        self.ensure_open()?;
        self.install_session(&mut guard).await
    }

    /// Build a session into `slot` and recreate the caches of subscribed
    /// services on it.
    async fn install_session(&self, slot: &mut Option<Session>) -> Result<()> {
        let session = self.build_session().await?;
        for service_name in self.subscriptions.service_names() {
            if let Err(e) = session.registry.get_or_create(&service_name).await {
                warn!("Failed to restore subscription for {}: {}", service_name, e);
            }
        }
        *slot = Some(session);
        Ok(())
    }

    async fn build_session(&self) -> Result<Session> {
        self.set_state(ClientState::Connecting);
        let connection = match self.connector.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                self.set_state(ClientState::Disconnected);
                error!("Failed to connect to {}: {}", self.connector.describe(), e);
                return Err(e.into());
            }
        };

        let states = connection.connection_states();
        if connection.state() == ConnectionState::Lost {
            self.set_state(ClientState::Disconnected);
            return Err(ClientError::StoreUnavailable(format!(
                "session {} lost while connecting",
                connection.session_id()
            )));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        ConnectionWatcher::spawn(self.self_ref.clone(), generation, states);
        self.ever_connected.store(true, Ordering::SeqCst);
        self.set_state(ClientState::Connected);
        info!(
            "Connected to {} with session {} (generation {})",
            self.connector.describe(),
            connection.session_id(),
            generation
        );

        let registry = CacheRegistry::new(connection.clone(), &self.base_path)
            .with_subscriptions(self.subscriptions.clone())
            .with_metrics(self.metrics.clone());
        Ok(Session {
            generation,
            connection,
            registry,
        })
    }

    /// Replace the session. With `expected`, only if it is still current.
    async fn rebuild(&self, expected: Option<u64>) -> Result<()> {
        let mut guard = self.session.write().await;
        if let Some(expected) = expected
            && guard.as_ref().map(|s| s.generation) != Some(expected)
        {
            debug!("Ignoring rebuild for stale generation {}", expected);
            return Ok(());
        }
        self.ensure_open()?;

        if let Some(old) = guard.take() {
            old.registry.clear();
            old.connection.close().await;
            info!(
                "Discarded session {} (generation {})",
                old.connection.session_id(),
                old.generation
            );
        }
        self.metrics.record_reconnect();
        self.install_session(&mut guard).await
    }
}

#[async_trait]
impl ConnectionHandler for DiscoveryInner {
    async fn on_state_change(&self, generation: u64, state: ConnectionState) {
        if generation != self.generation.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            debug!("Ignoring {} from stale generation {}", state, generation);
            return;
        }

        let current = *self.state.borrow();
        match current.on_store_event(state) {
            StateAction::Ignore => {}
            StateAction::Enter(next) => self.set_state(next),
            StateAction::Rebuild => {
                warn!("Store connection lost, reconnecting (generation {})", generation);
                if let Err(e) = self.rebuild(Some(generation)).await {
                    error!("Failed to rebuild store connection: {}", e);
                }
            }
        }
    }
}
