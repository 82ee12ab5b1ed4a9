//! Local mirror of one service's instance nodes
//!
//! A cache subscribes to the service subtree before listing it, so no change
//! between the initial read and the first notification is lost. Updates are
//! applied copy-on-write: readers clone an `Arc` of the current map and never
//! observe a half-applied event.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use roster_api::{InstanceRecord, codec, path};
use roster_store::{NodeEvent, NodeEventKind, StoreConnection, StoreError, WatchId};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::listener::{EventListener, NamingEvent};
use super::watcher::DataWatcher;
use crate::error::Result;
use crate::metrics::DiscoveryMetrics;

/// Lifecycle of a [`ServiceCache`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheState {
    Building,
    Ready,
    Stopped,
}

struct Subscription {
    connection: Arc<dyn StoreConnection>,
    watch_id: WatchId,
    task: JoinHandle<()>,
}

pub struct ServiceCache {
    service_name: String,
    path: String,
    instances: RwLock<Arc<HashMap<String, InstanceRecord>>>,
    version: AtomicU64,
    state: Mutex<CacheState>,
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
    subscription: Mutex<Option<Subscription>>,
    metrics: Option<Arc<DiscoveryMetrics>>,
}

impl ServiceCache {
    pub fn new(service_name: impl Into<String>, base_path: &str) -> Self {
        let service_name = service_name.into();
        let path = path::service_path(base_path, &service_name);
        Self {
            service_name,
            path,
            instances: RwLock::new(Arc::new(HashMap::new())),
            version: AtomicU64::new(0),
            state: Mutex::new(CacheState::Building),
            listeners: RwLock::new(Vec::new()),
            subscription: Mutex::new(None),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<DiscoveryMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Path of the watched service node.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> CacheState {
        *self.state.lock()
    }

    /// Number of changes applied since the cache was created.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a listener notified after every applied change.
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        let mut listeners = self.listeners.write();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
    }

    /// Subscribe to the service subtree, load the current children and
    /// start applying change notifications.
    ///
    /// A missing service node yields an empty cache. Undecodable children
    /// are logged and skipped.
    pub async fn start(self: &Arc<Self>, connection: Arc<dyn StoreConnection>) -> Result<()> {
        if self.state() != CacheState::Building {
            debug!("Service cache {} already started", self.service_name);
            return Ok(());
        }

        let watch = connection.watch_subtree(&self.path).await?;
        let initial = match self.load(connection.as_ref()).await {
            Ok(initial) => initial,
            Err(e) => {
                connection.unwatch(watch.id);
                return Err(e);
            }
        };
        let count = initial.len();
        *self.instances.write() = Arc::new(initial);

        let task = DataWatcher::spawn(Arc::downgrade(self), watch.events);
        {
            let mut state = self.state.lock();
            if *state == CacheState::Stopped {
                connection.unwatch(watch.id);
                task.abort();
                return Ok(());
            }
            *state = CacheState::Ready;
        }
        *self.subscription.lock() = Some(Subscription {
            connection,
            watch_id: watch.id,
            task,
        });

        info!(
            "Service cache for {} ready with {} instances",
            self.service_name, count
        );
        if let Some(metrics) = &self.metrics {
            metrics.set_cached_instances(&self.service_name, count);
        }
        self.notify(self.version());
        Ok(())
    }

    async fn load(&self, connection: &dyn StoreConnection) -> Result<HashMap<String, InstanceRecord>> {
        let children = match connection.list_children(&self.path).await {
            Ok(children) => children,
            Err(StoreError::NodeNotFound(_)) => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };

        let mut instances = HashMap::with_capacity(children.len());
        for child in children {
            let child_path = path::join(&self.path, &child);
            match connection.get_data(&child_path).await {
                Ok(data) => match codec::decode(&data) {
                    Ok(record) => {
                        instances.insert(child, record);
                    }
                    Err(e) => self.record_decode_failure(&child_path, &e),
                },
                // Removed between the listing and the read
                Err(StoreError::NodeNotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(instances)
    }

    /// Apply one subtree notification.
    ///
    /// Only direct children of the service node are instances; anything
    /// deeper is ignored. Returns whether the cache changed.
    pub fn apply_event(&self, event: &NodeEvent) -> bool {
        if self.state() == CacheState::Stopped {
            return false;
        }
        if path::parent(&event.path) != Some(self.path.as_str()) {
            return false;
        }

        let count = match event.kind {
            NodeEventKind::Created | NodeEventKind::Updated => {
                let Some(data) = event.data.as_deref() else {
                    warn!("Ignoring {:?} event without data for {}", event.kind, event.path);
                    return false;
                };
                let record = match codec::decode(data) {
                    Ok(record) => record,
                    Err(e) => {
                        self.record_decode_failure(&event.path, &e);
                        return false;
                    }
                };
                let mut instances = self.instances.write();
                Arc::make_mut(&mut *instances).insert(event.name.clone(), record);
                instances.len()
            }
            NodeEventKind::Deleted => {
                let mut instances = self.instances.write();
                Arc::make_mut(&mut *instances).remove(&event.name);
                instances.len()
            }
        };

        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(metrics) = &self.metrics {
            metrics.record_event(&self.service_name, event_kind_label(event.kind));
            metrics.set_cached_instances(&self.service_name, count);
        }
        self.notify(version);
        true
    }

    /// Current instances, ordered by id.
    pub fn snapshot(&self) -> Vec<InstanceRecord> {
        let instances = self.instances.read().clone();
        let mut records: Vec<InstanceRecord> = instances.values().cloned().collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        records
    }

    /// Cancel the subscription. Later notifications are ignored.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == CacheState::Stopped {
                return;
            }
            *state = CacheState::Stopped;
        }
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.connection.unwatch(subscription.watch_id);
            subscription.task.abort();
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_cached_instances(&self.service_name, 0);
        }
        debug!("Stopped service cache for {}", self.service_name);
    }

    fn notify(&self, version: u64) {
        let listeners = self.listeners.read().clone();
        if listeners.is_empty() {
            return;
        }
        let event = NamingEvent {
            service_name: self.service_name.clone(),
            instances: self.snapshot(),
            version,
        };
        for listener in listeners {
            listener.on_event(event.clone());
        }
    }

    fn record_decode_failure(&self, node_path: &str, err: &roster_api::CodecError) {
        warn!("Skipping undecodable instance at {}: {}", node_path, err);
        if let Some(metrics) = &self.metrics {
            metrics.record_decode_failure(&self.service_name);
        }
    }
}

fn event_kind_label(kind: NodeEventKind) -> &'static str {
    match kind {
        NodeEventKind::Created => "created",
        NodeEventKind::Updated => "updated",
        NodeEventKind::Deleted => "deleted",
    }
}

impl Drop for ServiceCache {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.get_mut().take() {
            subscription.connection.unwatch(subscription.watch_id);
            subscription.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::listener::FnEventListener;
    use async_trait::async_trait;
    use roster_api::ServiceType;
    use roster_store::{
        ConnectionState, CreateMode, MemoryConnector, MemoryStore, StoreConfig, StoreConnector,
        SubtreeWatch,
    };
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn record(id: &str, port: u16) -> InstanceRecord {
        InstanceRecord::builder("orders")
            .id(id)
            .address("10.0.0.1")
            .port(port)
            .service_type(ServiceType::Dynamic)
            .build()
    }

    fn created(record: &InstanceRecord) -> NodeEvent {
        NodeEvent::created(
            format!("/services/orders/{}", record.id()),
            codec::encode(record).unwrap(),
        )
    }

    #[test]
    fn test_apply_created_updated_deleted() {
        let cache = ServiceCache::new("orders", "/services");
        let a = record("a", 8080);

        assert!(cache.apply_event(&created(&a)));
        assert_eq!(cache.snapshot(), vec![a.clone()]);

        let moved = record("a", 9090);
        assert!(cache.apply_event(&NodeEvent::updated(
            "/services/orders/a",
            codec::encode(&moved).unwrap()
        )));
        assert_eq!(cache.snapshot()[0].port(), 9090);

        assert!(cache.apply_event(&NodeEvent::deleted("/services/orders/a")));
        assert!(cache.is_empty());
        assert_eq!(cache.version(), 3);
    }

    #[test]
    fn test_ignores_non_children() {
        let cache = ServiceCache::new("orders", "/services");
        let a = record("a", 8080);

        let nested = NodeEvent::created("/services/orders/a/extra", codec::encode(&a).unwrap());
        assert!(!cache.apply_event(&nested));
        let service_node = NodeEvent::created("/services/orders", vec![]);
        assert!(!cache.apply_event(&service_node));
        assert!(cache.is_empty());
        assert_eq!(cache.version(), 0);
    }

    #[test]
    fn test_skips_undecodable_data() {
        let cache = ServiceCache::new("orders", "/services");
        let garbage = NodeEvent::created("/services/orders/bad", b"not json".to_vec());
        assert!(!cache.apply_event(&garbage));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_snapshot_unaffected_by_later_events() {
        let cache = ServiceCache::new("orders", "/services");
        cache.apply_event(&created(&record("a", 8080)));

        let before = cache.snapshot();
        cache.apply_event(&created(&record("b", 8081)));

        assert_eq!(before.len(), 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_stopped_cache_ignores_events() {
        let cache = ServiceCache::new("orders", "/services");
        cache.stop();
        cache.stop();
        assert_eq!(cache.state(), CacheState::Stopped);
        assert!(!cache.apply_event(&created(&record("a", 8080))));
    }

    #[test]
    fn test_listeners_receive_versions() {
        let cache = ServiceCache::new("orders", "/services");
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        cache.add_listener(Arc::new(FnEventListener::new(move |event: NamingEvent| {
            let n = calls_clone.fetch_add(1, Ordering::SeqCst) as u64;
            assert_eq!(event.version, n + 1);
        })));

        cache.apply_event(&created(&record("a", 8080)));
        cache.apply_event(&NodeEvent::deleted("/services/orders/a"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cache.clear_listeners();
        cache.apply_event(&created(&record("b", 8081)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_metrics_track_instance_count() {
        let metrics = Arc::new(DiscoveryMetrics::new().unwrap());
        let cache = ServiceCache::new("orders", "/services").with_metrics(metrics.clone());

        cache.apply_event(&created(&record("a", 8080)));
        cache.apply_event(&created(&record("b", 8081)));
        cache.apply_event(&NodeEvent::created("/services/orders/bad", b"{".to_vec()));

        assert_eq!(metrics.cached_instances.with_label_values(&["orders"]).get(), 2);
        assert_eq!(metrics.decode_failures.with_label_values(&["orders"]).get(), 1);
        assert_eq!(
            metrics
                .events_applied
                .with_label_values(&["orders", "created"])
                .get(),
            2
        );
    }

    /// Adds `late` and removes `a` right after answering a listing, so the
    /// changes land between the initial read and the first notification.
    struct ChangingConnection {
        inner: Arc<dyn StoreConnection>,
    }

    #[async_trait]
    impl StoreConnection for ChangingConnection {
        fn session_id(&self) -> u64 {
            self.inner.session_id()
        }

        fn state(&self) -> ConnectionState {
            self.inner.state()
        }

        async fn create_node(
            &self,
            node_path: &str,
            data: Vec<u8>,
            mode: CreateMode,
        ) -> roster_store::Result<String> {
            self.inner.create_node(node_path, data, mode).await
        }

        async fn delete_node(&self, node_path: &str) -> roster_store::Result<()> {
            self.inner.delete_node(node_path).await
        }

        async fn set_data(&self, node_path: &str, data: Vec<u8>) -> roster_store::Result<()> {
            self.inner.set_data(node_path, data).await
        }

        async fn exists(&self, node_path: &str) -> roster_store::Result<bool> {
            self.inner.exists(node_path).await
        }

        async fn list_children(&self, node_path: &str) -> roster_store::Result<Vec<String>> {
            let children = self.inner.list_children(node_path).await?;
            let late = codec::encode(&record("late", 9090)).unwrap();
            self.inner
                .create_node("/services/orders/late", late, CreateMode::Ephemeral)
                .await?;
            self.inner.delete_node("/services/orders/a").await?;
            Ok(children)
        }

        async fn get_data(&self, node_path: &str) -> roster_store::Result<Vec<u8>> {
            self.inner.get_data(node_path).await
        }

        async fn watch_subtree(&self, node_path: &str) -> roster_store::Result<SubtreeWatch> {
            self.inner.watch_subtree(node_path).await
        }

        fn unwatch(&self, id: WatchId) {
            self.inner.unwatch(id)
        }

        fn connection_states(&self) -> broadcast::Receiver<ConnectionState> {
            self.inner.connection_states()
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    fn ids(cache: &ServiceCache) -> Vec<String> {
        cache.snapshot().iter().map(|r| r.id().to_string()).collect()
    }

    #[tokio::test]
    async fn test_changes_during_initial_listing_are_kept() {
        let store = MemoryStore::new();
        store
            .put_persistent("/services/orders/a", codec::encode(&record("a", 8080)).unwrap())
            .unwrap();
        let connector = MemoryConnector::new(store.clone(), StoreConfig::default()).unwrap();
        let connection: Arc<dyn StoreConnection> = Arc::new(ChangingConnection {
            inner: connector.connect().await.unwrap(),
        });

        let cache = Arc::new(ServiceCache::new("orders", "/services"));
        cache.start(connection).await.unwrap();
        assert_eq!(cache.state(), CacheState::Ready);

        tokio::time::timeout(Duration::from_secs(5), async {
            while ids(&cache) != vec!["late".to_string()] {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!store.node_exists("/services/orders/a"));
    }
}
