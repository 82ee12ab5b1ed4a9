//! Per-connection registry of service caches

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use roster_store::StoreConnection;
use tokio::sync::OnceCell;
use tracing::info;

use super::listener::Subscriptions;
use super::service_cache::ServiceCache;
use crate::error::Result;
use crate::metrics::DiscoveryMetrics;

/// Lazily created service caches bound to one store connection.
///
/// Concurrent first requests for the same service share a single
/// construction; a failed construction is retried by the next caller.
pub struct CacheRegistry {
    connection: Arc<dyn StoreConnection>,
    base_path: String,
    caches: DashMap<String, Arc<OnceCell<Arc<ServiceCache>>>>,
    creations: AtomicUsize,
    subscriptions: Arc<Subscriptions>,
    metrics: Option<Arc<DiscoveryMetrics>>,
}

impl CacheRegistry {
    pub fn new(connection: Arc<dyn StoreConnection>, base_path: impl Into<String>) -> Self {
        Self {
            connection,
            base_path: base_path.into(),
            caches: DashMap::new(),
            creations: AtomicUsize::new(0),
            subscriptions: Arc::new(Subscriptions::new()),
            metrics: None,
        }
    }

    /// Attach listeners to every cache this registry creates.
    pub fn with_subscriptions(mut self, subscriptions: Arc<Subscriptions>) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<DiscoveryMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Return the started cache for `service_name`, building it on first use.
    pub async fn get_or_create(&self, service_name: &str) -> Result<Arc<ServiceCache>> {
        let cell = self
            .caches
            .entry(service_name.to_string())
            .or_default()
            .value()
            .clone();
        let cache = cell.get_or_try_init(|| self.create(service_name)).await?;
        Ok(cache.clone())
    }

    /// The cache for `service_name` if it has been built.
    pub fn get(&self, service_name: &str) -> Option<Arc<ServiceCache>> {
        self.caches
            .get(service_name)
            .and_then(|cell| cell.get().cloned())
    }

    pub fn len(&self) -> usize {
        self.caches.iter().filter(|e| e.value().initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of cache constructions started so far.
    pub fn creations(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    /// Stop and drop every cache.
    pub fn clear(&self) {
        self.caches.retain(|_, cell| {
            if let Some(cache) = cell.get() {
                cache.stop();
            }
            false
        });
    }

    async fn create(&self, service_name: &str) -> Result<Arc<ServiceCache>> {
        self.creations.fetch_add(1, Ordering::SeqCst);
        let mut cache = ServiceCache::new(service_name, &self.base_path);
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_build(service_name);
            cache = cache.with_metrics(metrics.clone());
        }
        let cache = Arc::new(cache);
        for listener in self.subscriptions.listeners(service_name) {
            cache.add_listener(listener);
        }
        cache.start(self.connection.clone()).await?;
        info!("Built service cache for {}", service_name);
        Ok(cache)
    }
}

impl Drop for CacheRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}
