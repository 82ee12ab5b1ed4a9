//! Naming event listener trait and event types

use std::sync::Arc;

use dashmap::DashMap;
use roster_api::InstanceRecord;

/// Event delivered to listeners when a service's instance set changes.
#[derive(Clone, Debug)]
pub struct NamingEvent {
    pub service_name: String,
    pub instances: Vec<InstanceRecord>,
    /// Cache version after the change; strictly increasing per cache.
    pub version: u64,
}

/// Trait for receiving naming change events.
///
/// Implement this to be notified when a subscribed service's instance set changes.
pub trait EventListener: Send + Sync + 'static {
    /// Called when the service's instance set has changed.
    fn on_event(&self, event: NamingEvent);
}

/// A simple listener that invokes a closure.
pub struct FnEventListener<F>
where
    F: Fn(NamingEvent) + Send + Sync + 'static,
{
    f: F,
}

impl<F> FnEventListener<F>
where
    F: Fn(NamingEvent) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> EventListener for FnEventListener<F>
where
    F: Fn(NamingEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: NamingEvent) {
        (self.f)(event);
    }
}

/// Listeners registered per service name.
///
/// Outlives individual caches so subscriptions survive a connection rebuild.
#[derive(Default)]
pub struct Subscriptions {
    listeners: DashMap<String, Vec<Arc<dyn EventListener>>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener. Adding the same listener twice is a no-op.
    pub fn add(&self, service_name: &str, listener: Arc<dyn EventListener>) {
        let mut entry = self.listeners.entry(service_name.to_string()).or_default();
        if !entry.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            entry.push(listener);
        }
    }

    pub fn remove(&self, service_name: &str) -> Vec<Arc<dyn EventListener>> {
        self.listeners
            .remove(service_name)
            .map(|(_, v)| v)
            .unwrap_or_default()
    }

    pub fn listeners(&self, service_name: &str) -> Vec<Arc<dyn EventListener>> {
        self.listeners
            .get(service_name)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.listeners.iter().map(|e| e.key().clone()).collect()
    }
}
