//! Background tasks driven by store notifications
//!
//! `DataWatcher` forwards subtree events into a service cache and stops
//! once the owning session is lost.
//! `ConnectionWatcher` forwards session state changes to a handler, tagged
//! with the session generation so a handler can discard notifications from
//! a connection it already replaced.

use std::sync::Weak;

use async_trait::async_trait;
use roster_store::{ConnectionState, StoreEvent};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::service_cache::ServiceCache;

/// Receives session state changes for one connection generation.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn on_state_change(&self, generation: u64, state: ConnectionState);
}

pub struct ConnectionWatcher;

impl ConnectionWatcher {
    /// Spawn a task feeding `states` to `handler` until the session ends.
    ///
    /// The task stops after delivering `Lost`, when the channel closes, or
    /// when the handler is dropped.
    pub fn spawn<H: ConnectionHandler>(
        handler: Weak<H>,
        generation: u64,
        mut states: broadcast::Receiver<ConnectionState>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let state = match states.recv().await {
                    Ok(state) => state,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            "Connection watcher (generation {}) skipped {} state changes",
                            generation, skipped
                        );
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(handler) = handler.upgrade() else {
                    break;
                };
                debug!("Connection state {} (generation {})", state, generation);
                handler.on_state_change(generation, state).await;
                if state == ConnectionState::Lost {
                    break;
                }
            }
            debug!("Connection watcher for generation {} finished", generation);
        })
    }
}

pub struct DataWatcher;

impl DataWatcher {
    /// Spawn a task applying subtree events to `cache` in delivery order.
    pub fn spawn(cache: Weak<ServiceCache>, mut events: mpsc::UnboundedReceiver<StoreEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                match event {
                    StoreEvent::Node(event) => {
                        debug!(
                            "service stat change: {:?} | path: {}",
                            event.kind, event.path
                        );
                        cache.apply_event(&event);
                    }
                    StoreEvent::ConnectionStateChanged(ConnectionState::Lost) => {
                        debug!(
                            "Session lost, {} stops following changes",
                            cache.service_name()
                        );
                        break;
                    }
                    StoreEvent::ConnectionStateChanged(state) => {
                        debug!("Service cache {} sees connection {}", cache.service_name(), state);
                    }
                }
            }
        })
    }
}
