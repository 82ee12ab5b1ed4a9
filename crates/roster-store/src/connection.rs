//! Store connection contract
//!
//! A `StoreConnection` is one session with the coordination store. A
//! `StoreConnector` builds new sessions from injected configuration; clients
//! hold a connector so they can rebuild after a session is lost.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::error::{Result, StoreError};
use crate::event::{ConnectionState, CreateMode, StoreEvent};

/// Identifier of a subtree watch, used to cancel it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// An active subtree watch.
///
/// Node events for one path arrive in the order the store applied them.
/// State changes of the owning session are delivered on the same channel;
/// a lost session sends `Lost` before the channel closes. The channel
/// closes when the watch is cancelled or its session ends.
#[derive(Debug)]
pub struct SubtreeWatch {
    pub id: WatchId,
    pub events: mpsc::UnboundedReceiver<StoreEvent>,
}

/// One session with the coordination store.
#[async_trait]
pub trait StoreConnection: Send + Sync + 'static {
    /// Identifier of the underlying session.
    fn session_id(&self) -> u64;

    /// Current session state.
    fn state(&self) -> ConnectionState;

    /// Create a node, creating missing parents as persistent nodes.
    ///
    /// Returns the node name. Fails with `Unavailable` unless connected.
    async fn create_node(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String>;

    /// Delete a node. Deleting an absent node is not an error.
    async fn delete_node(&self, path: &str) -> Result<()>;

    /// Replace the data of an existing node.
    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Sorted child names of `path`; `NodeNotFound` if `path` is absent.
    async fn list_children(&self, path: &str) -> Result<Vec<String>>;

    async fn get_data(&self, path: &str) -> Result<Vec<u8>>;

    /// Watch `path` and all of its descendants until cancelled.
    async fn watch_subtree(&self, path: &str) -> Result<SubtreeWatch>;

    /// Cancel a watch. Unknown ids are ignored.
    fn unwatch(&self, id: WatchId);

    /// Subscribe to session state transitions.
    ///
    /// The channel closes when the session is closed or lost.
    fn connection_states(&self) -> broadcast::Receiver<ConnectionState>;

    /// End the session, releasing its ephemeral nodes and watches.
    async fn close(&self);
}

/// Builds new store sessions.
#[async_trait]
pub trait StoreConnector: Send + Sync + 'static {
    /// Establish a new session, retrying under the configured policy.
    ///
    /// Fails with `Unavailable` once retries are exhausted.
    async fn connect(&self) -> Result<Arc<dyn StoreConnection>>;

    /// Human readable description of the target, for logs.
    fn describe(&self) -> String;
}

/// Run `f` on a one-off session that is closed on every exit path.
pub async fn with_session<T, E, F, Fut>(connector: &dyn StoreConnector, f: F) -> std::result::Result<T, E>
where
    F: FnOnce(Arc<dyn StoreConnection>) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: From<StoreError>,
{
    let connection = connector.connect().await?;
    let result = f(connection.clone()).await;
    connection.close().await;
    result
}
