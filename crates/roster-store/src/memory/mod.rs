//! In-process coordination store
//!
//! `MemoryStore` keeps a tree of nodes, the sessions that own ephemeral
//! nodes, and the subtree watches registered by those sessions. Every
//! mutation and its watch notifications happen under one tree lock, so
//! watchers observe changes to a path in the order they were applied.
//!
//! Fault injection (`suspend_session`, `resume_session`, `expire_session`,
//! `set_available`) drives the connection-state transitions clients must
//! survive. A suspended session expires on its own once its session timeout
//! elapses without a resume.

mod connection;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use roster_api::path;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::connection::{StoreConnection, StoreConnector, SubtreeWatch, WatchId};
use crate::error::{Result, StoreError};
use crate::event::{ConnectionState, CreateMode, NodeEvent, StoreEvent};

pub use connection::MemoryConnection;

/// Capacity of each session's state channel
const STATE_CHANNEL_CAPACITY: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SessionStatus {
    Active,
    Suspended,
    Expired,
    Closed,
}

struct Node {
    data: Vec<u8>,
    /// Owning session for ephemeral nodes
    owner: Option<u64>,
    version: u64,
}

struct WatchEntry {
    id: WatchId,
    session_id: u64,
    path: String,
    tx: mpsc::UnboundedSender<StoreEvent>,
}

impl WatchEntry {
    fn covers(&self, node_path: &str) -> bool {
        if self.path == "/" || node_path == self.path {
            return true;
        }
        node_path.starts_with(&self.path) && node_path.as_bytes().get(self.path.len()) == Some(&b'/')
    }
}

struct Tree {
    nodes: BTreeMap<String, Node>,
    watches: Vec<WatchEntry>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                owner: None,
                version: 0,
            },
        );
        Self {
            nodes,
            watches: Vec::new(),
        }
    }

    fn emit(&mut self, event: NodeEvent) {
        self.watches.retain(|w| !w.tx.is_closed());
        for watch in self.watches.iter().filter(|w| w.covers(&event.path)) {
            let _ = watch.tx.send(StoreEvent::Node(event.clone()));
        }
    }

    /// Deliver a state change to the watches owned by `session_id`.
    fn notify_session(&self, session_id: u64, state: ConnectionState) {
        for watch in self.watches.iter().filter(|w| w.session_id == session_id) {
            let _ = watch.tx.send(StoreEvent::ConnectionStateChanged(state));
        }
    }

    fn child_prefix(node_path: &str) -> String {
        if node_path == "/" {
            "/".to_string()
        } else {
            format!("{}/", node_path)
        }
    }

    fn children(&self, node_path: &str) -> Vec<String> {
        let prefix = Self::child_prefix(node_path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn has_children(&self, node_path: &str) -> bool {
        let prefix = Self::child_prefix(node_path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .any(|(k, _)| k.len() > prefix.len())
    }

    fn insert(&mut self, node_path: &str, data: Vec<u8>, owner: Option<u64>) -> Result<String> {
        if self.nodes.contains_key(node_path) {
            return Err(StoreError::NodeExists(node_path.to_string()));
        }

        let mut missing = Vec::new();
        let mut current = path::parent(node_path);
        while let Some(p) = current {
            if self.nodes.contains_key(p) {
                break;
            }
            missing.push(p.to_string());
            current = path::parent(p);
        }

        for parent in missing.into_iter().rev() {
            self.nodes.insert(
                parent.clone(),
                Node {
                    data: Vec::new(),
                    owner: None,
                    version: 0,
                },
            );
            self.emit(NodeEvent::created(parent, Vec::new()));
        }

        self.nodes.insert(
            node_path.to_string(),
            Node {
                data: data.clone(),
                owner,
                version: 0,
            },
        );
        self.emit(NodeEvent::created(node_path, data));

        Ok(path::node_name(node_path).to_string())
    }

    /// Remove every ephemeral node owned by `session_id`, deepest first.
    fn release_ephemerals(&mut self, session_id: u64) -> usize {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.owner == Some(session_id))
            .map(|(k, _)| k.clone())
            .collect();

        for node_path in owned.iter().rev() {
            self.nodes.remove(node_path);
            self.emit(NodeEvent::deleted(node_path.clone()));
        }
        owned.len()
    }
}

struct Session {
    status: SessionStatus,
    timeout: Duration,
    /// Bumped on every suspend/resume so stale expiry timers do nothing
    epoch: u64,
    states: broadcast::Sender<ConnectionState>,
}

struct Inner {
    tree: RwLock<Tree>,
    sessions: DashMap<u64, Session>,
    next_session_id: AtomicU64,
    next_watch_id: AtomicU64,
    available: AtomicBool,
}

/// Shared in-process coordination store.
///
/// Cloning is cheap; clones share the same tree and sessions.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tree: RwLock::new(Tree::new()),
                sessions: DashMap::new(),
                next_session_id: AtomicU64::new(1),
                next_watch_id: AtomicU64::new(1),
                available: AtomicBool::new(true),
            }),
        }
    }

    // ========================================================================
    // Fault injection
    // ========================================================================

    /// Make new sessions fail (`false`) or succeed (`true`).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        info!("Memory store availability set to {}", available);
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Put an active session into the suspended state.
    ///
    /// The session expires after its timeout unless resumed first.
    pub fn suspend_session(&self, session_id: u64) -> bool {
        let (epoch, timeout, states) = {
            let Some(mut session) = self.inner.sessions.get_mut(&session_id) else {
                return false;
            };
            if session.status != SessionStatus::Active {
                return false;
            }
            session.status = SessionStatus::Suspended;
            session.epoch += 1;
            (session.epoch, session.timeout, session.states.clone())
        };

        warn!("Session {} suspended", session_id);
        let _ = states.send(ConnectionState::Suspended);
        self.inner
            .tree
            .read()
            .notify_session(session_id, ConnectionState::Suspended);

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(&self.inner);
            handle.spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    MemoryStore { inner }.end_session(session_id, true, Some(epoch));
                }
            });
        }
        true
    }

    /// Bring a suspended session back.
    pub fn resume_session(&self, session_id: u64) -> bool {
        let states = {
            let Some(mut session) = self.inner.sessions.get_mut(&session_id) else {
                return false;
            };
            if session.status != SessionStatus::Suspended {
                return false;
            }
            session.status = SessionStatus::Active;
            session.epoch += 1;
            session.states.clone()
        };

        info!("Session {} reconnected", session_id);
        let _ = states.send(ConnectionState::Reconnected);
        self.inner
            .tree
            .read()
            .notify_session(session_id, ConnectionState::Reconnected);
        true
    }

    /// Destroy a session as the store would on session timeout.
    ///
    /// Its ephemeral nodes are deleted and its subscribers see `Lost`.
    pub fn expire_session(&self, session_id: u64) -> bool {
        self.end_session(session_id, true, None)
    }

    // ========================================================================
    // Inspection and administration
    // ========================================================================

    pub fn session_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.sessions.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn watch_count(&self) -> usize {
        let mut tree = self.inner.tree.write();
        tree.watches.retain(|w| !w.tx.is_closed());
        tree.watches.len()
    }

    /// Number of nodes, excluding the root.
    pub fn node_count(&self) -> usize {
        self.inner.tree.read().nodes.len() - 1
    }

    pub fn node_exists(&self, node_path: &str) -> bool {
        self.inner.tree.read().nodes.contains_key(node_path)
    }

    pub fn node_data(&self, node_path: &str) -> Option<Vec<u8>> {
        self.inner
            .tree
            .read()
            .nodes
            .get(node_path)
            .map(|n| n.data.clone())
    }

    /// Version of a node, bumped on every data change.
    pub fn node_version(&self, node_path: &str) -> Option<u64> {
        self.inner.tree.read().nodes.get(node_path).map(|n| n.version)
    }

    pub fn children(&self, node_path: &str) -> Vec<String> {
        self.inner.tree.read().children(node_path)
    }

    /// Write a persistent node outside any session.
    pub fn put_persistent(&self, node_path: &str, data: Vec<u8>) -> Result<String> {
        path::validate(node_path)?;
        self.inner.tree.write().insert(node_path, data, None)
    }

    // ========================================================================
    // Session-scoped operations
    // ========================================================================

    pub(crate) fn open_session(&self, timeout: Duration) -> Result<u64> {
        if !self.is_available() {
            return Err(StoreError::Unavailable("memory store unreachable".to_string()));
        }

        let session_id = self.inner.next_session_id.fetch_add(1, Ordering::SeqCst);
        let (states, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        self.inner.sessions.insert(
            session_id,
            Session {
                status: SessionStatus::Active,
                timeout,
                epoch: 0,
                states,
            },
        );

        debug!("Opened session {}", session_id);
        Ok(session_id)
    }

    pub(crate) fn session_status(&self, session_id: u64) -> Option<SessionStatus> {
        self.inner.sessions.get(&session_id).map(|s| s.status)
    }

    pub(crate) fn check_session(&self, session_id: u64) -> Result<()> {
        match self.session_status(session_id) {
            Some(SessionStatus::Active) => Ok(()),
            Some(SessionStatus::Suspended) => Err(StoreError::Unavailable(format!(
                "session {} suspended",
                session_id
            ))),
            Some(SessionStatus::Closed) => Err(StoreError::Closed),
            Some(SessionStatus::Expired) | None => Err(StoreError::SessionExpired(session_id)),
        }
    }

    pub(crate) fn subscribe_states(&self, session_id: u64) -> broadcast::Receiver<ConnectionState> {
        match self.inner.sessions.get(&session_id) {
            Some(session) => session.states.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }

    pub(crate) fn close_session(&self, session_id: u64) {
        self.end_session(session_id, false, None);
    }

    fn end_session(&self, session_id: u64, lost: bool, expected_epoch: Option<u64>) -> bool {
        let states = {
            let Some(mut session) = self.inner.sessions.get_mut(&session_id) else {
                return false;
            };
            if matches!(session.status, SessionStatus::Expired | SessionStatus::Closed) {
                return false;
            }
            if let Some(epoch) = expected_epoch
                && (session.status != SessionStatus::Suspended || session.epoch != epoch)
            {
                return false;
            }
            session.status = if lost {
                SessionStatus::Expired
            } else {
                SessionStatus::Closed
            };
            session.states.clone()
        };

        let released = {
            let mut tree = self.inner.tree.write();
            if lost {
                tree.notify_session(session_id, ConnectionState::Lost);
            }
            tree.watches.retain(|w| w.session_id != session_id);
            tree.release_ephemerals(session_id)
        };

        if lost {
            warn!(
                "Session {} expired, released {} ephemeral nodes",
                session_id, released
            );
            let _ = states.send(ConnectionState::Lost);
        } else {
            debug!(
                "Session {} closed, released {} ephemeral nodes",
                session_id, released
            );
        }
        drop(states);
        self.inner.sessions.remove(&session_id);
        true
    }

    pub(crate) fn create(
        &self,
        session_id: u64,
        node_path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String> {
        path::validate(node_path)?;
        let mut tree = self.inner.tree.write();
        // Checked under the tree lock so an expiring session cannot leave
        // an orphaned ephemeral node behind.
        self.check_session(session_id)?;
        let owner = match mode {
            CreateMode::Ephemeral => Some(session_id),
            CreateMode::Persistent => None,
        };
        tree.insert(node_path, data, owner)
    }

    pub(crate) fn delete(&self, node_path: &str) -> Result<()> {
        path::validate(node_path)?;
        let mut tree = self.inner.tree.write();
        if node_path == "/" || tree.has_children(node_path) {
            return Err(StoreError::NotEmpty(node_path.to_string()));
        }
        if tree.nodes.remove(node_path).is_some() {
            tree.emit(NodeEvent::deleted(node_path));
        }
        Ok(())
    }

    pub(crate) fn set(&self, node_path: &str, data: Vec<u8>) -> Result<()> {
        path::validate(node_path)?;
        let mut tree = self.inner.tree.write();
        let node = tree
            .nodes
            .get_mut(node_path)
            .ok_or_else(|| StoreError::NodeNotFound(node_path.to_string()))?;
        node.data = data.clone();
        node.version += 1;
        tree.emit(NodeEvent::updated(node_path, data));
        Ok(())
    }

    pub(crate) fn get(&self, node_path: &str) -> Result<Vec<u8>> {
        path::validate(node_path)?;
        self.node_data(node_path)
            .ok_or_else(|| StoreError::NodeNotFound(node_path.to_string()))
    }

    pub(crate) fn list(&self, node_path: &str) -> Result<Vec<String>> {
        path::validate(node_path)?;
        let tree = self.inner.tree.read();
        if !tree.nodes.contains_key(node_path) {
            return Err(StoreError::NodeNotFound(node_path.to_string()));
        }
        Ok(tree.children(node_path))
    }

    pub(crate) fn watch(&self, session_id: u64, node_path: &str) -> Result<SubtreeWatch> {
        path::validate(node_path)?;
        let mut tree = self.inner.tree.write();
        self.check_session(session_id)?;

        let id = WatchId(self.inner.next_watch_id.fetch_add(1, Ordering::SeqCst));
        let (tx, events) = mpsc::unbounded_channel();
        tree.watches.push(WatchEntry {
            id,
            session_id,
            path: node_path.to_string(),
            tx,
        });

        debug!("Session {} watching {} ({:?})", session_id, node_path, id);
        Ok(SubtreeWatch { id, events })
    }

    pub(crate) fn unwatch(&self, id: WatchId) {
        self.inner.tree.write().watches.retain(|w| w.id != id);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Connector that opens sessions on a [`MemoryStore`].
pub struct MemoryConnector {
    store: MemoryStore,
    config: StoreConfig,
    connects: AtomicU64,
}

impl MemoryConnector {
    /// Create a connector; malformed configuration is rejected here.
    pub fn new(store: MemoryStore, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            connects: AtomicU64::new(0),
        })
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Number of sessions successfully opened by this connector.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn StoreConnection>> {
        let policy = self.config.retry_policy();
        let timeout = self.config.session_timeout();

        let session_id = policy
            .retry("connect", || async { self.store.open_session(timeout) })
            .await
            .map_err(|e| match e {
                StoreError::Unavailable(reason) => StoreError::Unavailable(format!(
                    "{} after {} attempts: {}",
                    self.config.connect_string(),
                    policy.max_retries() + 1,
                    reason
                )),
                other => other,
            })?;

        self.connects.fetch_add(1, Ordering::SeqCst);
        info!(
            "Connected to {}, session_id={}",
            self.describe(),
            session_id
        );

        Ok(Arc::new(MemoryConnection::new(
            self.store.clone(),
            session_id,
            policy,
        )))
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.config.connect_string())
    }
}
