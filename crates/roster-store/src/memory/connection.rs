//! Session handle on a memory store

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use super::{MemoryStore, SessionStatus};
use crate::config::RetryPolicy;
use crate::connection::{StoreConnection, SubtreeWatch, WatchId};
use crate::error::{Result, StoreError};
use crate::event::{ConnectionState, CreateMode};

/// A session on a [`MemoryStore`].
///
/// Operations issued while the session is suspended are retried under the
/// connector's retry policy. Dropping the handle closes the session.
pub struct MemoryConnection {
    store: MemoryStore,
    session_id: u64,
    retry: RetryPolicy,
    closed: AtomicBool,
}

impl MemoryConnection {
    pub(crate) fn new(store: MemoryStore, session_id: u64, retry: RetryPolicy) -> Self {
        Self {
            store,
            session_id,
            retry,
            closed: AtomicBool::new(false),
        }
    }

    async fn ready(&self, operation: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        self.retry
            .retry(operation, || async { self.store.check_session(self.session_id) })
            .await
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Closing session {}", self.session_id);
            self.store.close_session(self.session_id);
        }
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    fn session_id(&self) -> u64 {
        self.session_id
    }

    fn state(&self) -> ConnectionState {
        match self.store.session_status(self.session_id) {
            Some(SessionStatus::Active) => ConnectionState::Connected,
            Some(SessionStatus::Suspended) => ConnectionState::Suspended,
            _ => ConnectionState::Lost,
        }
    }

    async fn create_node(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        self.ready("create").await?;
        self.store.create(self.session_id, path, data, mode)
    }

    async fn delete_node(&self, path: &str) -> Result<()> {
        self.ready("delete").await?;
        self.store.delete(path)
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.ready("setData").await?;
        self.store.set(path, data)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.ready("exists").await?;
        roster_api::path::validate(path)?;
        Ok(self.store.node_exists(path))
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>> {
        self.ready("getChildren").await?;
        self.store.list(path)
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        self.ready("getData").await?;
        self.store.get(path)
    }

    async fn watch_subtree(&self, path: &str) -> Result<SubtreeWatch> {
        self.ready("watch").await?;
        self.store.watch(self.session_id, path)
    }

    fn unwatch(&self, id: WatchId) {
        self.store.unwatch(id);
    }

    fn connection_states(&self) -> broadcast::Receiver<ConnectionState> {
        self.store.subscribe_states(self.session_id)
    }

    async fn close(&self) {
        self.shutdown();
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}
