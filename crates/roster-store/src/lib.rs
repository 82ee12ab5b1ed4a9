//! Roster Store - coordination store contract
//!
//! This crate provides:
//! - `StoreConnection` / `StoreConnector`: the operations service discovery
//!   needs from a ZooKeeper-like store (path CRUD, ephemeral nodes, subtree
//!   watches, connection-state notifications)
//! - `StoreConfig` and `RetryPolicy` for connection parameters
//! - `MemoryStore`: an in-process store with sessions, ephemeral ownership,
//!   subtree watches, session-timeout expiry and fault injection

pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod memory;

pub use config::{RetryPolicy, StoreConfig};
pub use connection::{StoreConnection, StoreConnector, SubtreeWatch, WatchId, with_session};
pub use error::{Result, StoreError};
pub use event::{ConnectionState, CreateMode, NodeEvent, NodeEventKind, StoreEvent};
pub use memory::{MemoryConnection, MemoryConnector, MemoryStore};
