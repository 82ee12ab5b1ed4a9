//! Roster Client - service discovery over a coordination store
//!
//! This crate provides:
//! - `DiscoveryClient`: resolves a service name to one (random) or all live
//!   instances from a locally cached view
//! - `ServiceCache` / `CacheRegistry`: per-service mirrors kept coherent by
//!   subtree watch notifications
//! - `ConnectionWatcher` / `DataWatcher`: the reconnect state machine and
//!   change delivery
//! - `RegistrationService`: server-side registration with redo on reconnect
//! - Configuration loading, logging bootstrap and metrics

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod naming;
pub mod redo;
pub mod registration;

pub use config::DiscoveryConfig;
pub use error::{ClientError, Result};
pub use metrics::DiscoveryMetrics;
pub use naming::{
    CacheRegistry, ClientState, DiscoveryClient, ServiceCache,
    balancer::Balancer,
    listener::{EventListener, FnEventListener, NamingEvent},
    service_cache::CacheState,
};
pub use redo::RedoService;
pub use registration::RegistrationService;

pub use roster_api::{InstanceRecord, ServiceType};
