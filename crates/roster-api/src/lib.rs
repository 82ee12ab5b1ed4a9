//! Roster API - shared model types for service discovery
//!
//! This crate provides:
//! - `InstanceRecord`: the value registered under a service node
//! - `ServiceType`: permanent vs. session-bound (dynamic) registrations
//! - The JSON codec used to store records in the coordination tree
//! - Path helpers for the `base/service/instance` tree layout

pub mod codec;
pub mod model;
pub mod path;

pub use codec::{CodecError, decode, encode};
pub use model::{InstanceRecord, InstanceRecordBuilder, ServiceType};

/// Default base path for service registrations
pub const DEFAULT_BASE_PATH: &str = "/services";

/// Address used when no non-loopback interface is found
pub const LOOPBACK_ADDRESS: &str = "127.0.0.1";
