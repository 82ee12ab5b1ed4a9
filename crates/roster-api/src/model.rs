//! Service instance model stored under `base/service/instance` nodes.

use std::fmt;

use if_addrs::IfAddr;
use serde::{Deserialize, Serialize};

use crate::LOOPBACK_ADDRESS;

/// Lifetime of a registration in the coordination store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    /// Survives the loss of the registering session
    Permanent,
    /// Ephemeral node, removed when the registering session ends
    #[default]
    Dynamic,
}

impl ServiceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::Permanent => "PERMANENT",
            ServiceType::Dynamic => "DYNAMIC",
        }
    }

    /// Whether nodes of this type are bound to the owning session
    pub fn is_ephemeral(self) -> bool {
        matches!(self, ServiceType::Dynamic)
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registered instance of a named service.
///
/// Records are immutable; an update is modeled as delete-then-recreate at
/// the same `id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    name: String,
    id: String,
    address: String,
    port: u16,
    #[serde(default)]
    ssl_port: Option<u16>,
    #[serde(default)]
    payload: String,
    #[serde(rename = "registrationTimeUTC")]
    registration_time_utc: i64,
    #[serde(default)]
    service_type: ServiceType,
}

impl InstanceRecord {
    /// Start building a record for `name`.
    pub fn builder(name: impl Into<String>) -> InstanceRecordBuilder {
        InstanceRecordBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node name of this instance under its service node
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ssl_port(&self) -> Option<u16> {
        self.ssl_port
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Registration time in epoch milliseconds
    pub fn registration_time_utc(&self) -> i64 {
        self.registration_time_utc
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    /// Whether this record is identified by `(name, address, port)`.
    ///
    /// This triple is what duplicate-registration checks compare.
    pub fn matches(&self, name: &str, address: &str, port: u16) -> bool {
        self.name == name && self.address == address && self.port == port
    }

    /// Copy of this record with a different payload, keeping id and type.
    pub fn with_payload(&self, payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            ..self.clone()
        }
    }
}

impl fmt::Display for InstanceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]@{}:{} ({})",
            self.name, self.id, self.address, self.port, self.service_type
        )
    }
}

/// Builder for [`InstanceRecord`].
#[derive(Clone, Debug)]
pub struct InstanceRecordBuilder {
    name: String,
    id: Option<String>,
    address: Option<String>,
    port: u16,
    ssl_port: Option<u16>,
    payload: String,
    registration_time_utc: Option<i64>,
    service_type: ServiceType,
}

impl InstanceRecordBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            address: None,
            port: 0,
            ssl_port: None,
            payload: String::new(),
            registration_time_utc: None,
            service_type: ServiceType::default(),
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn ssl_port(mut self, ssl_port: u16) -> Self {
        self.ssl_port = Some(ssl_port);
        self
    }

    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn registration_time_utc(mut self, millis: i64) -> Self {
        self.registration_time_utc = Some(millis);
        self
    }

    pub fn service_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = service_type;
        self
    }

    /// Build the record, filling in a random id, the local address and the
    /// current time where they were not set.
    pub fn build(self) -> InstanceRecord {
        InstanceRecord {
            name: self.name,
            id: self
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            address: self.address.unwrap_or_else(local_ip),
            port: self.port,
            ssl_port: self.ssl_port,
            payload: self.payload,
            registration_time_utc: self
                .registration_time_utc
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
            service_type: self.service_type,
        }
    }
}

/// First non-loopback IPv4 address of this host.
pub fn local_ip() -> String {
    if_addrs::get_if_addrs()
        .ok()
        .and_then(|addrs| {
            addrs
                .into_iter()
                .find(|iface| !iface.is_loopback() && matches!(iface.addr, IfAddr::V4(_)))
                .and_then(|iface| match iface.addr {
                    IfAddr::V4(addr) => Some(addr.ip.to_string()),
                    _ => None,
                })
        })
        .unwrap_or_else(|| LOOPBACK_ADDRESS.to_string())
}
