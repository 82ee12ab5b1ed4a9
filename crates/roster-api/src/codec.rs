//! JSON codec for instance records
//!
//! Records are stored as JSON objects:
//!
//! ```text
//! {
//!     "name": "logmerge",
//!     "id": "1f379a40-6cae-4465-918e-81957274afa3",
//!     "address": "10.37.129.2", "port": 8090, "sslPort": null,
//!     "payload": "logmerge service",
//!     "registrationTimeUTC": 1343317256032, "serviceType": "PERMANENT"
//! }
//! ```

use crate::model::InstanceRecord;

/// Error raised when a node's bytes are not a valid instance record
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode instance record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("malformed instance record: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Serialize a record for storage in the coordination tree.
pub fn encode(record: &InstanceRecord) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(record).map_err(CodecError::Encode)
}

/// Deserialize a record read from the coordination tree.
pub fn decode(bytes: &[u8]) -> Result<InstanceRecord, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Decode)
}
