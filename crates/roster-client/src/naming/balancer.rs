//! Load balancer for service discovery
//!
//! Provides uniform random selection from a service's live instances.

use rand::seq::IndexedRandom;
use roster_api::InstanceRecord;
use tracing::debug;

use crate::error::{ClientError, Result};

/// Uniform random load balancer
pub struct Balancer;

impl Balancer {
    /// Randomly select one instance, each with equal probability
    pub fn select_host(service_name: &str, instances: &[InstanceRecord]) -> Result<InstanceRecord> {
        match Self::random(instances) {
            Some(instance) => Ok(instance),
            None => {
                debug!("no host to serve for service: {}", service_name);
                Err(ClientError::NoInstancesAvailable(service_name.to_string()))
            }
        }
    }

    /// Pick one instance uniformly at random; `None` when empty
    pub fn random(instances: &[InstanceRecord]) -> Option<InstanceRecord> {
        instances.choose(&mut rand::rng()).cloned()
    }

    /// Find an instance by its record id
    pub fn select_by_id(instances: &[InstanceRecord], id: &str) -> Option<InstanceRecord> {
        instances.iter().find(|i| i.id() == id).cloned()
    }
}
