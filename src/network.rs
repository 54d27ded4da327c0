//! Read-mostly mapping from network namespace name to the tap/address descriptor
//! provisioned for it by an outer system.
//!
//! Tap devices and namespaces are assumed pre-created (§1 Non-goals); this module
//! only reads the namespace → descriptor mapping it is handed at construction.

use std::collections::HashMap;

use crate::error::ControllerError;

/// A single pre-provisioned network binding. Added by the front-end, never mutated,
/// shared by value when embedded into a VM configuration.
#[derive(Debug, Clone)]
pub struct NetworkBinding {
    pub namespace: String,
    pub host_dev_name: String,
    pub iface_id: String,
    pub guest_mac: String,
    pub guest_addr: std::net::IpAddr,
    pub unique_addr: std::net::IpAddr,
}

/// Read-mostly registry of network bindings, keyed by namespace name.
#[derive(Debug, Default)]
pub struct NetworkRegistry {
    bindings: HashMap<String, NetworkBinding>,
}

impl NetworkRegistry {
    pub fn new(bindings: impl IntoIterator<Item = NetworkBinding>) -> Self {
        Self {
            bindings: bindings.into_iter().map(|b| (b.namespace.clone(), b)).collect(),
        }
    }

    pub fn get(&self, namespace: &str) -> Result<&NetworkBinding, ControllerError> {
        self.bindings
            .get(namespace)
            .ok_or_else(|| ControllerError::not_found("namespace", namespace))
    }
}
