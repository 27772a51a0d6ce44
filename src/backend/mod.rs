//! Registry backend implementations

pub mod consul;
pub mod consulkv;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;

use crate::error::BackendError;
use crate::types::{ServiceId, ServiceRecord};

pub use consul::ConsulBackend;
pub use consulkv::ConsulKvBackend;

/// Capability the bridge needs from a service registry.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// Check that the registry is reachable and ready
    async fn ping(&self) -> Result<(), BackendError>;

    /// Create or replace a service entry
    async fn register(&self, record: &ServiceRecord) -> Result<(), BackendError>;

    /// Remove a service entry; removing an unknown identity succeeds
    async fn deregister(&self, id: &ServiceId) -> Result<(), BackendError>;

    /// Identities the registry holds that were generated on `host`
    async fn list_registered(&self, host: &str) -> Result<Vec<ServiceId>, BackendError>;
}

/// Builds the backend named by the URI scheme.
pub fn from_uri(uri: &str) -> Result<Arc<dyn RegistryBackend>, BackendError> {
    let url = Url::parse(uri).map_err(|e| BackendError::InvalidUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })?;
    if url.host_str().is_none() {
        return Err(BackendError::InvalidUri {
            uri: uri.to_string(),
            reason: "missing host".into(),
        });
    }

    match url.scheme() {
        "consul" => Ok(Arc::new(ConsulBackend::new(&url, false)?)),
        "consul-tls" => Ok(Arc::new(ConsulBackend::new(&url, true)?)),
        "consulkv" => Ok(Arc::new(ConsulKvBackend::new(&url)?)),
        other => Err(BackendError::UnsupportedScheme(other.to_string())),
    }
}

/// Keeps identities generated on `host`.
pub(crate) fn owned_by(ids: impl IntoIterator<Item = ServiceId>, host: &str) -> Vec<ServiceId> {
    ids.into_iter()
        .filter(|id| id.origin().is_some_and(|(h, _)| h == host))
        .collect()
}
