//! The coordination service the cluster hangs off: lease-TTL locks, a flat
//! KV view of who holds what, and a service registry.
//!
//! Lock loss is a first-class event, surfaced on [`Locker::expirations`],
//! never an error return.

pub mod consul;
pub mod mem;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Worth retrying with backoff.
    #[error("transient coordination error: {0}")]
    Transient(String),

    /// Fatal, the credentials or ACLs are wrong.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Informational, the key or service does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl CoordinationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordinationError::Transient(_))
    }
}

/// One alive instance of a registered service.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ServiceEntry {
    pub id: String,
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ServiceEntry {
    /// Value of a `key=value` tag, if present.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        let prefix = format!("{key}=");
        self.tags
            .iter()
            .find_map(|tag| tag.strip_prefix(prefix.as_str()))
    }
}

#[derive(Clone, Debug)]
pub struct ServiceRegistration {
    pub id: String,
    pub name: String,
    pub address: String,
    pub tags: Vec<String>,
    /// URL the registry probes to decide liveness.
    pub check_url: String,
}

/// Client of the coordination service. One per process; the holder must
/// keep leases alive for as long as it lives, and a stopped client lets
/// everything it held lapse.
#[async_trait]
pub trait Locker: Send + Sync + 'static {
    /// Non-blocking acquisition attempt. True iff this process now holds
    /// `key` with `value` as the visible holder name.
    async fn lock(&self, key: &str, value: &str) -> Result<bool, CoordinationError>;

    /// Release if held; idempotent.
    async fn unlock(&self, key: &str) -> Result<(), CoordinationError>;

    /// Current holders under a prefix. Stale reads are fine, the dispatch
    /// loop reconverges.
    async fn list(&self, prefix: &str) -> Result<HashMap<String, String>, CoordinationError>;

    async fn get_services(
        &self,
        name: &str,
        tag_filters: &[String],
    ) -> Result<Vec<ServiceEntry>, CoordinationError>;

    async fn register(&self, service: ServiceRegistration) -> Result<(), CoordinationError>;

    async fn deregister(&self, id: &str) -> Result<(), CoordinationError>;

    /// Keys whose lease this process lost. Subscribe before acquiring.
    fn expirations(&self) -> broadcast::Receiver<String>;

    /// Change notifications for a key prefix. `None` means unsupported and
    /// the caller polls instead.
    async fn watch(&self, _prefix: &str) -> Option<tokio::sync::mpsc::Receiver<()>> {
        None
    }

    /// Release every lease and registration this process holds.
    async fn stop(&self);
}

pub type SharedLocker = Arc<dyn Locker>;

/// Registry of locker kinds, keyed by the `type` field of
/// `clustering.locker`.
#[async_trait]
#[typetag::serde(tag = "type")]
pub trait LockerConfig: Debug + Send + Sync {
    async fn build(&self) -> crate::Result<SharedLocker>;
}
