//! nswarden core types: watched namespace objects, cache events, and the
//! remote service contract the informer machinery is built on.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Label/annotation attribute maps. BTreeMap keeps iteration deterministic,
/// which matters for comparing observed vs desired state.
pub type Attrs = BTreeMap<String, String>;

/// Versioned snapshot of a cluster-scoped namespace object. Identity is the
/// name alone; `resource_version` is the opaque token used to resume a watch
/// and for optimistic concurrency on updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NsObject {
    pub name: String,
    pub resource_version: String,
    #[serde(default)]
    pub labels: Attrs,
    #[serde(default)]
    pub annotations: Attrs,
}

impl NsObject {
    pub fn new(name: impl Into<String>, resource_version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_version: resource_version.into(),
            labels: Attrs::new(),
            annotations: Attrs::new(),
        }
    }
}

/// Cache event delivered to registered handlers. `Updated` carries both
/// snapshots so handlers can diff without re-querying the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Added(NsObject),
    Updated { old: NsObject, new: NsObject },
    Deleted(NsObject),
}

impl Event {
    /// Identity of the object this event concerns.
    pub fn name(&self) -> &str {
        match self {
            Event::Added(o) | Event::Deleted(o) => &o.name,
            Event::Updated { new, .. } => &new.name,
        }
    }
}

/// Raw event as delivered by the remote watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(NsObject),
    Modified(NsObject),
    Deleted(NsObject),
}

/// Errors surfaced by the remote service, suitable for driving the
/// list/watch state machine.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The watch watermark is too old; the caller must re-list.
    #[error("resource version expired: {0}")]
    Expired(String),
    /// Optimistic-concurrency rejection on update.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn is_expired(&self) -> bool {
        matches!(self, ClientError::Expired(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict(_))
    }
}

/// Stream of watch events; transport/decode failures arrive in-band.
pub type WatchEventStream = BoxStream<'static, Result<WatchEvent, ClientError>>;

/// Black-box remote service offering list/watch/update over namespace
/// objects. Production wiring lives in nswarden-kubehub; tests script fakes.
#[async_trait::async_trait]
pub trait NamespaceClient: Send + Sync {
    /// Full snapshot of all objects plus the collection resource version.
    async fn list(&self) -> Result<(Vec<NsObject>, String), ClientError>;

    /// Open a watch starting after `resource_version`.
    async fn watch(&self, resource_version: &str) -> Result<WatchEventStream, ClientError>;

    /// Corrective update carrying the observed resource version; the remote
    /// rejects with `Conflict` when that version is stale.
    async fn update(&self, desired: &NsObject) -> Result<NsObject, ClientError>;
}

/// Callback capability registered with the event dispatcher.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_add(&self, obj: &NsObject) -> anyhow::Result<()>;

    async fn on_update(&self, old: &NsObject, new: &NsObject) -> anyhow::Result<()>;

    /// Deletion is a no-op for most namespace policies.
    async fn on_delete(&self, _obj: &NsObject) -> anyhow::Result<()> {
        Ok(())
    }
}
