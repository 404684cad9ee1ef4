//! Transport seams: the resource store and the event helper.

use futures::stream::BoxStream;

use crate::{EventRecord, Notification, ResourceType, StatusPatch, WatchedResource};

/// Watch stream handed out by a [`ResourceClient`]. A stream-level error ends the session.
pub type NotificationStream = BoxStream<'static, Result<Notification, ClientError>>;

/// Result of a list call: the objects and the collection version to watch from.
#[derive(Debug, Clone, Default)]
pub struct ResourceList {
    pub items: Vec<WatchedResource>,
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    /// The requested resume version is too old; relist and start over.
    #[error("resource version expired")]
    Gone,
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn is_gone(&self) -> bool {
        matches!(self, ClientError::Gone | ClientError::Api { code: 410, .. })
    }

    pub fn is_conflict(&self) -> bool { matches!(self, ClientError::Api { code: 409, .. }) }

    pub fn is_not_found(&self) -> bool { matches!(self, ClientError::Api { code: 404, .. }) }
}

/// List/watch/patch access to the remote store.
///
/// Patches are merge-patches: absent fields are left untouched. Implementations are
/// driven from a single loop and need not support concurrent callers.
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    async fn list(&self, ty: &ResourceType, namespace: Option<&str>) -> Result<ResourceList, ClientError>;

    /// Open a watch. `resource_version` is the resume point; `None` lets the store choose.
    async fn watch(
        &self,
        ty: &ResourceType,
        namespace: Option<&str>,
        resource_version: Option<&str>,
    ) -> Result<NotificationStream, ClientError>;

    /// Merge `patch` into the object's `/status` subresource.
    async fn patch_status(
        &self,
        ty: &ResourceType,
        name: &str,
        namespace: Option<&str>,
        patch: &StatusPatch,
    ) -> Result<WatchedResource, ClientError>;

    /// Replace `metadata.finalizers`; an empty slice clears the list.
    async fn patch_metadata(
        &self,
        ty: &ResourceType,
        name: &str,
        namespace: Option<&str>,
        finalizers: &[String],
    ) -> Result<WatchedResource, ClientError>;
}

/// Best-effort event recording. Failures are logged by the implementation, never returned.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn add(&self, resource: &WatchedResource, event: EventRecord);

    /// Delete every event whose involved object is `resource`.
    async fn delete_all(&self, resource: &WatchedResource);
}
