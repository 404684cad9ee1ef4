//! Steward core types: watched resources, watch notifications and the
//! transport seams the reconciliation engine consumes.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use smallvec::SmallVec;

mod client;
mod version;

pub use client::{ClientError, EventSink, NotificationStream, ResourceClient, ResourceList};
pub use version::VersionOrdering;

pub mod prelude {
    pub use super::{
        ClientError, EventRecord, EventSink, EventType, FinalizerToken, Notification, NotificationStream,
        ResourceClient, ResourceError, ResourceList, ResourceType, StatusPatch, VersionOrdering, WatchedResource,
    };
}

/// The watched collection: `(group, version, plural)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceType {
    pub group: String,
    pub version: String,
    pub plural: String,
}

impl ResourceType {
    pub fn new(group: impl Into<String>, version: impl Into<String>, plural: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), plural: plural.into() }
    }

    /// Parse `group/version/plural`, or `version/plural` for the core group.
    pub fn parse(key: &str) -> Result<Self, ResourceError> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, plural] if !version.is_empty() && !plural.is_empty() => Ok(Self::new("", *version, *plural)),
            [group, version, plural] if !version.is_empty() && !plural.is_empty() => Ok(Self::new(*group, *version, *plural)),
            _ => Err(ResourceError::InvalidTypeKey(key.to_string())),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// Token this controller places on objects it has unfinished interest in.
    pub fn finalizer_token(&self) -> FinalizerToken {
        FinalizerToken(format!("{}.{}.{}", self.plural, self.version, self.group))
    }

    /// File stem of the persisted version cache for this type.
    pub fn cache_stem(&self) -> String {
        format!("{}_{}_{}", self.group, self.version, self.plural)
    }

    /// Default controller name, also used as event component.
    pub fn controller_name(&self) -> String {
        if self.group.is_empty() { self.plural.clone() } else { format!("{}.{}", self.plural, self.group) }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.controller_name(), self.version)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FinalizerToken(String);

impl FinalizerToken {
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for FinalizerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Malformed objects or type keys.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("object missing metadata.{0}")]
    MissingField(&'static str),
    #[error("invalid resource type key: {0} (expect group/version/plural or version/plural)")]
    InvalidTypeKey(String),
}

/// Snapshot of one object as the store last reported it.
///
/// Only the metadata the engine acts on is lifted into typed fields; `spec`
/// and `status` stay inside `raw` and are never interpreted here.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchedResource {
    pub uid: String,
    pub name: String,
    pub namespace: Option<String>,
    pub resource_version: String,
    pub deletion_timestamp: Option<String>,
    pub finalizers: SmallVec<[String; 2]>,
    pub raw: Json,
}

impl WatchedResource {
    pub fn from_raw(raw: Json) -> Result<Self, ResourceError> {
        let meta = raw.get("metadata").ok_or(ResourceError::MissingField("uid"))?;
        let text = |k: &str| meta.get(k).and_then(|v| v.as_str()).map(|s| s.to_string());
        let uid = text("uid").ok_or(ResourceError::MissingField("uid"))?;
        let name = text("name").ok_or(ResourceError::MissingField("name"))?;
        let resource_version = text("resourceVersion").ok_or(ResourceError::MissingField("resourceVersion"))?;
        let finalizers = meta
            .get("finalizers")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|f| f.as_str().map(|s| s.to_string())).collect())
            .unwrap_or_default();
        Ok(Self {
            uid,
            name,
            namespace: text("namespace"),
            resource_version,
            deletion_timestamp: text("deletionTimestamp"),
            finalizers,
            raw,
        })
    }

    pub fn spec(&self) -> Option<&Json> { self.raw.get("spec") }
    pub fn status(&self) -> Option<&Json> { self.raw.get("status") }
    pub fn kind(&self) -> Option<&str> { self.raw.get("kind").and_then(|v| v.as_str()) }
    pub fn api_version(&self) -> Option<&str> { self.raw.get("apiVersion").and_then(|v| v.as_str()) }

    pub fn is_deleting(&self) -> bool { self.deletion_timestamp.is_some() }

    pub fn has_finalizer(&self, token: &FinalizerToken) -> bool {
        self.finalizers.iter().any(|f| f == token.as_str())
    }

    /// `name@namespace`, or `name@cluster` for cluster-scoped objects.
    pub fn key(&self) -> String {
        format!("{}@{}", self.name, self.namespace.as_deref().unwrap_or("cluster"))
    }
}

/// One item of the watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Added(WatchedResource),
    Modified(WatchedResource),
    Deleted(WatchedResource),
    /// Progress marker: advances the resume point, carries no object.
    Bookmark { resource_version: String },
    /// A notification type the engine does not know.
    Other { kind: String },
}

impl Notification {
    pub fn kind_str(&self) -> &str {
        match self {
            Notification::Added(_) => "ADDED",
            Notification::Modified(_) => "MODIFIED",
            Notification::Deleted(_) => "DELETED",
            Notification::Bookmark { .. } => "BOOKMARK",
            Notification::Other { kind } => kind.as_str(),
        }
    }

    /// Version this notification lets a later watch resume from.
    pub fn resume_version(&self) -> Option<&str> {
        match self {
            Notification::Added(r) | Notification::Modified(r) | Notification::Deleted(r) => Some(&r.resource_version),
            Notification::Bookmark { resource_version } => Some(resource_version),
            Notification::Other { .. } => None,
        }
    }
}

/// Status payload returned by a handler; merged into the `/status` subresource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusPatch(pub Json);

impl StatusPatch {
    /// Merge-patch body: `{"status": <payload>}`.
    pub fn body(&self) -> Json { serde_json::json!({ "status": self.0 }) }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum EventType {
    #[default]
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self { EventType::Normal => "Normal", EventType::Warning => "Warning" }
    }
}

/// An event to record against a resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub message: String,
    pub reason: String,
    pub type_: EventType,
    /// Reporting component; the sink's controller name when unset.
    pub component: Option<String>,
}

impl EventRecord {
    pub fn normal(message: impl Into<String>) -> Self {
        Self { message: message.into(), reason: "Upsert".into(), type_: EventType::Normal, component: None }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self { type_: EventType::Warning, ..Self::normal(message) }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self { self.reason = reason.into(); self }
    pub fn component(mut self, component: impl Into<String>) -> Self { self.component = Some(component.into()); self }
}
