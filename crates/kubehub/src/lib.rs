//! Steward kubehub: `ResourceClient` and `EventSink` over kube-rs.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::Result;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, WatchEvent, WatchParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use steward_core::{
    ClientError, Notification, NotificationStream, ResourceClient, ResourceList, ResourceType, StatusPatch,
    WatchedResource,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

mod events;

pub use events::KubeEventSink;

/// Client from the local kubeconfig when present, in-cluster config otherwise.
pub async fn kube_client() -> Result<Client> {
    Ok(Client::try_default().await?)
}

/// Map kube errors onto the transport taxonomy the engine understands.
pub fn client_error(e: kube::Error) -> ClientError {
    match e {
        kube::Error::Api(ae) if ae.code == 410 => ClientError::Gone,
        kube::Error::Api(ae) => ClientError::Api { code: ae.code, message: ae.message },
        kube::Error::SerdeError(e) => ClientError::Decode(e.to_string()),
        other => ClientError::Transport(other.to_string()),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_resource(obj: &DynamicObject) -> Result<WatchedResource, ClientError> {
    let mut raw = serde_json::to_value(obj).map_err(|e| ClientError::Decode(e.to_string()))?;
    strip_managed_fields(&mut raw);
    WatchedResource::from_raw(raw).map_err(|e| ClientError::Decode(e.to_string()))
}

/// `ResourceClient` backed by the Kubernetes API, resolving each resource type via discovery once.
pub struct KubeResourceClient {
    client: Client,
    resolved: Mutex<HashMap<ResourceType, (ApiResource, bool)>>,
    watch_timeout_secs: u32,
}

impl KubeResourceClient {
    pub fn new(client: Client) -> Self {
        Self { client, resolved: Mutex::new(HashMap::new()), watch_timeout_secs: 290 }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(kube_client().await?))
    }

    /// Server-side watch timeout; the store closes the stream after it. Capped below 295s.
    pub fn with_watch_timeout(mut self, secs: u32) -> Self {
        self.watch_timeout_secs = secs.clamp(1, 294);
        self
    }

    /// Underlying kube client, for handlers that need more than the engine's verbs.
    pub fn client(&self) -> Client { self.client.clone() }

    async fn api_resource(&self, ty: &ResourceType) -> Result<(ApiResource, bool), ClientError> {
        let mut resolved = self.resolved.lock().await;
        if let Some(found) = resolved.get(ty) {
            return Ok(found.clone());
        }
        let found = find_api_resource(self.client.clone(), ty).await?;
        debug!(resource = %ty, namespaced = found.1, "resolved api resource");
        resolved.insert(ty.clone(), found.clone());
        Ok(found)
    }

    async fn api(&self, ty: &ResourceType, namespace: Option<&str>) -> Result<Api<DynamicObject>, ClientError> {
        let (ar, namespaced) = self.api_resource(ty).await?;
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }
}

async fn find_api_resource(client: Client, ty: &ResourceType) -> Result<(ApiResource, bool), ClientError> {
    let discovery = Discovery::new(client).filter(&[ty.group.as_str()]).run().await.map_err(client_error)?;
    for group in discovery.groups() {
        if group.name() != ty.group {
            continue;
        }
        for (ar, caps) in group.versioned_resources(&ty.version) {
            if ar.plural == ty.plural {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar, namespaced));
            }
        }
    }
    Err(ClientError::Api { code: 404, message: format!("resource type not served: {}", ty) })
}

#[async_trait::async_trait]
impl ResourceClient for KubeResourceClient {
    async fn list(&self, ty: &ResourceType, namespace: Option<&str>) -> Result<ResourceList, ClientError> {
        let api = self.api(ty, namespace).await?;
        let list = api.list(&ListParams::default()).await.map_err(client_error)?;
        let mut items = Vec::with_capacity(list.items.len());
        for obj in list.items.iter() {
            match to_resource(obj) {
                Ok(r) => items.push(r),
                Err(e) => warn!(error = %e, "skipping undecodable object in list"),
            }
        }
        Ok(ResourceList { items, resource_version: list.metadata.resource_version })
    }

    async fn watch(
        &self,
        ty: &ResourceType,
        namespace: Option<&str>,
        resource_version: Option<&str>,
    ) -> Result<NotificationStream, ClientError> {
        let api = self.api(ty, namespace).await?;
        let wp = WatchParams::default().timeout(self.watch_timeout_secs);
        let version = resource_version.unwrap_or("0");
        let stream = api.watch(&wp, version).await.map_err(client_error)?;
        info!(resource = %ty, ns = ?namespace, rv = %version, "watch opened");
        let mapped = stream.filter_map(|ev| async move {
            let item = match ev {
                Ok(WatchEvent::Added(o)) => to_resource(&o).map(Notification::Added),
                Ok(WatchEvent::Modified(o)) => to_resource(&o).map(Notification::Modified),
                Ok(WatchEvent::Deleted(o)) => to_resource(&o).map(Notification::Deleted),
                Ok(WatchEvent::Bookmark(b)) => {
                    return Some(Ok(Notification::Bookmark { resource_version: b.metadata.resource_version }))
                }
                Ok(WatchEvent::Error(e)) if e.code == 410 => return Some(Err(ClientError::Gone)),
                Ok(WatchEvent::Error(e)) => return Some(Err(ClientError::Api { code: e.code, message: e.message })),
                Err(e) => return Some(Err(client_error(e))),
            };
            match item {
                Ok(n) => Some(Ok(n)),
                Err(e) => {
                    // one bad object must not end the session
                    warn!(error = %e, "skipping undecodable watch object");
                    None
                }
            }
        });
        Ok(mapped.boxed())
    }

    async fn patch_status(
        &self,
        ty: &ResourceType,
        name: &str,
        namespace: Option<&str>,
        patch: &StatusPatch,
    ) -> Result<WatchedResource, ClientError> {
        let api = self.api(ty, namespace).await?;
        let body = patch.body();
        let obj = api.patch_status(name, &PatchParams::default(), &Patch::Merge(&body)).await.map_err(client_error)?;
        to_resource(&obj)
    }

    async fn patch_metadata(
        &self,
        ty: &ResourceType,
        name: &str,
        namespace: Option<&str>,
        finalizers: &[String],
    ) -> Result<WatchedResource, ClientError> {
        let api = self.api(ty, namespace).await?;
        let body = finalizer_patch(finalizers);
        let obj = api.patch(name, &PatchParams::default(), &Patch::Merge(&body)).await.map_err(client_error)?;
        to_resource(&obj)
    }
}

fn finalizer_patch(finalizers: &[String]) -> serde_json::Value {
    if finalizers.is_empty() {
        serde_json::json!({ "metadata": { "finalizers": null } })
    } else {
        serde_json::json!({ "metadata": { "finalizers": finalizers } })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_finalizer_list_clears_field() {
        assert_eq!(finalizer_patch(&[]), serde_json::json!({ "metadata": { "finalizers": null } }));
        let set = finalizer_patch(&["projects.v1.example.com".to_string()]);
        assert_eq!(set["metadata"]["finalizers"][0], "projects.v1.example.com");
    }

    #[test]
    fn managed_fields_are_stripped() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "example.com/v1",
            "kind": "Project",
            "metadata": {
                "name": "demo",
                "namespace": "ns",
                "uid": "abc123",
                "resourceVersion": "7",
                "managedFields": [{ "manager": "kubectl" }],
            },
            "spec": { "a": 1 },
        }))
        .unwrap();
        let r = to_resource(&obj).unwrap();
        assert_eq!(r.uid, "abc123");
        assert!(r.raw["metadata"].get("managedFields").is_none());
        assert_eq!(r.spec(), Some(&serde_json::json!({ "a": 1 })));
    }

    #[test]
    fn object_without_uid_is_a_decode_error() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "example.com/v1",
            "kind": "Project",
            "metadata": { "name": "demo", "resourceVersion": "7" },
        }))
        .unwrap();
        assert!(matches!(to_resource(&obj), Err(ClientError::Decode(_))));
    }
}
