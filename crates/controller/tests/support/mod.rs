#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use steward_controller::{handler_fn, CallbackKind, Callbacks, CancellationToken, OperatorConfig, ReconciliationLoop};
use steward_core::{
    ClientError, EventRecord, EventSink, Notification, NotificationStream, ResourceClient, ResourceList, ResourceType,
    StatusPatch, WatchedResource,
};
use steward_persist::{MemoryVersionCache, VersionCache};

pub fn ty() -> ResourceType { ResourceType::new("example.com", "v1alpha1", "projects") }

pub fn token() -> String { ty().finalizer_token().to_string() }

pub fn obj(uid: &str, name: &str, rv: &str) -> WatchedResource {
    let raw = serde_json::json!({
        "apiVersion": "example.com/v1alpha1",
        "kind": "Project",
        "metadata": { "uid": uid, "name": name, "namespace": "default", "resourceVersion": rv },
        "spec": { "sampleName": name },
    });
    WatchedResource::from_raw(raw).unwrap()
}

pub fn with_finalizers(mut r: WatchedResource, finalizers: &[&str]) -> WatchedResource {
    r.finalizers = finalizers.iter().map(|s| s.to_string()).collect();
    r.raw["metadata"]["finalizers"] = serde_json::json!(finalizers);
    r
}

pub fn deleting(mut r: WatchedResource) -> WatchedResource {
    r.deletion_timestamp = Some("2024-01-01T00:00:00Z".into());
    r.raw["metadata"]["deletionTimestamp"] = serde_json::json!("2024-01-01T00:00:00Z");
    r
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    List,
    Watch(Option<String>),
    PatchStatus { name: String, status: serde_json::Value },
    PatchMetadata { name: String, finalizers: Vec<String> },
}

#[derive(Default)]
struct State {
    objects: Vec<WatchedResource>,
    listed: Vec<WatchedResource>,
    list_version: Option<String>,
    sessions: VecDeque<Result<Vec<Result<Notification, ClientError>>, ClientError>>,
    calls: Vec<Call>,
    bump_on_patch: bool,
    fail_status: bool,
    fail_metadata: bool,
    when_drained: Option<CancellationToken>,
    hang_when_drained: bool,
    edit_before_status: Option<serde_json::Value>,
}

/// In-memory store with scripted watch sessions.
#[derive(Default)]
pub struct FakeClient {
    state: Mutex<State>,
}

impl FakeClient {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    /// Make `r` known to patch requests (matched by namespace/name).
    pub fn seed(&self, r: &WatchedResource) {
        let mut st = self.state.lock().unwrap();
        st.objects.retain(|o| !(o.name == r.name && o.namespace == r.namespace));
        st.objects.push(r.clone());
    }

    pub fn set_list(&self, items: Vec<WatchedResource>, version: Option<&str>) {
        let mut st = self.state.lock().unwrap();
        for r in items.iter() {
            st.objects.retain(|o| !(o.name == r.name && o.namespace == r.namespace));
            st.objects.push(r.clone());
        }
        st.listed = items;
        st.list_version = version.map(|s| s.to_string());
    }

    pub fn push_session(&self, items: Vec<Result<Notification, ClientError>>) {
        self.state.lock().unwrap().sessions.push_back(Ok(items));
    }

    pub fn push_watch_failure(&self, err: ClientError) {
        self.state.lock().unwrap().sessions.push_back(Err(err));
    }

    /// Cancel `token` once the scripted sessions run out.
    pub fn cancel_when_drained(&self, token: CancellationToken) {
        self.state.lock().unwrap().when_drained = Some(token);
    }

    /// Once the scripted sessions run out, watches open but never yield.
    pub fn hang_when_drained(&self) { self.state.lock().unwrap().hang_when_drained = true; }

    /// The next status patch first lands a concurrent edit replacing `spec`.
    pub fn edit_spec_before_status(&self, spec: serde_json::Value) {
        self.state.lock().unwrap().edit_before_status = Some(spec);
    }

    /// Every patch increments the object's numeric version.
    pub fn bump_versions(&self) { self.state.lock().unwrap().bump_on_patch = true; }
    pub fn fail_status(&self) { self.state.lock().unwrap().fail_status = true; }
    pub fn fail_metadata(&self) { self.state.lock().unwrap().fail_metadata = true; }

    pub fn calls(&self) -> Vec<Call> { self.state.lock().unwrap().calls.clone() }

    pub fn metadata_patches(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c { Call::PatchMetadata { finalizers, .. } => Some(finalizers), _ => None })
            .collect()
    }

    pub fn status_patches(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, Call::PatchStatus { .. })).count()
    }

    pub fn current(&self, name: &str) -> Option<WatchedResource> {
        self.state.lock().unwrap().objects.iter().find(|o| o.name == name).cloned()
    }

    fn patch(&self, name: &str, namespace: Option<&str>, edit: impl FnOnce(&mut WatchedResource)) -> Result<WatchedResource, ClientError> {
        let mut st = self.state.lock().unwrap();
        let bump_on_patch = st.bump_on_patch;
        let obj = st
            .objects
            .iter_mut()
            .find(|o| o.name == name && o.namespace.as_deref() == namespace)
            .ok_or(ClientError::Api { code: 404, message: format!("{name} not found") })?;
        edit(obj);
        if bump_on_patch {
            let next = obj.resource_version.parse::<u64>().unwrap_or(0) + 1;
            obj.resource_version = next.to_string();
            obj.raw["metadata"]["resourceVersion"] = serde_json::json!(obj.resource_version);
        }
        Ok(obj.clone())
    }
}

#[async_trait::async_trait]
impl ResourceClient for FakeClient {
    async fn list(&self, _ty: &ResourceType, _namespace: Option<&str>) -> Result<ResourceList, ClientError> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(Call::List);
        Ok(ResourceList { items: st.listed.clone(), resource_version: st.list_version.clone() })
    }

    async fn watch(
        &self,
        _ty: &ResourceType,
        _namespace: Option<&str>,
        resource_version: Option<&str>,
    ) -> Result<NotificationStream, ClientError> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(Call::Watch(resource_version.map(|s| s.to_string())));
        match st.sessions.pop_front() {
            Some(Ok(items)) => Ok(futures::stream::iter(items).boxed()),
            Some(Err(e)) => Err(e),
            None if st.hang_when_drained => Ok(futures::stream::pending().boxed()),
            None => {
                if let Some(token) = st.when_drained.as_ref() {
                    token.cancel();
                }
                Ok(futures::stream::empty().boxed())
            }
        }
    }

    async fn patch_status(
        &self,
        _ty: &ResourceType,
        name: &str,
        namespace: Option<&str>,
        patch: &StatusPatch,
    ) -> Result<WatchedResource, ClientError> {
        let edit = {
            let mut st = self.state.lock().unwrap();
            st.calls.push(Call::PatchStatus { name: name.to_string(), status: patch.0.clone() });
            if st.fail_status {
                return Err(ClientError::Api { code: 404, message: "status subresource not enabled".into() });
            }
            st.edit_before_status.take()
        };
        if let Some(spec) = edit {
            self.patch(name, namespace, move |o| o.raw["spec"] = spec)?;
        }
        let status = patch.0.clone();
        self.patch(name, namespace, move |o| o.raw["status"] = status)
    }

    async fn patch_metadata(
        &self,
        _ty: &ResourceType,
        name: &str,
        namespace: Option<&str>,
        finalizers: &[String],
    ) -> Result<WatchedResource, ClientError> {
        {
            let mut st = self.state.lock().unwrap();
            st.calls.push(Call::PatchMetadata { name: name.to_string(), finalizers: finalizers.to_vec() });
            if st.fail_metadata {
                return Err(ClientError::Api { code: 409, message: "conflict".into() });
            }
        }
        let next = finalizers.to_vec();
        self.patch(name, namespace, move |o| {
            o.raw["metadata"]["finalizers"] = serde_json::json!(next);
            o.finalizers = next.into_iter().collect();
        })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub added: Mutex<Vec<(String, EventRecord)>>,
    pub purged: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }
    pub fn purged(&self) -> Vec<String> { self.purged.lock().unwrap().clone() }
    pub fn added(&self) -> Vec<(String, EventRecord)> { self.added.lock().unwrap().clone() }
}

#[async_trait::async_trait]
impl EventSink for RecordingSink {
    async fn add(&self, resource: &WatchedResource, event: EventRecord) {
        self.added.lock().unwrap().push((resource.uid.clone(), event));
    }

    async fn delete_all(&self, resource: &WatchedResource) {
        self.purged.lock().unwrap().push(resource.uid.clone());
    }
}

/// Records every handler call as `(kind, uid, rv)`.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<(CallbackKind, String, String)>>>,
    failing: Arc<Mutex<Vec<CallbackKind>>>,
    status: Option<serde_json::Value>,
}

impl Recorder {
    pub fn new() -> Self { Self::default() }

    /// Add/update handlers return this status payload.
    pub fn with_status(mut self, status: serde_json::Value) -> Self {
        self.status = Some(status);
        self
    }

    pub fn fail(&self, kind: CallbackKind) { self.failing.lock().unwrap().push(kind); }
    pub fn heal(&self) { self.failing.lock().unwrap().clear(); }

    pub fn calls(&self) -> Vec<(CallbackKind, String, String)> { self.calls.lock().unwrap().clone() }

    pub fn count(&self, kind: CallbackKind) -> usize { self.calls().iter().filter(|(k, _, _)| *k == kind).count() }

    pub fn callbacks(&self) -> Callbacks {
        let make = |me: Recorder| {
            handler_fn(move |r: WatchedResource, ctx: steward_controller::HandlerContext| {
                let me = me.clone();
                async move {
                    me.calls.lock().unwrap().push((ctx.kind, r.uid.clone(), r.resource_version.clone()));
                    if me.failing.lock().unwrap().contains(&ctx.kind) {
                        anyhow::bail!("{} handler exploded", ctx.kind);
                    }
                    Ok(match (ctx.kind, &me.status) {
                        (CallbackKind::Delete, _) | (_, None) => None,
                        (_, Some(s)) => Some(StatusPatch(s.clone())),
                    })
                }
            })
        };
        Callbacks::new().on_add(make(self.clone())).on_update(make(self.clone())).on_delete(make(self.clone()))
    }
}

pub fn fast_config() -> OperatorConfig {
    OperatorConfig { sleep_timer: Duration::from_millis(5), ..OperatorConfig::default() }
}

pub fn build(client: &Arc<FakeClient>, sink: &Arc<RecordingSink>, cache: Box<dyn VersionCache>, callbacks: Callbacks) -> ReconciliationLoop {
    build_with(fast_config(), client, sink, cache, callbacks)
}

pub fn build_with(
    config: OperatorConfig,
    client: &Arc<FakeClient>,
    sink: &Arc<RecordingSink>,
    cache: Box<dyn VersionCache>,
    callbacks: Callbacks,
) -> ReconciliationLoop {
    ReconciliationLoop::new(ty(), config, client.clone(), sink.clone(), cache, callbacks)
}

pub fn memory_cache() -> Box<dyn VersionCache> { Box::new(MemoryVersionCache::new()) }
