//! User callbacks: registration, default fallback, invocation and status write-back.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use metrics::counter;
use steward_core::{EventSink, ResourceClient, ResourceType, StatusPatch, WatchedResource};
use tracing::{info, warn};

use crate::error::ReconcileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    Add,
    Update,
    Delete,
}

impl CallbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackKind::Add => "add",
            CallbackKind::Update => "update",
            CallbackKind::Delete => "delete",
        }
    }
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// What a handler gets besides the resource.
#[derive(Clone)]
pub struct HandlerContext {
    pub kind: CallbackKind,
    pub client: Arc<dyn ResourceClient>,
    pub events: Arc<dyn EventSink>,
}

/// `Ok(Some(patch))` asks for `patch` to be merged into the object's status.
pub type HandlerResult = anyhow::Result<Option<StatusPatch>>;

#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, resource: &WatchedResource, ctx: &HandlerContext) -> HandlerResult;
}

/// Adapts an async closure into a [`Handler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(WatchedResource, HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait::async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(WatchedResource, HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, resource: &WatchedResource, ctx: &HandlerContext) -> HandlerResult {
        (self.0)(resource.clone(), ctx.clone()).await
    }
}

/// Used for any kind nobody registered: one structured log line, no status.
pub struct LogHandler;

#[async_trait::async_trait]
impl Handler for LogHandler {
    async fn handle(&self, resource: &WatchedResource, ctx: &HandlerContext) -> HandlerResult {
        let path = match &resource.namespace {
            Some(ns) => format!("{}/{}", ns, resource.name),
            None => resource.name.clone(),
        };
        info!(action = ctx.kind.as_str(), resource = %path, "no handler registered");
        Ok(None)
    }
}

/// Handler registration, one slot per kind.
#[derive(Clone, Default)]
pub struct Callbacks {
    add: Option<Arc<dyn Handler>>,
    update: Option<Arc<dyn Handler>>,
    delete: Option<Arc<dyn Handler>>,
}

impl Callbacks {
    pub fn new() -> Self { Self::default() }

    pub fn on_add(mut self, handler: impl Handler + 'static) -> Self {
        self.add = Some(Arc::new(handler));
        self
    }

    pub fn on_update(mut self, handler: impl Handler + 'static) -> Self {
        self.update = Some(Arc::new(handler));
        self
    }

    /// Same handler for add and update.
    pub fn on_upsert(mut self, handler: impl Handler + 'static) -> Self {
        let shared: Arc<dyn Handler> = Arc::new(handler);
        self.add = Some(shared.clone());
        self.update = Some(shared);
        self
    }

    pub fn on_delete(mut self, handler: impl Handler + 'static) -> Self {
        self.delete = Some(Arc::new(handler));
        self
    }
}

/// Invokes exactly one handler per call and writes back the returned status. No retries.
pub struct CallbackDispatcher {
    add: Arc<dyn Handler>,
    update: Arc<dyn Handler>,
    delete: Arc<dyn Handler>,
    ty: ResourceType,
    client: Arc<dyn ResourceClient>,
    events: Arc<dyn EventSink>,
}

impl CallbackDispatcher {
    pub fn new(callbacks: Callbacks, ty: ResourceType, client: Arc<dyn ResourceClient>, events: Arc<dyn EventSink>) -> Self {
        let fallback: Arc<dyn Handler> = Arc::new(LogHandler);
        Self {
            add: callbacks.add.unwrap_or_else(|| fallback.clone()),
            update: callbacks.update.unwrap_or_else(|| fallback.clone()),
            delete: callbacks.delete.unwrap_or(fallback),
            ty,
            client,
            events,
        }
    }

    fn handler(&self, kind: CallbackKind) -> &Arc<dyn Handler> {
        match kind {
            CallbackKind::Add => &self.add,
            CallbackKind::Update => &self.update,
            CallbackKind::Delete => &self.delete,
        }
    }

    /// Run the handler for `kind`; its error is returned as is.
    pub async fn invoke(&self, kind: CallbackKind, resource: &WatchedResource) -> Result<Option<StatusPatch>, ReconcileError> {
        let ctx = HandlerContext { kind, client: self.client.clone(), events: self.events.clone() };
        match self.handler(kind).handle(resource, &ctx).await {
            Ok(patch) => {
                counter!("steward_callbacks_total", 1u64, "kind" => kind.as_str(), "outcome" => "ok");
                Ok(patch)
            }
            Err(source) => {
                counter!("steward_callbacks_total", 1u64, "kind" => kind.as_str(), "outcome" => "error");
                Err(ReconcileError::Handler { kind, resource: resource.key(), source })
            }
        }
    }

    /// Merge `patch` into `/status`. Failure is logged and yields `None`: the handler's
    /// side effects already happened, so bookkeeping goes on without the write-back.
    pub async fn apply_status(&self, resource: &WatchedResource, patch: &StatusPatch) -> Option<WatchedResource> {
        match self.client.patch_status(&self.ty, &resource.name, resource.namespace.as_deref(), patch).await {
            Ok(patched) => Some(patched),
            Err(e) => {
                counter!("steward_status_patch_errors_total", 1u64);
                warn!(resource = %resource.key(), error = %e, "status patch failed");
                None
            }
        }
    }

    /// Invoke, then apply any returned status. Yields the object after a successful status write.
    pub async fn dispatch(&self, kind: CallbackKind, resource: &WatchedResource) -> Result<Option<WatchedResource>, ReconcileError> {
        match self.invoke(kind, resource).await? {
            Some(patch) => Ok(self.apply_status(resource, &patch).await),
            None => Ok(None),
        }
    }
}
