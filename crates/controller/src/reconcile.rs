//! The reconciliation loop: one watch session at a time, one notification at a time.

use std::sync::Arc;

use futures::StreamExt;
use metrics::counter;
use steward_core::{ClientError, EventSink, Notification, ResourceClient, ResourceType, WatchedResource};
use steward_persist::VersionCache;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::classify::{classify, Action, SkipReason};
use crate::config::OperatorConfig;
use crate::dispatch::{CallbackDispatcher, CallbackKind, Callbacks};
use crate::error::ReconcileError;
use crate::finalizer::FinalizerManager;
use crate::ledger::VersionLedger;

/// What handling one notification did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Added,
    Updated,
    Finalized,
    Purged,
    Skipped(SkipReason),
    Bookmark,
    Unexpected,
}

/// How a watch session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The store closed the stream (timeout, resync).
    Closed,
    Cancelled,
}

pub struct ReconciliationLoop {
    ty: ResourceType,
    config: OperatorConfig,
    client: Arc<dyn ResourceClient>,
    events: Arc<dyn EventSink>,
    ledger: VersionLedger,
    finalizers: FinalizerManager,
    dispatcher: CallbackDispatcher,
    /// Where the next watch picks up; `None` forces a relist first.
    resume_version: Option<String>,
}

impl ReconciliationLoop {
    pub fn new(
        ty: ResourceType,
        config: OperatorConfig,
        client: Arc<dyn ResourceClient>,
        events: Arc<dyn EventSink>,
        cache: Box<dyn VersionCache>,
        callbacks: Callbacks,
    ) -> Self {
        let finalizers = FinalizerManager::new(ty.clone(), client.clone());
        let dispatcher = CallbackDispatcher::new(callbacks, ty.clone(), client.clone(), events.clone());
        Self {
            ty,
            config,
            client,
            events,
            ledger: VersionLedger::new(cache),
            finalizers,
            dispatcher,
            resume_version: None,
        }
    }

    pub fn resource_type(&self) -> &ResourceType { &self.ty }
    pub fn ledger(&self) -> &VersionLedger { &self.ledger }
    pub fn finalizers(&self) -> &FinalizerManager { &self.finalizers }
    pub fn resume_version(&self) -> Option<&str> { self.resume_version.as_deref() }

    /// Watch, reconnect and repeat until `cancel` fires. Failures are logged, never returned.
    pub async fn run(&mut self, cancel: CancellationToken) {
        let span = info_span!("operator", resource = %self.ty);
        async {
            info!(ns = ?self.config.namespace, token = %self.finalizers.token(), "start the operator");
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                match self.run_session(&cancel).await {
                    Ok(SessionEnd::Cancelled) => break,
                    Ok(SessionEnd::Closed) => debug!("watch stream closed"),
                    Err(e) => {
                        if e.is_gone() {
                            self.resume_version = None;
                        }
                        warn!(error = %e, "watch session failed");
                    }
                }
                counter!("steward_reconnects_total", 1u64);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.sleep_timer) => {}
                }
            }
            info!("operator stopped");
        }
        .instrument(span)
        .await
    }

    /// One watch session: relist when there is no resume point, then consume the
    /// stream until it ends. Only watch-level errors are returned.
    pub async fn run_session(&mut self, cancel: &CancellationToken) -> Result<SessionEnd, ClientError> {
        if self.resume_version.is_none() {
            self.resync().await?;
        }
        let namespace = self.config.namespace.clone();
        let mut stream = self.client.watch(&self.ty, namespace.as_deref(), self.resume_version.as_deref()).await?;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                next = stream.next() => next,
            };
            let notification = match next {
                None => return Ok(SessionEnd::Closed),
                Some(Err(e)) => return Err(e),
                Some(Ok(n)) => n,
            };
            if let Some(rv) = notification.resume_version() {
                self.resume_version = Some(rv.to_string());
            }
            if let Err(e) = self.handle(notification).await {
                counter!("steward_notification_errors_total", 1u64);
                warn!(error = %e, "notification processing failed");
            }
        }
    }

    /// List the collection and process every object as a modification, then resume
    /// watching from the list's version. Uids recorded but no longer listed are forgotten
    /// when the whole collection is in scope.
    pub async fn resync(&mut self) -> Result<(), ClientError> {
        let namespace = self.config.namespace.clone();
        let list = self.client.list(&self.ty, namespace.as_deref()).await?;
        info!(count = list.items.len(), rv = ?list.resource_version, "resync");
        let listed: Vec<String> = list.items.iter().map(|r| r.uid.clone()).collect();
        for item in list.items {
            if let Err(e) = self.handle(Notification::Modified(item)).await {
                counter!("steward_notification_errors_total", 1u64);
                warn!(error = %e, "resync item failed");
            }
        }
        if namespace.is_none() {
            self.prune_unlisted(&listed);
        }
        self.resume_version = list.resource_version;
        Ok(())
    }

    fn prune_unlisted(&mut self, listed: &[String]) {
        let recorded = match self.ledger.uids() {
            Ok(uids) => uids,
            Err(e) => {
                warn!(error = %e, "cannot enumerate version cache; skipping prune");
                return;
            }
        };
        let mut pruned = 0usize;
        for uid in recorded.iter().filter(|u| !listed.contains(u)) {
            self.ledger.forget(uid);
            pruned += 1;
        }
        if pruned > 0 {
            info!(pruned, "forgot uids no longer in the store");
        }
    }

    /// Classify one notification and carry out its action.
    pub async fn handle(&mut self, notification: Notification) -> Result<Outcome, ReconcileError> {
        counter!("steward_notifications_total", 1u64, "kind" => notification.kind_str().to_string());
        let recorded = match &notification {
            // the echo of our own finalizer write reads as already handled
            Notification::Modified(r) if self.ledger.take_own_write(&r.uid, &r.resource_version) => {
                Some(r.resource_version.clone())
            }
            Notification::Added(r) | Notification::Modified(r) | Notification::Deleted(r) => self.ledger.get(&r.uid),
            _ => None,
        };
        let action = classify(&notification, recorded.as_deref(), self.config.version_ordering, self.finalizers.token());
        let kind = notification.kind_str().to_string();
        let resource = match notification {
            Notification::Added(r) | Notification::Modified(r) | Notification::Deleted(r) => r,
            Notification::Bookmark { resource_version } => {
                debug!(rv = %resource_version, "bookmark");
                return Ok(Outcome::Bookmark);
            }
            Notification::Other { .. } => {
                warn!(kind = %kind, "unexpected notification type");
                return Ok(Outcome::Unexpected);
            }
        };
        match action {
            Action::Add => self.add(resource).await,
            Action::Update => self.update(resource).await,
            Action::Finalize => self.finalize(resource).await,
            Action::Purge => self.purge(resource).await,
            Action::Skip(reason) => {
                self.log_skip(&kind, &resource, recorded.as_deref(), reason);
                Ok(Outcome::Skipped(reason))
            }
            Action::Bookmark | Action::Unexpected => Ok(Outcome::Unexpected),
        }
    }

    async fn add(&mut self, resource: WatchedResource) -> Result<Outcome, ReconcileError> {
        let resource = self
            .finalizers
            .add(&resource)
            .await
            .map_err(ReconcileError::client("add finalizer", resource.key()))?;
        info!(action = "add", resource = %resource.key(), rv = %resource.resource_version, "add custom resource");
        let patched = self.dispatcher.dispatch(CallbackKind::Add, &resource).await?;
        let recorded = self.record(&resource, patched.as_ref());
        if recorded != resource.resource_version {
            self.ledger.note_own_write(&resource.uid, &resource.resource_version);
        }
        Ok(Outcome::Added)
    }

    async fn update(&mut self, resource: WatchedResource) -> Result<Outcome, ReconcileError> {
        info!(action = "update", resource = %resource.key(), rv = %resource.resource_version, "update custom resource");
        let patched = self.dispatcher.dispatch(CallbackKind::Update, &resource).await?;
        self.record(&resource, patched.as_ref());
        Ok(Outcome::Updated)
    }

    /// Delete handler first; the finalizer is only released once it succeeded.
    async fn finalize(&mut self, resource: WatchedResource) -> Result<Outcome, ReconcileError> {
        info!(action = "delete", resource = %resource.key(), rv = %resource.resource_version, "delete custom resource");
        self.dispatcher.dispatch(CallbackKind::Delete, &resource).await?;
        self.finalizers
            .remove(&resource)
            .await
            .map_err(ReconcileError::client("remove finalizer", resource.key()))?;
        Ok(Outcome::Finalized)
    }

    async fn purge(&mut self, resource: WatchedResource) -> Result<Outcome, ReconcileError> {
        info!(resource = %resource.key(), "custom resource removed from store");
        self.events.delete_all(&resource).await;
        self.ledger.forget(&resource.uid);
        Ok(Outcome::Purged)
    }

    /// Record the version after our own status write when there was one, so its echo is a no-op.
    /// If the object changed underneath the handler the handled version is kept instead, so
    /// that change still gets its own notification handled. Returns what was recorded.
    fn record(&mut self, resource: &WatchedResource, patched: Option<&WatchedResource>) -> String {
        let version = match patched {
            Some(p) if same_desired_state(resource, p) => p.resource_version.clone(),
            Some(p) => {
                debug!(resource = %resource.key(), rv = %resource.resource_version, patched_rv = %p.resource_version, "object changed during handler");
                resource.resource_version.clone()
            }
            None => resource.resource_version.clone(),
        };
        self.ledger.put(&resource.uid, &version);
        version
    }

    fn log_skip(&self, kind: &str, resource: &WatchedResource, recorded: Option<&str>, reason: SkipReason) {
        counter!("steward_skips_total", 1u64, "reason" => reason.as_str());
        if self.config.show_skip_events {
            info!(kind = %kind, resource = %resource.key(), rv = %resource.resource_version, recorded = ?recorded, reason = reason.as_str(), "skip");
        } else {
            debug!(kind = %kind, resource = %resource.key(), rv = %resource.resource_version, recorded = ?recorded, reason = reason.as_str(), "skip");
        }
    }
}

/// Same `metadata.generation` when both carry one, otherwise the same `spec`.
fn same_desired_state(handled: &WatchedResource, patched: &WatchedResource) -> bool {
    let generation = |r: &WatchedResource| r.raw.get("metadata").and_then(|m| m.get("generation")).and_then(|g| g.as_i64());
    match (generation(handled), generation(patched)) {
        (Some(a), Some(b)) => a == b,
        _ => handled.spec() == patched.spec(),
    }
}
