//! Event helper: core/v1 events attached to watched resources.

use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    Client,
};
use metrics::counter;
use steward_core::{ClientError, EventRecord, EventSink, WatchedResource};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client_error;

/// Cluster-scoped objects get their events here.
const CLUSTER_EVENT_NAMESPACE: &str = "default";

pub struct KubeEventSink {
    client: Client,
    component: String,
    instance: Option<String>,
}

impl KubeEventSink {
    /// `component` is reported when an event does not name its own.
    pub fn new(client: Client, component: impl Into<String>) -> Self {
        Self { client, component: component.into(), instance: std::env::var("POD_NAME").ok() }
    }

    fn build(&self, resource: &WatchedResource, record: &EventRecord) -> Event {
        let namespace = resource.namespace.clone().unwrap_or_else(|| CLUSTER_EVENT_NAMESPACE.to_string());
        let component = record.component.clone().unwrap_or_else(|| self.component.clone());
        let now = Time(chrono::Utc::now());
        Event {
            metadata: ObjectMeta {
                name: Some(format!("{}.{}", resource.name, Uuid::new_v4().simple())),
                namespace: Some(namespace),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: resource.api_version().map(|s| s.to_string()),
                kind: resource.kind().map(|s| s.to_string()),
                name: Some(resource.name.clone()),
                namespace: resource.namespace.clone(),
                uid: Some(resource.uid.clone()),
                resource_version: Some(resource.resource_version.clone()),
                ..Default::default()
            },
            message: Some(record.message.clone()),
            reason: Some(record.reason.clone()),
            type_: Some(record.type_.as_str().to_string()),
            source: Some(EventSource { component: Some(component.clone()), host: None }),
            reporting_component: Some(component),
            reporting_instance: self.instance.clone(),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            count: Some(1),
            ..Default::default()
        }
    }

    async fn try_add(&self, resource: &WatchedResource, record: &EventRecord) -> Result<(), ClientError> {
        let ev = self.build(resource, record);
        let namespace = ev.metadata.namespace.clone().unwrap_or_else(|| CLUSTER_EVENT_NAMESPACE.to_string());
        let api: Api<Event> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), &ev).await.map_err(client_error)?;
        Ok(())
    }

    async fn try_delete_all(&self, resource: &WatchedResource) -> Result<usize, ClientError> {
        let all: Api<Event> = Api::all(self.client.clone());
        let lp = ListParams::default().fields(&format!("involvedObject.uid={}", resource.uid));
        let events = all.list(&lp).await.map_err(client_error)?;
        let mut deleted = 0usize;
        for ev in events.items {
            let (Some(ns), Some(name)) = (ev.metadata.namespace, ev.metadata.name) else { continue };
            let api: Api<Event> = Api::namespaced(self.client.clone(), &ns);
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => deleted += 1,
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => warn!(event = %name, error = %e, "event delete failed"),
            }
        }
        Ok(deleted)
    }
}

#[async_trait::async_trait]
impl EventSink for KubeEventSink {
    async fn add(&self, resource: &WatchedResource, event: EventRecord) {
        match self.try_add(resource, &event).await {
            Ok(()) => {
                counter!("steward_events_created_total", 1u64);
                debug!(resource = %resource.key(), reason = %event.reason, "event recorded");
            }
            Err(e) => warn!(resource = %resource.key(), error = %e, "failed to record event"),
        }
    }

    async fn delete_all(&self, resource: &WatchedResource) {
        match self.try_delete_all(resource).await {
            Ok(n) => info!(resource = %resource.key(), deleted = n, "events purged"),
            Err(e) => warn!(resource = %resource.key(), error = %e, "failed to purge events"),
        }
    }
}
