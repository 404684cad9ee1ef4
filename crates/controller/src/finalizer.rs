//! Finalizer add/remove requests for this controller's token.

use std::sync::Arc;

use steward_core::{ClientError, FinalizerToken, ResourceClient, ResourceType, WatchedResource};
use tracing::debug;

/// Only this controller's token is touched; other finalizers on the object are carried
/// through unchanged in the patched list.
pub struct FinalizerManager {
    ty: ResourceType,
    token: FinalizerToken,
    client: Arc<dyn ResourceClient>,
}

impl FinalizerManager {
    pub fn new(ty: ResourceType, client: Arc<dyn ResourceClient>) -> Self {
        let token = ty.finalizer_token();
        Self { ty, token, client }
    }

    pub fn token(&self) -> &FinalizerToken { &self.token }

    /// Ensure the token is present. No request when it already is.
    pub async fn add(&self, resource: &WatchedResource) -> Result<WatchedResource, ClientError> {
        if resource.has_finalizer(&self.token) {
            return Ok(resource.clone());
        }
        let mut next: Vec<String> = resource.finalizers.iter().cloned().collect();
        next.push(self.token.to_string());
        debug!(resource = %resource.key(), token = %self.token, "adding finalizer");
        self.client.patch_metadata(&self.ty, &resource.name, resource.namespace.as_deref(), &next).await
    }

    /// Ensure the token is absent. No request when it already is.
    pub async fn remove(&self, resource: &WatchedResource) -> Result<WatchedResource, ClientError> {
        if !resource.has_finalizer(&self.token) {
            return Ok(resource.clone());
        }
        let next: Vec<String> = resource.finalizers.iter().filter(|f| f.as_str() != self.token.as_str()).cloned().collect();
        debug!(resource = %resource.key(), token = %self.token, "removing finalizer");
        self.client.patch_metadata(&self.ty, &resource.name, resource.namespace.as_deref(), &next).await
    }
}
