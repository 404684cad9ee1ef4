//! Per-notification failures. None of these end the loop.

use steward_core::ClientError;

use crate::dispatch::CallbackKind;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// A store request made on behalf of one notification failed.
    #[error("{action} for {resource} failed: {source}")]
    Client {
        action: &'static str,
        resource: String,
        #[source]
        source: ClientError,
    },

    /// The user handler returned an error; no bookkeeping was committed.
    #[error("{kind} handler failed for {resource}: {source:#}")]
    Handler {
        kind: CallbackKind,
        resource: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ReconcileError {
    pub(crate) fn client(action: &'static str, resource: String) -> impl FnOnce(ClientError) -> Self {
        move |source| ReconcileError::Client { action, resource, source }
    }

    pub fn is_handler(&self) -> bool { matches!(self, ReconcileError::Handler { .. }) }
}
