//! The notification policy table: what one notification means given the ledger.

use steward_core::{FinalizerToken, Notification, VersionOrdering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// ADDED for a uid the ledger already holds.
    AlreadyProcessed,
    /// Same version as recorded (redelivery, or our own patch echoing back).
    Unchanged,
    /// Numerically older than recorded.
    Stale,
    /// Being deleted and our finalizer is already gone: the delete handler ran.
    Released,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::AlreadyProcessed => "already_processed",
            SkipReason::Unchanged => "unchanged",
            SkipReason::Stale => "stale",
            SkipReason::Released => "released",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Add finalizer, run the add handler, record the version.
    Add,
    /// Run the update handler, record the version.
    Update,
    /// Run the delete handler, then release the finalizer. Never recorded.
    Finalize,
    /// Object is gone from the store: purge its events, forget its uid.
    Purge,
    Skip(SkipReason),
    Bookmark,
    Unexpected,
}

/// Classify `notification` against the `recorded` version of its uid.
///
/// An object marked for deletion finalizes while it still carries `token`. Once the
/// token is gone the delete handler has run, so later modifications (other finalizers
/// still holding the object) are skipped. A uid the ledger never recorded finalizes
/// regardless, and a modification of such a uid otherwise takes the add path.
pub fn classify(
    notification: &Notification,
    recorded: Option<&str>,
    ordering: VersionOrdering,
    token: &FinalizerToken,
) -> Action {
    match notification {
        Notification::Added(r) => match recorded {
            Some(_) => Action::Skip(SkipReason::AlreadyProcessed),
            None if r.is_deleting() => Action::Finalize,
            None => Action::Add,
        },
        Notification::Modified(r) => match recorded {
            Some(v) if v == r.resource_version => Action::Skip(SkipReason::Unchanged),
            Some(v) if !ordering.supersedes(&r.resource_version, v) => Action::Skip(SkipReason::Stale),
            Some(_) if r.is_deleting() && r.has_finalizer(token) => Action::Finalize,
            Some(_) if r.is_deleting() => Action::Skip(SkipReason::Released),
            Some(_) => Action::Update,
            None if r.is_deleting() => Action::Finalize,
            None => Action::Add,
        },
        Notification::Deleted(_) => Action::Purge,
        Notification::Bookmark { .. } => Action::Bookmark,
        Notification::Other { .. } => Action::Unexpected,
    }
}
