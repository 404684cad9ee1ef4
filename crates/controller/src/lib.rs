//! Steward controller: drives watched custom resources through user callbacks.
//!
//! A [`ReconciliationLoop`] owns one watch over one resource type. For every
//! notification it consults the version ledger, decides between add, update,
//! finalize, purge or skip, calls the matching handler exactly once and then
//! records what it processed, so redeliveries, reconnects and restarts do not
//! re-run handlers for versions already handled.

#![forbid(unsafe_code)]

use anyhow::Result;
use steward_core::ResourceType;
use steward_persist::{SqliteVersionCache, VersionCache};

pub mod classify;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod finalizer;
pub mod ledger;
pub mod reconcile;

pub use classify::{classify, Action, SkipReason};
pub use config::OperatorConfig;
pub use dispatch::{handler_fn, CallbackDispatcher, CallbackKind, Callbacks, Handler, HandlerContext, HandlerResult, LogHandler};
pub use error::ReconcileError;
pub use finalizer::FinalizerManager;
pub use ledger::VersionLedger;
pub use reconcile::{Outcome, ReconciliationLoop, SessionEnd};
pub use tokio_util::sync::CancellationToken;

/// Open the durable version cache for `ty` under the configured persistence location.
pub fn open_cache(config: &OperatorConfig, ty: &ResourceType) -> Result<Box<dyn VersionCache>> {
    Ok(Box::new(SqliteVersionCache::open_for(&config.persistence_location, ty)?))
}
