//! Operator configuration: defaults, overridable from `STEWARD_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use steward_core::VersionOrdering;
use tracing::warn;

pub const ENV_SLEEP_SECS: &str = "STEWARD_SLEEP_SECS";
pub const ENV_NAMESPACE: &str = "STEWARD_NAMESPACE";
pub const ENV_SHOW_SKIP_EVENTS: &str = "STEWARD_SHOW_SKIP_EVENTS";
pub const ENV_PERSISTENCE_LOCATION: &str = "STEWARD_PERSISTENCE_LOCATION";
pub const ENV_WATCH_TIMEOUT_SECS: &str = "STEWARD_WATCH_TIMEOUT_SECS";
pub const ENV_VERSION_ORDERING: &str = "STEWARD_VERSION_ORDERING";
pub const ENV_COMPONENT: &str = "STEWARD_COMPONENT";

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Pause between a watch session ending and the next one opening.
    pub sleep_timer: Duration,
    /// Restrict the watch to one namespace; `None` watches all.
    pub namespace: Option<String>,
    /// Log no-op notifications at info instead of debug.
    pub show_skip_events: bool,
    /// Directory holding one version cache file per resource type.
    pub persistence_location: PathBuf,
    /// Server-side watch timeout; the stream closes cleanly after it.
    pub watch_timeout_secs: u32,
    pub version_ordering: VersionOrdering,
    /// Event component; the resource type's controller name when unset.
    pub component: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            sleep_timer: Duration::from_secs(10),
            namespace: None,
            show_skip_events: false,
            persistence_location: PathBuf::from(steward_persist::DEFAULT_LOCATION),
            watch_timeout_secs: 290,
            version_ordering: VersionOrdering::default(),
            component: None,
        }
    }
}

fn truthy(v: &str) -> bool {
    v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes")
}

impl OperatorConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary variable lookup; unparsable values keep the default.
    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(v) = get(ENV_SLEEP_SECS) {
            match v.parse::<u64>() {
                Ok(secs) => cfg.sleep_timer = Duration::from_secs(secs),
                Err(_) => warn!(value = %v, "invalid {}; using default", ENV_SLEEP_SECS),
            }
        }
        cfg.namespace = get(ENV_NAMESPACE).filter(|s| !s.is_empty());
        cfg.show_skip_events = get(ENV_SHOW_SKIP_EVENTS).map(|v| truthy(&v)).unwrap_or(false);
        if let Some(dir) = get(ENV_PERSISTENCE_LOCATION).filter(|s| !s.is_empty()) {
            cfg.persistence_location = PathBuf::from(dir);
        }
        if let Some(v) = get(ENV_WATCH_TIMEOUT_SECS) {
            match v.parse::<u32>() {
                Ok(secs) => cfg.watch_timeout_secs = secs,
                Err(_) => warn!(value = %v, "invalid {}; using default", ENV_WATCH_TIMEOUT_SECS),
            }
        }
        if let Some(v) = get(ENV_VERSION_ORDERING) {
            match v.parse::<VersionOrdering>() {
                Ok(o) => cfg.version_ordering = o,
                Err(e) => warn!(error = %e, "invalid {}; using default", ENV_VERSION_ORDERING),
            }
        }
        cfg.component = get(ENV_COMPONENT).filter(|s| !s.is_empty());
        cfg
    }
}
