use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use steward_controller::{handler_fn, open_cache, CallbackKind, Callbacks, CancellationToken, HandlerContext, OperatorConfig, ReconciliationLoop};
use steward_core::{EventRecord, ResourceType, WatchedResource};
use steward_kubehub::{KubeEventSink, KubeResourceClient};
use steward_persist::{SqliteVersionCache, VersionCache};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "stewardctl", version, about = "Steward operator runner and cache tools")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Directory holding the version cache files
    #[arg(long = "persistence-location", global = true, env = "STEWARD_PERSISTENCE_LOCATION")]
    persistence_location: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json, Yaml }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch a custom resource type and log add/update/delete until interrupted
    Run {
        /// Resource key, e.g. "example.com/v1alpha1/projects"
        resource: String,
        /// Watch a single namespace (default: all)
        #[arg(long = "ns", env = "STEWARD_NAMESPACE")]
        namespace: Option<String>,
        /// Seconds to wait before reopening a closed watch
        #[arg(long = "sleep-secs", env = "STEWARD_SLEEP_SECS")]
        sleep_secs: Option<u64>,
        /// Log skipped notifications at info
        #[arg(long = "show-skip-events", action = ArgAction::SetTrue)]
        show_skip_events: bool,
        /// Record a Kubernetes event for every add and update
        #[arg(long = "events", action = ArgAction::SetTrue)]
        events: bool,
    },
    /// Inspect or reset the version cache of a resource type
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCommands {
    /// List recorded uid -> resourceVersion entries
    Ls { resource: String },
    /// Forget one uid, or every uid when none is given
    Purge { resource: String, uid: Option<String> },
}

fn init_tracing() {
    let env = std::env::var("STEWARD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("STEWARD_LOG_FORMAT").map(|v| v.eq_ignore_ascii_case("json")).unwrap_or(false);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).with_target(true).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
    }
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STEWARD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid STEWARD_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancel `token` on the first ctrl-c.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received; stopping"),
            Err(e) => warn!(error = %e, "cannot listen for ctrl-c; stopping"),
        }
        token.cancel();
    });
}

fn event_callbacks() -> Callbacks {
    Callbacks::new().on_upsert(handler_fn(|r: WatchedResource, ctx: HandlerContext| async move {
        let reason = match ctx.kind {
            CallbackKind::Add => "Added",
            _ => "Updated",
        };
        let message = format!("{} observed at resourceVersion {}", r.name, r.resource_version);
        ctx.events.add(&r, EventRecord::normal(message).reason(reason)).await;
        Ok(None)
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut config = OperatorConfig::from_env();
    if let Some(dir) = cli.persistence_location.clone() {
        config.persistence_location = dir;
    }

    match cli.command {
        Commands::Run { resource, namespace, sleep_secs, show_skip_events, events } => {
            let ty = ResourceType::parse(&resource)?;
            if namespace.is_some() {
                config.namespace = namespace;
            }
            if let Some(secs) = sleep_secs {
                config.sleep_timer = Duration::from_secs(secs);
            }
            config.show_skip_events |= show_skip_events;

            let client = KubeResourceClient::try_default().await.context("connecting to the cluster")?;
            let component = config.component.clone().unwrap_or_else(|| ty.controller_name());
            let sink = Arc::new(KubeEventSink::new(client.client(), component));
            let client = Arc::new(client.with_watch_timeout(config.watch_timeout_secs));
            let cache = open_cache(&config, &ty)?;
            let callbacks = if events { event_callbacks() } else { Callbacks::new() };

            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let mut lp = ReconciliationLoop::new(ty, config, client, sink, cache, callbacks);
            lp.run(cancel).await;
        }
        Commands::Cache { command } => match command {
            CacheCommands::Ls { resource } => {
                let ty = ResourceType::parse(&resource)?;
                let cache = SqliteVersionCache::open_for(&config.persistence_location, &ty)?;
                let entries = cache.entries()?;
                match cli.output {
                    Output::Human => {
                        println!("{:<38} {:<16} AGE", "UID", "VERSION");
                        for e in entries {
                            println!("{:<38} {:<16} {}", e.uid, e.resource_version, render_age(e.ts));
                        }
                    }
                    Output::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
                    Output::Yaml => print!("{}", serde_yaml::to_string(&entries)?),
                }
            }
            CacheCommands::Purge { resource, uid } => {
                let ty = ResourceType::parse(&resource)?;
                let cache = SqliteVersionCache::open_for(&config.persistence_location, &ty)?;
                let removed = match uid {
                    Some(uid) => {
                        let present = cache.get(&uid)?.is_some();
                        cache.remove(&uid)?;
                        usize::from(present)
                    }
                    None => cache.clear()?,
                };
                info!(resource = %ty, removed, path = %cache.path().display(), "cache purged");
                match cli.output {
                    Output::Human => println!("removed {} entr{}", removed, if removed == 1 { "y" } else { "ies" }),
                    Output::Json => println!("{}", serde_json::json!({ "removed": removed })),
                    Output::Yaml => print!("{}", serde_yaml::to_string(&serde_json::json!({ "removed": removed }))?),
                }
            }
        },
    }

    Ok(())
}

fn render_age(ts: i64) -> String {
    if ts <= 0 { return "-".to_string(); }
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
    let mut secs = (now - ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_parse_with_defaults() {
        let cli = Cli::try_parse_from(["stewardctl", "run", "example.com/v1alpha1/projects", "--ns", "team-a"]).unwrap();
        match cli.command {
            Commands::Run { resource, namespace, sleep_secs, show_skip_events, events } => {
                assert_eq!(resource, "example.com/v1alpha1/projects");
                assert_eq!(namespace.as_deref(), Some("team-a"));
                assert_eq!(sleep_secs, None);
                assert!(!show_skip_events);
                assert!(!events);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.output, Output::Human);
    }

    #[test]
    fn cache_purge_takes_optional_uid() {
        let cli = Cli::try_parse_from(["stewardctl", "-o", "yaml", "cache", "purge", "v1/configmaps"]).unwrap();
        assert_eq!(cli.output, Output::Yaml);
        assert!(matches!(cli.command, Commands::Cache { command: CacheCommands::Purge { uid: None, .. } }));
    }

    #[test]
    fn age_rendering() {
        assert_eq!(render_age(0), "-");
        let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_secs() as i64;
        assert_eq!(render_age(now - 3 * 3600 - 120), "3h2m");
    }
}
