use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use steward_controller::{handler_fn, open_cache, Callbacks, CancellationToken, HandlerContext, HandlerResult, OperatorConfig, ReconciliationLoop};
use steward_core::prelude::*;
use steward_kubehub::{KubeEventSink, KubeResourceClient};
use tracing::{info, warn};

fn init_tracing() {
    let env = std::env::var("STEWARD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn sample_name(obj: &WatchedResource) -> &str {
    obj.spec().and_then(|s| s.get("sampleName")).and_then(|v| v.as_str()).unwrap_or("<unnamed>")
}

async fn upsert(obj: WatchedResource, ctx: HandlerContext) -> HandlerResult {
    info!(name = sample_name(&obj), "create new fancy sample");
    ctx.events.add(&obj, EventRecord::normal("fancy sample event")).await;
    Ok(Some(StatusPatch(serde_json::json!({ "message": "upsert works fine" }))))
}

async fn delete(obj: WatchedResource, _ctx: HandlerContext) -> HandlerResult {
    info!(name = sample_name(&obj), "delete fancy sample");
    Ok(None)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let ty = ResourceType::new("example.com", "v1alpha1", "projects");
    let config = OperatorConfig::from_env();

    let client = KubeResourceClient::try_default().await?;
    let component = config.component.clone().unwrap_or_else(|| ty.controller_name());
    let events = Arc::new(KubeEventSink::new(client.client(), component));
    let client = Arc::new(client.with_watch_timeout(config.watch_timeout_secs));
    let cache = open_cache(&config, &ty)?;
    let callbacks = Callbacks::new().on_upsert(handler_fn(upsert)).on_delete(handler_fn(delete));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("interrupt received; stopping"),
                Err(e) => warn!(error = %e, "cannot listen for ctrl-c; stopping"),
            }
            cancel.cancel();
        }
    });
    ReconciliationLoop::new(ty, config, client, events, cache, callbacks).run(cancel).await;
    Ok(())
}
