// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! karsidecar: actor registry, router, progress tracker, and bus driver for
//! a distributed actor-sidecar runtime.

pub mod actor;
pub mod admission;
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod kv;
pub mod progress;
pub mod registry;
pub mod router;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bus::kafka::KafkaBus;
use crate::bus::BusDriver;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::kv::redis_store::RedisKv;
use crate::kv::KvStore;
use crate::progress::ProgressTracker;
use crate::registry::ActorRegistry;
use crate::router::Router;

/// Idle actors are swept this often.
const COLLECT_INTERVAL: Duration = Duration::from_secs(30);

/// Run the sidecar until `shutdown` is cancelled (e.g. by a signal handler
/// the caller installs) or a fatal startup error occurs.
pub async fn run(mut config: Config) -> anyhow::Result<()> {
    config.resolve()?;
    let shutdown = CancellationToken::new();

    let host = config.kv_host.as_deref().unwrap_or("localhost");
    let port = config.kv_port.unwrap_or(6379);
    let kv: Arc<dyn KvStore> =
        Arc::new(RedisKv::connect(host, port, config.kv_password.as_deref(), config.kv_enable_tls).await?);

    let registry = Arc::new(ActorRegistry::new(Arc::clone(&kv), config.id.clone(), config.actor_timeout()));
    let progress = Arc::new(
        ProgressTracker::new(Arc::clone(&kv), config.id.clone(), config.service.clone())
            .with_retention(config.progress_retain()),
    );
    let router = Arc::new(Router::new(Arc::clone(&kv)));

    let bus = Arc::new(KafkaBus::new(
        &config.bus_brokers,
        &config.app,
        &config.service,
        &config.id,
        config.bus_username.as_deref(),
        config.bus_password.as_deref(),
        config.bus_enable_tls,
        Arc::clone(&kv),
    )?);
    bus.ensure_topic().await?;

    let (forwarded_tx, forwarded_rx) = tokio::sync::mpsc::channel(256);
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&progress),
        Arc::clone(&bus),
        Arc::clone(&router),
        config.id.clone(),
        config.service_port,
    ));

    tracing::info!(app = %config.app, service = %config.service, id = %config.id, "karsidecar starting");

    let bus_task = {
        let bus = Arc::clone(&bus);
        let progress = Arc::clone(&progress);
        let router = Arc::clone(&router);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { bus.run(progress, router, forwarded_tx, shutdown).await })
    };

    let dispatch_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatcher.run(forwarded_rx, shutdown).await })
    };

    let collect_task = {
        let registry = Arc::clone(&registry);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { run_idle_sweep(registry, shutdown).await })
    };

    shutdown.cancelled().await;
    dispatch_task.await?;
    collect_task.await?;
    bus_task.await??;
    Ok(())
}

async fn run_idle_sweep(registry: Arc<ActorRegistry>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(COLLECT_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let before = std::time::Instant::now() - COLLECT_INTERVAL;
                registry.collect(before, &shutdown, |actor| async move {
                    tracing::debug!(%actor, "deactivating idle actor");
                    true
                }).await;
            }
        }
    }
}
