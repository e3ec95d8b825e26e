mod booking;
mod cache;
mod clock;
mod config;
mod db;
mod errors;
mod events;
mod lifecycle;
mod notify;
mod resources;
mod sockets;
mod webhooks;


use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cache::KeyedCache;
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::db::Database;
use crate::events::EventBus;
use crate::sockets::SocketHub;
use crate::webhooks::dispatcher::WebhookDispatcher;

/// Shared handles threaded through every component.
///
/// Cloning is cheap — all fields share their underlying state via Arc.
#[derive(Clone)]
pub struct Core {
    pub config: AppConfig,
    pub db: Database,
    pub clock: Clock,
    pub bus: EventBus,
    pub hub: SocketHub,
    pub cache: KeyedCache,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (not required)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reserver_engine=info".into()),
        )
        .init();

    info!("Starting Reserver Engine v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::from_env()?;
    info!(database_url = %config.database_url, "Configuration loaded");

    // Initialize database
    let db = Database::connect(&config.database_url).await?;
    db.migrate().await?;
    info!("Database initialized");

    let clock = Clock::system();
    let bus = EventBus::new(clock.clone());
    let hub = SocketHub::new();
    let cache = KeyedCache::new(Duration::from_secs(60));

    // Build shared state
    let core = Core {
        config: config.clone(),
        db: db.clone(),
        clock: clock.clone(),
        bus: bus.clone(),
        hub,
        cache,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // In-app notification + socket push subscriber
    let notifier = notify::spawn_subscriber(core.clone(), shutdown_rx.clone());

    // Webhook fan-out: subscriber, worker pool, retry sweeper
    let (dispatcher, jobs_rx) = WebhookDispatcher::new(db, clock, config);
    let mut background = dispatcher.spawn_workers(jobs_rx, shutdown_rx.clone());
    background.push(dispatcher.spawn_subscriber(&bus, shutdown_rx.clone()));
    background.push(dispatcher.spawn_sweeper(shutdown_rx.clone()));

    // Lifecycle scheduler (expiry, offers, auto-reset, reminders)
    let scheduler = lifecycle::spawn(core.clone(), shutdown_rx);

    info!("Reservation engine running");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining background tasks");

    shutdown_tx.send(true).ok();
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        let _ = scheduler.await;
        let _ = notifier.await;
        for task in background {
            let _ = task.await;
        }
    })
    .await;
    if drained.is_err() {
        warn!("Timed out waiting for background tasks to drain");
    }

    info!("Shutdown complete");
    Ok(())
}
