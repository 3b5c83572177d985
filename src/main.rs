// Copyright 2024 Zinc Labs Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::sync::Arc;

use config::{TriggerCatalog, CONFIG};
use scheduler::{
    run_generator, run_processor, unlock_in_flight, EventStoreGateway, LockedEventsCtx, PostgresGateway,
    ShutdownSignal,
};
use sqlx::postgres::PgPoolOptions;
use tokio::signal::unix::{signal, SignalKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = &*CONFIG;
    log::info!("[STARTUP] connecting to database");
    let pool = PgPoolOptions::new()
        .min_connections(cfg.sql_min_db_connections)
        .max_connections(cfg.sql_max_db_connections)
        .connect(&cfg.database_url)
        .await?;

    let gateway = Arc::new(PostgresGateway::new(pool));
    gateway.create_tables().await?;
    gateway.unlock_all_locked().await?;
    log::info!("[STARTUP] schema ready, reset any stale locked rows");

    let catalog = Arc::new(TriggerCatalog::load(&cfg.catalog_path)?);
    log::info!(
        "[STARTUP] loaded trigger catalog from {} ({} trigger(s))",
        cfg.catalog_path,
        catalog.snapshot().len()
    );

    let registry = Arc::new(LockedEventsCtx::new());
    let http_client = build_http_client()?;
    let shutdown = Arc::new(ShutdownSignal::new());

    let generator_handle = tokio::spawn(run_generator(
        gateway.clone(),
        catalog.clone(),
        cfg.generator_interval_seconds,
        cfg.scheduler_buffer_threshold,
        cfg.scheduler_seed_horizon as usize,
        shutdown.clone(),
    ));

    let processor_handle = tokio::spawn(run_processor(
        gateway.clone(),
        catalog.clone(),
        registry.clone(),
        http_client,
        Arc::new(cfg.default_headers.clone()),
        cfg.processor_interval_seconds,
        cfg.processor_concurrency as i64,
        cfg.processor_concurrency,
        shutdown.clone(),
    ));

    wait_for_shutdown_signal().await;
    log::info!("[SHUTDOWN] signal received, waiting for in-flight work to stop");

    shutdown.trigger();
    if let Err(err) = generator_handle.await {
        log::error!("[SHUTDOWN] generator task panicked: {err}");
    }
    if let Err(err) = processor_handle.await {
        log::error!("[SHUTDOWN] processor task panicked: {err}");
    }
    unlock_in_flight(&gateway, &registry).await;

    log::info!("[SHUTDOWN] complete");
    Ok(())
}

/// A single shared client for all outbound webhook calls, built once at
/// startup (SPEC_FULL.md §9.5).
fn build_http_client() -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(concat!("hdb-scheduler/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// Waits for either SIGINT or SIGTERM. `main` then triggers `ShutdownSignal`
/// and awaits both loop tasks so in-flight work stops cooperatively before
/// `unlock_in_flight` runs (SPEC_FULL.md §5 "Cancellation").
async fn wait_for_shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            log::error!("[SHUTDOWN] failed installing SIGTERM handler: {err}");
            std::future::pending::<()>().await;
            unreachable!()
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
