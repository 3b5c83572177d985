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
use std::time::Duration;

use chrono::Utc;
use config::TriggerCatalog;

use crate::calculator::upcoming;
use crate::shutdown::ShutdownSignal;
use crate::store::{CronSeed, EventStoreGateway};

/// Runs the Generator loop forever: on each tick, finds triggers whose
/// `scheduled` backlog has fallen below `buffer_threshold` and tops it back
/// up to `seed_horizon` occurrences (SPEC_FULL.md §4.4).
///
/// Paused triggers and triggers absent from the catalog are skipped with a
/// log line rather than treated as fatal — a generator replica must never
/// crash because one trigger definition is stale. The loop exits between
/// ticks once `shutdown` fires rather than being torn down by
/// `JoinHandle::abort` (SPEC_FULL.md §5 "Cancellation").
pub async fn run_generator<G: EventStoreGateway>(
    store: Arc<G>,
    catalog: Arc<TriggerCatalog>,
    interval_seconds: u64,
    buffer_threshold: i64,
    seed_horizon: usize,
    shutdown: Arc<ShutdownSignal>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => break,
        }
        if shutdown.is_triggered() {
            break;
        }
        if let Err(err) = tick(&*store, &catalog, buffer_threshold, seed_horizon).await {
            log::error!("[GENERATOR] tick failed: {err}");
        }
    }
    log::info!("[GENERATOR] shutdown signal received, loop stopped");
}

async fn tick<G: EventStoreGateway>(
    store: &G,
    catalog: &TriggerCatalog,
    buffer_threshold: i64,
    seed_horizon: usize,
) -> crate::errors::Result<()> {
    let snapshot = catalog.snapshot();
    let active_trigger_names: Vec<String> = snapshot
        .values()
        .filter(|def| !def.paused)
        .map(|def| def.name.clone())
        .collect();
    if active_trigger_names.is_empty() {
        return Ok(());
    }

    let stats = store
        .fetch_deprived_stats(&active_trigger_names, buffer_threshold)
        .await?;
    if stats.is_empty() {
        return Ok(());
    }

    for stat in stats {
        let Some(def) = snapshot.get(&stat.trigger_name) else {
            log::warn!(
                "[GENERATOR] trigger `{}` has deprived stats but is not in the catalog, skipping",
                stat.trigger_name
            );
            continue;
        };
        if def.paused {
            continue;
        }

        let start = stat.max_scheduled_time.unwrap_or_else(Utc::now);
        let seeds = match upcoming(start, seed_horizon, &def.schedule) {
            Ok(instants) => instants,
            Err(err) => {
                log::error!(
                    "[GENERATOR] trigger `{}` has an unparseable schedule `{}`: {err}",
                    def.name,
                    def.schedule
                );
                continue;
            }
        };
        if seeds.is_empty() {
            continue;
        }

        let cron_seeds: Vec<CronSeed> = seeds
            .into_iter()
            .map(|scheduled_time| CronSeed {
                trigger_name: def.name.clone(),
                scheduled_time,
            })
            .collect();
        store.insert_cron_seeds(&cron_seeds).await?;
        log::info!(
            "[GENERATOR] seeded {} occurrence(s) for trigger `{}`",
            cron_seeds.len(),
            def.name
        );
    }

    Ok(())
}
