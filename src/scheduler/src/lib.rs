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

pub mod calculator;
pub mod delivery;
pub mod errors;
pub mod generator;
pub mod processor;
pub mod registry;
pub mod shutdown;
pub mod store;

pub use errors::{Error, Result};
pub use generator::run_generator;
pub use processor::run_processor;
pub use registry::LockedEventsCtx;
pub use shutdown::ShutdownSignal;
pub use store::{postgres::PostgresGateway, EventStoreGateway};

use std::sync::Arc;

/// Snapshots the Locked-Event Registry and returns every row it names to
/// `scheduled`, regardless of which phase locked it. Called once on
/// graceful shutdown (SPEC_FULL.md §5 "Cancellation") and once at startup
/// before the main loops begin, covering crash recovery via
/// `EventStoreGateway::unlock_all_locked`.
pub async fn unlock_in_flight<G: EventStoreGateway>(
    store: &Arc<G>,
    registry: &Arc<LockedEventsCtx>,
) {
    let cron_ids = registry.cron_snapshot();
    if !cron_ids.is_empty() {
        match store.unlock_cron(&cron_ids).await {
            Ok(n) => log::info!("[SHUTDOWN] unlocked {n} in-flight cron event(s)"),
            Err(err) => log::error!("[SHUTDOWN] failed unlocking cron events: {err}"),
        }
    }

    let oneoff_ids = registry.oneoff_snapshot();
    if !oneoff_ids.is_empty() {
        match store.unlock_oneoff(&oneoff_ids).await {
            Ok(n) => log::info!("[SHUTDOWN] unlocked {n} in-flight one-off event(s)"),
            Err(err) => log::error!("[SHUTDOWN] failed unlocking one-off events: {err}"),
        }
    }
}
