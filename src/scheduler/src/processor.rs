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
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};

use crate::delivery::{classify, deliver, is_dead_on_arrival, to_invocation, Outcome};
use crate::registry::{EventClass as RegistryClass, LockedEventsCtx};
use crate::shutdown::ShutdownSignal;
use crate::store::{EventClass as StoreClass, EventStatus, EventStoreGateway, ScheduledEventFull};

/// Whether a locked row reached a terminal/retry write this attempt (and so
/// should leave the Locked-Event Registry) or was left `locked` — a missing
/// trigger definition, a webhook/header resolution failure, or a shutdown
/// interrupting the attempt before any DB write — in which case the id must
/// stay registered so the shutdown hook (or, on an ungraceful exit,
/// `unlock_all_locked` at next startup) can still reclaim it.
enum ProcessOutcome {
    Done,
    LeftLocked,
}

/// Runs the Processor loop forever: each tick locks a batch of due cron and
/// one-off events, delivers them with bounded concurrency, and advances each
/// event's state machine (SPEC_FULL.md §4.5). The loop itself cooperates with
/// `shutdown` rather than being torn down by `JoinHandle::abort`: it exits
/// between ticks, and `deliver`/`process_one` check the same signal before
/// each DB write so an in-flight attempt never races `unlock_in_flight`.
pub async fn run_processor<G: EventStoreGateway>(
    store: Arc<G>,
    catalog: Arc<TriggerCatalog>,
    registry: Arc<LockedEventsCtx>,
    client: Client,
    default_headers: Arc<Vec<(String, String)>>,
    interval_seconds: u64,
    lock_batch_size: i64,
    concurrency: usize,
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
        process_cron_phase(
            &store,
            &catalog,
            &registry,
            &client,
            &default_headers,
            lock_batch_size,
            concurrency,
            &shutdown,
        )
        .await;
        process_oneoff_phase(
            &store,
            &registry,
            &client,
            &default_headers,
            lock_batch_size,
            concurrency,
            &shutdown,
        )
        .await;
    }
    log::info!("[PROCESSOR] shutdown signal received, loop stopped");
}

async fn process_cron_phase<G: EventStoreGateway>(
    store: &Arc<G>,
    catalog: &Arc<TriggerCatalog>,
    registry: &Arc<LockedEventsCtx>,
    client: &Client,
    default_headers: &Arc<Vec<(String, String)>>,
    limit: i64,
    concurrency: usize,
    shutdown: &Arc<ShutdownSignal>,
) {
    let locked = match store.lock_due_cron_events(limit).await {
        Ok(rows) => rows,
        Err(err) => {
            log::error!("[PROCESSOR] failed locking due cron events: {err}");
            return;
        }
    };
    if locked.is_empty() {
        return;
    }

    let ids: Vec<String> = locked.iter().map(|row| row.id.clone()).collect();
    registry.insert_many(&RegistryClass::Cron, ids);

    let snapshot = catalog.snapshot();
    stream::iter(locked)
        .for_each_concurrent(concurrency, |row| {
            let store = store.clone();
            let registry = registry.clone();
            let client = client.clone();
            let snapshot = snapshot.clone();
            let default_headers = default_headers.clone();
            let shutdown = shutdown.clone();
            async move {
                let Some(def) = snapshot.get(&row.trigger_name) else {
                    log::warn!(
                        "[PROCESSOR] trigger `{}` missing from catalog, leaving event `{}` locked",
                        row.trigger_name,
                        row.id
                    );
                    // Left locked and registered: recovered by a graceful
                    // shutdown's unlock pass or `unlock_all_locked` on restart
                    // (SPEC_FULL.md §4.5 Phase A step 3).
                    return;
                };

                let full = ScheduledEventFull {
                    id: row.id.clone(),
                    trigger_name: Some(row.trigger_name.clone()),
                    scheduled_time: row.scheduled_time,
                    tries: row.tries,
                    created_at: row.created_at,
                    webhook_conf: def.webhook_conf.clone(),
                    payload: def.payload.clone(),
                    retry_conf: def.retry_conf.clone(),
                    header_conf: def.header_conf.clone(),
                    comment: def.comment.clone(),
                };

                if let ProcessOutcome::Done =
                    process_one(&*store, &full, &client, &default_headers, StoreClass::Cron, &shutdown).await
                {
                    registry.remove(&RegistryClass::Cron, &row.id);
                }
            }
        })
        .await;
}

async fn process_oneoff_phase<G: EventStoreGateway>(
    store: &Arc<G>,
    registry: &Arc<LockedEventsCtx>,
    client: &Client,
    default_headers: &Arc<Vec<(String, String)>>,
    limit: i64,
    concurrency: usize,
    shutdown: &Arc<ShutdownSignal>,
) {
    let locked = match store.lock_due_oneoff_events(limit).await {
        Ok(rows) => rows,
        Err(err) => {
            log::error!("[PROCESSOR] failed locking due one-off events: {err}");
            return;
        }
    };
    if locked.is_empty() {
        return;
    }

    let ids: Vec<String> = locked.iter().map(|row| row.id.clone()).collect();
    registry.insert_many(&RegistryClass::OneOff, ids);

    stream::iter(locked)
        .for_each_concurrent(concurrency, |row| {
            let store = store.clone();
            let registry = registry.clone();
            let client = client.clone();
            let default_headers = default_headers.clone();
            let shutdown = shutdown.clone();
            async move {
                let full = ScheduledEventFull {
                    id: row.id.clone(),
                    trigger_name: None,
                    scheduled_time: row.scheduled_time,
                    tries: row.tries,
                    created_at: row.created_at,
                    webhook_conf: row.webhook_conf.clone(),
                    payload: row.payload.clone(),
                    retry_conf: row.retry_conf.clone(),
                    header_conf: row.header_conf.clone(),
                    comment: row.comment.clone(),
                };

                if let ProcessOutcome::Done =
                    process_one(&*store, &full, &client, &default_headers, StoreClass::OneOff, &shutdown).await
                {
                    registry.remove(&RegistryClass::OneOff, &row.id);
                }
            }
        })
        .await;
}

/// Builds the JSON request body sent to the webhook (SPEC_FULL.md §4.6
/// step 2): `name` is omitted for one-off events, `created_at` is included
/// only for one-off events, `comment` is omitted when absent.
fn build_request_body(event: &ScheduledEventFull) -> Value {
    let mut body = json!({
        "id": event.id,
        "scheduled_time": event.scheduled_time.to_rfc3339(),
        "payload": event.payload,
    });
    let map = body.as_object_mut().expect("object literal");
    if let Some(trigger_name) = &event.trigger_name {
        map.insert("name".to_string(), json!(trigger_name));
    } else {
        map.insert("created_at".to_string(), json!(event.created_at.to_rfc3339()));
    }
    if let Some(comment) = &event.comment {
        map.insert("comment".to_string(), json!(comment));
    }
    body
}

/// Delivers a single locked event and drives its state machine to
/// completion for this attempt: dead-on-arrival, delivered, a scheduled
/// retry, or exhausted-retries `error`.
async fn process_one<G: EventStoreGateway>(
    store: &G,
    event: &ScheduledEventFull,
    client: &Client,
    default_headers: &[(String, String)],
    class: StoreClass,
    shutdown: &ShutdownSignal,
) -> ProcessOutcome {
    let now = Utc::now();

    if is_dead_on_arrival(event.scheduled_time, event.retry_conf.tolerance_seconds, now) {
        if let Err(err) = store.set_status(&event.id, EventStatus::Dead, class).await {
            log::error!("[PROCESSOR] failed marking event `{}` dead on arrival: {err}", event.id);
        }
        return ProcessOutcome::Done;
    }

    let request_body = build_request_body(event);
    let attempt = match deliver(
        client,
        &event.webhook_conf,
        &event.header_conf,
        default_headers,
        request_body,
        event.retry_conf.timeout_seconds,
        shutdown,
    )
    .await
    {
        Ok(Some(attempt)) => attempt,
        Ok(None) => {
            log::info!(
                "[PROCESSOR] shutdown interrupted delivery of event `{}`, leaving locked",
                event.id
            );
            return ProcessOutcome::LeftLocked;
        }
        Err(err) => {
            log::error!(
                "[PROCESSOR] could not resolve webhook/header config for event `{}`, leaving locked: {err}",
                event.id
            );
            return ProcessOutcome::LeftLocked;
        }
    };

    let invocation = to_invocation(event.id.clone(), &attempt);
    if let Err(err) = store.insert_invocation(&invocation, class).await {
        log::error!(
            "[PROCESSOR] failed recording invocation for event `{}`: {err}",
            event.id
        );
    }

    let tries = event.tries + 1;
    let outcome = classify(&attempt, tries, now, &event.retry_conf);

    let result = match outcome {
        Outcome::Delivered => store.set_status(&event.id, EventStatus::Delivered, class).await,
        Outcome::RetryAt(retry_time) => store.set_retry(&event.id, retry_time, class).await,
        Outcome::ExhaustedRetries => store.set_status(&event.id, EventStatus::Error, class).await,
    };
    if let Err(err) = result {
        log::error!(
            "[PROCESSOR] failed advancing state machine for event `{}`: {err}",
            event.id
        );
    }
    ProcessOutcome::Done
}

#[cfg(test)]
mod request_body_tests {
    use chrono::TimeZone;
    use config::{RetryConf, WebhookConf};

    use super::*;

    fn base_event() -> ScheduledEventFull {
        ScheduledEventFull {
            id: "evt-1".to_string(),
            trigger_name: None,
            scheduled_time: chrono::Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            tries: 0,
            created_at: chrono::Utc.with_ymd_and_hms(2025, 12, 31, 23, 0, 0).unwrap(),
            webhook_conf: WebhookConf::Value("https://example.com".to_string()),
            payload: Some(json!({"k": "v"})),
            retry_conf: RetryConf::default(),
            header_conf: vec![],
            comment: None,
        }
    }

    #[test]
    fn cron_event_includes_name_and_omits_created_at() {
        let mut event = base_event();
        event.trigger_name = Some("hourly".to_string());
        let body = build_request_body(&event);
        assert_eq!(body["name"], json!("hourly"));
        assert!(body.get("created_at").is_none());
    }

    #[test]
    fn oneoff_event_includes_created_at_and_omits_name() {
        let event = base_event();
        let body = build_request_body(&event);
        assert!(body.get("name").is_none());
        assert_eq!(body["created_at"], json!(event.created_at.to_rfc3339()));
    }

    #[test]
    fn comment_is_omitted_when_absent() {
        let event = base_event();
        let body = build_request_body(&event);
        assert!(body.get("comment").is_none());
    }

    #[test]
    fn comment_is_included_when_present() {
        let mut event = base_event();
        event.comment = Some("note".to_string());
        let body = build_request_body(&event);
        assert_eq!(body["comment"], json!("note"));
    }
}
