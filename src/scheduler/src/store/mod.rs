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

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use config::{HeaderConf, RetryConf, WebhookConf};
use serde::{Deserialize, Serialize};

use crate::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Scheduled,
    Locked,
    Delivered,
    Error,
    Dead,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Scheduled => "scheduled",
            EventStatus::Locked => "locked",
            EventStatus::Delivered => "delivered",
            EventStatus::Error => "error",
            EventStatus::Dead => "dead",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Cron,
    OneOff,
}

/// One row returned by `fetch_deprived_stats`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TriggerStats {
    pub trigger_name: String,
    pub upcoming_events_count: i64,
    pub max_scheduled_time: Option<DateTime<Utc>>,
}

/// A single `(trigger_name, scheduled_time)` seed row for `insert_cron_seeds`.
#[derive(Debug, Clone)]
pub struct CronSeed {
    pub trigger_name: String,
    pub scheduled_time: DateTime<Utc>,
}

/// The partial cron row returned by `lock_due_cron_events` — the columns
/// shared with the catalog (webhook, payload, retry/header config) are not
/// stored per-row and must be joined against the catalog snapshot by the
/// caller.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CronEventPartial {
    pub id: String,
    pub trigger_name: String,
    pub scheduled_time: DateTime<Utc>,
    pub tries: i32,
    pub created_at: DateTime<Utc>,
}

/// The fully self-describing one-off row returned by `lock_due_oneoff_events`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OneOffScheduledEventRow {
    pub id: String,
    pub scheduled_time: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub tries: i32,
    pub created_at: DateTime<Utc>,
    pub webhook_conf: sqlx::types::Json<WebhookConf>,
    pub payload: Option<serde_json::Value>,
    pub retry_conf: sqlx::types::Json<RetryConf>,
    pub header_conf: sqlx::types::Json<Vec<HeaderConf>>,
    pub comment: Option<String>,
}

/// Application-facing view of a one-off row, with the `jsonb` columns
/// unwrapped from `sqlx::types::Json`.
#[derive(Debug, Clone)]
pub struct OneOffScheduledEvent {
    pub id: String,
    pub scheduled_time: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub tries: i32,
    pub created_at: DateTime<Utc>,
    pub webhook_conf: WebhookConf,
    pub payload: Option<serde_json::Value>,
    pub retry_conf: RetryConf,
    pub header_conf: Vec<HeaderConf>,
    pub comment: Option<String>,
}

impl From<OneOffScheduledEventRow> for OneOffScheduledEvent {
    fn from(row: OneOffScheduledEventRow) -> Self {
        Self {
            id: row.id,
            scheduled_time: row.scheduled_time,
            next_retry_at: row.next_retry_at,
            tries: row.tries,
            created_at: row.created_at,
            webhook_conf: row.webhook_conf.0,
            payload: row.payload,
            retry_conf: row.retry_conf.0,
            header_conf: row.header_conf.0,
            comment: row.comment,
        }
    }
}

/// The fully joined view the delivery subroutine operates on, whether the
/// event originated as a cron occurrence or a one-off.
#[derive(Debug, Clone)]
pub struct ScheduledEventFull {
    pub id: String,
    pub trigger_name: Option<String>,
    pub scheduled_time: DateTime<Utc>,
    pub tries: i32,
    pub created_at: DateTime<Utc>,
    pub webhook_conf: WebhookConf,
    pub payload: Option<serde_json::Value>,
    pub retry_conf: RetryConf,
    pub header_conf: Vec<HeaderConf>,
    pub comment: Option<String>,
}

/// What to store for a single HTTP attempt outcome (SPEC_FULL.md §6,
/// "Invocation record shape").
#[derive(Debug, Clone)]
pub struct Invocation {
    pub event_id: String,
    pub status: i32,
    pub request: serde_json::Value,
    pub response: serde_json::Value,
}

#[async_trait]
pub trait EventStoreGateway: Send + Sync + 'static {
    async fn create_tables(&self) -> Result<()>;

    // Generator
    async fn fetch_deprived_stats(
        &self,
        trigger_names: &[String],
        buffer_threshold: i64,
    ) -> Result<Vec<TriggerStats>>;
    async fn insert_cron_seeds(&self, seeds: &[CronSeed]) -> Result<()>;

    // Processor
    async fn lock_due_cron_events(&self, limit: i64) -> Result<Vec<CronEventPartial>>;
    async fn lock_due_oneoff_events(&self, limit: i64) -> Result<Vec<OneOffScheduledEvent>>;
    async fn insert_invocation(&self, invocation: &Invocation, class: EventClass) -> Result<()>;
    async fn set_status(&self, id: &str, status: EventStatus, class: EventClass) -> Result<()>;
    async fn set_retry(
        &self,
        id: &str,
        retry_time: DateTime<Utc>,
        class: EventClass,
    ) -> Result<()>;

    // Shutdown / startup
    async fn unlock_cron(&self, ids: &[String]) -> Result<u64>;
    async fn unlock_oneoff(&self, ids: &[String]) -> Result<u64>;
    async fn unlock_all_locked(&self) -> Result<()>;
}
