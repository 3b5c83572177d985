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

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use super::{
    CronEventPartial, CronSeed, EventClass, EventStatus, EventStoreGateway, Invocation,
    OneOffScheduledEvent, OneOffScheduledEventRow, TriggerStats,
};
use crate::errors::Result;

pub struct PostgresGateway {
    pool: Pool<Postgres>,
}

impl PostgresGateway {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn event_table(class: EventClass) -> &'static str {
        match class {
            EventClass::Cron => "hdb_cron_events",
            EventClass::OneOff => "hdb_scheduled_events",
        }
    }

    fn invocation_table(class: EventClass) -> &'static str {
        match class {
            EventClass::Cron => "hdb_cron_event_invocation_logs",
            EventClass::OneOff => "hdb_scheduled_event_invocation_logs",
        }
    }
}

#[async_trait]
impl EventStoreGateway for PostgresGateway {
    /// Creates the scheduler tables and supporting indexes. Idempotent,
    /// matching the teacher's `create_table` / `create_table_index` split.
    async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS hdb_cron_events
(
    id              TEXT PRIMARY KEY,
    trigger_name    TEXT NOT NULL,
    scheduled_time  TIMESTAMPTZ NOT NULL,
    next_retry_at   TIMESTAMPTZ,
    tries           INT NOT NULL DEFAULT 0,
    status          TEXT NOT NULL DEFAULT 'scheduled',
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (trigger_name, scheduled_time)
);
"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS hdb_scheduled_events
(
    id              TEXT PRIMARY KEY,
    scheduled_time  TIMESTAMPTZ NOT NULL,
    next_retry_at   TIMESTAMPTZ,
    tries           INT NOT NULL DEFAULT 0,
    status          TEXT NOT NULL DEFAULT 'scheduled',
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    webhook_conf    JSONB NOT NULL,
    payload         JSONB,
    retry_conf      JSONB NOT NULL,
    header_conf     JSONB NOT NULL DEFAULT '[]',
    comment         TEXT
);
"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS hdb_cron_event_invocation_logs
(
    id         BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    event_id   TEXT NOT NULL,
    status     INT NOT NULL,
    request    JSONB NOT NULL,
    response   JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS hdb_scheduled_event_invocation_logs
(
    id         BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    event_id   TEXT NOT NULL,
    status     INT NOT NULL,
    request    JSONB NOT NULL,
    response   JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#,
        )
        .execute(&self.pool)
        .await?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS hdb_cron_events_trigger_status_idx ON hdb_cron_events (trigger_name, status);",
            "CREATE INDEX IF NOT EXISTS hdb_cron_events_due_idx ON hdb_cron_events (status, next_retry_at, scheduled_time);",
            "CREATE INDEX IF NOT EXISTS hdb_scheduled_events_due_idx ON hdb_scheduled_events (status, next_retry_at, scheduled_time);",
        ];
        for index in indexes {
            sqlx::query(index).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Returns one row per trigger whose `scheduled` backlog is below
    /// `buffer_threshold`. `trigger_names` is the full catalog trigger-name
    /// list (not just the ones already present in the table): a
    /// `LEFT JOIN` against `unnest($1::text[])` is required so a trigger
    /// with zero existing rows still surfaces as
    /// `(count=0, max_scheduled_time=NULL)` rather than being silently
    /// absent from the result — a plain `GROUP BY` over the table alone
    /// cannot invent a row for a `trigger_name` that never appears in it.
    async fn fetch_deprived_stats(
        &self,
        trigger_names: &[String],
        buffer_threshold: i64,
    ) -> Result<Vec<TriggerStats>> {
        if trigger_names.is_empty() {
            return Ok(vec![]);
        }
        let rows = sqlx::query_as::<_, TriggerStats>(
            r#"
SELECT t.trigger_name AS trigger_name,
       COUNT(e.id) FILTER (WHERE e.status = 'scheduled')::BIGINT AS upcoming_events_count,
       MAX(e.scheduled_time) AS max_scheduled_time
FROM unnest($1::text[]) AS t(trigger_name)
LEFT JOIN hdb_cron_events e ON e.trigger_name = t.trigger_name
GROUP BY t.trigger_name
HAVING COUNT(e.id) FILTER (WHERE e.status = 'scheduled') < $2;
"#,
        )
        .bind(trigger_names)
        .bind(buffer_threshold)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Bulk-inserts seeds; a `(trigger_name, scheduled_time)` conflict is a
    /// no-op, making re-hydration idempotent (invariant 4, SPEC_FULL.md §8).
    async fn insert_cron_seeds(&self, seeds: &[CronSeed]) -> Result<()> {
        if seeds.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for seed in seeds {
            sqlx::query(
                r#"
INSERT INTO hdb_cron_events (id, trigger_name, scheduled_time, tries, status)
VALUES ($1, $2, $3, 0, 'scheduled')
ON CONFLICT (trigger_name, scheduled_time) DO NOTHING;
"#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&seed.trigger_name)
            .bind(seed.scheduled_time)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Cross-replica mutual-exclusion primitive: selects due, unlocked rows,
    /// skip-locks concurrently-claimed ones, and flips them to `locked` in
    /// one statement.
    async fn lock_due_cron_events(&self, limit: i64) -> Result<Vec<CronEventPartial>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query_as::<_, CronEventPartial>(
            r#"
UPDATE hdb_cron_events
SET status = 'locked'
WHERE id IN (
    SELECT id FROM hdb_cron_events
    WHERE status = 'scheduled'
      AND (
          (next_retry_at IS NOT NULL AND next_retry_at <= $1)
          OR (next_retry_at IS NULL AND scheduled_time <= $1)
      )
    ORDER BY scheduled_time
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
RETURNING id, trigger_name, scheduled_time, tries, created_at;
"#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(rows)
    }

    async fn lock_due_oneoff_events(&self, limit: i64) -> Result<Vec<OneOffScheduledEvent>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query_as::<_, OneOffScheduledEventRow>(
            r#"
UPDATE hdb_scheduled_events
SET status = 'locked'
WHERE id IN (
    SELECT id FROM hdb_scheduled_events
    WHERE status = 'scheduled'
      AND (
          (next_retry_at IS NOT NULL AND next_retry_at <= $1)
          OR (next_retry_at IS NULL AND scheduled_time <= $1)
      )
    ORDER BY scheduled_time
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
RETURNING id, scheduled_time, next_retry_at, tries, created_at, webhook_conf, payload, retry_conf, header_conf, comment;
"#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Writes the invocation row and increments `tries` in a single
    /// transaction — required so a crash between the two writes can never
    /// leave `tries` out of sync with the logged attempt count.
    async fn insert_invocation(&self, invocation: &Invocation, class: EventClass) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let query = format!(
            "INSERT INTO {} (event_id, status, request, response) VALUES ($1, $2, $3, $4);",
            Self::invocation_table(class)
        );
        sqlx::query(&query)
            .bind(&invocation.event_id)
            .bind(invocation.status)
            .bind(&invocation.request)
            .bind(&invocation.response)
            .execute(&mut *tx)
            .await?;

        let update = format!(
            "UPDATE {} SET tries = tries + 1 WHERE id = $1;",
            Self::event_table(class)
        );
        sqlx::query(&update)
            .bind(&invocation.event_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_status(&self, id: &str, status: EventStatus, class: EventClass) -> Result<()> {
        let query = format!(
            "UPDATE {} SET status = $1 WHERE id = $2;",
            Self::event_table(class)
        );
        sqlx::query(&query)
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_retry(
        &self,
        id: &str,
        retry_time: DateTime<Utc>,
        class: EventClass,
    ) -> Result<()> {
        let query = format!(
            "UPDATE {} SET status = 'scheduled', next_retry_at = $1 WHERE id = $2;",
            Self::event_table(class)
        );
        sqlx::query(&query)
            .bind(retry_time)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn unlock_cron(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"UPDATE hdb_cron_events SET status = 'scheduled' WHERE id = ANY($1) AND status = 'locked';"#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn unlock_oneoff(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"UPDATE hdb_scheduled_events SET status = 'scheduled' WHERE id = ANY($1) AND status = 'locked';"#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Blanket crash-recovery reset, run once at startup before the main
    /// loops (SPEC_FULL.md §9 "Coordination via locked status").
    async fn unlock_all_locked(&self) -> Result<()> {
        sqlx::query(r#"UPDATE hdb_cron_events SET status = 'scheduled' WHERE status = 'locked';"#)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            r#"UPDATE hdb_scheduled_events SET status = 'scheduled' WHERE status = 'locked';"#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use config::{RetryConf, WebhookConf};

    use super::*;

    async fn setup(pool: Pool<Postgres>) -> PostgresGateway {
        let gw = PostgresGateway::new(pool);
        gw.create_tables().await.unwrap();
        gw
    }

    async fn seed_cron_event(gw: &PostgresGateway, trigger_name: &str, scheduled_time: DateTime<Utc>) -> String {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO hdb_cron_events (id, trigger_name, scheduled_time, tries, status) VALUES ($1, $2, $3, 0, 'scheduled')",
        )
        .bind(&id)
        .bind(trigger_name)
        .bind(scheduled_time)
        .execute(&gw.pool)
        .await
        .unwrap();
        id
    }

    #[sqlx::test]
    async fn lock_due_cron_events_only_returns_past_due_rows(pool: Pool<Postgres>) {
        let gw = setup(pool).await;
        let due_id = seed_cron_event(&gw, "hourly", Utc::now() - chrono::Duration::seconds(5)).await;
        seed_cron_event(&gw, "hourly", Utc::now() + chrono::Duration::hours(1)).await;

        let locked = gw.lock_due_cron_events(10).await.unwrap();
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].id, due_id);
    }

    #[sqlx::test]
    async fn insert_cron_seeds_is_idempotent(pool: Pool<Postgres>) {
        let gw = setup(pool).await;
        let ts = Utc::now() + chrono::Duration::hours(1);
        let seeds = vec![CronSeed {
            trigger_name: "hourly".to_string(),
            scheduled_time: ts,
        }];
        gw.insert_cron_seeds(&seeds).await.unwrap();
        gw.insert_cron_seeds(&seeds).await.unwrap();

        let stats = gw
            .fetch_deprived_stats(&["hourly".to_string()], 1000)
            .await
            .unwrap();
        let hourly = stats.iter().find(|s| s.trigger_name == "hourly").unwrap();
        assert_eq!(hourly.upcoming_events_count, 1);
    }

    #[sqlx::test]
    async fn fetch_deprived_stats_surfaces_triggers_with_zero_rows(pool: Pool<Postgres>) {
        let gw = setup(pool).await;

        let stats = gw
            .fetch_deprived_stats(&["brand-new".to_string()], 100)
            .await
            .unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].trigger_name, "brand-new");
        assert_eq!(stats[0].upcoming_events_count, 0);
        assert!(stats[0].max_scheduled_time.is_none());
    }

    #[sqlx::test]
    async fn fetch_deprived_stats_excludes_triggers_at_or_above_threshold(pool: Pool<Postgres>) {
        let gw = setup(pool).await;
        seed_cron_event(&gw, "hourly", Utc::now() + chrono::Duration::hours(1)).await;

        let stats = gw
            .fetch_deprived_stats(&["hourly".to_string()], 1)
            .await
            .unwrap();
        assert!(stats.is_empty());
    }

    #[sqlx::test]
    async fn set_retry_returns_event_to_scheduled(pool: Pool<Postgres>) {
        let gw = setup(pool).await;
        let id = seed_cron_event(&gw, "hourly", Utc::now() - chrono::Duration::seconds(5)).await;
        gw.lock_due_cron_events(10).await.unwrap();

        let retry_time = Utc::now() + chrono::Duration::seconds(30);
        gw.set_retry(&id, retry_time, EventClass::Cron).await.unwrap();

        let row: (String, Option<DateTime<Utc>>) =
            sqlx::query_as("SELECT status, next_retry_at FROM hdb_cron_events WHERE id = $1")
                .bind(&id)
                .fetch_one(&gw.pool)
                .await
                .unwrap();
        assert_eq!(row.0, "scheduled");
        assert_eq!(row.1.unwrap().timestamp(), retry_time.timestamp());
    }

    #[sqlx::test]
    async fn insert_invocation_increments_tries_by_exactly_one(pool: Pool<Postgres>) {
        let gw = setup(pool).await;
        let id = seed_cron_event(&gw, "hourly", Utc::now() - chrono::Duration::seconds(5)).await;
        gw.lock_due_cron_events(10).await.unwrap();

        let invocation = Invocation {
            event_id: id.clone(),
            status: 200,
            request: serde_json::json!({}),
            response: serde_json::json!({"status": 200}),
        };
        gw.insert_invocation(&invocation, EventClass::Cron).await.unwrap();

        let tries: i32 = sqlx::query_scalar("SELECT tries FROM hdb_cron_events WHERE id = $1")
            .bind(&id)
            .fetch_one(&gw.pool)
            .await
            .unwrap();
        assert_eq!(tries, 1);

        let log_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM hdb_cron_event_invocation_logs WHERE event_id = $1")
                .bind(&id)
                .fetch_one(&gw.pool)
                .await
                .unwrap();
        assert_eq!(log_count, 1);
    }

    #[sqlx::test]
    async fn unlock_all_locked_resets_both_tables(pool: Pool<Postgres>) {
        let gw = setup(pool).await;
        let id = seed_cron_event(&gw, "hourly", Utc::now() - chrono::Duration::seconds(5)).await;
        gw.lock_due_cron_events(10).await.unwrap();

        gw.unlock_all_locked().await.unwrap();

        let status: String = sqlx::query_scalar("SELECT status FROM hdb_cron_events WHERE id = $1")
            .bind(&id)
            .fetch_one(&gw.pool)
            .await
            .unwrap();
        assert_eq!(status, "scheduled");
    }

    #[sqlx::test]
    async fn lock_due_oneoff_events_round_trips_json_columns(pool: Pool<Postgres>) {
        let gw = setup(pool).await;
        let id = Uuid::new_v4().to_string();
        let webhook_conf = WebhookConf::Value("https://example.com/hook".to_string());
        sqlx::query(
            "INSERT INTO hdb_scheduled_events (id, scheduled_time, tries, status, webhook_conf, retry_conf, header_conf) VALUES ($1, $2, 0, 'scheduled', $3, $4, '[]')",
        )
        .bind(&id)
        .bind(Utc::now() - chrono::Duration::seconds(5))
        .bind(sqlx::types::Json(&webhook_conf))
        .bind(sqlx::types::Json(RetryConf::default()))
        .execute(&gw.pool)
        .await
        .unwrap();

        let locked = gw.lock_due_oneoff_events(10).await.unwrap();
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].webhook_conf, webhook_conf);
    }
}
