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

use std::time::Duration;

use chrono::{DateTime, Utc};
use config::{resolve_headers, resolve_webhook, HeaderConf, RetryConf, WebhookConf};
use reqwest::Client;
use serde_json::Value;

use crate::shutdown::ShutdownSignal;
use crate::store::Invocation;

/// Synthetic status codes for outcomes that never reached (or never parsed)
/// an HTTP response (SPEC_FULL.md §4.6 step 4).
pub const STATUS_TRANSPORT_ERROR: i32 = 1000;
pub const STATUS_PARSE_ERROR: i32 = 1001;

/// What the state machine should do after this tick's processing of one
/// event. `Dead` and `Delivered`/`Error` are all terminal; `RetryAt` leaves
/// the event `scheduled` with an updated `next_retry_at`.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The attempt succeeded (status < 400).
    Delivered,
    /// The attempt failed but a further attempt is warranted; carries the
    /// instant of the next attempt.
    RetryAt(DateTime<Utc>),
    /// The attempt failed and `tries` has reached `num_retries` with no
    /// `Retry-After` present. Terminal `error` state (distinct from `dead`).
    ExhaustedRetries,
}

/// A single delivery attempt's result, independent of what it means for
/// retry/dead-letter bookkeeping. Kept separate from `Outcome` so the
/// classification step (`classify`) stays a pure function over plain data.
#[derive(Debug, Clone)]
pub struct AttemptResult {
    /// The observed HTTP status, or a synthetic code for transport/parse
    /// failures (`STATUS_TRANSPORT_ERROR` / `STATUS_PARSE_ERROR`).
    pub status: i32,
    pub success: bool,
    pub request_body: Value,
    pub response_body: Value,
    pub retry_after: Option<Duration>,
}

/// Returns true if `now - scheduled_time` exceeds `tolerance_seconds`,
/// meaning the event must be dead-lettered without attempting delivery
/// (SPEC_FULL.md §4.6 step 1, transition (e)).
pub fn is_dead_on_arrival(
    scheduled_time: DateTime<Utc>,
    tolerance_seconds: i64,
    now: DateTime<Utc>,
) -> bool {
    now - scheduled_time > chrono::Duration::seconds(tolerance_seconds)
}

/// Pure post-attempt retry/terminate decision. Never touches the network or
/// the database, so it is exhaustively unit-testable.
///
/// `tries` is the attempt count *after* this attempt (i.e. already
/// incremented). A `Retry-After` header overrides the tries-exhausted check
/// regardless of how many tries remain (SPEC_FULL.md §4.5 transition (c)).
pub fn classify(attempt: &AttemptResult, tries: i32, now: DateTime<Utc>, retry_conf: &RetryConf) -> Outcome {
    if attempt.success {
        return Outcome::Delivered;
    }

    if let Some(retry_after) = attempt.retry_after {
        let delay = chrono::Duration::from_std(retry_after).unwrap_or_default();
        return Outcome::RetryAt(now + delay);
    }

    if tries >= retry_conf.num_retries {
        return Outcome::ExhaustedRetries;
    }

    Outcome::RetryAt(now + chrono::Duration::seconds(retry_conf.retry_interval_seconds))
}

/// Performs the HTTP POST for a single event, returning the raw attempt
/// result. Header/webhook resolution errors are surfaced as `Err` so the
/// caller can decide how to record them (SPEC_FULL.md §4.6 step 1).
///
/// The request is raced against `shutdown`: if the shutdown signal fires
/// before the response arrives, the in-flight call is dropped and `Ok(None)`
/// is returned so the caller never reaches the DB-write step with a
/// shutdown already in progress (SPEC_FULL.md §5 "Cancellation").
pub async fn deliver(
    client: &Client,
    webhook_conf: &WebhookConf,
    header_conf: &[HeaderConf],
    default_headers: &[(String, String)],
    request_body: Value,
    timeout_seconds: f64,
    shutdown: &ShutdownSignal,
) -> Result<Option<AttemptResult>, config::Error> {
    let url = resolve_webhook(webhook_conf)?;
    let headers = resolve_headers(header_conf)?;

    let timeout = Duration::from_secs(timeout_seconds.round().max(0.0) as u64);
    let mut request = client.post(&url).timeout(timeout).json(&request_body);
    for (name, value) in default_headers {
        request = request.header(name, value);
    }
    for (name, value) in &headers {
        request = request.header(name, value);
    }

    let response = tokio::select! {
        result = request.send() => result,
        _ = shutdown.cancelled() => return Ok(None),
    };

    match response {
        Ok(response) => {
            let status = response.status();
            let retry_after = parse_retry_after(&response);
            let text = tokio::select! {
                result = response.text() => match result {
                    Ok(text) => text,
                    Err(err) => {
                        return Ok(Some(AttemptResult {
                            status: STATUS_PARSE_ERROR,
                            success: false,
                            request_body,
                            response_body: Value::String(format!("failed reading response body: {err}")),
                            retry_after,
                        }))
                    }
                },
                _ = shutdown.cancelled() => return Ok(None),
            };
            let response_body = if (400..500).contains(&status.as_u16()) {
                serde_json::json!({"error": "client_error", "status": status.as_u16(), "body": text})
            } else {
                // Success and server-error (>=500) responses both store the
                // captured detail as-is: JSON when the body parses, the raw
                // text otherwise. Only client errors get the distinguished
                // "client_error" variant (SPEC_FULL.md §4.6 step 4).
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            };
            Ok(Some(AttemptResult {
                status: status.as_u16() as i32,
                success: status.as_u16() < 400,
                request_body,
                response_body,
                retry_after,
            }))
        }
        Err(err) => Ok(Some(AttemptResult {
            status: STATUS_TRANSPORT_ERROR,
            success: false,
            request_body,
            response_body: Value::String(format!("transport error: {err}")),
            retry_after: None,
        })),
    }
}

/// Reads the `Retry-After` header as a delay-seconds value. HTTP-date
/// values are not handled; the catalog's own `retry_interval_seconds` is
/// used instead when the header is absent or unparseable.
fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

pub fn to_invocation(event_id: String, attempt: &AttemptResult) -> Invocation {
    Invocation {
        event_id,
        status: attempt.status,
        request: attempt.request_body.clone(),
        response: attempt.response_body.clone(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn attempt(success: bool, retry_after: Option<Duration>) -> AttemptResult {
        AttemptResult {
            status: if success { 200 } else { 500 },
            success,
            request_body: Value::Null,
            response_body: Value::Null,
            retry_after,
        }
    }

    fn retry_conf(num_retries: i32, retry_interval_seconds: i64, tolerance_seconds: i64) -> RetryConf {
        RetryConf {
            num_retries,
            retry_interval_seconds,
            timeout_seconds: 30.0,
            tolerance_seconds,
        }
    }

    #[test]
    fn successful_attempt_is_delivered() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let outcome = classify(&attempt(true, None), 1, now, &retry_conf(3, 60, 21600));
        assert_eq!(outcome, Outcome::Delivered);
    }

    #[test]
    fn failed_attempt_within_budget_retries_with_configured_interval() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let outcome = classify(&attempt(false, None), 1, now, &retry_conf(3, 60, 21600));
        assert_eq!(outcome, Outcome::RetryAt(now + chrono::Duration::seconds(60)));
    }

    #[test]
    fn retry_after_header_overrides_configured_interval() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let outcome = classify(&attempt(false, Some(Duration::from_secs(30))), 1, now, &retry_conf(3, 60, 21600));
        assert_eq!(outcome, Outcome::RetryAt(now + chrono::Duration::seconds(30)));
    }

    #[test]
    fn retry_after_header_overrides_tries_exhausted_check() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let outcome = classify(&attempt(false, Some(Duration::from_secs(30))), 5, now, &retry_conf(3, 60, 21600));
        assert_eq!(outcome, Outcome::RetryAt(now + chrono::Duration::seconds(30)));
    }

    #[test]
    fn exhausted_retries_without_retry_after_is_terminal_error() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let outcome = classify(&attempt(false, None), 4, now, &retry_conf(3, 60, 21600));
        assert_eq!(outcome, Outcome::ExhaustedRetries);
    }

    #[test]
    fn dead_on_arrival_checks_lateness_against_tolerance() {
        let scheduled_time = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let now = scheduled_time + chrono::Duration::seconds(61);
        assert!(is_dead_on_arrival(scheduled_time, 60, now));
        assert!(!is_dead_on_arrival(scheduled_time, 60, scheduled_time + chrono::Duration::seconds(60)));
    }
}
