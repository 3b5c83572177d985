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

use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::errors::{Error, Result};

/// The `cron` crate requires 6-field (second-granularity) expressions; the
/// catalog stores ordinary 5-field minute-granularity expressions, so a
/// literal `"0"` seconds field is prepended before parsing.
fn normalize(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

/// Returns up to `n` instants strictly after `start_time`, in ascending
/// order, each matching `cron_expression`. Pure and I/O-free: a shorter
/// sequence (down to empty) is returned if the expression has no further
/// matches, rather than looping forever.
pub fn upcoming(
    start_time: DateTime<Utc>,
    n: usize,
    cron_expression: &str,
) -> Result<Vec<DateTime<Utc>>> {
    let normalized = normalize(cron_expression);
    let schedule = cron::Schedule::from_str(&normalized)
        .map_err(|e| Error::CronParseError(format!("`{cron_expression}`: {e}")))?;

    Ok(schedule.after(&start_time).take(n).collect())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn returns_exactly_n_ascending_future_instants() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let out = upcoming(t0, 5, "0 * * * *").unwrap();
        assert_eq!(out.len(), 5);
        for pair in out.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        for ts in &out {
            assert!(*ts > t0);
            assert_eq!(ts.format("%M").to_string(), "00");
        }
    }

    #[test]
    fn hourly_boundaries_are_exactly_one_hour_apart() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 15, 10, 30, 0).unwrap();
        let out = upcoming(t0, 3, "0 * * * *").unwrap();
        assert_eq!(
            out,
            vec![
                Utc.with_ymd_and_hms(2026, 3, 15, 11, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 3, 15, 13, 0, 0).unwrap(),
            ]
        );
    }

    #[test]
    fn invalid_expression_is_an_error() {
        let t0 = Utc::now();
        assert!(upcoming(t0, 1, "not a cron expression").is_err());
    }

    #[test]
    fn n_zero_returns_empty() {
        let t0 = Utc::now();
        assert!(upcoming(t0, 0, "0 * * * *").unwrap().is_empty());
    }
}
