//! Next-run computation for the three schedule kinds.

use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;

use crate::job::Schedule;

/// Next fire time strictly governed by the schedule:
/// - `at` fires once, only while still in the future;
/// - `every` fires at `anchor + k*every` for the smallest `k >= 1` with
///   the result `>= now` (first fire is the anchor when `now < anchor`);
/// - `cron` fires at the next expression match, strictly after `now`.
pub fn compute_next_run_at_ms(schedule: &Schedule, now_ms: i64) -> Result<Option<i64>> {
    match schedule {
        Schedule::At { at_ms } => Ok((*at_ms > now_ms).then_some(*at_ms)),
        Schedule::Every { every_ms, anchor_ms } => {
            let every = *every_ms;
            if every <= 0 {
                return Err(anyhow!("everyMs must be positive"));
            }
            let anchor = anchor_ms.unwrap_or(now_ms);
            if now_ms < anchor {
                return Ok(Some(anchor));
            }
            let elapsed = now_ms - anchor;
            let steps = ((elapsed + every - 1) / every).max(1);
            Ok(Some(anchor + steps * every))
        }
        Schedule::Cron { expr, tz } => {
            let tz: Tz = match tz.as_deref() {
                Some(tz) => tz.parse().map_err(|_| anyhow!("invalid timezone: {tz}"))?,
                None => chrono_tz::UTC,
            };
            let cron = CronSchedule::from_str(&normalize_cron_expr(expr)?)
                .map_err(|err| anyhow!("invalid cron expression {expr}: {err}"))?;
            let now = tz
                .timestamp_millis_opt(now_ms)
                .single()
                .ok_or_else(|| anyhow!("invalid timestamp: {now_ms}"))?;
            Ok(cron
                .after(&now)
                .next()
                .map(|dt| dt.with_timezone(&Utc).timestamp_millis()))
        }
    }
}

/// The cron crate wants seconds first and counts DOW from 1=Sunday; user
/// expressions are standard 5/6-field with DOW 0-6, 0=Sunday.
fn normalize_cron_expr(expr: &str) -> Result<String> {
    let mut fields: Vec<String> = expr.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        5 => fields.insert(0, "0".to_string()),
        6 => {}
        n => return Err(anyhow!("cron expression needs 5 or 6 fields, got {n}")),
    }
    // fields: sec min hour dom month dow
    let dow = fields.pop().expect("dow field");
    fields.push(remap_dow_field(&dow)?);
    Ok(fields.join(" "))
}

fn remap_dow_field(field: &str) -> Result<String> {
    let parts: Result<Vec<String>> = field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let mapped = match range.split_once('-') {
                Some((a, b)) => format!("{}-{}", remap_dow_value(a)?, remap_dow_value(b)?),
                None => remap_dow_value(range)?,
            };
            Ok(match step {
                Some(step) => format!("{mapped}/{step}"),
                None => mapped,
            })
        })
        .collect();
    Ok(parts?.join(","))
}

fn remap_dow_value(value: &str) -> Result<String> {
    if value == "*" || value == "?" {
        return Ok(value.to_string());
    }
    match value.parse::<u8>() {
        Ok(n @ 0..=6) => Ok((n + 1).to_string()),
        Ok(7) => Ok("1".to_string()),
        Ok(n) => Err(anyhow!("day-of-week out of range: {n}")),
        // Names (Mon, Tue, ...) pass through.
        Err(_) => Ok(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;

    fn ms(rfc3339: &str) -> i64 {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .timestamp_millis()
    }

    #[test]
    fn at_in_future_fires_once() {
        let schedule = Schedule::At { at_ms: 2_000_000 };
        assert_eq!(
            compute_next_run_at_ms(&schedule, 1_000_000).unwrap(),
            Some(2_000_000)
        );
    }

    #[test]
    fn at_in_past_never_fires() {
        let schedule = Schedule::At { at_ms: 1_000 };
        assert_eq!(compute_next_run_at_ms(&schedule, 2_000).unwrap(), None);
        // Boundary: exactly now is not in the future.
        assert_eq!(compute_next_run_at_ms(&schedule, 1_000).unwrap(), None);
    }

    #[test]
    fn every_with_anchor_steps_forward() {
        let schedule = Schedule::Every {
            every_ms: 60_000,
            anchor_ms: Some(1_000_000),
        };
        assert_eq!(
            compute_next_run_at_ms(&schedule, 1_059_000).unwrap(),
            Some(1_060_000)
        );
        assert_eq!(
            compute_next_run_at_ms(&schedule, 1_060_001).unwrap(),
            Some(1_120_000)
        );
    }

    #[test]
    fn every_before_anchor_fires_at_anchor() {
        let schedule = Schedule::Every {
            every_ms: 60_000,
            anchor_ms: Some(5_000_000),
        };
        assert_eq!(
            compute_next_run_at_ms(&schedule, 1_000_000).unwrap(),
            Some(5_000_000)
        );
    }

    #[test]
    fn every_at_anchor_takes_one_step() {
        let schedule = Schedule::Every {
            every_ms: 1,
            anchor_ms: Some(42),
        };
        assert_eq!(compute_next_run_at_ms(&schedule, 42).unwrap(), Some(43));
    }

    #[test]
    fn every_is_monotonic() {
        let schedule = Schedule::Every {
            every_ms: 30_000,
            anchor_ms: Some(0),
        };
        let first = compute_next_run_at_ms(&schedule, 10_000).unwrap().unwrap();
        let second = compute_next_run_at_ms(&schedule, first).unwrap().unwrap();
        assert!(second >= first);
    }

    #[test]
    fn cron_five_field_utc() {
        let schedule = Schedule::Cron {
            expr: "30 9 * * *".into(),
            tz: None,
        };
        let now = ms("2025-02-12T09:00:00Z");
        let next = compute_next_run_at_ms(&schedule, now).unwrap().unwrap();
        assert_eq!(next, ms("2025-02-12T09:30:00Z"));
    }

    #[test]
    fn cron_dow_zero_is_sunday() {
        let schedule = Schedule::Cron {
            expr: "0 12 * * 0".into(),
            tz: None,
        };
        // 2025-02-12 is a Wednesday; next Sunday is 2025-02-16.
        let now = ms("2025-02-12T00:00:00Z");
        let next = compute_next_run_at_ms(&schedule, now).unwrap().unwrap();
        assert_eq!(next, ms("2025-02-16T12:00:00Z"));
    }

    #[test]
    fn cron_dow_ranges_and_lists() {
        let schedule = Schedule::Cron {
            expr: "0 8 * * 1-5".into(),
            tz: None,
        };
        // Saturday morning -> next weekday is Monday.
        let now = ms("2025-02-15T09:00:00Z");
        let next = compute_next_run_at_ms(&schedule, now).unwrap().unwrap();
        assert_eq!(next, ms("2025-02-17T08:00:00Z"));
    }

    #[test]
    fn cron_respects_timezone() {
        let schedule = Schedule::Cron {
            expr: "0 9 * * *".into(),
            tz: Some("America/New_York".into()),
        };
        // 9:00 New York == 14:00 UTC in February (EST).
        let now = ms("2025-02-12T00:00:00Z");
        let next = compute_next_run_at_ms(&schedule, now).unwrap().unwrap();
        assert_eq!(next, ms("2025-02-12T14:00:00Z"));
    }

    #[test]
    fn cron_is_monotonic() {
        let schedule = Schedule::Cron {
            expr: "*/5 * * * *".into(),
            tz: None,
        };
        let now = ms("2025-02-12T09:02:00Z");
        let first = compute_next_run_at_ms(&schedule, now).unwrap().unwrap();
        let second = compute_next_run_at_ms(&schedule, first).unwrap().unwrap();
        assert!(second > first);
        assert_eq!(first, ms("2025-02-12T09:05:00Z"));
        assert_eq!(second, ms("2025-02-12T09:10:00Z"));
    }

    #[test]
    fn invalid_inputs_rejected() {
        assert!(compute_next_run_at_ms(
            &Schedule::Cron {
                expr: "not a cron".into(),
                tz: None
            },
            0
        )
        .is_err());
        assert!(compute_next_run_at_ms(
            &Schedule::Cron {
                expr: "0 9 * * *".into(),
                tz: Some("Mars/Olympus".into())
            },
            0
        )
        .is_err());
        assert!(compute_next_run_at_ms(
            &Schedule::Every {
                every_ms: 0,
                anchor_ms: None
            },
            0
        )
        .is_err());
    }

    #[test]
    fn dow_field_remapping() {
        assert_eq!(remap_dow_field("0").unwrap(), "1");
        assert_eq!(remap_dow_field("1-5").unwrap(), "2-6");
        assert_eq!(remap_dow_field("0,3,6").unwrap(), "1,4,7");
        assert_eq!(remap_dow_field("*").unwrap(), "*");
        assert_eq!(remap_dow_field("*/2").unwrap(), "*/2");
        assert_eq!(remap_dow_field("Mon-Fri").unwrap(), "Mon-Fri");
        assert!(remap_dow_field("9").is_err());
    }
}
