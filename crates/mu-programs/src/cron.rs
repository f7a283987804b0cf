//! 5-field minute-resolution cron: minute, hour, day-of-month, month,
//! day-of-week. Supports `*`, `a`, `a-b`, `a-b/step`, `*/step`, and comma
//! lists. Day-of-week accepts 0–7 with 7 wrapping to Sunday (0).
//!
//! Next-fire search scans forward minute by minute in the resolved timezone,
//! bounded by a horizon so an impossible expression (Feb 30) terminates.

use chrono::{DateTime, Datelike, FixedOffset, TimeZone, Timelike, Utc};

use crate::error::{ProgramError, Result};
use crate::types::CronSchedule;

const MINUTE_MS: i64 = 60_000;

/// Parsed expression as per-field bitmasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: u64,
    hours: u32,
    dom: u32,
    months: u16,
    dow: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    fn minute_set(&self, minute: u32) -> bool {
        self.minutes & (1 << minute) != 0
    }

    fn hour_set(&self, hour: u32) -> bool {
        self.hours & (1 << hour) != 0
    }

    fn month_set(&self, month: u32) -> bool {
        self.months & (1 << month) != 0
    }

    /// Day rule: both restricted → union; one restricted → that one;
    /// neither → every day.
    fn day_matches(&self, dt: &DateTime<FixedOffset>) -> bool {
        let dom_match = self.dom & (1 << dt.day()) != 0;
        let dow_match = self.dow & (1 << dt.weekday().num_days_from_sunday()) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_match || dow_match,
            (true, false) => dom_match,
            (false, true) => dow_match,
            (false, false) => true,
        }
    }

    fn matches(&self, dt: &DateTime<FixedOffset>) -> bool {
        self.minute_set(dt.minute())
            && self.hour_set(dt.hour())
            && self.month_set(dt.month())
            && self.day_matches(dt)
    }
}

/// Parse a 5-field expression.
pub fn parse_cron_expr(expr: &str) -> Result<CronExpr> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(ProgramError::InvalidCron(format!(
            "expected 5 fields, got {} in {expr:?}",
            fields.len()
        )));
    }

    let (minutes, _) = parse_field(fields[0], 0, 59, false)?;
    let (hours, _) = parse_field(fields[1], 0, 23, false)?;
    let (dom, dom_restricted) = parse_field(fields[2], 1, 31, false)?;
    let (months, _) = parse_field(fields[3], 1, 12, false)?;
    let (dow, dow_restricted) = parse_field(fields[4], 0, 7, true)?;

    Ok(CronExpr {
        minutes,
        hours: hours as u32,
        dom: dom as u32,
        months: months as u16,
        dow: dow as u8,
        dom_restricted,
        dow_restricted,
    })
}

/// One field → bitmask. `wrap7` folds day-of-week 7 onto 0.
fn parse_field(field: &str, min: u32, max: u32, wrap7: bool) -> Result<(u64, bool)> {
    let mut mask: u64 = 0;
    let restricted = field != "*";

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| ProgramError::InvalidCron(format!("bad step in {part:?}")))?;
                if step == 0 {
                    return Err(ProgramError::InvalidCron(format!("zero step in {part:?}")));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a: u32 = a
                .parse()
                .map_err(|_| ProgramError::InvalidCron(format!("bad range start in {part:?}")))?;
            let b: u32 = b
                .parse()
                .map_err(|_| ProgramError::InvalidCron(format!("bad range end in {part:?}")))?;
            (a, b)
        } else {
            let v: u32 = range
                .parse()
                .map_err(|_| ProgramError::InvalidCron(format!("bad value {part:?}")))?;
            (v, v)
        };

        if lo < min || hi > max || lo > hi {
            return Err(ProgramError::InvalidCron(format!(
                "value out of range {min}-{max} in {part:?}"
            )));
        }

        let mut v = lo;
        while v <= hi {
            let bit = if wrap7 && v == 7 { 0 } else { v };
            mask |= 1 << bit;
            v += step;
        }
    }

    if mask == 0 {
        return Err(ProgramError::InvalidCron(format!("empty field {field:?}")));
    }
    Ok((mask, restricted))
}

/// Resolve a schedule timezone: `UTC` (default) or a fixed `±HH:MM` offset.
pub fn parse_tz(tz: Option<&str>) -> Result<FixedOffset> {
    let Some(tz) = tz else {
        return Ok(FixedOffset::east_opt(0).expect("zero offset"));
    };
    if tz.eq_ignore_ascii_case("utc") {
        return Ok(FixedOffset::east_opt(0).expect("zero offset"));
    }
    let (sign, rest) = if let Some(rest) = tz.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = tz.strip_prefix('-') {
        (-1, rest)
    } else {
        return Err(ProgramError::InvalidTimezone(tz.to_string()));
    };
    let Some((hours, minutes)) = rest.split_once(':') else {
        return Err(ProgramError::InvalidTimezone(tz.to_string()));
    };
    let hours: i32 = hours
        .parse()
        .map_err(|_| ProgramError::InvalidTimezone(tz.to_string()))?;
    let minutes: i32 = minutes
        .parse()
        .map_err(|_| ProgramError::InvalidTimezone(tz.to_string()))?;
    if hours > 14 || minutes > 59 {
        return Err(ProgramError::InvalidTimezone(tz.to_string()));
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| ProgramError::InvalidTimezone(tz.to_string()))
}

/// First matching minute strictly after `from_ms`, or `None` within the
/// horizon.
pub fn next_cron_fire(
    expr: &CronExpr,
    from_ms: i64,
    tz: FixedOffset,
    horizon_minutes: u32,
) -> Option<i64> {
    // Align to the next whole minute after `from_ms`.
    let mut t = (from_ms.div_euclid(MINUTE_MS) + 1) * MINUTE_MS;
    let mut remaining = horizon_minutes as i64;

    while remaining > 0 {
        let dt = Utc.timestamp_millis_opt(t).single()?.with_timezone(&tz);
        if expr.matches(&dt) {
            return Some(t);
        }
        // When today can never match, skip to the next local midnight.
        if !expr.month_set(dt.month()) || !expr.day_matches(&dt) {
            let minutes_left_today = (24 * 60) - (dt.hour() * 60 + dt.minute()) as i64;
            t += minutes_left_today * MINUTE_MS;
            remaining -= minutes_left_today;
        } else {
            t += MINUTE_MS;
            remaining -= 1;
        }
    }
    None
}

/// Next fire time for any schedule kind, or `None` when exhausted.
pub fn schedule_next(
    schedule: &CronSchedule,
    now_ms: i64,
    horizon_minutes: u32,
) -> Result<Option<i64>> {
    match schedule {
        CronSchedule::At { at_ms } => Ok(if *at_ms > now_ms { Some(*at_ms) } else { None }),
        CronSchedule::Every { every_ms, anchor_ms } => {
            if *every_ms <= 0 {
                return Err(ProgramError::InvalidProgram(
                    "every_ms must be positive".to_string(),
                ));
            }
            if now_ms < *anchor_ms {
                return Ok(Some(*anchor_ms));
            }
            let intervals = (now_ms - anchor_ms).div_euclid(*every_ms)
                + i64::from((now_ms - anchor_ms).rem_euclid(*every_ms) != 0);
            Ok(Some(anchor_ms + intervals * every_ms))
        }
        CronSchedule::Cron { expr, tz } => {
            let parsed = parse_cron_expr(expr)?;
            let offset = parse_tz(tz.as_deref())?;
            Ok(next_cron_fire(&parsed, now_ms, offset, horizon_minutes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HORIZON: u32 = 2 * 366 * 24 * 60;

    fn ms(iso: &str) -> i64 {
        DateTime::parse_from_rfc3339(iso).unwrap().timestamp_millis()
    }

    #[test]
    fn every_minute_fires_on_the_next_minute() {
        let expr = parse_cron_expr("* * * * *").unwrap();
        let from = ms("2026-03-01T10:30:15Z");
        let next = next_cron_fire(&expr, from, parse_tz(None).unwrap(), HORIZON).unwrap();
        assert_eq!(next, ms("2026-03-01T10:31:00Z"));
    }

    #[test]
    fn daily_at_fixed_time() {
        let expr = parse_cron_expr("30 9 * * *").unwrap();
        let from = ms("2026-03-01T10:00:00Z");
        let next = next_cron_fire(&expr, from, parse_tz(None).unwrap(), HORIZON).unwrap();
        assert_eq!(next, ms("2026-03-02T09:30:00Z"));
    }

    #[test]
    fn step_and_list_fields() {
        let expr = parse_cron_expr("*/15 8-10 * * *").unwrap();
        let from = ms("2026-03-01T08:16:00Z");
        let next = next_cron_fire(&expr, from, parse_tz(None).unwrap(), HORIZON).unwrap();
        assert_eq!(next, ms("2026-03-01T08:30:00Z"));

        let expr = parse_cron_expr("0 0 1,15 * *").unwrap();
        let from = ms("2026-03-02T00:00:00Z");
        let next = next_cron_fire(&expr, from, parse_tz(None).unwrap(), HORIZON).unwrap();
        assert_eq!(next, ms("2026-03-15T00:00:00Z"));
    }

    #[test]
    fn dow_seven_wraps_to_sunday() {
        let a = parse_cron_expr("0 12 * * 0").unwrap();
        let b = parse_cron_expr("0 12 * * 7").unwrap();
        assert_eq!(a, b);
        // 2026-03-01 is a Sunday.
        let from = ms("2026-02-28T12:00:00Z");
        let next = next_cron_fire(&a, from, parse_tz(None).unwrap(), HORIZON).unwrap();
        assert_eq!(next, ms("2026-03-01T12:00:00Z"));
    }

    #[test]
    fn dom_and_dow_union() {
        // The 10th OR any Monday. From Sat 2026-03-07, Monday the 9th wins.
        let expr = parse_cron_expr("0 0 10 * 1").unwrap();
        let from = ms("2026-03-07T00:00:00Z");
        let next = next_cron_fire(&expr, from, parse_tz(None).unwrap(), HORIZON).unwrap();
        assert_eq!(next, ms("2026-03-09T00:00:00Z"));
        // And from just after the Monday, the 10th wins.
        let next = next_cron_fire(&expr, next, parse_tz(None).unwrap(), HORIZON).unwrap();
        assert_eq!(next, ms("2026-03-10T00:00:00Z"));
    }

    #[test]
    fn impossible_date_exhausts_horizon() {
        let expr = parse_cron_expr("0 0 30 2 *").unwrap();
        let from = ms("2026-01-01T00:00:00Z");
        assert_eq!(next_cron_fire(&expr, from, parse_tz(None).unwrap(), HORIZON), None);
    }

    #[test]
    fn fixed_offset_timezone_shifts_local_time() {
        // 09:00 at +02:00 is 07:00 UTC.
        let expr = parse_cron_expr("0 9 * * *").unwrap();
        let tz = parse_tz(Some("+02:00")).unwrap();
        let from = ms("2026-03-01T00:00:00Z");
        let next = next_cron_fire(&expr, from, tz, HORIZON).unwrap();
        assert_eq!(next, ms("2026-03-01T07:00:00Z"));
    }

    #[test]
    fn bad_expressions_are_rejected() {
        assert!(parse_cron_expr("* * * *").is_err());
        assert!(parse_cron_expr("61 * * * *").is_err());
        assert!(parse_cron_expr("*/0 * * * *").is_err());
        assert!(parse_cron_expr("5-2 * * * *").is_err());
        assert!(parse_tz(Some("Europe/Berlin")).is_err());
    }

    #[test]
    fn at_schedule_is_one_shot() {
        let s = CronSchedule::At { at_ms: 5_000 };
        assert_eq!(schedule_next(&s, 1_000, HORIZON).unwrap(), Some(5_000));
        assert_eq!(schedule_next(&s, 5_000, HORIZON).unwrap(), None);
    }

    #[test]
    fn every_schedule_rounds_up_from_anchor() {
        let s = CronSchedule::Every {
            every_ms: 1_000,
            anchor_ms: 500,
        };
        // Before the anchor → the anchor itself.
        assert_eq!(schedule_next(&s, 100, HORIZON).unwrap(), Some(500));
        // Mid-interval → next multiple.
        assert_eq!(schedule_next(&s, 1_700, HORIZON).unwrap(), Some(2_500));
        // Exactly on a boundary → that instant.
        assert_eq!(schedule_next(&s, 2_500, HORIZON).unwrap(), Some(2_500));
    }
}
