use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::realtime::topic::Period;

// ──────────────────────────── timestamps ─────────────────────────────────── //

/// Format a timestamp the way envelopes carry it on the wire.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

// ────────────────────────── formatting / parsing ─────────────────────────── //

/// Parse an ISO 8601 / RFC 3339 datetime string.
///
/// Returns ``None`` on unparseable input.
///
/// Accepts:
/// - ``2026-02-23T14:30:00Z``
/// - ``2026-02-23T14:30:00.123+02:00``
/// - ``2026-02-23T14:30:00``  (assumes UTC)
/// - ``2026-02-23``           (start of day UTC)
pub fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Naive datetime, assume UTC
    for fmt in &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|nd| nd.and_hms_opt(0, 0, 0))
        .map(|ndt| Utc.from_utc_datetime(&ndt))
}

// ───────────────────────── leaderboard windows ───────────────────────────── //

/// Start of the leaderboard window containing `now`.
///
/// Daily is the UTC calendar day, weekly the ISO week starting Monday,
/// monthly the calendar month. `AllTime` has no lower bound.
pub fn period_start(period: Period, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let today = now.date_naive();
    let first_day = match period {
        Period::Daily => today,
        Period::Weekly => {
            today - Duration::days(i64::from(today.weekday().num_days_from_monday()))
        }
        Period::Monthly => NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?,
        Period::AllTime => return None,
    };
    first_day
        .and_hms_opt(0, 0, 0)
        .map(|ndt| Utc.from_utc_datetime(&ndt))
}

/// Whether `ts` falls inside the `period` window that contains `now`.
pub fn in_period(period: Period, ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    match period_start(period, now) {
        Some(start) => ts >= start,
        None => true,
    }
}

// ──────────────────────── serde adapters ─────────────────────────────────── //

/// Serde adapter for envelope timestamps: writes millisecond-precision
/// ``Z`` strings and reads anything [`parse_iso`] accepts.
pub mod iso {
    use chrono::{DateTime, Utc};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_iso(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp '{raw}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        parse_iso(s).unwrap()
    }

    #[test]
    fn parses_common_shapes() {
        assert_eq!(at("2026-02-23T14:30:00Z"), at("2026-02-23T14:30:00"));
        assert_eq!(at("2026-02-23T16:30:00+02:00"), at("2026-02-23T14:30:00Z"));
        assert_eq!(at("2026-02-23"), at("2026-02-23T00:00:00Z"));
        assert!(parse_iso("yesterday").is_none());
    }

    #[test]
    fn formats_with_millis() {
        assert_eq!(format_timestamp(&at("2026-02-23T14:30:00.5Z")), "2026-02-23T14:30:00.500Z");
    }

    #[test]
    fn weekly_window_starts_on_monday() {
        // 2026-10-16 is a Friday
        let now = at("2026-10-16T12:00:00Z");
        assert_eq!(period_start(Period::Weekly, now), Some(at("2026-10-12")));
        assert_eq!(period_start(Period::Monthly, now), Some(at("2026-10-01")));
        assert_eq!(period_start(Period::Daily, now), Some(at("2026-10-16")));
        assert_eq!(period_start(Period::AllTime, now), None);
        assert!(!in_period(Period::Daily, at("2026-10-15T23:59:59Z"), now));
        assert!(in_period(Period::AllTime, at("1999-01-01"), now));
    }
}
