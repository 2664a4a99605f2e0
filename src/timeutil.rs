use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, SecondsFormat, TimeZone, Utc};

/// Offset assumed for stored timestamps written without zone information.
///
/// Legacy rows were written in Vietnam local time (UTC+07:00, no DST).
pub const LEGACY_NAIVE_OFFSET_SECONDS: i32 = 7 * 3600;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

pub fn legacy_offset() -> FixedOffset {
    match FixedOffset::east_opt(LEGACY_NAIVE_OFFSET_SECONDS) {
        Some(offset) => offset,
        None => Utc.fix(),
    }
}

/// Parse a persisted timestamp into UTC.
///
/// RFC 3339 values keep their own offset; naive values are read in the
/// legacy offset before conversion.
pub fn parse_stored_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    NAIVE_FORMATS.iter().find_map(|format| {
        NaiveDateTime::parse_from_str(raw, format)
            .ok()
            .and_then(|naive| legacy_offset().from_local_datetime(&naive).single())
            .map(|local| local.with_timezone(&Utc))
    })
}

/// Fixed-width RFC 3339 UTC text, so stored values sort lexicographically.
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{format_timestamp, parse_stored_timestamp};

    #[test]
    fn rfc3339_keeps_its_offset() {
        let parsed = parse_stored_timestamp("2026-03-01T10:00:00+02:00").expect("parse");
        assert_eq!(parsed, Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap());
    }

    #[test]
    fn naive_values_are_read_as_utc_plus_seven() {
        let parsed = parse_stored_timestamp("2026-03-01 10:00:00").expect("parse");
        assert_eq!(parsed, Utc.with_ymd_and_hms(2026, 3, 1, 3, 0, 0).unwrap());

        let fractional = parse_stored_timestamp("2026-03-01T10:00:00.250").expect("parse");
        assert_eq!(
            fractional.timestamp_millis(),
            Utc.with_ymd_and_hms(2026, 3, 1, 3, 0, 0).unwrap().timestamp_millis() + 250
        );
    }

    #[test]
    fn formatted_values_parse_back() {
        let value = Utc.with_ymd_and_hms(2026, 3, 1, 3, 0, 0).unwrap();
        let text = format_timestamp(&value);
        assert_eq!(text, "2026-03-01T03:00:00.000Z");
        assert_eq!(parse_stored_timestamp(&text), Some(value));
    }

    #[test]
    fn garbage_is_absent() {
        assert!(parse_stored_timestamp("").is_none());
        assert!(parse_stored_timestamp("yesterday").is_none());
    }
}
