use chrono::{DateTime, Duration, NaiveDate, Utc};
use thiserror::Error;

/// Transactional senders searched by default: Vietcombank notifications and Remitano swaps.
pub const DEFAULT_SENDER_FILTERS: &[&str] = &[
    "from:VCBDigibank@info.vietcombank.com.vn",
    r#"(from:notifications@remitano.com (subject:"You have swapped" OR subject:"Bạn đã hoán đổi"))"#,
];

const SECONDS_PER_DAY: i64 = 86_400;

/// Longest relative window accepted anywhere: about ten years.
pub const MAX_WINDOW_DAYS: i64 = 3_650;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid query window: {0}")]
pub struct InvalidWindow(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryWindow {
    /// The most recent span of time ending now.
    Relative(Duration),
    /// One calendar month, `[first day, first day of next month)`.
    Month { year: i32, month: u32 },
}

impl QueryWindow {
    pub fn days(days: i64) -> Result<Self, InvalidWindow> {
        if !(1..=MAX_WINDOW_DAYS).contains(&days) {
            return Err(InvalidWindow(format!(
                "lookback must be between 1 and {MAX_WINDOW_DAYS} days, got {days}"
            )));
        }
        Duration::try_days(days)
            .map(Self::Relative)
            .ok_or_else(|| InvalidWindow(format!("lookback of {days} days is out of range")))
    }

    pub fn hours(hours: i64) -> Result<Self, InvalidWindow> {
        let max_hours = MAX_WINDOW_DAYS * 24;
        if !(1..=max_hours).contains(&hours) {
            return Err(InvalidWindow(format!(
                "lookback must be between 1 and {max_hours} hours, got {hours}"
            )));
        }
        Duration::try_hours(hours)
            .map(Self::Relative)
            .ok_or_else(|| InvalidWindow(format!("lookback of {hours} hours is out of range")))
    }

    /// Window covering the time since the last sync plus one hour of overlap, capped at
    /// `max_lookback`. Connections that never synced get `first_sync`.
    pub fn incremental(
        last_sync_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        max_lookback: Duration,
        first_sync: Duration,
    ) -> Self {
        let span = match last_sync_at {
            None => first_sync,
            Some(last) => {
                let since = (now - last) + Duration::hours(1);
                since.max(Duration::hours(1)).min(max_lookback)
            }
        };
        Self::Relative(span)
    }

    fn render(&self, now: DateTime<Utc>) -> Result<String, InvalidWindow> {
        match *self {
            Self::Relative(span) => {
                let seconds = span.num_seconds();
                if seconds <= 0 {
                    return Err(InvalidWindow(format!(
                        "relative window must be positive, got {seconds}s"
                    )));
                }
                if seconds % SECONDS_PER_DAY == 0 {
                    Ok(format!("newer_than:{}d", seconds / SECONDS_PER_DAY))
                } else {
                    let after = now.checked_sub_signed(span).ok_or_else(|| {
                        InvalidWindow(format!("relative window of {seconds}s is out of range"))
                    })?;
                    Ok(format!("after:{}", after.timestamp()))
                }
            }
            Self::Month { year, month } => {
                let (start, end) = month_bounds(year, month)?;
                Ok(format!(
                    "after:{} before:{}",
                    start.format("%Y/%m/%d"),
                    end.format("%Y/%m/%d")
                ))
            }
        }
    }
}

pub fn month_bounds(year: i32, month: u32) -> Result<(NaiveDate, NaiveDate), InvalidWindow> {
    let start = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| InvalidWindow(format!("no such month: {year}-{month:02}")))?;
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let end = NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .ok_or_else(|| InvalidWindow(format!("month out of range: {year}-{month:02}")))?;
    Ok((start, end))
}

/// Build a Gmail search query: allow-listed senders, inbox only, no chats.
///
/// Output depends only on the arguments, `now` included.
pub fn build_query(
    senders: &[&str],
    window: &QueryWindow,
    now: DateTime<Utc>,
) -> Result<String, InvalidWindow> {
    let window = window.render(now)?;
    let senders: Vec<&str> = senders
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();

    if senders.is_empty() {
        return Ok(format!("label:inbox {window} -in:chats"));
    }
    Ok(format!(
        "({}) label:inbox {window} -in:chats",
        senders.join(" OR ")
    ))
}
