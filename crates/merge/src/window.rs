use cdc_contracts::{CivilRange, DateWindow, Row};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc};

/// Business dates are civil dates at UTC+05:30.
pub const BUSINESS_OFFSET_SECS: i64 = 5 * 3600 + 30 * 60;

pub const DEFAULT_LOOKBACK_DAYS: i64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Relative { days: i64 },
    CalendarYear { year: i32 },
    Explicit,
}

/// Why the requested window was not honoured as given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowFallback {
    InvalidExplicitDates,
    UnknownRangeToken,
}

impl WindowFallback {
    pub fn as_str(self) -> &'static str {
        match self {
            WindowFallback::InvalidExplicitDates => "invalid_explicit_dates",
            WindowFallback::UnknownRangeToken => "unknown_range_token",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedWindow {
    pub window: DateWindow,
    pub kind: WindowKind,
    pub fallback: Option<WindowFallback>,
}

/// Resolves the request's date parameters into an absolute window.
///
/// Explicit `from`/`to` civil dates win when both are present and valid.
/// Otherwise the range token is used; unknown tokens fall back to the
/// default lookback. Malformed input never errors, it is reported through
/// `fallback`.
pub fn normalize(
    range: Option<&str>,
    from: Option<&str>,
    to: Option<&str>,
    now: DateTime<Utc>,
) -> NormalizedWindow {
    let from = from.map(str::trim).filter(|s| !s.is_empty());
    let to = to.map(str::trim).filter(|s| !s.is_empty());

    let mut fallback = None;
    if let (Some(from), Some(to)) = (from, to) {
        match explicit_window(from, to) {
            Some(window) => {
                return NormalizedWindow {
                    window,
                    kind: WindowKind::Explicit,
                    fallback: None,
                };
            }
            None => fallback = Some(WindowFallback::InvalidExplicitDates),
        }
    }

    let token = range
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty());

    let Some(token) = token else {
        return relative(now, DEFAULT_LOOKBACK_DAYS, fallback);
    };

    if let Some(days) = lookback_days(&token) {
        return relative(now, days, fallback);
    }

    let current_year = civil_date(now).year();
    let year = match token.as_str() {
        "thisyear" => Some(current_year),
        "lastyear" => Some(current_year - 1),
        _ => None,
    };
    if let Some(year) = year
        && let Some(window) = calendar_year_window(year)
    {
        return NormalizedWindow {
            window,
            kind: WindowKind::CalendarYear { year },
            fallback,
        };
    }

    relative(
        now,
        DEFAULT_LOOKBACK_DAYS,
        fallback.or(Some(WindowFallback::UnknownRangeToken)),
    )
}

fn lookback_days(token: &str) -> Option<i64> {
    match token {
        "1m" | "30d" => Some(30),
        "3m" | "90d" => Some(90),
        "6m" | "180d" => Some(180),
        "12m" | "1y" | "365d" => Some(365),
        _ => None,
    }
}

fn relative(now: DateTime<Utc>, days: i64, fallback: Option<WindowFallback>) -> NormalizedWindow {
    NormalizedWindow {
        window: DateWindow {
            from: now - TimeDelta::days(days),
            to: now,
            civil: None,
        },
        kind: WindowKind::Relative { days },
        fallback,
    }
}

fn explicit_window(from: &str, to: &str) -> Option<DateWindow> {
    let from = parse_civil_date(from)?;
    let to = parse_civil_date(to)?;
    if from > to {
        return None;
    }

    Some(DateWindow {
        from: start_of_business_day(from),
        to: end_of_business_day(to),
        civil: Some(CivilRange { from, to }),
    })
}

fn calendar_year_window(year: i32) -> Option<DateWindow> {
    let from = NaiveDate::from_ymd_opt(year, 1, 1)?;
    let to = NaiveDate::from_ymd_opt(year, 12, 31)?;
    Some(DateWindow {
        from: start_of_business_day(from),
        to: end_of_business_day(to),
        civil: Some(CivilRange { from, to }),
    })
}

pub fn parse_civil_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

/// 00:00:00.000 at the business offset, as a UTC instant.
pub fn start_of_business_day(date: NaiveDate) -> DateTime<Utc> {
    let local = date.and_time(NaiveTime::MIN);
    (local - TimeDelta::seconds(BUSINESS_OFFSET_SECS)).and_utc()
}

/// 23:59:59.999 at the business offset, as a UTC instant.
pub fn end_of_business_day(date: NaiveDate) -> DateTime<Utc> {
    start_of_business_day(date) + TimeDelta::days(1) - TimeDelta::milliseconds(1)
}

/// Civil date of a UTC instant at the business offset.
pub fn civil_date(instant: DateTime<Utc>) -> NaiveDate {
    (instant + TimeDelta::seconds(BUSINESS_OFFSET_SECS)).date_naive()
}

/// Parses the instant encodings sources emit: RFC 3339 strings, naive
/// timestamps (taken as UTC), bare dates, or epoch milliseconds.
pub fn parse_instant(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(raw) => parse_instant_str(raw),
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}

fn parse_instant_str(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }

    parse_civil_date(raw).map(|d| d.and_time(NaiveTime::MIN).and_utc())
}

/// Keeps rows whose business date falls inside `range`, comparing civil
/// dates rather than instants. The business date is read from `field` and
/// falls back to the row's sort key when absent or unparseable.
pub fn retain_civil_range(rows: &mut Vec<Row>, range: &CivilRange, field: &str) -> usize {
    let before = rows.len();
    rows.retain(|row| {
        let instant = row
            .payload
            .get(field)
            .and_then(parse_instant)
            .unwrap_or(row.sort_key);
        range.contains(civil_date(instant))
    });
    before - rows.len()
}
