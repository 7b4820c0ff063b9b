//! Service-day time arithmetic.
//!
//! GTFS expresses stop times as `HH:MM:SS` offsets from the start of a
//! service day. Hours run past 24 for trips that continue after midnight, so
//! offsets are kept as plain seconds rather than `NaiveTime`.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Error returned when a GTFS time or date string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid GTFS time {value:?}: {reason}")]
pub struct TimeError {
    value: String,
    reason: &'static str,
}

impl TimeError {
    fn new(value: &str, reason: &'static str) -> Self {
        Self {
            value: value.to_string(),
            reason,
        }
    }
}

/// Parses an `HH:MM:SS` offset into seconds since service-day midnight.
///
/// Hours are unbounded (`25:10:00` is 1:10 the next morning) and may be a
/// single digit, as some producers write `8:15:00`.
///
/// ```
/// use gtfs_rt_departures::time::parse_offset;
///
/// assert_eq!(parse_offset("08:15:00"), Ok(29_700));
/// assert_eq!(parse_offset("25:10:00"), Ok(90_600));
/// assert!(parse_offset("08:15").is_err());
/// ```
pub fn parse_offset(value: &str) -> Result<i64, TimeError> {
    let trimmed = value.trim();
    let mut parts = trimmed.split(':');
    let (hours, minutes, seconds) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(h), Some(m), Some(s), None) => (h, m, s),
        _ => return Err(TimeError::new(value, "expected HH:MM:SS")),
    };

    let hours = parse_digits(hours).ok_or_else(|| TimeError::new(value, "invalid hour digits"))?;
    let minutes =
        parse_digits(minutes).ok_or_else(|| TimeError::new(value, "invalid minute digits"))?;
    let seconds =
        parse_digits(seconds).ok_or_else(|| TimeError::new(value, "invalid second digits"))?;

    if minutes > 59 {
        return Err(TimeError::new(value, "minute must be 0-59"));
    }
    if seconds > 59 {
        return Err(TimeError::new(value, "second must be 0-59"));
    }

    Ok(hours * 3600 + minutes * 60 + seconds)
}

fn parse_digits(s: &str) -> Option<i64> {
    if s.is_empty() || s.len() > 3 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Parses a GTFS `YYYYMMDD` service date.
pub fn parse_date(value: &str) -> Result<NaiveDate, TimeError> {
    NaiveDate::parse_from_str(value.trim(), "%Y%m%d")
        .map_err(|_| TimeError::new(value, "expected YYYYMMDD"))
}

/// Instant of `offset_s` seconds past the service-day midnight, shifted by a delay.
pub fn scheduled_epoch(midnight_epoch: i64, offset_s: i64, delay_s: i64) -> i64 {
    midnight_epoch + offset_s + delay_s
}

/// Maps service dates onto absolute instants in the agency's time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceClock {
    tz: Tz,
}

impl ServiceClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn utc() -> Self {
        Self::new(Tz::UTC)
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// The local calendar date at `now`.
    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    /// Unix time of local midnight at the start of `date`.
    ///
    /// On a fall-back transition the earlier instant wins. Where midnight falls
    /// inside a spring-forward gap, the offset in force at 01:00 is applied to
    /// the nominal midnight.
    pub fn midnight_epoch(&self, date: NaiveDate) -> i64 {
        let midnight = date.and_time(NaiveTime::MIN);
        if let Some(instant) = self.tz.from_local_datetime(&midnight).earliest() {
            return instant.timestamp();
        }
        let one_am = midnight + chrono::TimeDelta::hours(1);
        self.tz
            .from_local_datetime(&one_am)
            .earliest()
            .map(|instant| instant.timestamp() - 3600)
            .unwrap_or_else(|| midnight.and_utc().timestamp())
    }

    /// Converts a Unix time into the local wall clock.
    pub fn local(&self, epoch_s: i64) -> Option<DateTime<Tz>> {
        DateTime::from_timestamp(epoch_s, 0).map(|utc| utc.with_timezone(&self.tz))
    }
}

impl Default for ServiceClock {
    fn default() -> Self {
        Self::utc()
    }
}
