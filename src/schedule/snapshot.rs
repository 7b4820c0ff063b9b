//! Per-date join of the static GTFS tables.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{Datelike, NaiveDate, Weekday};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::{debug, info};

use super::error::ScheduleError;
use super::tables::{
    AgencyRecord, CalendarDateRecord, CalendarRecord, GtfsTables, RouteRecord, StopRecord,
    TripRecord,
};
use crate::time::{parse_date, parse_offset};

/// `calendar_dates` override in force for a service on the snapshot date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceException {
    /// exception_type 1
    Added,
    /// exception_type 2
    Removed,
}

impl ServiceException {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ServiceException::Added),
            2 => Some(ServiceException::Removed),
            _ => None,
        }
    }
}

/// One scheduled call of a trip at a stop.
///
/// Offsets are seconds since the service-day midnight and may exceed 86400.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleRow {
    pub trip_id: String,
    pub route_id: String,
    pub route_short_name: Option<String>,
    pub route_long_name: Option<String>,
    pub agency_id: Option<String>,
    pub agency_name: Option<String>,
    pub trip_headsign: Option<String>,
    pub direction_id: Option<u32>,
    pub stop_id: String,
    pub stop_code: Option<String>,
    pub stop_name: Option<String>,
    pub stop_sequence: u32,
    pub stop_headsign: Option<String>,
    pub scheduled_arrival_offset_s: i64,
    pub scheduled_departure_offset_s: i64,
    pub service_id: String,
    pub service_exception: Option<ServiceException>,
}

/// The static schedule for one service date, keyed by `(trip_id, stop_id)`.
#[derive(Debug, Clone)]
pub struct StaticSnapshot {
    date: NaiveDate,
    timezone: Option<Tz>,
    rows: BTreeMap<String, BTreeMap<String, ScheduleRow>>,
    sequences: HashMap<String, HashMap<u32, String>>,
    len: usize,
}

impl StaticSnapshot {
    /// Joins `tables` into the rows of every trip running on `date`.
    pub fn build(tables: &GtfsTables, date: NaiveDate) -> Result<Self, ScheduleError> {
        let timezone = tables.timezone();
        let services = ActiveServices::resolve(
            tables.calendar.as_deref().unwrap_or_default(),
            tables.calendar_dates.as_deref().unwrap_or_default(),
            date,
        )?;

        let agencies: HashMap<&str, &AgencyRecord> = tables
            .agency
            .iter()
            .filter_map(|a| a.agency_id.as_deref().map(|id| (id, a)))
            .collect();
        let sole_agency = match tables.agency.as_slice() {
            [only] => Some(only),
            _ => None,
        };
        let routes: HashMap<&str, &RouteRecord> = tables
            .routes
            .iter()
            .map(|r| (r.route_id.as_str(), r))
            .collect();
        let stops: HashMap<&str, &StopRecord> = tables
            .stops
            .iter()
            .map(|s| (s.stop_id.as_str(), s))
            .collect();

        let mut trips: HashMap<&str, TripContext<'_>> = HashMap::new();
        for trip in &tables.trips {
            let Some(exception) = services.running(&trip.service_id) else {
                continue;
            };
            let route = routes.get(trip.route_id.as_str()).copied();
            if route.is_none() {
                debug!(trip_id = %trip.trip_id, route_id = %trip.route_id, "Trip references unknown route");
            }
            let agency = match route.and_then(|r| r.agency_id.as_deref()) {
                Some(id) => agencies.get(id).copied(),
                None => sole_agency,
            };
            trips.insert(
                trip.trip_id.as_str(),
                TripContext {
                    trip,
                    route,
                    agency,
                    exception,
                },
            );
        }

        let mut snapshot = Self::empty(date, timezone);
        for stop_time in &tables.stop_times {
            let Some(context) = trips.get(stop_time.trip_id.as_str()) else {
                continue;
            };
            let arrival = parse_column(stop_time.arrival_time.as_deref())?;
            let departure = parse_column(stop_time.departure_time.as_deref())?;
            let (arrival, departure) = match (arrival, departure) {
                (Some(a), Some(d)) => (a, d),
                (Some(a), None) => (a, a),
                (None, Some(d)) => (d, d),
                (None, None) => continue,
            };

            let stop = stops.get(stop_time.stop_id.as_str()).copied();
            snapshot.insert(ScheduleRow {
                trip_id: stop_time.trip_id.clone(),
                route_id: context.trip.route_id.clone(),
                route_short_name: context.route.and_then(|r| r.route_short_name.clone()),
                route_long_name: context.route.and_then(|r| r.route_long_name.clone()),
                agency_id: context
                    .agency
                    .and_then(|a| a.agency_id.clone())
                    .or_else(|| context.route.and_then(|r| r.agency_id.clone())),
                agency_name: context.agency.and_then(|a| a.agency_name.clone()),
                trip_headsign: context.trip.trip_headsign.clone(),
                direction_id: context.trip.direction_id,
                stop_id: stop_time.stop_id.clone(),
                stop_code: stop.and_then(|s| s.stop_code.clone()),
                stop_name: stop.and_then(|s| s.stop_name.clone()),
                stop_sequence: stop_time.stop_sequence,
                stop_headsign: stop_time.stop_headsign.clone(),
                scheduled_arrival_offset_s: arrival,
                scheduled_departure_offset_s: departure,
                service_id: context.trip.service_id.clone(),
                service_exception: context.exception,
            });
        }

        info!(
            %date,
            trips = trips.len(),
            rows = snapshot.len(),
            "Static schedule snapshot built"
        );
        Ok(snapshot)
    }

    /// Assembles a snapshot from prepared rows.
    pub fn from_rows(
        date: NaiveDate,
        timezone: Option<Tz>,
        rows: impl IntoIterator<Item = ScheduleRow>,
    ) -> Self {
        let mut snapshot = Self::empty(date, timezone);
        for row in rows {
            snapshot.insert(row);
        }
        snapshot
    }

    fn empty(date: NaiveDate, timezone: Option<Tz>) -> Self {
        Self {
            date,
            timezone,
            rows: BTreeMap::new(),
            sequences: HashMap::new(),
            len: 0,
        }
    }

    fn insert(&mut self, row: ScheduleRow) {
        self.sequences
            .entry(row.trip_id.clone())
            .or_default()
            .insert(row.stop_sequence, row.stop_id.clone());
        let stops = self.rows.entry(row.trip_id.clone()).or_default();
        match stops.get(&row.stop_id) {
            // A trip calling twice at one stop keeps its first visit.
            Some(existing) if existing.stop_sequence <= row.stop_sequence => {}
            Some(_) => {
                stops.insert(row.stop_id.clone(), row);
            }
            None => {
                stops.insert(row.stop_id.clone(), row);
                self.len += 1;
            }
        }
    }

    /// The same rows placed on another service date.
    pub fn on_date(&self, date: NaiveDate) -> Self {
        Self {
            date,
            ..self.clone()
        }
    }

    pub fn get(&self, trip_id: &str, stop_id: &str) -> Option<&ScheduleRow> {
        self.rows.get(trip_id)?.get(stop_id)
    }

    /// Rows in `(trip_id, stop_id)` order.
    pub fn rows(&self) -> impl Iterator<Item = &ScheduleRow> {
        self.rows.values().flat_map(BTreeMap::values)
    }

    /// Stop visited by `trip_id` at `stop_sequence`.
    pub fn stop_for_sequence(&self, trip_id: &str, stop_sequence: u32) -> Option<&str> {
        self.sequences
            .get(trip_id)?
            .get(&stop_sequence)
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// Time zone declared by the feed's agencies, if any.
    pub fn timezone(&self) -> Option<Tz> {
        self.timezone
    }
}

struct TripContext<'a> {
    trip: &'a TripRecord,
    route: Option<&'a RouteRecord>,
    agency: Option<&'a AgencyRecord>,
    exception: Option<ServiceException>,
}

fn parse_column(value: Option<&str>) -> Result<Option<i64>, ScheduleError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => parse_offset(v)
            .map(Some)
            .map_err(|source| ScheduleError::InvalidValue {
                table: "stop_times.txt",
                source,
            }),
        None => Ok(None),
    }
}

/// Services running on one date, with the override that applied.
struct ActiveServices {
    running: HashMap<String, Option<ServiceException>>,
}

impl ActiveServices {
    fn resolve(
        calendar: &[CalendarRecord],
        calendar_dates: &[CalendarDateRecord],
        date: NaiveDate,
    ) -> Result<Self, ScheduleError> {
        let mut exceptions: HashMap<&str, ServiceException> = HashMap::new();
        for record in calendar_dates {
            let on = parse_date(&record.date).map_err(|source| ScheduleError::InvalidValue {
                table: "calendar_dates.txt",
                source,
            })?;
            if on != date {
                continue;
            }
            if let Some(exception) = ServiceException::from_code(record.exception_type) {
                exceptions.insert(record.service_id.as_str(), exception);
            }
        }

        let mut running = HashMap::new();
        let mut seen = HashSet::new();
        for record in calendar {
            seen.insert(record.service_id.as_str());
            let exception = exceptions.get(record.service_id.as_str()).copied();
            let runs = match exception {
                Some(ServiceException::Added) => true,
                Some(ServiceException::Removed) => false,
                None => calendar_runs(record, date)?,
            };
            if runs {
                running.insert(record.service_id.clone(), exception);
            }
        }
        for (service_id, exception) in &exceptions {
            if *exception == ServiceException::Added && !seen.contains(service_id) {
                running.insert(service_id.to_string(), Some(*exception));
            }
        }

        debug!(%date, services = running.len(), "Active services resolved");
        Ok(Self { running })
    }

    /// `Some(override)` if `service_id` runs, `None` if it does not.
    fn running(&self, service_id: &str) -> Option<Option<ServiceException>> {
        self.running.get(service_id).copied()
    }
}

fn calendar_runs(record: &CalendarRecord, date: NaiveDate) -> Result<bool, ScheduleError> {
    let invalid = |source| ScheduleError::InvalidValue {
        table: "calendar.txt",
        source,
    };
    let start = parse_date(&record.start_date).map_err(invalid)?;
    let end = parse_date(&record.end_date).map_err(invalid)?;
    if date < start || date > end {
        return Ok(false);
    }
    let flag = match date.weekday() {
        Weekday::Mon => record.monday,
        Weekday::Tue => record.tuesday,
        Weekday::Wed => record.wednesday,
        Weekday::Thu => record.thursday,
        Weekday::Fri => record.friday,
        Weekday::Sat => record.saturday,
        Weekday::Sun => record.sunday,
    };
    Ok(flag == 1)
}
