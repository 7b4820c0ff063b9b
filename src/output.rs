//! Sensor-style rendering of query results, and CSV persistence.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use csv::WriterBuilder;
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::Path;
use tracing::{debug, info};

use crate::board::DepartureRecord;
use crate::config::DepartureConfig;
use crate::normalize::ScheduleRelationship;
use crate::time::ServiceClock;

const TIME_FORMAT: &str = "%H:%M";
const NONE: &str = "-";

/// State and attributes of one departure sensor, as a dashboard shows them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorState {
    pub name: String,
    /// Whole minutes until the next departure, or `-`.
    pub state: String,
    pub unit_of_measurement: &'static str,
    pub icon: String,
    pub service_type: String,
    pub due_in: String,
    /// Local `HH:MM` of the next departure.
    pub due_at: String,
    /// Local `HH:MM` of the departure after next.
    pub next_service: String,
    pub stop_id: Option<String>,
    pub route: Option<String>,
    pub direction_id: Option<u32>,
    pub latitude: String,
    pub longitude: String,
}

impl SensorState {
    /// Builds the sensor view of `results`, which must already be ordered.
    pub fn from_departures(
        departure: &DepartureConfig,
        results: &[DepartureRecord],
        now: DateTime<Utc>,
        tz: Tz,
    ) -> Self {
        let next = results.first();
        let after = results.get(1);

        let state = next
            .map(|r| due_in_minutes(r.updated_arrival_epoch_s, now).to_string())
            .unwrap_or_else(|| NONE.to_string());
        let position = |value: Option<f64>| value.map_or_else(|| NONE.to_string(), |v| v.to_string());

        Self {
            name: departure.name.clone(),
            due_in: state.clone(),
            state,
            unit_of_measurement: "min",
            icon: departure.icon.clone(),
            service_type: departure.service_type.clone(),
            due_at: local_time(next, tz),
            next_service: local_time(after, tz),
            stop_id: departure.stop_id.clone(),
            route: departure.route.clone(),
            direction_id: departure.direction_id,
            latitude: position(next.and_then(|r| r.latitude)),
            longitude: position(next.and_then(|r| r.longitude)),
        }
    }

    /// Label of the `next_service` attribute, e.g. "Next Bus".
    pub fn next_service_label(&self) -> String {
        format!("Next {}", self.service_type)
    }
}

/// Minutes until `epoch_s`, rounded down and never negative.
pub fn due_in_minutes(epoch_s: i64, now: DateTime<Utc>) -> i64 {
    (epoch_s - now.timestamp()).max(0) / 60
}

fn local_time(record: Option<&DepartureRecord>, tz: Tz) -> String {
    record
        .and_then(|r| ServiceClock::new(tz).local(r.updated_arrival_epoch_s))
        .map(|at| at.format(TIME_FORMAT).to_string())
        .unwrap_or_else(|| NONE.to_string())
}

/// Logs a sensor state and its attributes.
pub fn print_pretty(sensor: &SensorState) {
    info!(
        name = %sensor.name,
        state = %sensor.state,
        unit = sensor.unit_of_measurement,
        due_at = %sensor.due_at,
        next_label = %sensor.next_service_label(),
        next_service = %sensor.next_service,
        stop_id = ?sensor.stop_id,
        route = ?sensor.route,
        direction_id = ?sensor.direction_id,
        latitude = %sensor.latitude,
        longitude = %sensor.longitude,
        icon = %sensor.icon,
        "Sensor update"
    );
    debug!("{:#?}", sensor);
}

/// Logs sensor states as pretty-printed JSON.
pub fn print_json(sensors: &[SensorState]) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(sensors)?);
    Ok(())
}

#[derive(Debug, Serialize)]
struct DepartureRow<'a> {
    polled_at: i64,
    sensor: &'a str,
    trip_id: &'a str,
    route_id: Option<&'a str>,
    route_short_name: Option<&'a str>,
    route_long_name: Option<&'a str>,
    trip_headsign: Option<&'a str>,
    agency_name: Option<&'a str>,
    stop_id: &'a str,
    stop_name: Option<&'a str>,
    direction_id: Option<u32>,
    service_date: NaiveDate,
    updated_arrival_epoch_s: i64,
    updated_departure_epoch_s: i64,
    delay_s: i64,
    real_time_flag: bool,
    schedule_relationship: ScheduleRelationship,
    vehicle_id: Option<&'a str>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl<'a> DepartureRow<'a> {
    fn new(polled_at: i64, sensor: &'a str, r: &'a DepartureRecord) -> Self {
        Self {
            polled_at,
            sensor,
            trip_id: &r.trip_id,
            route_id: r.route_id.as_deref(),
            route_short_name: r.route_short_name.as_deref(),
            route_long_name: r.route_long_name.as_deref(),
            trip_headsign: r.trip_headsign.as_deref(),
            agency_name: r.agency_name.as_deref(),
            stop_id: &r.stop_id,
            stop_name: r.stop_name.as_deref(),
            direction_id: r.direction_id,
            service_date: r.service_date,
            updated_arrival_epoch_s: r.updated_arrival_epoch_s,
            updated_departure_epoch_s: r.updated_departure_epoch_s,
            delay_s: r.delay_s,
            real_time_flag: r.real_time_flag,
            schedule_relationship: r.schedule_relationship,
            vehicle_id: r.vehicle_id.as_deref(),
            latitude: r.latitude,
            longitude: r.longitude,
        }
    }
}

/// Appends one row per departure to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_departures(
    path: impl AsRef<Path>,
    sensor: &str,
    polled_at: DateTime<Utc>,
    records: &[DepartureRecord],
) -> Result<()> {
    let path = path.as_ref();
    let file_exists = path.exists();
    debug!(path = %path.display(), file_exists, rows = records.len(), "Appending departures");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    for record in records {
        writer.serialize(DepartureRow::new(polled_at.timestamp(), sensor, record))?;
    }
    writer.flush()?;

    Ok(())
}
