//! Conversion of decoded GTFS-RT entities into typed live records.
//!
//! Trip updates are flattened to one [`LiveTripUpdate`] per stop-time update,
//! and vehicle positions are keyed by the trip they are serving. Vehicles not
//! assigned to a trip are out of service and dropped.

use std::collections::HashMap;

use chrono::{NaiveDate, TimeDelta};
use serde::Serialize;
use tracing::debug;

use crate::gtfs_rt::{FeedEntity, trip_descriptor};
use crate::time::{parse_date, parse_offset};

/// Feed-provided status of a trip instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleRelationship {
    #[default]
    Scheduled,
    Added,
    Unscheduled,
    Canceled,
    Replacement,
    Duplicated,
    Deleted,
}

impl ScheduleRelationship {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleRelationship::Scheduled => "SCHEDULED",
            ScheduleRelationship::Added => "ADDED",
            ScheduleRelationship::Unscheduled => "UNSCHEDULED",
            ScheduleRelationship::Canceled => "CANCELED",
            ScheduleRelationship::Replacement => "REPLACEMENT",
            ScheduleRelationship::Duplicated => "DUPLICATED",
            ScheduleRelationship::Deleted => "DELETED",
        }
    }
}

impl From<trip_descriptor::ScheduleRelationship> for ScheduleRelationship {
    fn from(value: trip_descriptor::ScheduleRelationship) -> Self {
        use trip_descriptor::ScheduleRelationship as Wire;
        match value {
            Wire::Scheduled => ScheduleRelationship::Scheduled,
            Wire::Added => ScheduleRelationship::Added,
            Wire::Unscheduled => ScheduleRelationship::Unscheduled,
            Wire::Canceled => ScheduleRelationship::Canceled,
            Wire::Replacement => ScheduleRelationship::Replacement,
            Wire::Duplicated => ScheduleRelationship::Duplicated,
            Wire::Deleted => ScheduleRelationship::Deleted,
        }
    }
}

/// Predicted times for one stop of a live trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopTimeUpdate {
    /// Empty when the producer only identifies the stop by sequence.
    pub stop_id: String,
    pub stop_sequence: Option<u32>,
    /// Absolute predicted arrival. A wire value of 0 means unset.
    pub arrival_epoch_s: Option<i64>,
    pub arrival_delay_s: Option<i64>,
    pub departure_epoch_s: Option<i64>,
    pub departure_delay_s: Option<i64>,
}

/// One stop-time update together with the trip it belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveTripUpdate {
    pub entity_id: String,
    pub feed_timestamp: Option<u64>,
    pub trip_id: String,
    /// Canonical route id, after delimiter splitting.
    pub route_id: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub start_time_offset_s: Option<i64>,
    pub direction_id: Option<u32>,
    pub vehicle_id: Option<String>,
    pub schedule_relationship: ScheduleRelationship,
    pub stop_time: StopTimeUpdate,
}

impl LiveTripUpdate {
    /// Ordering used to pick one update when several describe the same stop:
    /// the newest feed timestamp wins, then the greatest entity id.
    pub fn freshness(&self) -> (Option<u64>, &str) {
        (self.feed_timestamp, self.entity_id.as_str())
    }
}

/// Position of an in-service vehicle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VehiclePosition {
    pub trip_id: String,
    pub vehicle_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timestamp: Option<u64>,
}

/// Settings applied while normalizing trip updates.
#[derive(Debug, Clone, Default)]
pub struct NormalizeOptions {
    /// Route ids are cut at the first occurrence of this delimiter.
    pub route_delimiter: Option<String>,
    /// Days added to every parsed `start_date`. Some producers publish the
    /// previous day's date; leave at 0 unless the feed is known to do so.
    pub start_date_correction_days: i64,
}

/// Returns the canonical form of a raw feed route id.
///
/// A raw value that begins with the delimiter is already canonical.
///
/// ```
/// use gtfs_rt_departures::normalize::canonical_route_id;
///
/// assert_eq!(canonical_route_id("42-1234-abc", Some("-")), "42");
/// assert_eq!(canonical_route_id("-42", Some("-")), "-42");
/// assert_eq!(canonical_route_id("42", None), "42");
/// ```
pub fn canonical_route_id<'a>(raw: &'a str, delimiter: Option<&str>) -> &'a str {
    match delimiter {
        Some(delim) if !delim.is_empty() && !raw.starts_with(delim) => {
            raw.split(delim).next().unwrap_or(raw)
        }
        _ => raw,
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

fn non_zero(value: Option<i64>) -> Option<i64> {
    value.filter(|v| *v != 0)
}

/// Flattens trip-update entities into one record per stop-time update.
///
/// Entities without a trip-update payload, deleted entities and trips without
/// a trip id are skipped. Feed order is retained.
pub fn normalize_trip_updates(
    entities: &[FeedEntity],
    feed_timestamp: Option<u64>,
    options: &NormalizeOptions,
) -> Vec<LiveTripUpdate> {
    let mut updates = Vec::new();
    let mut skipped = 0usize;

    for entity in entities {
        let Some(trip_update) = &entity.trip_update else {
            continue;
        };
        if entity.is_deleted() {
            skipped += 1;
            continue;
        }

        let trip = &trip_update.trip;
        let trip_id = trip.trip_id();
        if trip_id.is_empty() {
            skipped += 1;
            continue;
        }

        let route_id = non_empty(trip.route_id.as_deref()).map(|raw| {
            canonical_route_id(&raw, options.route_delimiter.as_deref()).to_string()
        });

        let start_date = trip
            .start_date
            .as_deref()
            .filter(|d| !d.is_empty())
            .and_then(|d| match parse_date(d) {
                Ok(date) => Some(date),
                Err(e) => {
                    debug!(entity_id = %entity.id, error = %e, "Ignoring trip start_date");
                    None
                }
            })
            .and_then(|date| {
                date.checked_add_signed(TimeDelta::days(options.start_date_correction_days))
            });

        let start_time_offset_s = trip
            .start_time
            .as_deref()
            .filter(|t| !t.is_empty())
            .and_then(|t| parse_offset(t).ok());

        let vehicle_id = trip_update
            .vehicle
            .as_ref()
            .and_then(|v| non_empty(v.id.as_deref()));

        let timestamp = trip_update.timestamp.or(feed_timestamp);

        for stu in &trip_update.stop_time_update {
            updates.push(LiveTripUpdate {
                entity_id: entity.id.clone(),
                feed_timestamp: timestamp,
                trip_id: trip_id.to_string(),
                route_id: route_id.clone(),
                start_date,
                start_time_offset_s,
                direction_id: trip.direction_id,
                vehicle_id: vehicle_id.clone(),
                schedule_relationship: trip.schedule_relationship().into(),
                stop_time: StopTimeUpdate {
                    stop_id: stu.stop_id().to_string(),
                    stop_sequence: stu.stop_sequence,
                    arrival_epoch_s: non_zero(stu.arrival.as_ref().and_then(|e| e.time)),
                    arrival_delay_s: stu.arrival.as_ref().and_then(|e| e.delay).map(i64::from),
                    departure_epoch_s: non_zero(stu.departure.as_ref().and_then(|e| e.time)),
                    departure_delay_s: stu
                        .departure
                        .as_ref()
                        .and_then(|e| e.delay)
                        .map(i64::from),
                },
            });
        }
    }

    debug!(records = updates.len(), skipped, "Trip updates normalized");
    updates
}

/// Keys in-service vehicle positions by trip id.
///
/// When two vehicles claim the same trip, the newest report wins, then the
/// greatest vehicle id, so the result does not depend on feed order.
pub fn normalize_vehicle_positions(entities: &[FeedEntity]) -> HashMap<String, VehiclePosition> {
    let mut positions: HashMap<String, VehiclePosition> = HashMap::new();

    for entity in entities {
        let Some(vehicle) = &entity.vehicle else {
            continue;
        };
        if entity.is_deleted() {
            continue;
        }
        let trip_id = vehicle.trip.as_ref().map(|t| t.trip_id()).unwrap_or("");
        if trip_id.is_empty() {
            // Vehicle is not in service
            continue;
        }

        let candidate = VehiclePosition {
            trip_id: trip_id.to_string(),
            vehicle_id: vehicle.vehicle.as_ref().and_then(|v| non_empty(v.id.as_deref())),
            latitude: vehicle.position.as_ref().map(|p| f64::from(p.latitude)),
            longitude: vehicle.position.as_ref().map(|p| f64::from(p.longitude)),
            timestamp: vehicle.timestamp,
        };

        match positions.get(trip_id) {
            Some(existing)
                if (existing.timestamp, existing.vehicle_id.as_deref())
                    >= (candidate.timestamp, candidate.vehicle_id.as_deref()) => {}
            _ => {
                positions.insert(trip_id.to_string(), candidate);
            }
        }
    }

    debug!(vehicles = positions.len(), "Vehicle positions normalized");
    positions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtfs_rt::{
        Position, TripDescriptor, TripUpdate, VehicleDescriptor,
        VehiclePosition as WireVehicle,
        trip_update::{StopTimeEvent, StopTimeUpdate as WireStopTime},
    };

    fn stop_time(stop_id: &str, time: Option<i64>, delay: Option<i32>) -> WireStopTime {
        WireStopTime {
            stop_id: Some(stop_id.to_string()),
            arrival: Some(StopTimeEvent {
                time,
                delay,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn trip_entity(id: &str, trip: TripDescriptor, stops: Vec<WireStopTime>) -> FeedEntity {
        FeedEntity {
            id: id.to_string(),
            trip_update: Some(TripUpdate {
                trip,
                vehicle: Some(VehicleDescriptor {
                    id: Some("bus-7".to_string()),
                    ..Default::default()
                }),
                stop_time_update: stops,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn vehicle_entity(id: &str, trip_id: &str, vehicle_id: &str, timestamp: u64) -> FeedEntity {
        FeedEntity {
            id: id.to_string(),
            vehicle: Some(WireVehicle {
                trip: Some(TripDescriptor {
                    trip_id: Some(trip_id.to_string()),
                    ..Default::default()
                }),
                vehicle: Some(VehicleDescriptor {
                    id: Some(vehicle_id.to_string()),
                    ..Default::default()
                }),
                position: Some(Position {
                    latitude: 53.35,
                    longitude: -6.26,
                    bearing: None,
                    odometer: None,
                    speed: None,
                }),
                timestamp: Some(timestamp),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_route_delimiter_takes_first_token() {
        assert_eq!(canonical_route_id("60-46A-b12-1", Some("-")), "60");
        assert_eq!(canonical_route_id("46A", Some("-")), "46A");
        assert_eq!(canonical_route_id("-46A", Some("-")), "-46A");
        assert_eq!(canonical_route_id("60-46A", Some("")), "60-46A");
        assert_eq!(canonical_route_id("60-46A", None), "60-46A");
    }

    #[test]
    fn test_expands_one_record_per_stop_time_update() {
        let trip = TripDescriptor {
            trip_id: Some("t1".to_string()),
            route_id: Some("42_x".to_string()),
            direction_id: Some(1),
            start_date: Some("20240315".to_string()),
            start_time: Some("08:00:00".to_string()),
            ..Default::default()
        };
        let entities = vec![trip_entity(
            "e1",
            trip,
            vec![
                stop_time("s1", Some(1_710_490_000), Some(60)),
                stop_time("s2", Some(0), Some(120)),
            ],
        )];
        let options = NormalizeOptions {
            route_delimiter: Some("_".to_string()),
            start_date_correction_days: 0,
        };

        let updates = normalize_trip_updates(&entities, Some(100), &options);

        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].stop_time.stop_id, "s1");
        assert_eq!(updates[1].stop_time.stop_id, "s2");
        assert_eq!(updates[0].route_id.as_deref(), Some("42"));
        assert_eq!(updates[0].direction_id, Some(1));
        assert_eq!(updates[0].vehicle_id.as_deref(), Some("bus-7"));
        assert_eq!(updates[0].feed_timestamp, Some(100));
        assert_eq!(
            updates[0].start_date,
            NaiveDate::from_ymd_opt(2024, 3, 15)
        );
        assert_eq!(updates[0].start_time_offset_s, Some(28_800));
        assert_eq!(updates[0].stop_time.arrival_epoch_s, Some(1_710_490_000));
        // A zero epoch is the wire's way of saying "unset".
        assert_eq!(updates[1].stop_time.arrival_epoch_s, None);
        assert_eq!(updates[1].stop_time.arrival_delay_s, Some(120));
        assert_eq!(updates[1].stop_time.departure_delay_s, None);
    }

    #[test]
    fn test_skips_entities_without_trip_updates() {
        let entities = vec![
            vehicle_entity("v1", "t1", "bus-1", 10),
            trip_entity(
                "e2",
                TripDescriptor::default(),
                vec![stop_time("s1", None, None)],
            ),
        ];
        let updates = normalize_trip_updates(&entities, None, &NormalizeOptions::default());
        assert!(updates.is_empty());
    }

    #[test]
    fn test_start_date_correction_is_opt_in() {
        let trip = TripDescriptor {
            trip_id: Some("t1".to_string()),
            start_date: Some("20240315".to_string()),
            ..Default::default()
        };
        let entities = vec![trip_entity("e1", trip, vec![stop_time("s1", None, None)])];

        let plain = normalize_trip_updates(&entities, None, &NormalizeOptions::default());
        assert_eq!(plain[0].start_date, NaiveDate::from_ymd_opt(2024, 3, 15));

        let corrected = normalize_trip_updates(
            &entities,
            None,
            &NormalizeOptions {
                route_delimiter: None,
                start_date_correction_days: 1,
            },
        );
        assert_eq!(corrected[0].start_date, NaiveDate::from_ymd_opt(2024, 3, 16));
    }

    #[test]
    fn test_schedule_relationship_is_carried() {
        let trip = TripDescriptor {
            trip_id: Some("t1".to_string()),
            schedule_relationship: Some(trip_descriptor::ScheduleRelationship::Canceled as i32),
            ..Default::default()
        };
        let entities = vec![trip_entity("e1", trip, vec![stop_time("s1", None, None)])];
        let updates = normalize_trip_updates(&entities, None, &NormalizeOptions::default());
        assert_eq!(
            updates[0].schedule_relationship,
            ScheduleRelationship::Canceled
        );
        assert_eq!(updates[0].schedule_relationship.as_str(), "CANCELED");
    }

    #[test]
    fn test_out_of_service_vehicles_are_excluded() {
        let mut idle = vehicle_entity("v2", "", "bus-2", 10);
        if let Some(v) = idle.vehicle.as_mut() {
            v.trip = None;
        }
        let entities = vec![
            vehicle_entity("v1", "t1", "bus-1", 10),
            vehicle_entity("v3", "", "bus-3", 10),
            idle,
        ];

        let positions = normalize_vehicle_positions(&entities);

        assert_eq!(positions.len(), 1);
        let position = &positions["t1"];
        assert_eq!(position.vehicle_id.as_deref(), Some("bus-1"));
        assert!((position.latitude.unwrap() - 53.35).abs() < 1e-4);
        assert!((position.longitude.unwrap() + 6.26).abs() < 1e-4);
    }

    #[test]
    fn test_duplicate_vehicle_trips_resolve_independently_of_order() {
        let older = vehicle_entity("v1", "t1", "bus-1", 10);
        let newer = vehicle_entity("v2", "t1", "bus-2", 20);

        let forward = normalize_vehicle_positions(&[older.clone(), newer.clone()]);
        let backward = normalize_vehicle_positions(&[newer, older]);

        assert_eq!(forward["t1"].vehicle_id.as_deref(), Some("bus-2"));
        assert_eq!(forward, backward);
    }
}
