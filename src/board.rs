//! The reconciled departure board and its query layer.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::normalize::ScheduleRelationship;

/// Number of departures returned when a query does not say otherwise.
pub const DEFAULT_LIMIT: usize = 30;

/// One vehicle's call at one stop, with its best-known times.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepartureRecord {
    pub trip_id: String,
    pub route_id: Option<String>,
    pub route_short_name: Option<String>,
    pub route_long_name: Option<String>,
    /// The stop's headsign where it overrides the trip's.
    pub trip_headsign: Option<String>,
    pub stop_id: String,
    pub stop_code: Option<String>,
    pub stop_name: Option<String>,
    pub direction_id: Option<u32>,
    pub agency_id: Option<String>,
    pub agency_name: Option<String>,
    pub service_date: NaiveDate,
    pub updated_arrival_epoch_s: i64,
    pub updated_departure_epoch_s: i64,
    pub delay_s: i64,
    pub real_time_flag: bool,
    pub schedule_relationship: ScheduleRelationship,
    pub vehicle_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl DepartureRecord {
    /// The value of `field` on this record, `None` when unset.
    pub fn value(&self, field: Field) -> Option<FieldValue<'_>> {
        use FieldValue::{Bool, Date, Float, Int, Text};
        match field {
            Field::TripId => Some(Text(&self.trip_id)),
            Field::RouteId => self.route_id.as_deref().map(Text),
            Field::RouteShortName => self.route_short_name.as_deref().map(Text),
            Field::TripHeadsign => self.trip_headsign.as_deref().map(Text),
            Field::StopId => Some(Text(&self.stop_id)),
            Field::StopCode => self.stop_code.as_deref().map(Text),
            Field::StopName => self.stop_name.as_deref().map(Text),
            Field::DirectionId => self.direction_id.map(|d| Int(i64::from(d))),
            Field::AgencyId => self.agency_id.as_deref().map(Text),
            Field::ServiceDate => Some(Date(self.service_date)),
            Field::ArrivalTime => Some(Int(self.updated_arrival_epoch_s)),
            Field::DepartureTime => Some(Int(self.updated_departure_epoch_s)),
            Field::Delay => Some(Int(self.delay_s)),
            Field::RealTime => Some(Bool(self.real_time_flag)),
            Field::ScheduleRelationship => Some(Text(self.schedule_relationship.as_str())),
            Field::VehicleId => self.vehicle_id.as_deref().map(Text),
            Field::Latitude => self.latitude.map(Float),
            Field::Longitude => self.longitude.map(Float),
        }
    }
}

/// Addressable columns of a [`DepartureRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    TripId,
    RouteId,
    RouteShortName,
    TripHeadsign,
    StopId,
    StopCode,
    StopName,
    DirectionId,
    AgencyId,
    ServiceDate,
    /// `updated_arrival_epoch_s`
    ArrivalTime,
    /// `updated_departure_epoch_s`
    DepartureTime,
    Delay,
    RealTime,
    ScheduleRelationship,
    VehicleId,
    Latitude,
    Longitude,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::TripId => "trip_id",
            Field::RouteId => "route_id",
            Field::RouteShortName => "route_short_name",
            Field::TripHeadsign => "trip_headsign",
            Field::StopId => "stop_id",
            Field::StopCode => "stop_code",
            Field::StopName => "stop_name",
            Field::DirectionId => "direction_id",
            Field::AgencyId => "agency_id",
            Field::ServiceDate => "service_date",
            Field::ArrivalTime => "arrival_time",
            Field::DepartureTime => "departure_time",
            Field::Delay => "delay",
            Field::RealTime => "real_time",
            Field::ScheduleRelationship => "schedule_relationship",
            Field::VehicleId => "vehicle_id",
            Field::Latitude => "latitude",
            Field::Longitude => "longitude",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown departure field {0:?}")]
pub struct UnknownField(pub String);

impl FromStr for Field {
    type Err = UnknownField;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let field = match s.trim() {
            "trip_id" => Field::TripId,
            "route_id" | "route" => Field::RouteId,
            "route_short_name" => Field::RouteShortName,
            "trip_headsign" => Field::TripHeadsign,
            "stop_id" => Field::StopId,
            "stop_code" => Field::StopCode,
            "stop_name" => Field::StopName,
            "direction_id" => Field::DirectionId,
            "agency_id" => Field::AgencyId,
            "service_date" => Field::ServiceDate,
            "arrival_time" | "updated_arrival_time" | "updated_arrival_epoch_s" => {
                Field::ArrivalTime
            }
            "departure_time" | "updated_departure_time" | "updated_departure_epoch_s" => {
                Field::DepartureTime
            }
            "delay" | "delay_s" => Field::Delay,
            "real_time" | "real_time_flag" => Field::RealTime,
            "schedule_relationship" => Field::ScheduleRelationship,
            "vehicle_id" => Field::VehicleId,
            "latitude" => Field::Latitude,
            "longitude" => Field::Longitude,
            other => return Err(UnknownField(other.to_string())),
        };
        Ok(field)
    }
}

/// A borrowed field value, typed for comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Text(&'a str),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
}

impl FieldValue<'_> {
    /// Whether this value equals the textual criterion `wanted`.
    pub fn matches(&self, wanted: &str) -> bool {
        let wanted = wanted.trim();
        match *self {
            FieldValue::Text(v) => v == wanted,
            FieldValue::Int(v) => wanted.parse::<i64>() == Ok(v),
            FieldValue::Float(v) => wanted.parse::<f64>() == Ok(v),
            FieldValue::Bool(v) => match wanted.to_ascii_lowercase().as_str() {
                "true" | "1" => v,
                "false" | "0" => !v,
                _ => false,
            },
            FieldValue::Date(v) => NaiveDate::parse_from_str(wanted, "%Y%m%d")
                .or_else(|_| NaiveDate::parse_from_str(wanted, "%Y-%m-%d"))
                .is_ok_and(|d| d == v),
        }
    }

    fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (FieldValue::Text(a), FieldValue::Text(b)) => a.cmp(b),
            (FieldValue::Int(a), FieldValue::Int(b)) => a.cmp(b),
            (FieldValue::Float(a), FieldValue::Float(b)) => a.total_cmp(b),
            (FieldValue::Bool(a), FieldValue::Bool(b)) => a.cmp(b),
            (FieldValue::Date(a), FieldValue::Date(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

/// Unset values sort before set ones.
fn compare_values(a: Option<FieldValue<'_>>, b: Option<FieldValue<'_>>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.compare(&b),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Field-equality filter. Criteria with an empty value are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Criteria(BTreeMap<Field, String>);

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: Field, value: impl Into<String>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: Field, value: impl Into<String>) {
        self.0.insert(field, value.into());
    }

    pub fn matches(&self, record: &DepartureRecord) -> bool {
        self.0
            .iter()
            .filter(|(_, wanted)| !wanted.trim().is_empty())
            .all(|(field, wanted)| {
                record
                    .value(*field)
                    .is_some_and(|value| value.matches(wanted))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub criteria: Criteria,
    pub order_by: Field,
    pub ascending: bool,
    pub limit: usize,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            criteria: Criteria::default(),
            order_by: Field::ArrivalTime,
            ascending: true,
            limit: DEFAULT_LIMIT,
        }
    }
}

/// The unfiltered result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Board {
    generated_at: DateTime<Utc>,
    timezone: Tz,
    records: Vec<DepartureRecord>,
    unresolved: usize,
}

impl Board {
    pub fn new(
        generated_at: DateTime<Utc>,
        timezone: Tz,
        records: Vec<DepartureRecord>,
        unresolved: usize,
    ) -> Self {
        Self {
            generated_at,
            timezone,
            records,
            unresolved,
        }
    }

    /// Board published before the first successful pass.
    pub fn empty() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH, Tz::UTC, Vec::new(), 0)
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    /// Zone the board's service days were computed in.
    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn records(&self) -> &[DepartureRecord] {
        &self.records
    }

    /// Live updates that could not be placed on the timeline.
    pub fn unresolved(&self) -> usize {
        self.unresolved
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Upcoming departures matching `query`, ordered and truncated.
    ///
    /// Records arriving before `now` are dropped. Ties on the sort field are
    /// broken by `trip_id`.
    pub fn query(&self, query: &Query, now: DateTime<Utc>) -> Vec<DepartureRecord> {
        let now = now.timestamp();
        let mut results: Vec<&DepartureRecord> = self
            .records
            .iter()
            .filter(|r| r.updated_arrival_epoch_s >= now)
            .filter(|r| query.criteria.matches(r))
            .collect();

        results.sort_by(|a, b| {
            let ordering = compare_values(a.value(query.order_by), b.value(query.order_by));
            let ordering = if query.ascending {
                ordering
            } else {
                ordering.reverse()
            };
            ordering.then_with(|| a.trip_id.cmp(&b.trip_id))
        });

        results.into_iter().take(query.limit).cloned().collect()
    }
}

impl Default for Board {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn record(trip_id: &str, route_id: &str, arrival: i64) -> DepartureRecord {
        DepartureRecord {
            trip_id: trip_id.to_string(),
            route_id: Some(route_id.to_string()),
            route_short_name: Some(route_id.to_string()),
            route_long_name: None,
            trip_headsign: None,
            stop_id: "S1".to_string(),
            stop_code: None,
            stop_name: Some("Main St".to_string()),
            direction_id: Some(0),
            agency_id: None,
            agency_name: None,
            service_date: NaiveDate::from_ymd_opt(2023, 11, 14).unwrap(),
            updated_arrival_epoch_s: arrival,
            updated_departure_epoch_s: arrival,
            delay_s: 0,
            real_time_flag: false,
            schedule_relationship: ScheduleRelationship::Scheduled,
            vehicle_id: None,
            latitude: None,
            longitude: None,
        }
    }

    const NOW: i64 = 1_700_000_000;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(NOW, 0).unwrap()
    }

    fn board(records: Vec<DepartureRecord>) -> Board {
        Board::new(now(), Tz::UTC, records, 0)
    }

    fn trip_ids(records: &[DepartureRecord]) -> Vec<&str> {
        records.iter().map(|r| r.trip_id.as_str()).collect()
    }

    #[test]
    fn test_limit_one_returns_the_soonest() {
        let board = board(vec![
            record("late", "42", NOW + 12 * 60),
            record("soon", "42", NOW + 5 * 60),
        ]);
        let query = Query {
            limit: 1,
            ..Default::default()
        };
        assert_eq!(trip_ids(&board.query(&query, now())), vec!["soon"]);
    }

    #[test]
    fn test_filters_by_route_and_drops_past_departures() {
        let board = board(vec![
            record("a", "42", NOW + 600),
            record("b", "7", NOW + 300),
            record("c", "42", NOW - 1),
            record("d", "42", NOW),
            record("e", "42", NOW + 60),
        ]);
        let query = Query {
            criteria: Criteria::new().with(Field::RouteId, "42"),
            ..Default::default()
        };

        let results = board.query(&query, now());
        assert_eq!(trip_ids(&results), vec!["d", "e", "a"]);
        assert!(results.iter().all(|r| r.updated_arrival_epoch_s >= NOW));
    }

    #[test]
    fn test_empty_criteria_impose_nothing() {
        let board = board(vec![record("a", "42", NOW + 60), record("b", "7", NOW + 120)]);
        let query = Query {
            criteria: Criteria::new()
                .with(Field::RouteId, "")
                .with(Field::StopId, "  "),
            ..Default::default()
        };
        assert_eq!(board.query(&query, now()).len(), 2);
    }

    #[test]
    fn test_unset_field_never_matches_a_criterion() {
        let mut unnamed = record("a", "42", NOW + 60);
        unnamed.route_id = None;
        let board = board(vec![unnamed]);
        let query = Query {
            criteria: Criteria::new().with(Field::RouteId, "42"),
            ..Default::default()
        };
        assert!(board.query(&query, now()).is_empty());
    }

    #[test]
    fn test_numeric_and_boolean_criteria() {
        let mut inbound = record("a", "42", NOW + 60);
        inbound.direction_id = Some(1);
        inbound.real_time_flag = true;
        let outbound = record("b", "42", NOW + 120);
        let board = board(vec![inbound, outbound]);

        let by_direction = Query {
            criteria: Criteria::new().with(Field::DirectionId, "1"),
            ..Default::default()
        };
        assert_eq!(trip_ids(&board.query(&by_direction, now())), vec!["a"]);

        let scheduled_only = Query {
            criteria: Criteria::new().with(Field::RealTime, "false"),
            ..Default::default()
        };
        assert_eq!(trip_ids(&board.query(&scheduled_only, now())), vec!["b"]);
    }

    #[test]
    fn test_descending_order_with_trip_id_tiebreak() {
        let board = board(vec![
            record("b", "42", NOW + 60),
            record("a", "42", NOW + 60),
            record("c", "42", NOW + 120),
        ]);
        let query = Query {
            ascending: false,
            ..Default::default()
        };
        assert_eq!(trip_ids(&board.query(&query, now())), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_unset_sort_values_come_first() {
        let mut unnamed = record("z", "42", NOW + 600);
        unnamed.stop_name = None;
        let board = board(vec![record("a", "42", NOW + 60), unnamed]);
        let query = Query {
            order_by: Field::StopName,
            ..Default::default()
        };
        assert_eq!(trip_ids(&board.query(&query, now())), vec!["z", "a"]);
    }

    #[test]
    fn test_repeated_queries_are_identical() {
        let board = board(vec![
            record("a", "42", NOW + 60),
            record("b", "42", NOW + 60),
            record("c", "7", NOW + 30),
        ]);
        let query = Query::default();
        assert_eq!(board.query(&query, now()), board.query(&query, now()));
    }

    #[test]
    fn test_default_query_caps_at_thirty() {
        let records = (0..40)
            .map(|i| record(&format!("t{i:02}"), "42", NOW + i))
            .collect();
        let results = board(records).query(&Query::default(), now());
        assert_eq!(results.len(), DEFAULT_LIMIT);
        assert_eq!(results[0].trip_id, "t00");
    }

    #[test]
    fn test_field_names_and_aliases() {
        assert_eq!("arrival_time".parse::<Field>(), Ok(Field::ArrivalTime));
        assert_eq!(
            "updated_arrival_epoch_s".parse::<Field>(),
            Ok(Field::ArrivalTime)
        );
        assert_eq!("route".parse::<Field>(), Ok(Field::RouteId));
        assert_eq!(
            "platform".parse::<Field>(),
            Err(UnknownField("platform".to_string()))
        );
        for field in [Field::StopCode, Field::RealTime, Field::Longitude] {
            assert_eq!(field.as_str().parse::<Field>(), Ok(field));
        }
    }

    #[test]
    fn test_date_criteria_accept_both_formats() {
        let value = FieldValue::Date(NaiveDate::from_ymd_opt(2023, 11, 14).unwrap());
        assert!(value.matches("20231114"));
        assert!(value.matches("2023-11-14"));
        assert!(!value.matches("2023-11-15"));
    }
}
