//! Merges live trip updates with the static schedule into a [`Board`].
//!
//! Every `(trip_id, stop_id)` pair present in either source yields one
//! [`DepartureRecord`]. Arrival resolution, in order of preference:
//!
//! 1. the live absolute arrival time, used as-is;
//! 2. the scheduled offset on the service day, shifted by the live delay;
//! 3. the departure resolved the same way;
//! 4. the trip's declared start time.
//!
//! A record with a static row whose arrival is already in the past is moved
//! to tomorrow's run of the same trip, once, with the delay discarded.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, warn};

use crate::board::{Board, DepartureRecord};
use crate::normalize::{LiveTripUpdate, VehiclePosition};
use crate::schedule::{ScheduleRow, StaticSnapshot};
use crate::time::{ServiceClock, scheduled_epoch};

type Key<'a> = (&'a str, &'a str);

type Rank<'a> = (
    (Option<u64>, &'a str),
    Option<u32>,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<i64>,
);

/// Total order over competing updates; the greatest wins.
fn rank(update: &LiveTripUpdate) -> Rank<'_> {
    let stop = &update.stop_time;
    (
        update.freshness(),
        stop.stop_sequence,
        stop.arrival_epoch_s,
        stop.departure_epoch_s,
        stop.arrival_delay_s,
        stop.departure_delay_s,
    )
}

fn keep_freshest<'a, K: Ord>(
    map: &mut BTreeMap<K, &'a LiveTripUpdate>,
    key: K,
    update: &'a LiveTripUpdate,
) {
    match map.get(&key) {
        Some(existing) if rank(existing) >= rank(update) => {}
        _ => {
            map.insert(key, update);
        }
    }
}

/// Builds the board for `now` from one snapshot and one pair of live feeds.
///
/// Static rows run on the snapshot's date unless their own live update names
/// another start date. `clock` supplies the midnights of those days.
///
/// Pure: the result depends only on the arguments, not on the order of
/// `trip_updates`.
pub fn reconcile(
    snapshot: &StaticSnapshot,
    trip_updates: &[LiveTripUpdate],
    vehicles: &HashMap<String, VehiclePosition>,
    now: DateTime<Utc>,
    clock: &ServiceClock,
) -> Board {
    let today = snapshot.date();
    let now_s = now.timestamp();

    let mut live: BTreeMap<Key, &LiveTripUpdate> = BTreeMap::new();
    let mut trips: BTreeMap<&str, &LiveTripUpdate> = BTreeMap::new();
    let mut unresolved = 0usize;

    for update in trip_updates {
        keep_freshest(&mut trips, update.trip_id.as_str(), update);

        let stop_id = if !update.stop_time.stop_id.is_empty() {
            Some(update.stop_time.stop_id.as_str())
        } else {
            update
                .stop_time
                .stop_sequence
                .and_then(|seq| snapshot.stop_for_sequence(&update.trip_id, seq))
        };
        let Some(stop_id) = stop_id else {
            debug!(
                trip_id = %update.trip_id,
                stop_sequence = ?update.stop_time.stop_sequence,
                "Stop time update names no known stop"
            );
            unresolved += 1;
            continue;
        };
        keep_freshest(&mut live, (update.trip_id.as_str(), stop_id), update);
    }

    let keys: BTreeSet<Key> = live
        .keys()
        .copied()
        .chain(
            snapshot
                .rows()
                .map(|row| (row.trip_id.as_str(), row.stop_id.as_str())),
        )
        .collect();

    let mut records = Vec::with_capacity(keys.len());
    for key in keys {
        let (trip_id, stop_id) = key;
        let update = live.get(&key).copied();
        let row = snapshot.get(trip_id, stop_id);
        let context = update.or_else(|| trips.get(trip_id).copied());

        let Some(record) = resolve(
            trip_id,
            stop_id,
            update,
            context,
            row,
            vehicles.get(trip_id),
            today,
            now_s,
            clock,
        ) else {
            warn!(%trip_id, %stop_id, "Live update carries no usable time");
            unresolved += 1;
            continue;
        };
        records.push(record);
    }

    debug!(
        records = records.len(),
        live_keys = live.len(),
        static_rows = snapshot.len(),
        unresolved,
        "Reconciled departures"
    );
    Board::new(now, clock.timezone(), records, unresolved)
}

#[allow(clippy::too_many_arguments)]
fn resolve(
    trip_id: &str,
    stop_id: &str,
    update: Option<&LiveTripUpdate>,
    context: Option<&LiveTripUpdate>,
    row: Option<&ScheduleRow>,
    vehicle: Option<&VehiclePosition>,
    today: NaiveDate,
    now_s: i64,
    clock: &ServiceClock,
) -> Option<DepartureRecord> {
    let stop_time = update.map(|u| &u.stop_time);
    let arrival_delay = stop_time.and_then(|s| s.arrival_delay_s);
    let departure_delay = stop_time.and_then(|s| s.departure_delay_s);

    let mut service_date = update.and_then(|u| u.start_date).unwrap_or(today);
    let midnight = clock.midnight_epoch(service_date);

    let live_arrival = stop_time.and_then(|s| s.arrival_epoch_s);
    let scheduled_arrival = row.map(|r| scheduled_epoch(midnight, r.scheduled_arrival_offset_s, 0));
    let arrival = live_arrival.or_else(|| {
        row.map(|r| {
            scheduled_epoch(
                midnight,
                r.scheduled_arrival_offset_s,
                arrival_delay.unwrap_or(0),
            )
        })
    });
    let departure = stop_time.and_then(|s| s.departure_epoch_s).or_else(|| {
        row.map(|r| {
            scheduled_epoch(
                midnight,
                r.scheduled_departure_offset_s,
                departure_delay.unwrap_or(0),
            )
        })
    });

    let (mut arrival, mut departure) = match (arrival, departure) {
        (Some(a), Some(d)) => (a, d),
        (Some(a), None) => (a, a),
        (None, Some(d)) => (d, d),
        (None, None) => {
            let start = context.and_then(|c| c.start_time_offset_s)?;
            let at = scheduled_epoch(midnight, start, arrival_delay.unwrap_or(0));
            (at, at)
        }
    };

    let mut delay = arrival_delay
        .or_else(|| live_arrival.zip(scheduled_arrival).map(|(l, s)| l - s))
        .unwrap_or(0);

    let rollover = row.filter(|_| arrival < now_s).zip(today.succ_opt());
    if let Some((row, tomorrow)) = rollover {
        let midnight = clock.midnight_epoch(tomorrow);
        arrival = scheduled_epoch(midnight, row.scheduled_arrival_offset_s, 0);
        departure = scheduled_epoch(midnight, row.scheduled_departure_offset_s, 0);
        delay = 0;
        service_date = tomorrow;
    }

    Some(DepartureRecord {
        trip_id: trip_id.to_string(),
        route_id: context
            .and_then(|c| c.route_id.clone())
            .or_else(|| row.map(|r| r.route_id.clone()))
            .filter(|r| !r.is_empty()),
        route_short_name: row.and_then(|r| r.route_short_name.clone()),
        route_long_name: row.and_then(|r| r.route_long_name.clone()),
        trip_headsign: row.and_then(|r| r.stop_headsign.clone().or_else(|| r.trip_headsign.clone())),
        stop_id: stop_id.to_string(),
        stop_code: row.and_then(|r| r.stop_code.clone()),
        stop_name: row.and_then(|r| r.stop_name.clone()),
        direction_id: context
            .and_then(|c| c.direction_id)
            .or_else(|| row.and_then(|r| r.direction_id)),
        agency_id: row.and_then(|r| r.agency_id.clone()),
        agency_name: row.and_then(|r| r.agency_name.clone()),
        service_date,
        updated_arrival_epoch_s: arrival,
        updated_departure_epoch_s: departure,
        delay_s: delay,
        real_time_flag: update.is_some(),
        schedule_relationship: context
            .map(|c| c.schedule_relationship)
            .unwrap_or_default(),
        vehicle_id: context
            .and_then(|c| c.vehicle_id.clone())
            .or_else(|| vehicle.and_then(|v| v.vehicle_id.clone())),
        latitude: vehicle.and_then(|v| v.latitude),
        longitude: vehicle.and_then(|v| v.longitude),
    })
}
