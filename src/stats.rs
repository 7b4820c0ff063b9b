use serde::Serialize;

use crate::board::Board;
use crate::gtfs_rt::FeedMessage;

/// Entity counts of one decoded GTFS-RT feed.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct FeedSummary {
    pub header_timestamp: Option<u64>,
    pub total_entities: usize,
    pub deleted_entities: usize,

    // trip updates
    pub trip_updates: usize,
    pub stop_time_updates: usize,
    pub with_arrival_time: usize,
    pub with_arrival_delay: usize,
    pub with_start_date: usize,

    // vehicles
    pub vehicles: usize,
    pub in_service_vehicles: usize,
    pub with_position: usize,
}

impl FeedSummary {
    pub fn from_feed(feed: &FeedMessage) -> Self {
        let mut s = FeedSummary {
            header_timestamp: feed.header.timestamp,
            total_entities: feed.entity.len(),
            ..Default::default()
        };

        for e in &feed.entity {
            if e.is_deleted() {
                s.deleted_entities += 1;
            }

            if let Some(tu) = &e.trip_update {
                s.trip_updates += 1;
                s.stop_time_updates += tu.stop_time_update.len();

                if tu.trip.start_date.as_deref().is_some_and(|d| !d.is_empty()) {
                    s.with_start_date += 1;
                }

                for stu in &tu.stop_time_update {
                    if let Some(arrival) = &stu.arrival {
                        if arrival.time.is_some_and(|t| t != 0) {
                            s.with_arrival_time += 1;
                        }
                        if arrival.delay.is_some() {
                            s.with_arrival_delay += 1;
                        }
                    }
                }
            }

            if let Some(v) = &e.vehicle {
                s.vehicles += 1;

                if v.trip.as_ref().is_some_and(|t| !t.trip_id().is_empty()) {
                    s.in_service_vehicles += 1;
                }

                if v.position.is_some() {
                    s.with_position += 1;
                }
            }
        }

        s
    }

    /// Share of stop-time updates carrying an absolute arrival time.
    pub fn arrival_time_pct(&self) -> f64 {
        pct(self.with_arrival_time, self.stop_time_updates)
    }
}

/// Record counts of one reconciled board.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BoardSummary {
    pub records: usize,
    pub real_time: usize,
    pub with_position: usize,
    pub delayed: usize,
    pub unresolved: usize,
}

impl BoardSummary {
    pub fn from_board(board: &Board) -> Self {
        let mut s = BoardSummary {
            records: board.len(),
            unresolved: board.unresolved(),
            ..Default::default()
        };

        for r in board.records() {
            if r.real_time_flag {
                s.real_time += 1;
            }
            if r.latitude.is_some() && r.longitude.is_some() {
                s.with_position += 1;
            }
            if r.delay_s > 0 {
                s.delayed += 1;
            }
        }

        s
    }

    pub fn real_time_pct(&self) -> f64 {
        pct(self.real_time, self.records)
    }
}

fn pct(n: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        (n as f64 / total as f64) * 100.0
    }
}
