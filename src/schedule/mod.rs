//! Static GTFS schedule.
//!
//! [`GtfsTables`] holds the raw CSV tables of a GTFS archive,
//! [`StaticSnapshot`] joins them into per-(trip, stop) rows for one service
//! date, and [`ScheduleCache`] keeps the single snapshot for the current date.

mod cache;
mod error;
mod snapshot;
mod tables;

pub use cache::{ArchiveSource, ScheduleCache, ScheduleSource};
pub use error::ScheduleError;
pub use snapshot::{ScheduleRow, ServiceException, StaticSnapshot};
pub use tables::{
    AgencyRecord, CalendarDateRecord, CalendarRecord, GtfsTables, RouteRecord, StopRecord,
    StopTimeRecord, TripRecord,
};
