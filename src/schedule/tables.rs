//! Raw GTFS tables decoded from a zip archive.

use std::collections::HashMap;
use std::io::{Cursor, Read, Seek};

use chrono_tz::Tz;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};
use zip::ZipArchive;

use super::error::ScheduleError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgencyRecord {
    #[serde(default)]
    pub agency_id: Option<String>,
    #[serde(default)]
    pub agency_name: Option<String>,
    #[serde(default)]
    pub agency_timezone: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteRecord {
    pub route_id: String,
    #[serde(default)]
    pub agency_id: Option<String>,
    #[serde(default)]
    pub route_short_name: Option<String>,
    #[serde(default)]
    pub route_long_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TripRecord {
    pub route_id: String,
    pub service_id: String,
    pub trip_id: String,
    #[serde(default)]
    pub trip_headsign: Option<String>,
    #[serde(default)]
    pub direction_id: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StopRecord {
    pub stop_id: String,
    #[serde(default)]
    pub stop_code: Option<String>,
    #[serde(default)]
    pub stop_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StopTimeRecord {
    pub trip_id: String,
    /// Blank for stops between timepoints.
    #[serde(default)]
    pub arrival_time: Option<String>,
    #[serde(default)]
    pub departure_time: Option<String>,
    pub stop_id: String,
    pub stop_sequence: u32,
    #[serde(default)]
    pub stop_headsign: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CalendarRecord {
    pub service_id: String,
    pub monday: u8,
    pub tuesday: u8,
    pub wednesday: u8,
    pub thursday: u8,
    pub friday: u8,
    pub saturday: u8,
    pub sunday: u8,
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CalendarDateRecord {
    pub service_id: String,
    pub date: String,
    /// 1 = service added on `date`, 2 = service removed.
    pub exception_type: u8,
}

/// The GTFS tables the departure board is built from.
///
/// `calendar` and `calendar_dates` are each optional in GTFS, but at least
/// one must be present.
#[derive(Debug, Clone, Default)]
pub struct GtfsTables {
    pub agency: Vec<AgencyRecord>,
    pub routes: Vec<RouteRecord>,
    pub trips: Vec<TripRecord>,
    pub stops: Vec<StopRecord>,
    pub stop_times: Vec<StopTimeRecord>,
    pub calendar: Option<Vec<CalendarRecord>>,
    pub calendar_dates: Option<Vec<CalendarDateRecord>>,
}

impl GtfsTables {
    /// Decodes the tables from the bytes of a GTFS zip archive.
    ///
    /// Tables may sit in a sub-directory of the archive.
    pub fn from_zip(bytes: &[u8]) -> Result<Self, ScheduleError> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))?;
        let names = table_names(&archive);

        let tables = Self {
            agency: required("agency.txt", read_table(&mut archive, &names, "agency.txt")?)?,
            routes: required("routes.txt", read_table(&mut archive, &names, "routes.txt")?)?,
            trips: required("trips.txt", read_table(&mut archive, &names, "trips.txt")?)?,
            stops: required("stops.txt", read_table(&mut archive, &names, "stops.txt")?)?,
            stop_times: required(
                "stop_times.txt",
                read_table(&mut archive, &names, "stop_times.txt")?,
            )?,
            calendar: read_table(&mut archive, &names, "calendar.txt")?,
            calendar_dates: read_table(&mut archive, &names, "calendar_dates.txt")?,
        };

        if tables.calendar.is_none() && tables.calendar_dates.is_none() {
            return Err(ScheduleError::NoServiceCalendar);
        }

        info!(
            agencies = tables.agency.len(),
            routes = tables.routes.len(),
            trips = tables.trips.len(),
            stops = tables.stops.len(),
            stop_times = tables.stop_times.len(),
            "Static schedule tables decoded"
        );
        Ok(tables)
    }

    /// First parseable `agency_timezone` declared by the feed.
    pub fn timezone(&self) -> Option<Tz> {
        let name = self
            .agency
            .iter()
            .find_map(|a| a.agency_timezone.as_deref())?;
        match name.parse::<Tz>() {
            Ok(tz) => Some(tz),
            Err(_) => {
                warn!(timezone = name, "Ignoring unknown agency timezone");
                None
            }
        }
    }
}

/// Maps each table's file name to its path inside the archive, preferring
/// the shallowest copy.
fn table_names<R: Read + Seek>(archive: &ZipArchive<R>) -> HashMap<String, String> {
    let mut names: HashMap<String, String> = HashMap::new();
    for path in archive.file_names() {
        let base = path.rsplit('/').next().unwrap_or(path);
        if base.is_empty() {
            continue;
        }
        names
            .entry(base.to_string())
            .and_modify(|existing| {
                if path.len() < existing.len() {
                    *existing = path.to_string();
                }
            })
            .or_insert_with(|| path.to_string());
    }
    names
}

fn read_table<T: DeserializeOwned, R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    names: &HashMap<String, String>,
    table: &'static str,
) -> Result<Option<Vec<T>>, ScheduleError> {
    let Some(path) = names.get(table) else {
        return Ok(None);
    };
    let file = archive.by_name(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(file);

    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record.map_err(|source| ScheduleError::Csv { table, source })?);
    }
    Ok(Some(rows))
}

fn required<T>(table: &'static str, rows: Option<Vec<T>>) -> Result<Vec<T>, ScheduleError> {
    rows.ok_or(ScheduleError::MissingTable { table })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// Builds an in-memory zip archive from `(path, contents)` pairs.
    pub(crate) fn zip_archive(files: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        for (path, contents) in files {
            writer.start_file(*path, options).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    pub(crate) const AGENCY: &str =
        "agency_id,agency_name,agency_url,agency_timezone\nA1,Metro,https://metro.example,Europe/Dublin\n";
    pub(crate) const ROUTES: &str = "route_id,agency_id,route_short_name,route_long_name,route_type\n\
        R42,A1,42,City - Airport,3\n\
        R7,A1,7,,3\n";
    pub(crate) const TRIPS: &str = "route_id,service_id,trip_id,trip_headsign,direction_id\n\
        R42,WK,T1,Airport,0\n\
        R42,WE,T2,Airport,0\n\
        R7,WK,T3,,1\n";
    pub(crate) const STOPS: &str = "stop_id,stop_code,stop_name,stop_lat,stop_lon\n\
        S1,1001,Main St,53.1,-6.1\n\
        S2,,Airport,53.2,-6.2\n";
    pub(crate) const STOP_TIMES: &str =
        "trip_id,arrival_time,departure_time,stop_id,stop_sequence\n\
        T1,08:15:00,08:16:00,S1,1\n\
        T1,25:10:00,25:10:00,S2,2\n\
        T2,09:00:00,09:00:00,S1,1\n\
        T3,10:00:00,,S1,1\n";
    // 2024-03-15 is a Friday.
    pub(crate) const CALENDAR: &str = "service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date\n\
        WK,1,1,1,1,1,0,0,20240101,20241231\n\
        WE,0,0,0,0,0,1,1,20240101,20241231\n";
    pub(crate) const CALENDAR_DATES: &str = "service_id,date,exception_type\n\
        WE,20240315,1\n\
        WK,20240401,2\n";

    pub(crate) fn sample_archive() -> Vec<u8> {
        zip_archive(&[
            ("agency.txt", AGENCY),
            ("routes.txt", ROUTES),
            ("trips.txt", TRIPS),
            ("stops.txt", STOPS),
            ("stop_times.txt", STOP_TIMES),
            ("calendar.txt", CALENDAR),
            ("calendar_dates.txt", CALENDAR_DATES),
        ])
    }

    #[test]
    fn test_decodes_all_tables() {
        let tables = GtfsTables::from_zip(&sample_archive()).unwrap();

        assert_eq!(tables.agency.len(), 1);
        assert_eq!(
            tables.agency[0].agency_timezone.as_deref(),
            Some("Europe/Dublin")
        );
        assert_eq!(tables.routes.len(), 2);
        assert_eq!(tables.routes[1].route_long_name, None);
        assert_eq!(tables.trips[2].trip_headsign, None);
        assert_eq!(tables.trips[2].direction_id, Some(1));
        assert_eq!(tables.stops[1].stop_code, None);
        assert_eq!(tables.stop_times.len(), 4);
        assert_eq!(tables.stop_times[3].departure_time, None);
        assert_eq!(tables.calendar.as_ref().map(Vec::len), Some(2));
        assert_eq!(tables.calendar_dates.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn test_finds_tables_in_subdirectory() {
        let bytes = zip_archive(&[
            ("gtfs/agency.txt", AGENCY),
            ("gtfs/routes.txt", ROUTES),
            ("gtfs/trips.txt", TRIPS),
            ("gtfs/stops.txt", STOPS),
            ("gtfs/stop_times.txt", STOP_TIMES),
            ("gtfs/calendar_dates.txt", CALENDAR_DATES),
        ]);
        let tables = GtfsTables::from_zip(&bytes).unwrap();
        assert!(tables.calendar.is_none());
        assert_eq!(tables.trips.len(), 3);
    }

    #[test]
    fn test_missing_required_table_is_an_error() {
        let bytes = zip_archive(&[("agency.txt", AGENCY), ("routes.txt", ROUTES)]);
        let err = GtfsTables::from_zip(&bytes).unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::MissingTable {
                table: "trips.txt"
            }
        ));
    }

    #[test]
    fn test_missing_both_calendars_is_an_error() {
        let bytes = zip_archive(&[
            ("agency.txt", AGENCY),
            ("routes.txt", ROUTES),
            ("trips.txt", TRIPS),
            ("stops.txt", STOPS),
            ("stop_times.txt", STOP_TIMES),
        ]);
        let err = GtfsTables::from_zip(&bytes).unwrap_err();
        assert!(matches!(err, ScheduleError::NoServiceCalendar));
    }

    #[test]
    fn test_malformed_column_is_a_csv_error() {
        let bytes = zip_archive(&[
            ("agency.txt", AGENCY),
            ("routes.txt", ROUTES),
            ("trips.txt", TRIPS),
            ("stops.txt", STOPS),
            (
                "stop_times.txt",
                "trip_id,arrival_time,departure_time,stop_id,stop_sequence\nT1,08:00:00,08:00:00,S1,first\n",
            ),
            ("calendar.txt", CALENDAR),
        ]);
        let err = GtfsTables::from_zip(&bytes).unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::Csv {
                table: "stop_times.txt",
                ..
            }
        ));
    }

    #[test]
    fn test_garbage_bytes_are_an_archive_error() {
        let err = GtfsTables::from_zip(b"not a zip").unwrap_err();
        assert!(matches!(err, ScheduleError::Archive(_)));
    }
}
