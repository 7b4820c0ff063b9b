//! Static schedule error types.

use crate::fetch::FetchError;
use crate::time::TimeError;

/// Errors that prevent a static schedule snapshot from being built.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// Downloading the archive failed
    #[error("failed to fetch static schedule: {0}")]
    Fetch(#[from] FetchError),

    /// The archive is not a readable zip file
    #[error("malformed schedule archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// A required table is absent from the archive
    #[error("schedule archive has no {table}")]
    MissingTable { table: &'static str },

    /// A table could not be decoded
    #[error("failed to parse {table}: {source}")]
    Csv {
        table: &'static str,
        #[source]
        source: csv::Error,
    },

    /// A time or date column holds an unparseable value
    #[error("invalid value in {table}: {source}")]
    InvalidValue {
        table: &'static str,
        #[source]
        source: TimeError,
    },

    /// Neither calendar.txt nor calendar_dates.txt is present
    #[error("schedule archive has neither calendar.txt nor calendar_dates.txt")]
    NoServiceCalendar,
}
