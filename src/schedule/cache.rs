//! Single-slot cache of the current day's schedule snapshot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::error::ScheduleError;
use super::snapshot::StaticSnapshot;
use super::tables::GtfsTables;
use crate::fetch::FeedFetcher;
use crate::time::ServiceClock;

/// Where the raw static tables come from.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    async fn fetch_tables(&self) -> Result<GtfsTables, ScheduleError>;
}

/// A GTFS zip archive at a URL or local path.
pub struct ArchiveSource {
    fetcher: Arc<dyn FeedFetcher>,
    url: String,
    timeout: Duration,
}

impl ArchiveSource {
    pub fn new(fetcher: Arc<dyn FeedFetcher>, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            fetcher,
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ScheduleSource for ArchiveSource {
    #[tracing::instrument(skip(self), fields(url = %self.url))]
    async fn fetch_tables(&self) -> Result<GtfsTables, ScheduleError> {
        let bytes = self.fetcher.fetch(&self.url, self.timeout).await?;
        info!(bytes = bytes.len(), "Static schedule archive downloaded");
        GtfsTables::from_zip(&bytes)
    }
}

/// Holds at most one [`StaticSnapshot`]; loading a different date replaces it.
///
/// A failed rebuild leaves the previous snapshot in place, where
/// [`ScheduleCache::stale`] can still reach it.
pub struct ScheduleCache {
    source: Arc<dyn ScheduleSource>,
    slot: Mutex<Option<Arc<StaticSnapshot>>>,
}

impl ScheduleCache {
    pub fn new(source: Arc<dyn ScheduleSource>) -> Self {
        Self {
            source,
            slot: Mutex::new(None),
        }
    }

    /// Returns the snapshot for the service day in progress at `now`,
    /// building it on a miss.
    ///
    /// The day is the local date in `zone`, else in the feed's agency time
    /// zone, else in UTC. A fresh archive decides its own zone before the
    /// date is picked.
    pub async fn load(
        &self,
        now: DateTime<Utc>,
        zone: Option<Tz>,
    ) -> Result<Arc<StaticSnapshot>, ScheduleError> {
        let today = |declared: Option<Tz>| {
            ServiceClock::new(zone.or(declared).unwrap_or(Tz::UTC)).today(now)
        };

        let mut slot = self.slot.lock().await;
        if let Some(snapshot) = slot.as_ref().filter(|s| s.date() == today(s.timezone())) {
            return Ok(Arc::clone(snapshot));
        }

        let built = match self.source.fetch_tables().await {
            Ok(tables) => StaticSnapshot::build(&tables, today(tables.timezone())),
            Err(e) => Err(e),
        };
        let snapshot = match built {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                warn!(
                    error = %e,
                    retained = ?slot.as_ref().map(|s| s.date()),
                    "Static schedule rebuild failed"
                );
                return Err(e);
            }
        };

        if let Some(previous) = slot.replace(Arc::clone(&snapshot)) {
            info!(
                evicted = %previous.date(),
                loaded = %snapshot.date(),
                "Static schedule replaced"
            );
        }
        Ok(snapshot)
    }

    /// The cached snapshot, whatever date it was built for.
    pub async fn stale(&self) -> Option<Arc<StaticSnapshot>> {
        self.slot.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchError;
    use crate::schedule::tables::tests::sample_archive;
    use bytes::Bytes;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        failing: AtomicBool,
    }

    impl CountingSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl ScheduleSource for CountingSource {
        async fn fetch_tables(&self) -> Result<GtfsTables, ScheduleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(ScheduleError::MissingTable { table: "trips.txt" });
            }
            GtfsTables::from_zip(&sample_archive())
        }
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    /// Noon UTC on 2024-03-`d`; Dublin is on GMT until the end of March.
    fn noon(d: u32) -> DateTime<Utc> {
        date(d).and_hms_opt(12, 0, 0).unwrap().and_utc()
    }

    #[tokio::test]
    async fn test_same_day_is_served_from_cache() {
        let source = CountingSource::new();
        let cache = ScheduleCache::new(source.clone());

        let first = cache.load(noon(15), None).await.unwrap();
        let second = cache.load(noon(15) + chrono::Duration::hours(3), None).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.date(), date(15));
        assert_eq!(first.timezone(), Some(chrono_tz::Europe::Dublin));
    }

    #[tokio::test]
    async fn test_new_day_evicts_previous_snapshot() {
        let source = CountingSource::new();
        let cache = ScheduleCache::new(source.clone());

        cache.load(noon(15), None).await.unwrap();
        let next = cache.load(noon(16), None).await.unwrap();

        assert_eq!(next.date(), date(16));
        assert_eq!(cache.stale().await.unwrap().date(), date(16));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zone_picks_the_local_day() {
        let source = CountingSource::new();
        let cache = ScheduleCache::new(source.clone());

        // 20:00 UTC on the 15th is already the 16th in Brisbane.
        let evening = date(15).and_hms_opt(20, 0, 0).unwrap().and_utc();
        let snapshot = cache
            .load(evening, Some(chrono_tz::Australia::Brisbane))
            .await
            .unwrap();

        assert_eq!(snapshot.date(), date(16));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_rebuild_retains_stale_snapshot() {
        let source = CountingSource::new();
        let cache = ScheduleCache::new(source.clone());
        cache.load(noon(15), None).await.unwrap();

        source.failing.store(true, Ordering::SeqCst);
        assert!(cache.load(noon(16), None).await.is_err());

        let stale = cache.stale().await.unwrap();
        assert_eq!(stale.date(), date(15));
    }

    #[tokio::test]
    async fn test_empty_cache_has_nothing_stale() {
        let source = CountingSource::new();
        source.failing.store(true, Ordering::SeqCst);
        let cache = ScheduleCache::new(source);

        assert!(cache.load(noon(15), None).await.is_err());
        assert!(cache.stale().await.is_none());
    }

    struct StaticBytes(Bytes);

    #[async_trait]
    impl FeedFetcher for StaticBytes {
        async fn fetch(&self, _url: &str, _timeout: Duration) -> Result<Bytes, FetchError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_archive_source_decodes_fetched_bytes() {
        let fetcher = Arc::new(StaticBytes(Bytes::from(sample_archive())));
        let source = ArchiveSource::new(fetcher, "gtfs.zip", Duration::from_secs(10));
        let tables = source.fetch_tables().await.unwrap();
        assert_eq!(tables.trips.len(), 3);
    }
}
