//! The polling pipeline: throttle, fetch, decode, reconcile, publish.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::board::Board;
use crate::config::{Config, ConfigError};
use crate::fetch::auth::ApiKey;
use crate::fetch::{BasicClient, FeedFetcher, FetchError, UrlFetcher};
use crate::gtfs_rt::FeedMessage;
use crate::normalize::{NormalizeOptions, normalize_trip_updates, normalize_vehicle_positions};
use crate::parser::parse_feed;
use crate::reconcile::reconcile;
use crate::schedule::{ArchiveSource, ScheduleCache, ScheduleError, StaticSnapshot};
use crate::stats::{BoardSummary, FeedSummary};
use crate::time::ServiceClock;

/// Why a refresh pass produced no board.
#[derive(Debug, thiserror::Error)]
pub enum PassError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub trip_update_url: String,
    pub vehicle_position_url: Option<String>,
    /// Minimum time between two passes.
    pub throttle: Duration,
    pub live_timeout: Duration,
    /// Overrides the agency time zone.
    pub timezone: Option<Tz>,
    pub normalize: NormalizeOptions,
    /// Reconcile against the last good snapshot when today's cannot be built.
    pub serve_stale_schedule: bool,
}

impl SourceSettings {
    pub fn new(trip_update_url: impl Into<String>) -> Self {
        Self {
            trip_update_url: trip_update_url.into(),
            vehicle_position_url: None,
            throttle: Duration::from_secs(60),
            live_timeout: Duration::from_secs(20),
            timezone: None,
            normalize: NormalizeOptions::default(),
            serve_stale_schedule: true,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            trip_update_url: config.trip_update_url.clone(),
            vehicle_position_url: config.vehicle_position_url.clone(),
            throttle: config.throttle(),
            live_timeout: config.live_timeout(),
            timezone: config.timezone,
            normalize: config.normalize_options(),
            serve_stale_schedule: config.serve_stale_schedule,
        }
    }
}

/// Owns the feeds, the schedule cache and the published board.
///
/// Shared between sensors behind an `Arc`. Passes are serialized; readers
/// always see a complete board.
pub struct DataSource {
    fetcher: Arc<dyn FeedFetcher>,
    schedule: ScheduleCache,
    settings: SourceSettings,
    last_attempt: Mutex<Option<Instant>>,
    board: RwLock<Arc<Board>>,
}

impl DataSource {
    pub fn new(
        fetcher: Arc<dyn FeedFetcher>,
        schedule: ScheduleCache,
        settings: SourceSettings,
    ) -> Self {
        Self {
            fetcher,
            schedule,
            settings,
            last_attempt: Mutex::new(None),
            board: RwLock::new(Arc::new(Board::empty())),
        }
    }

    /// Wires HTTP transport, authentication and the schedule archive from `config`.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let client = BasicClient::new();
        let invalid = |key| move |_: FetchError| ConfigError::InvalidApiKey { key };
        let fetcher: Arc<dyn FeedFetcher> = match (&config.api_key, &config.x_api_key) {
            (Some(key), _) => {
                let client = ApiKey::authorisation(client, key).map_err(invalid("api_key"))?;
                info!(header = %client.header_name(), "Feed requests carry an API key");
                Arc::new(UrlFetcher::new(client))
            }
            (None, Some(key)) => {
                let client = ApiKey::x_api_key(client, key).map_err(invalid("x_api_key"))?;
                info!(header = %client.header_name(), "Feed requests carry an API key");
                Arc::new(UrlFetcher::new(client))
            }
            (None, None) => Arc::new(UrlFetcher::new(client)),
        };

        let archive = ArchiveSource::new(
            Arc::clone(&fetcher),
            config.gtfs_url.clone(),
            config.static_timeout(),
        );
        Ok(Self::new(
            fetcher,
            ScheduleCache::new(Arc::new(archive)),
            SourceSettings::from_config(config),
        ))
    }

    /// The most recently published board.
    pub fn board(&self) -> Arc<Board> {
        match self.board.read() {
            Ok(board) => Arc::clone(&board),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn publish(&self, board: Arc<Board>) {
        match self.board.write() {
            Ok(mut slot) => *slot = board,
            Err(poisoned) => *poisoned.into_inner() = board,
        }
    }

    /// Refreshes if the throttle allows and returns the current board.
    ///
    /// Pass errors are logged; the previous board stays published.
    pub async fn poll(&self) -> Arc<Board> {
        match self.refresh().await {
            Ok(board) => board,
            Err(e) => {
                error!(error = %e, "Refresh failed, keeping previous board");
                self.board()
            }
        }
    }

    pub async fn refresh(&self) -> Result<Arc<Board>, PassError> {
        self.refresh_at(Utc::now()).await
    }

    /// Runs one pass as of `now`, unless the last attempt was within the throttle.
    #[tracing::instrument(skip_all, fields(now = %now))]
    pub async fn refresh_at(&self, now: DateTime<Utc>) -> Result<Arc<Board>, PassError> {
        let mut last_attempt = self.last_attempt.lock().await;
        if last_attempt.is_some_and(|at| at.elapsed() < self.settings.throttle) {
            debug!("Throttled, returning published board");
            return Ok(self.board());
        }
        *last_attempt = Some(Instant::now());

        let board = Arc::new(self.pass(now).await?);
        self.publish(Arc::clone(&board));
        info!(
            records = board.len(),
            unresolved = board.unresolved(),
            "Board published"
        );
        Ok(board)
    }

    async fn pass(&self, now: DateTime<Utc>) -> Result<Board, PassError> {
        let snapshot = self.snapshot(now).await?;
        let clock = ServiceClock::new(
            self.settings
                .timezone
                .or(snapshot.timezone())
                .unwrap_or(Tz::UTC),
        );

        let timeout = self.settings.live_timeout;
        let vehicles = async {
            match &self.settings.vehicle_position_url {
                Some(url) => self.fetcher.fetch(url, timeout).await.map(Some),
                None => Ok(None),
            }
        };
        let (trip_bytes, vehicle_bytes) = tokio::try_join!(
            self.fetcher.fetch(&self.settings.trip_update_url, timeout),
            vehicles
        )?;

        let trip_feed = decode("trip_updates", &trip_bytes);
        let updates = normalize_trip_updates(
            &trip_feed.entity,
            trip_feed.header.timestamp,
            &self.settings.normalize,
        );
        let positions = match vehicle_bytes {
            Some(bytes) => normalize_vehicle_positions(&decode("vehicle_positions", &bytes).entity),
            None => Default::default(),
        };

        let board = reconcile(&snapshot, &updates, &positions, now, &clock);
        let summary = BoardSummary::from_board(&board);
        debug!(
            service_date = %snapshot.date(),
            real_time_pct = summary.real_time_pct(),
            summary = ?summary,
            "Board summary"
        );
        Ok(board)
    }

    /// Today's snapshot, or the last good one moved onto today.
    async fn snapshot(&self, now: DateTime<Utc>) -> Result<Arc<StaticSnapshot>, ScheduleError> {
        let zone = self.settings.timezone;
        match self.schedule.load(now, zone).await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) if self.settings.serve_stale_schedule => match self.schedule.stale().await {
                Some(stale) => {
                    let today = ServiceClock::new(zone.or(stale.timezone()).unwrap_or(Tz::UTC))
                        .today(now);
                    warn!(
                        error = %e,
                        stale_date = %stale.date(),
                        %today,
                        "Serving stale static schedule"
                    );
                    Ok(Arc::new(stale.on_date(today)))
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }
}

/// Decodes a live feed; an undecodable feed counts as empty.
fn decode(feed: &'static str, bytes: &[u8]) -> FeedMessage {
    match parse_feed(bytes) {
        Ok(message) => {
            debug!(feed, summary = ?FeedSummary::from_feed(&message), "Feed decoded");
            message
        }
        Err(e) => {
            warn!(feed, error = %e, bytes = bytes.len(), "Failed to decode feed, treating as empty");
            FeedMessage::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtfs_rt::{FeedEntity, FeedHeader};
    use prost::Message;

    #[test]
    fn test_undecodable_feed_is_empty() {
        let feed = decode("trip_updates", &[0xFF, 0xFE, 0x00, 0x01]);
        assert!(feed.entity.is_empty());
    }

    #[test]
    fn test_decodes_valid_feed() {
        let message = FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                timestamp: Some(42),
                ..Default::default()
            },
            entity: vec![FeedEntity {
                id: "e1".to_string(),
                ..Default::default()
            }],
        };
        let feed = decode("trip_updates", &message.encode_to_vec());
        assert_eq!(feed.header.timestamp, Some(42));
        assert_eq!(feed.entity.len(), 1);
    }

    #[test]
    fn test_settings_follow_config() {
        let config: Config = serde_json::from_str(
            r#"{
                "trip_update_url": "https://example.com/tu",
                "vehicle_position_url": "https://example.com/vp",
                "gtfs_url": "https://example.com/gtfs.zip",
                "throttle_secs": 15,
                "timezone": "Europe/Dublin",
                "serve_stale_schedule": false
            }"#,
        )
        .unwrap();

        let settings = SourceSettings::from_config(&config);
        assert_eq!(settings.throttle, Duration::from_secs(15));
        assert_eq!(settings.live_timeout, Duration::from_secs(20));
        assert_eq!(settings.timezone, Some(chrono_tz::Europe::Dublin));
        assert_eq!(
            settings.vehicle_position_url.as_deref(),
            Some("https://example.com/vp")
        );
        assert!(!settings.serve_stale_schedule);
    }

    #[test]
    fn test_from_config_starts_with_empty_board() {
        let config: Config = serde_json::from_str(
            r#"{
                "trip_update_url": "https://example.com/tu",
                "gtfs_url": "https://example.com/gtfs.zip",
                "x_api_key": "secret"
            }"#,
        )
        .unwrap();
        let source = DataSource::from_config(&config).unwrap();
        assert!(source.board().is_empty());
    }
}
