//! CLI entry point for the GTFS-RT departure board.
//!
//! Provides subcommands for polling configured departure sensors, running a
//! single pass, and inspecting a raw GTFS-RT feed.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use gtfs_rt_departures::{
    config::{Config, DepartureConfig},
    fetch::{BasicClient, FeedFetcher, UrlFetcher},
    output::{SensorState, append_departures, print_json, print_pretty},
    parser::parse_feed,
    source::DataSource,
    stats::FeedSummary,
};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "gtfs_rt_departures")]
#[command(about = "Next-departure boards from GTFS and GTFS-RT feeds", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the feeds and report every configured departure sensor
    Watch {
        /// JSON configuration file
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,

        /// Seconds between polls
        #[arg(short, long, default_value_t = 60)]
        interval: u64,

        /// CSV file to append departures to
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Number of polls to run (0 = infinite)
        #[arg(short = 'n', long, default_value_t = 0)]
        iterations: usize,
    },
    /// Run one pass and print the departures of each sensor
    Board {
        /// JSON configuration file
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,

        /// Only report the sensor with this name
        #[arg(short, long)]
        departure: Option<String>,

        /// Print sensor states as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Decode a GTFS-RT feed from a file or URL and summarise it
    Inspect {
        /// Path to file or URL to fetch
        #[arg(value_name = "FILE_OR_URL")]
        source: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path = std::env::var("LOG_FILE_PATH")
        .unwrap_or_else(|_| "logs/gtfs_rt_departures.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("gtfs_rt_departures.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch {
            config,
            interval,
            csv,
            iterations,
        } => {
            let config = load_config(&config)?;
            watch(&config, interval, csv.as_deref(), iterations).await?;
        }
        Commands::Board {
            config,
            departure,
            json,
        } => {
            let config = load_config(&config)?;
            let source = DataSource::from_config(&config)?;
            let board = source
                .refresh()
                .await
                .context("failed to build departure board")?;

            let selected = select(&config, departure.as_deref())?;
            let now = Utc::now();
            let mut sensors = Vec::with_capacity(selected.len());
            for departure in selected {
                let results = board.query(&departure.query()?, now);
                for record in &results {
                    info!(
                        sensor = %departure.name,
                        trip_id = %record.trip_id,
                        route = ?record.route_short_name.as_ref().or(record.route_id.as_ref()),
                        stop = %record.stop_id,
                        arrival = record.updated_arrival_epoch_s,
                        delay_s = record.delay_s,
                        real_time = record.real_time_flag,
                        "Departure"
                    );
                }
                sensors.push(SensorState::from_departures(
                    departure,
                    &results,
                    now,
                    board.timezone(),
                ));
            }

            if json {
                print_json(&sensors)?;
            } else {
                sensors.iter().for_each(print_pretty);
            }
        }
        Commands::Inspect { source } => {
            let fetcher = UrlFetcher::new(BasicClient::new());
            let bytes = fetcher
                .fetch(&source, Duration::from_secs(20))
                .await
                .with_context(|| format!("failed to load {source}"))?;
            let feed = parse_feed(&bytes).context("failed to decode GTFS-RT feed")?;
            let summary = FeedSummary::from_feed(&feed);
            info!(
                source = %source,
                entities = summary.total_entities,
                trip_updates = summary.trip_updates,
                stop_time_updates = summary.stop_time_updates,
                vehicles = summary.vehicles,
                in_service = summary.in_service_vehicles,
                arrival_time_pct = summary.arrival_time_pct(),
                "Feed summary"
            );
            info!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load(path)
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    if config.departures.is_empty() {
        warn!(path = %path.display(), "No departures configured");
    }
    Ok(config)
}

fn select<'a>(config: &'a Config, name: Option<&str>) -> Result<Vec<&'a DepartureConfig>> {
    match name {
        Some(name) => match config.departure(name) {
            Some(departure) => Ok(vec![departure]),
            None => bail!("no departure named {name:?} in configuration"),
        },
        None => Ok(config.departures.iter().collect()),
    }
}

/// Polls the data source on a fixed interval, reporting every sensor after
/// each poll.
#[tracing::instrument(skip(config, csv))]
async fn watch(
    config: &Config,
    interval: u64,
    csv: Option<&Path>,
    iterations: usize,
) -> Result<()> {
    let source = DataSource::from_config(config)?;
    let queries = config
        .departures
        .iter()
        .map(|d| d.query().map(|q| (d, q)))
        .collect::<Result<Vec<_>, _>>()?;

    if iterations == 0 {
        info!(interval, "Polling indefinitely. Press Ctrl+C to stop.");
    } else {
        info!(iterations, interval, "Starting polling");
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
    let mut count = 0;
    loop {
        if iterations > 0 && count >= iterations {
            break;
        }
        ticker.tick().await;
        count += 1;

        let board = source.poll().await;
        let now = Utc::now();
        info!(
            poll = count,
            records = board.len(),
            generated_at = %board.generated_at(),
            "Board ready"
        );

        for (departure, query) in &queries {
            let results = board.query(query, now);
            print_pretty(&SensorState::from_departures(
                departure,
                &results,
                now,
                board.timezone(),
            ));

            if let Some(path) = csv {
                if let Err(e) = append_departures(path, &departure.name, now, &results) {
                    error!(path = %path.display(), error = %e, "Failed to append departures");
                }
            }
        }
    }

    Ok(())
}
