use std::path::PathBuf;
use std::sync::Arc;

use alignment_planner::{
    best_shot_days, stats, AlignmentService, Body, DateRange, FileCacheStore, Location,
    LowPrecisionEphemeris, Observer, PlannerConfig, SceneFilter, SearchMode, SearchRequest,
};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "alignment", about = "Diamond and pearl alignment planner")]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Event cache directory (defaults to the user data directory)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone, Copy)]
struct ObserverArgs {
    /// Latitude in degrees
    #[arg(long, allow_hyphen_values = true)]
    lat: f64,
    /// Longitude in degrees
    #[arg(long, allow_hyphen_values = true)]
    lon: f64,
    /// Elevation in meters
    #[arg(long, default_value = "0")]
    elevation: f64,
    /// Saved location id, used for cache keys and event ids
    #[arg(long)]
    location_id: Option<u64>,
}

impl ObserverArgs {
    fn observer(&self) -> Observer {
        Observer::new(self.lat, self.lon, self.elevation)
    }

    fn request(&self, start: NaiveDate, end: NaiveDate) -> SearchRequest {
        let mut request = SearchRequest::new(self.observer(), start, end);
        request.location_id = self.location_id;
        request
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SceneArg {
    All,
    Diamond,
    Pearl,
}

impl From<SceneArg> for SceneFilter {
    fn from(arg: SceneArg) -> Self {
        match arg {
            SceneArg::All => SceneFilter::All,
            SceneArg::Diamond => SceneFilter::Diamond,
            SceneArg::Pearl => SceneFilter::Pearl,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Auto,
    Fast,
    Balanced,
    Precise,
}

impl From<ModeArg> for SearchMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Auto => SearchMode::Auto,
            ModeArg::Fast => SearchMode::Fast,
            ModeArg::Balanced => SearchMode::Balanced,
            ModeArg::Precise => SearchMode::Precise,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum BodyArg {
    Sun,
    Moon,
}

impl From<BodyArg> for Body {
    fn from(arg: BodyArg) -> Self {
        match arg {
            BodyArg::Sun => Body::Sun,
            BodyArg::Moon => Body::Moon,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Find alignments between two local dates (inclusive)
    Search {
        #[command(flatten)]
        observer: ObserverArgs,
        /// First date (YYYY-MM-DD)
        #[arg(long)]
        start: NaiveDate,
        /// Last date (YYYY-MM-DD)
        #[arg(long)]
        end: NaiveDate,
        #[arg(long, value_enum, default_value = "all")]
        scene: SceneArg,
        #[arg(long, value_enum, default_value = "auto")]
        mode: ModeArg,
        /// Maximum number of events to print
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Where to stand so the apex and the body share an elevation angle
    Elevation {
        /// Local date (YYYY-MM-DD)
        #[arg(long)]
        date: NaiveDate,
        #[arg(long, value_enum, default_value = "sun")]
        body: BodyArg,
        /// Target elevations in degrees, comma separated
        #[arg(long, value_delimiter = ',')]
        elevations: Option<Vec<f64>>,
    },
    /// Best days of a month for one observer
    BestDays {
        #[command(flatten)]
        observer: ObserverArgs,
        #[arg(long)]
        year: i32,
        #[arg(long)]
        month: u32,
        #[arg(long, default_value = "5")]
        limit: usize,
    },
    /// Yearly statistics for one observer
    Stats {
        #[command(flatten)]
        observer: ObserverArgs,
        #[arg(long)]
        year: i32,
        #[arg(long, value_enum, default_value = "fast")]
        mode: ModeArg,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PlannerConfig::load_from(path)?,
        None => PlannerConfig::load_or_default()?,
    };
    let store = match &cli.cache_dir {
        Some(dir) => FileCacheStore::new(dir.clone()),
        None => FileCacheStore::in_default_dir()?,
    };
    let service =
        AlignmentService::from_config(&config, Arc::new(LowPrecisionEphemeris::default()), store)?;
    let utc_offset = config.utc_offset()?;

    match cli.command {
        Commands::Search {
            observer,
            start,
            end,
            scene,
            mode,
            limit,
        } => {
            let mut request = observer
                .request(start, end)
                .with_scene(scene.into())
                .with_mode(mode.into());
            request.limit = limit;
            print_json(&service.search(&request).await?)?;
        }

        Commands::Elevation {
            date,
            body,
            elevations,
        } => {
            let points = service.elevation_points(date, body.into(), elevations).await?;
            print_json(&points)?;
        }

        Commands::BestDays {
            observer,
            year,
            month,
            limit,
        } => {
            let range = DateRange::month(year, month)
                .ok_or_else(|| format!("invalid month {year}-{month}"))?;
            let request = observer.request(range.start, range.end);
            let result = service.search(&request).await?;
            print_json(&best_shot_days(&result.events, year, month, limit, utc_offset))?;
        }

        Commands::Stats {
            observer,
            year,
            mode,
        } => {
            let start = NaiveDate::from_ymd_opt(year, 1, 1).ok_or("invalid year")?;
            let end = NaiveDate::from_ymd_opt(year, 12, 31).ok_or("invalid year")?;
            let request = observer.request(start, end).with_mode(mode.into());
            let result = service.search(&request).await?;

            let locations: Vec<Location> = observer
                .location_id
                .map(|id| Location {
                    id,
                    name: format!("location {id}"),
                    observer: observer.observer(),
                })
                .into_iter()
                .collect();
            print_json(&stats(&result.events, year, &locations, utc_offset))?;
        }
    }

    Ok(())
}
