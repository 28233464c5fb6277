use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};

use trackstats::logging::{init_logging, log_error, LogFormat, LogLevel};
use trackstats::replay::replay_track_with_progress;
use trackstats::{
    AppConfig, Database, RecordingState, Track, TrackId, TrackPoint, TrackPointType,
    TrackRecorder, TrackStatistics, TrackStatsError,
};

/// trackstats - GPS track statistics CLI
///
/// Stores recorded tracks in SQLite and derives distance, moving time,
/// speed, altitude and sensor statistics from their points.
#[derive(Parser)]
#[command(name = "trackstats")]
#[command(version)]
#[command(about = "GPS track statistics CLI", long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Overrides the database path from the config
    #[arg(short, long, value_name = "FILE")]
    database: Option<PathBuf>,

    /// Increase verbosity of output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log level, overriding the config (error, warn, info, debug, trace)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    /// Log format, overriding the config (pretty, json, compact)
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file and create the database
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Record a track from a JSON-lines file of track points
    Ingest {
        /// Points, one JSON object per line, in time order
        file: PathBuf,

        /// Track name (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,

        /// Activity type, e.g. "running"
        #[arg(short, long)]
        activity: Option<String>,
    },

    /// List stored tracks
    Tracks,

    /// Show the statistics summary and markers of a track
    Show {
        track_id: i64,
    },

    /// Recompute statistics by replaying stored points
    Recompute {
        /// Track to recompute (all tracks when omitted)
        track_id: Option<i64>,
    },

    /// Time-weighted heart rate, cadence and power of a track
    SensorStats {
        track_id: i64,
    },

    /// Delete a track with its points and markers
    Delete {
        track_id: i64,
    },

    /// Show the effective configuration
    Config {
        /// Only print the config file path
        #[arg(long)]
        path: bool,
    },
}

#[derive(Tabled)]
struct TrackRow {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Start")]
    start: String,
    #[tabled(rename = "Distance")]
    distance: String,
    #[tabled(rename = "Time")]
    total_time: String,
    #[tabled(rename = "Moving")]
    moving_time: String,
    #[tabled(rename = "Avg km/h")]
    average_speed: String,
}

#[derive(Tabled)]
struct MetricRow {
    #[tabled(rename = "Metric")]
    metric: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        match err.downcast_ref::<TrackStatsError>() {
            Some(known) => {
                log_error(known);
                eprintln!("{} {}", "Error:".red().bold(), known.user_message());
            }
            None => eprintln!("{} {:#}", "Error:".red().bold(), err),
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = AppConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;

    let mut log_config = config.logging.clone();
    if let Some(level) = cli.log_level {
        log_config.level = level;
    }
    if let Some(format) = cli.log_format {
        log_config.format = format;
    }
    for _ in 0..cli.verbose {
        log_config.level = log_config.level.more_verbose();
    }
    init_logging(&log_config).context("Failed to initialize logging")?;

    let database_path = cli
        .database
        .clone()
        .unwrap_or_else(|| config.store.database_path.clone());
    let open_database = || -> Result<Database> {
        if let Some(parent) = database_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Database::new(&database_path)
            .with_context(|| format!("Failed to open database {}", database_path.display()))
    };

    match cli.command {
        Commands::Init { force } => {
            let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_config_path);
            if config_path.exists() && !force {
                println!(
                    "{} {}",
                    "Config already exists:".yellow(),
                    config_path.display()
                );
            } else {
                config.save_to_file(&config_path)?;
                println!("{} {}", "✓ Wrote config".green(), config_path.display());
            }
            open_database()?;
            println!("{} {}", "✓ Database ready".green(), database_path.display());
        }

        Commands::Ingest { file, name, activity } => {
            let db = open_database()?;
            let name = name.unwrap_or_else(|| {
                file.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "Imported track".to_string())
            });
            let mut track = Track::new(name);
            track.activity_type = activity;

            let (track_id, stats) = ingest(&db, &track, &file, &config)?;
            print_statistics(track_id, &track.name, &stats, cli.json)?;
        }

        Commands::Tracks => {
            let db = open_database()?;
            let tracks = db.list_tracks()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&tracks)?);
            } else if tracks.is_empty() {
                println!("{}", "No tracks stored".dimmed());
            } else {
                let rows: Vec<TrackRow> = tracks
                    .iter()
                    .map(|track| TrackRow {
                        id: track.id.map_or(0, |id| id.0),
                        name: track.name.clone(),
                        start: track
                            .statistics
                            .start_time()
                            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        distance: format_distance(track.statistics.total_distance()),
                        total_time: format_duration(track.statistics.total_time()),
                        moving_time: format_duration(track.statistics.moving_time()),
                        average_speed: format!("{:.1}", track.statistics.average_moving_speed() * 3.6),
                    })
                    .collect();
                println!("{}", Table::new(rows).with(Style::rounded()));
            }
        }

        Commands::Show { track_id } => {
            let db = open_database()?;
            let track_id = TrackId(track_id);
            let track = db.get_track(track_id)?;
            let markers = db.get_markers(track_id)?;
            if cli.json {
                let value = serde_json::json!({ "track": track, "markers": markers });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                print_statistics(track_id, &track.name, &track.statistics, false)?;
                for marker in markers {
                    println!(
                        "  {} {} {}",
                        "◆".cyan(),
                        marker.time.format("%H:%M:%S"),
                        marker.name
                    );
                }
            }
        }

        Commands::Recompute { track_id } => {
            let db = open_database()?;
            let track_ids: Vec<TrackId> = match track_id {
                Some(id) => vec![TrackId(id)],
                None => db.list_tracks()?.into_iter().filter_map(|t| t.id).collect(),
            };

            for track_id in track_ids {
                let track = db.get_track(track_id)?;
                let total = db.count_track_points(track_id)?;

                let pb = ProgressBar::new(total as u64);
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                        .context("Invalid progress template")?
                        .progress_chars("#>-"),
                );
                pb.set_message(track.name.clone());

                let stats = replay_track_with_progress(
                    &db,
                    track_id,
                    config.statistics,
                    config.store.page_size,
                    |_| pb.inc(1),
                )?;
                db.update_track_statistics(track_id, &stats)?;
                pb.finish_and_clear();

                if cli.json {
                    println!("{}", serde_json::to_string(&stats)?);
                } else {
                    println!(
                        "{} {} ({} points, {})",
                        "✓ Recomputed".green(),
                        track.name,
                        total,
                        format_distance(stats.total_distance())
                    );
                }
            }
        }

        Commands::SensorStats { track_id } => {
            let db = open_database()?;
            let stats = db.get_sensor_stats(TrackId(track_id))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else if !stats.has_data() {
                println!("{}", "No sensor data recorded for this track".dimmed());
            } else {
                let rows = vec![
                    MetricRow { metric: "Avg heart rate (bpm)", value: format_optional(stats.avg_heart_rate, 0) },
                    MetricRow { metric: "Max heart rate (bpm)", value: format_optional(stats.max_heart_rate, 0) },
                    MetricRow { metric: "Avg cadence (rpm)", value: format_optional(stats.avg_cadence, 0) },
                    MetricRow { metric: "Max cadence (rpm)", value: format_optional(stats.max_cadence, 0) },
                    MetricRow { metric: "Avg power (W)", value: format_optional(stats.avg_power, 0) },
                    MetricRow { metric: "Max power (W)", value: format_optional(stats.max_power, 0) },
                ];
                println!("{}", Table::new(rows).with(Style::rounded()));
            }
        }

        Commands::Delete { track_id } => {
            let mut db = open_database()?;
            let summary = db.delete_track(TrackId(track_id))?;
            println!(
                "{} track {} ({} points, {} markers)",
                "✓ Deleted".green(),
                track_id,
                summary.track_points,
                summary.markers
            );
        }

        Commands::Config { path } => {
            let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_config_path);
            if path {
                println!("{}", config_path.display());
            } else if cli.json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("{}", format!("# {}", config_path.display()).dimmed());
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Feeds a JSON-lines point file through a recording session
fn ingest(
    db: &Database,
    track: &Track,
    file: &Path,
    config: &AppConfig,
) -> Result<(TrackId, TrackStatistics)> {
    let reader = BufReader::new(
        File::open(file).with_context(|| format!("Failed to open {}", file.display()))?,
    );

    let mut points = reader.lines().enumerate().filter_map(|(index, line)| match line {
        Ok(line) if line.trim().is_empty() => None,
        Ok(line) => Some(
            serde_json::from_str::<TrackPoint>(&line)
                .with_context(|| format!("Invalid track point on line {}", index + 1)),
        ),
        Err(err) => Some(Err(err.into())),
    });

    let first = match points.next() {
        Some(point) => point?,
        None => bail!("{} contains no track points", file.display()),
    };

    let start_time = first.time;
    let mut recorder = if first.point_type.is_segment_start() {
        TrackRecorder::start_with_marker(db, track, config.statistics, first)?
    } else {
        let mut recorder = TrackRecorder::start(db, track, config.statistics, start_time)?;
        recorder.record(first)?;
        recorder
    };

    let mut last_time = None;
    for point in points {
        let point = point?;
        last_time = Some(point.time);
        match (point.point_type, recorder.state()) {
            (TrackPointType::SegmentEndManual, RecordingState::Recording) => recorder.pause(point.time)?,
            (TrackPointType::SegmentEndManual, _) => {}
            (TrackPointType::SegmentStartManual, RecordingState::Paused) => recorder.resume(point.time)?,
            (_, RecordingState::Paused) => {
                tracing::warn!(time = %point.time, "Skipping point recorded while paused");
            }
            _ => {
                recorder.record(point)?;
            }
        }
    }

    let stats = recorder.finish(last_time.unwrap_or(start_time))?;
    Ok((recorder.track_id(), stats))
}

fn print_statistics(track_id: TrackId, name: &str, stats: &TrackStatistics, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(stats)?);
        return Ok(());
    }

    println!("{} {} {}", "Track".bold(), track_id.to_string().cyan(), name.bold());
    let rows = vec![
        MetricRow { metric: "Distance", value: format_distance(stats.total_distance()) },
        MetricRow { metric: "Total time", value: format_duration(stats.total_time()) },
        MetricRow { metric: "Moving time", value: format_duration(stats.moving_time()) },
        MetricRow { metric: "Avg speed (km/h)", value: format!("{:.1}", stats.average_speed() * 3.6) },
        MetricRow { metric: "Avg moving speed (km/h)", value: format!("{:.1}", stats.average_moving_speed() * 3.6) },
        MetricRow { metric: "Max speed (km/h)", value: format!("{:.1}", stats.max_speed() * 3.6) },
        MetricRow { metric: "Min altitude (m)", value: format_optional(stats.min_altitude(), 0) },
        MetricRow { metric: "Max altitude (m)", value: format_optional(stats.max_altitude(), 0) },
        MetricRow { metric: "Altitude gain (m)", value: format_optional(stats.total_altitude_gain(), 0) },
        MetricRow { metric: "Altitude loss (m)", value: format_optional(stats.total_altitude_loss(), 0) },
        MetricRow { metric: "Avg heart rate (bpm)", value: format_optional(stats.average_heart_rate(), 0) },
        MetricRow { metric: "Avg cadence (rpm)", value: format_optional(stats.average_cadence(), 0) },
        MetricRow { metric: "Avg power (W)", value: format_optional(stats.average_power(), 0) },
    ];
    println!("{}", Table::new(rows).with(Style::rounded()));
    Ok(())
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

fn format_distance(meters: f64) -> String {
    if meters >= 1000.0 {
        format!("{:.2} km", meters / 1000.0)
    } else {
        format!("{:.0} m", meters)
    }
}

fn format_optional(value: Option<f64>, precision: usize) -> String {
    value
        .map(|v| format!("{:.*}", precision, v))
        .unwrap_or_else(|| "-".to_string())
}
