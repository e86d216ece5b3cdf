use anyhow::{Context, Result};
use autodj::analyzer::decode::FfmpegDecoder;
use autodj::blob::{BlobStore, FsBlobStore};
use autodj::db::models::Track;
use autodj::db::Database;
use autodj::selector::{self, EnergyPlan};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "autodj", version, about = "Automatic DJ: analyze a music library and pick what plays next")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Directory holding imported audio
    #[arg(long, global = true)]
    library: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy audio files into the library as unanalyzed tracks
    Import {
        /// Files or directories to import
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Extract duration, tempo and energy for unanalyzed tracks
    Analyze {
        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,

        /// Also analyze tracks in the trash
        #[arg(long)]
        include_deleted: bool,
    },

    /// List tracks, newest first
    List {
        /// Include trashed tracks
        #[arg(long)]
        all: bool,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Pick the next track to play
    Next {
        /// Id of the track playing now
        #[arg(long)]
        current: Option<i64>,

        /// Target energy in [0, 1] (defaults to config)
        #[arg(long)]
        energy: Option<f64>,

        /// Already played track ids, comma separated
        #[arg(long, value_delimiter = ',')]
        history: Vec<i64>,

        /// Seed for a repeatable pick
        #[arg(long)]
        seed: Option<u64>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Build a whole set by chaining picks
    Set {
        /// Number of tracks
        #[arg(short = 'n', long, default_value = "10")]
        length: usize,

        /// Target energy, or the starting energy with --ramp-to
        #[arg(long)]
        energy: Option<f64>,

        /// Ramp the target energy linearly to this value by the last track
        #[arg(long)]
        ramp_to: Option<f64>,

        /// Track to start from (not included in the set)
        #[arg(long)]
        start: Option<i64>,

        /// Seed for a repeatable set
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Move tracks to the trash
    Trash {
        #[arg(required = true)]
        ids: Vec<i64>,
    },

    /// Take tracks back out of the trash
    Restore {
        #[arg(required = true)]
        ids: Vec<i64>,
    },

    /// Permanently delete tracks and their audio
    Purge {
        #[arg(required = true)]
        ids: Vec<i64>,
    },

    /// Permanently delete everything in the trash
    EmptyTrash,

    /// Show library statistics
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = autodj::config::AppConfig::load();

    // Resolve paths: CLI > config > XDG default
    let db_path = cli
        .db_path
        .or(config.db_path.clone())
        .unwrap_or_else(autodj::config::default_db_path);
    let library_dir = cli
        .library
        .or(config.library_dir.clone())
        .unwrap_or_else(autodj::config::default_library_dir);
    log::info!("Database: {}", db_path.display());
    log::info!("Library: {}", library_dir.display());

    let db = Database::open(&db_path).context("Failed to open database")?;
    let blobs = FsBlobStore::new(&library_dir).context("Failed to open audio library")?;

    match cli.command {
        Commands::Import { paths } => {
            let result = autodj::ingest::import(&db, &blobs, &paths).context("Import failed")?;
            println!(
                "Import complete: {} imported, {} skipped, {} errors",
                result.imported.len(),
                result.skipped,
                result.errors
            );
        }

        Commands::Analyze { jobs, include_deleted } => {
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let mut decoder = FfmpegDecoder::new(&config.decoder.program);
            if let Some(dir) = &config.decoder.scratch_dir {
                decoder = decoder.with_scratch_dir(dir);
            }
            let result = autodj::analyzer::analyze_tracks(
                &db,
                &blobs,
                &decoder,
                workers,
                include_deleted || config.dj.include_deleted,
            )
            .context("Analysis failed")?;
            println!(
                "Analysis complete: {} analyzed, {} failed, {} skipped",
                result.analyzed, result.failed, result.skipped
            );
        }

        Commands::List { all, json } => {
            let tracks = db.list_tracks(all).context("Query failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tracks)?);
            } else if tracks.is_empty() {
                println!("No tracks. Import some with `autodj import <paths>`.");
            } else {
                print_track_table(&tracks);
            }
        }

        Commands::Next { current, energy, history, seed, json } => {
            let target = energy.unwrap_or(config.dj.target_energy);
            let history: HashSet<i64> = history.into_iter().collect();
            let mut rng = make_rng(seed);

            let pick = selector::next_track(
                &db,
                current,
                target,
                &history,
                config.dj.include_deleted,
                &mut rng,
            )
            .context("Selection failed")?;

            match (pick, json) {
                (None, true) => println!("null"),
                (None, false) => println!("nothing to play"),
                (Some(pick), true) => {
                    let out = serde_json::json!({
                        "id": pick.track.id,
                        "storage_key": pick.track.storage_key,
                        "original_name": pick.track.original_name,
                        "mime": pick.track.mime,
                        "duration": pick.features.duration,
                        "bpm": pick.features.bpm,
                        "energy": pick.features.energy,
                        "score": pick.score,
                        "path": blobs.resolve(&pick.track.storage_key).ok(),
                    });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
                (Some(pick), false) => {
                    println!(
                        "{:>5}  {}  ({:.1} BPM, energy {:.2}, {}, score {:.2})",
                        pick.track.id,
                        pick.track.original_name,
                        pick.features.bpm,
                        pick.features.energy,
                        format_duration(pick.features.duration),
                        pick.score
                    );
                }
            }
        }

        Commands::Set { length, energy, ramp_to, start, seed } => {
            let from = energy.unwrap_or(config.dj.target_energy);
            let plan = match ramp_to {
                Some(to) => EnergyPlan::Ramp { from, to },
                None => EnergyPlan::Constant(from),
            };

            let candidates = db
                .get_candidates(config.dj.include_deleted)
                .context("Query failed")?;
            let start_track = match start {
                Some(id) => Some(
                    db.get_track(id)
                        .context("Query failed")?
                        .with_context(|| format!("No track with id {id}"))?,
                ),
                None => None,
            };

            let mut rng = make_rng(seed);
            let set = selector::build_set(&candidates, start_track.as_ref(), plan, length, &mut rng)
                .context("Set building failed")?;

            if set.is_empty() {
                println!("nothing to play");
                return Ok(());
            }

            println!("{:>3}  {:>5}  {:<40} {:>6} {:>6} {:>6}", "#", "Id", "Track", "BPM", "Energy", "Time");
            println!("{}", "-".repeat(74));
            for (i, choice) in set.iter().enumerate() {
                println!(
                    "{:>3}  {:>5}  {:<40} {:>6.1} {:>6.2} {:>6}",
                    i + 1,
                    choice.track.id,
                    truncate(&choice.track.original_name, 40),
                    choice.features.bpm,
                    choice.features.energy,
                    format_duration(choice.features.duration),
                );
            }
            let total: f64 = set.iter().map(|c| c.features.duration).sum();
            println!();
            println!("{} tracks, {}", set.len(), format_duration(total));
        }

        Commands::Trash { ids } => {
            let n = db.set_deleted(&ids, true).context("Trash failed")?;
            println!("Moved {n} track(s) to the trash");
        }

        Commands::Restore { ids } => {
            let n = db.set_deleted(&ids, false).context("Restore failed")?;
            println!("Restored {n} track(s)");
        }

        Commands::Purge { ids } => {
            let removed = db.purge(&ids).context("Purge failed")?;
            remove_blobs(&blobs, &removed);
            println!("Permanently deleted {} track(s)", removed.len());
        }

        Commands::EmptyTrash => {
            let removed = db.purge_trash().context("Emptying trash failed")?;
            remove_blobs(&blobs, &removed);
            println!("Permanently deleted {} track(s)", removed.len());
        }

        Commands::Stats => {
            let stats = db.stats().context("Failed to get stats")?;
            println!("Library Statistics");
            println!("==================");
            println!("Total tracks:     {}", stats.total_tracks);
            println!("Analyzed tracks:  {}", stats.analyzed_tracks);
            println!("In trash:         {}", stats.deleted_tracks);
            println!(
                "Total duration:   {:.1} hours",
                stats.total_duration_secs / 3600.0
            );
            if let Some(bpm) = stats.mean_bpm {
                println!("Mean tempo:       {:.1} BPM", bpm);
            }
            if let Some(energy) = stats.mean_energy {
                println!("Mean energy:      {:.2}", energy);
            }
        }
    }

    Ok(())
}

fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Blob removal after a purge is best-effort: the rows are already gone.
fn remove_blobs(blobs: &dyn BlobStore, tracks: &[Track]) {
    for track in tracks {
        if let Err(e) = blobs.remove(&track.storage_key) {
            log::warn!("Failed to remove audio for track {}: {}", track.id, e);
        }
    }
}

fn print_track_table(tracks: &[Track]) {
    println!(
        "{:>5}  {:<40} {:>6} {:>6} {:>6}  {}",
        "Id", "Track", "BPM", "Energy", "Time", "State"
    );
    println!("{}", "-".repeat(80));

    for t in tracks {
        let (bpm, energy, time) = match t.features {
            Some(f) => (
                format!("{:.1}", f.bpm),
                format!("{:.2}", f.energy),
                format_duration(f.duration),
            ),
            None => ("-".into(), "-".into(), "-".into()),
        };
        let state = match (t.deleted, t.is_analyzed()) {
            (true, _) => "trash",
            (false, true) => "ready",
            (false, false) => "pending",
        };
        println!(
            "{:>5}  {:<40} {:>6} {:>6} {:>6}  {}",
            t.id,
            truncate(&t.original_name, 40),
            bpm,
            energy,
            time,
            state
        );
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max - 3).collect();
        format!("{head}...")
    } else {
        s.to_string()
    }
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}
