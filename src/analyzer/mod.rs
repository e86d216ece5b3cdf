pub mod decode;
pub mod features;
pub mod tempo;

use crate::blob::{BlobError, BlobStore};
use crate::db::models::{Features, Track};
use crate::db::Database;
use decode::Decoder;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error("Decode error: {0}")]
    Decode(#[from] decode::DecodeError),
    #[error("Analysis error: {0}")]
    Analysis(#[from] features::AnalysisError),
    #[error("Blob error: {0}")]
    Blob(#[from] BlobError),
    #[error("Database error: {0}")]
    Db(#[from] crate::db::DbError),
    #[error("Worker pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct AnalyzeResult {
    pub analyzed: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Outcome of working on a single track (before the DB write).
enum TrackOutcome {
    Done(Features),
    Skipped(BlobError),
}

/// Decode a file and extract its features.
pub fn analyze_file(
    decoder: &dyn Decoder,
    path: &Path,
    mime: Option<&str>,
) -> Result<Features, AnalyzeError> {
    let pcm = decoder.decode(path, mime)?;
    Ok(features::extract(&pcm)?)
}

/// Analyze every pending track in parallel and store the results.
///
/// Tracks are processed in chunks: a chunk is analyzed on the rayon pool,
/// then its results are written before the next chunk starts, so progress
/// survives an interrupted run. A track whose blob is missing or empty is
/// skipped; any other failure leaves it unanalyzed.
pub fn analyze_tracks(
    db: &Database,
    blobs: &dyn BlobStore,
    decoder: &dyn Decoder,
    jobs: usize,
    include_deleted: bool,
) -> Result<AnalyzeResult, AnalyzeError> {
    let tracks = db.get_unanalyzed_tracks(include_deleted)?;

    if tracks.is_empty() {
        log::info!("No tracks to analyze");
        return Ok(AnalyzeResult::default());
    }

    let jobs = jobs.max(1);
    log::info!("Analyzing {} tracks with {} workers", tracks.len(), jobs);

    let pb = ProgressBar::new(tracks.len() as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("#>-"));
    }

    let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?;

    let mut result = AnalyzeResult::default();

    for chunk in tracks.chunks(jobs * 2) {
        let outcomes: Vec<_> = pool.install(|| {
            use rayon::prelude::*;
            chunk
                .par_iter()
                .map(|track| {
                    let outcome = analyze_track(track, blobs, decoder);
                    pb.inc(1);
                    (track.id, outcome)
                })
                .collect()
        });

        for (id, outcome) in outcomes {
            match outcome {
                Ok(TrackOutcome::Done(features)) => match db.store_features(id, &features) {
                    Ok(true) => result.analyzed += 1,
                    Ok(false) => {
                        log::info!("Track {id} was analyzed concurrently; keeping stored features");
                        result.skipped += 1;
                    }
                    Err(e) => {
                        log::error!("DB error storing features for track {id}: {e}");
                        result.failed += 1;
                    }
                },
                Ok(TrackOutcome::Skipped(reason)) => {
                    log::warn!("Skipping track {id}: {reason}");
                    result.skipped += 1;
                }
                Err(e) => {
                    log::warn!("Analysis of track {id} failed: {e}");
                    result.failed += 1;
                }
            }
        }

        pb.set_message(format!(
            "{} stored, {} failed, {} skipped",
            result.analyzed, result.failed, result.skipped
        ));
    }

    pb.finish_with_message(format!(
        "Done: {} analyzed, {} failed, {} skipped",
        result.analyzed, result.failed, result.skipped
    ));

    Ok(result)
}

fn analyze_track(
    track: &Track,
    blobs: &dyn BlobStore,
    decoder: &dyn Decoder,
) -> Result<TrackOutcome, AnalyzeError> {
    let path = match blobs.resolve(&track.storage_key) {
        Ok(path) => path,
        Err(e @ (BlobError::Missing(_) | BlobError::Empty(_))) => {
            return Ok(TrackOutcome::Skipped(e));
        }
        Err(e) => return Err(e.into()),
    };

    log::debug!("Analyzing track {}: {}", track.id, track.original_name);
    let features = analyze_file(decoder, &path, track.mime.as_deref())?;
    Ok(TrackOutcome::Done(features))
}
