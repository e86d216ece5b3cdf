//! Next-track selection.
//!
//! Each eligible candidate gets a score from how close its energy is to the
//! target, how well its tempo continues the current track, and a mild
//! preference for longer tracks, plus a little jitter. One of the top
//! [`TOP_K`] is then drawn at random, weighted by score, so the same
//! situation does not always produce the same pick while well-matched
//! tracks still win most of the time.

use crate::db::models::{Features, Track};
use crate::db::{Database, DbError};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use std::collections::HashSet;
use thiserror::Error;

/// Number of best-scoring candidates the pick is drawn from.
pub const TOP_K: usize = 5;

const ENERGY_WEIGHT: f64 = 2.0;
const TEMPO_WEIGHT: f64 = 2.0;
/// Soft tempo bandwidth: a 6 BPM gap scores `TEMPO_WEIGHT / e`.
const TEMPO_BANDWIDTH_BPM: f64 = 6.0;
const DURATION_WEIGHT: f64 = 0.2;
/// Tracks at least this long get the full duration bonus.
const FULL_LENGTH_SECS: f64 = 240.0;
const JITTER: f64 = 0.05;
/// Floor on sampling weight so every top-K candidate stays reachable.
const MIN_WEIGHT: f64 = 1e-3;

#[derive(Error, Debug, PartialEq)]
pub enum SelectError {
    #[error("target energy must be within [0, 1], got {0}")]
    InvalidTargetEnergy(f64),
    #[error("candidate {id} is inconsistent: {reason}")]
    Inconsistent { id: i64, reason: String },
}

/// What the selector knows about the moment of choosing.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    /// The track playing now, if any. Never selected again.
    pub current: Option<&'a Track>,
    pub target_energy: f64,
    /// Ids that must not be selected.
    pub history: &'a HashSet<i64>,
}

/// A selected track together with its features and the score it won with.
#[derive(Debug, Clone, PartialEq)]
pub struct Choice<'a> {
    pub track: &'a Track,
    pub features: Features,
    pub score: f64,
}

/// Closeness of `energy` to `target`, worth up to 2.0.
pub fn energy_term(energy: f64, target: f64) -> f64 {
    ENERGY_WEIGHT * (1.0 - (energy - target).abs())
}

/// Gaussian tempo continuity, worth up to 2.0 at equal tempo.
/// Contributes nothing unless both tempos are known.
pub fn tempo_term(current_bpm: Option<f64>, bpm: Option<f64>) -> f64 {
    match (current_bpm, bpm) {
        (Some(current), Some(bpm)) => {
            let ratio = (bpm - current).abs() / TEMPO_BANDWIDTH_BPM;
            TEMPO_WEIGHT * (-(ratio * ratio)).exp()
        }
        _ => 0.0,
    }
}

/// Mild preference for full-length tracks, capped at 0.2.
pub fn duration_term(duration: Option<f64>) -> f64 {
    match duration {
        Some(secs) => DURATION_WEIGHT * (secs / FULL_LENGTH_SECS).min(1.0),
        None => 0.0,
    }
}

/// Score before jitter.
pub fn base_score(candidate: &Features, ctx: &Context<'_>) -> f64 {
    energy_term(candidate.energy, ctx.target_energy)
        + tempo_term(ctx.current.and_then(Track::bpm), Some(candidate.bpm))
        + duration_term(Some(candidate.duration))
}

fn is_excluded(track: &Track, ctx: &Context<'_>) -> bool {
    ctx.current.is_some_and(|c| c.id == track.id) || ctx.history.contains(&track.id)
}

/// Features of a candidate, which must be analyzed and in range.
fn candidate_features(track: &Track) -> Result<Features, SelectError> {
    let features = track.features.ok_or_else(|| SelectError::Inconsistent {
        id: track.id,
        reason: "not analyzed".into(),
    })?;
    features.validate().map_err(|e| SelectError::Inconsistent {
        id: track.id,
        reason: e.to_string(),
    })?;
    Ok(features)
}

/// Choose the next track from `candidates`.
///
/// Returns `Ok(None)` when nothing is eligible after excluding the current
/// track and the history. Errors only for a bad target energy or a
/// candidate whose stored features break the analyzed invariant.
pub fn pick_next<'a, R: Rng + ?Sized>(
    candidates: &'a [Track],
    ctx: &Context<'_>,
    rng: &mut R,
) -> Result<Option<Choice<'a>>, SelectError> {
    if !(0.0..=1.0).contains(&ctx.target_energy) {
        return Err(SelectError::InvalidTargetEnergy(ctx.target_energy));
    }

    let mut scored: Vec<Choice<'a>> = Vec::with_capacity(candidates.len());
    for track in candidates {
        if is_excluded(track, ctx) {
            continue;
        }
        let features = candidate_features(track)?;
        let score = base_score(&features, ctx) + rng.gen_range(-JITTER..=JITTER);
        scored.push(Choice { track, features, score });
    }

    if scored.is_empty() {
        log::debug!("No eligible candidate among {} tracks", candidates.len());
        return Ok(None);
    }

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    let k = TOP_K.min(scored.len());
    let pick = if k == 1 { 0 } else { draw(&scored[..k], rng) };
    let choice = scored.swap_remove(pick);

    log::debug!(
        "Picked track {} (score {:.3}) from top {} of {}",
        choice.track.id,
        choice.score,
        k,
        scored.len() + 1
    );
    Ok(Some(choice))
}

/// Index into `top`, weighted by score.
fn draw<R: Rng + ?Sized>(top: &[Choice<'_>], rng: &mut R) -> usize {
    match WeightedIndex::new(top.iter().map(|c| c.score.max(MIN_WEIGHT))) {
        Ok(dist) => dist.sample(rng),
        Err(_) => rng.gen_range(0..top.len()),
    }
}

/// Target energy over the course of a set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EnergyPlan {
    Constant(f64),
    /// Linear ramp from the first to the last step of the set.
    Ramp { from: f64, to: f64 },
}

impl EnergyPlan {
    pub fn target_at(&self, step: usize, length: usize) -> f64 {
        match *self {
            Self::Constant(energy) => energy,
            Self::Ramp { from, to } => {
                if length <= 1 {
                    from
                } else {
                    let t = step.min(length - 1) as f64 / (length - 1) as f64;
                    from + (to - from) * t
                }
            }
        }
    }
}

/// Build a set of up to `length` tracks by chaining selections.
///
/// Each pick becomes the current track for the next step and joins the
/// history, so no track repeats. Stops early when no candidate remains.
pub fn build_set<'a, R: Rng + ?Sized>(
    candidates: &'a [Track],
    start: Option<&'a Track>,
    plan: EnergyPlan,
    length: usize,
    rng: &mut R,
) -> Result<Vec<Choice<'a>>, SelectError> {
    let mut history: HashSet<i64> = start.map(|t| t.id).into_iter().collect();
    let mut current = start;
    let mut set = Vec::with_capacity(length);

    for step in 0..length {
        let ctx = Context {
            current,
            target_energy: plan.target_at(step, length),
            history: &history,
        };
        let Some(choice) = pick_next(candidates, &ctx, rng)? else {
            log::info!("Set ended after {step} tracks: no candidates left");
            break;
        };
        history.insert(choice.track.id);
        current = Some(choice.track);
        set.push(choice);
    }

    Ok(set)
}

#[derive(Error, Debug)]
pub enum NextError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("Selection error: {0}")]
    Select(#[from] SelectError),
}

/// Selection result detached from the candidate snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Pick {
    pub track: Track,
    pub features: Features,
    pub score: f64,
}

/// Look up the candidate pool and current track in the store, then pick.
///
/// An unknown `current_id` is still excluded but adds no tempo term.
pub fn next_track<R: Rng + ?Sized>(
    db: &Database,
    current_id: Option<i64>,
    target_energy: f64,
    history: &HashSet<i64>,
    include_deleted: bool,
    rng: &mut R,
) -> Result<Option<Pick>, NextError> {
    let candidates = db.get_candidates(include_deleted)?;
    let current = match current_id {
        Some(id) => db.get_track(id)?,
        None => None,
    };

    let mut excluded = history.clone();
    if let Some(id) = current_id {
        if current.is_none() {
            log::warn!("Current track {id} not found; excluding it without tempo matching");
        }
        excluded.insert(id);
    }

    let ctx = Context {
        current: current.as_ref(),
        target_energy,
        history: &excluded,
    };
    Ok(pick_next(&candidates, &ctx, rng)?.map(|c| Pick {
        track: c.track.clone(),
        features: c.features,
        score: c.score,
    }))
}
