//! Locates the T1–T12 span on a coarse vertebra label map.
//!
//! Each axial slice is vertebra-positive when it holds at least
//! `min_vertebra_voxels` vertebra voxels. Maximal positive runs are taken as
//! one vertebral body each and counted from the top of the column (highest
//! axial index in the canonical frame).

use crate::enums::TissueClass;
use crate::volume::LabelMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const THORACIC_LEVELS: usize = 12;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeConfig {
    /// Vertebra voxels a slice needs to count as vertebra-positive.
    pub min_vertebra_voxels: usize,
    /// Shorter positive runs are noise.
    pub min_run_slices: usize,
    /// Negative slices required between two separate vertebrae.
    pub min_gap_slices: usize,
    /// Expected axial thickness of one vertebral body.
    pub expected_vertebra_mm: f64,
    /// Runs longer than `merge_factor` expected thicknesses are split.
    pub merge_factor: f64,
    /// Runs above T1 that are in the field of view (e.g. cervical levels).
    pub skip_top_runs: usize,
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            min_vertebra_voxels: 50,
            min_run_slices: 2,
            min_gap_slices: 2,
            expected_vertebra_mm: 22.0,
            merge_factor: 1.6,
            skip_top_runs: 0,
        }
    }
}

/// Inclusive span of axial slices attributed to one vertebra.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertebraRun {
    pub low: usize,
    pub high: usize,
    /// Produced by splitting an over-long (merged) detection.
    pub split: bool,
}

impl VertebraRun {
    pub fn len(&self) -> usize {
        self.high - self.low + 1
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RangeError {
    #[error("found {found} vertebra runs, need {required}; runs (top first): {runs:?}")]
    InsufficientVertebrae {
        found: usize,
        required: usize,
        runs: Vec<VertebraRun>,
    },

    #[error(
        "vertebrae at slices {}..={} and {}..={} separated by {gap} slice(s), need {min_gap}",
        upper.low, upper.high, lower.low, lower.high
    )]
    AmbiguousVertebralBoundary {
        upper: VertebraRun,
        lower: VertebraRun,
        gap: usize,
        min_gap: usize,
    },

    #[error("invalid range configuration: {0}")]
    InvalidConfig(String),
}

/// Inclusive axial slice span from the top of T1 down to the bottom of T12.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VertebralRange {
    pub low: usize,
    pub high: usize,
    /// T1 first.
    pub levels: Vec<VertebraRun>,
}

impl VertebralRange {
    pub fn contains(&self, slice: usize) -> bool {
        (self.low..=self.high).contains(&slice)
    }

    pub fn slices(&self) -> usize {
        self.high - self.low + 1
    }

    pub fn level_name(index: usize) -> String {
        format!("T{}", index + 1)
    }
}

pub struct RangeSelector {
    config: RangeConfig,
}

#[derive(Clone, Copy, Debug)]
struct Piece {
    run: VertebraRun,
    /// Index of the detected run this piece came from.
    origin: usize,
}

impl RangeSelector {
    pub fn new(config: RangeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RangeConfig {
        &self.config
    }

    pub fn select(&self, coarse: &LabelMap) -> Result<VertebralRange, RangeError> {
        let counts = coarse.axial_counts(TissueClass::Vertebra);
        let slice_mm = coarse.geometry().spacing()[0];
        self.select_from_counts(&counts, slice_mm)
    }

    /// Same as [`RangeSelector::select`] on precomputed per-slice counts.
    pub fn select_from_counts(&self, counts: &[usize], slice_mm: f64) -> Result<VertebralRange, RangeError> {
        self.validate()?;
        let config = &self.config;

        let mut runs = self.detect_runs(counts);
        runs.reverse();

        let limit = config.merge_factor * config.expected_vertebra_mm / slice_mm;
        let mut pieces = Vec::with_capacity(runs.len());
        for (origin, run) in runs.into_iter().enumerate() {
            split_run(run, limit, origin, &mut pieces);
        }

        let required = config.skip_top_runs + THORACIC_LEVELS;
        if pieces.len() < required {
            return Err(RangeError::InsufficientVertebrae {
                found: pieces.len(),
                required,
                runs: pieces.iter().map(|p| p.run).collect(),
            });
        }

        // T1..T12 plus the neighbours that bound them
        let window_start = config.skip_top_runs.saturating_sub(1);
        let window_end = (required + 1).min(pieces.len());
        for pair in pieces[window_start..window_end].windows(2) {
            let (upper, lower) = (pair[0], pair[1]);
            if upper.origin == lower.origin {
                continue;
            }
            let gap = upper.run.low - lower.run.high - 1;
            if gap < config.min_gap_slices {
                return Err(RangeError::AmbiguousVertebralBoundary {
                    upper: upper.run,
                    lower: lower.run,
                    gap,
                    min_gap: config.min_gap_slices,
                });
            }
        }

        let levels: Vec<VertebraRun> = pieces[config.skip_top_runs..required]
            .iter()
            .map(|p| p.run)
            .collect();
        let range = VertebralRange {
            low: levels[THORACIC_LEVELS - 1].low,
            high: levels[0].high,
            levels,
        };
        info!(
            low = range.low,
            high = range.high,
            runs_found = pieces.len(),
            "vertebral range selected"
        );
        Ok(range)
    }

    /// Maximal runs of positive slices, ascending, noise removed.
    fn detect_runs(&self, counts: &[usize]) -> Vec<VertebraRun> {
        let mut runs = Vec::new();
        let mut start = None;
        for (slice, &count) in counts.iter().enumerate() {
            let positive = count >= self.config.min_vertebra_voxels;
            match (positive, start) {
                (true, None) => start = Some(slice),
                (false, Some(low)) => {
                    runs.push(VertebraRun { low, high: slice - 1, split: false });
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(low) = start {
            runs.push(VertebraRun { low, high: counts.len() - 1, split: false });
        }

        runs.retain(|run| {
            let keep = run.len() >= self.config.min_run_slices;
            if !keep {
                debug!(low = run.low, high = run.high, "dropping short vertebra run");
            }
            keep
        });
        runs
    }

    fn validate(&self) -> Result<(), RangeError> {
        let config = &self.config;
        if config.min_vertebra_voxels == 0 {
            return Err(RangeError::InvalidConfig("min_vertebra_voxels must be at least 1".into()));
        }
        if !(config.expected_vertebra_mm > 0.0) || !(config.merge_factor > 1.0) {
            return Err(RangeError::InvalidConfig(format!(
                "expected_vertebra_mm {} must be positive and merge_factor {} above 1",
                config.expected_vertebra_mm, config.merge_factor
            )));
        }
        Ok(())
    }
}

/// Halve runs longer than `limit` slices at their midpoint until every piece
/// fits; pushes pieces top first.
fn split_run(run: VertebraRun, limit: f64, origin: usize, out: &mut Vec<Piece>) {
    if run.len() as f64 > limit && run.len() >= 2 {
        let mid = run.low + run.len() / 2;
        split_run(VertebraRun { low: mid, high: run.high, split: true }, limit, origin, out);
        split_run(VertebraRun { low: run.low, high: mid - 1, split: true }, limit, origin, out);
    } else {
        out.push(Piece { run, origin });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RangeConfig {
        RangeConfig {
            min_vertebra_voxels: 1,
            min_run_slices: 2,
            min_gap_slices: 2,
            expected_vertebra_mm: 10.0,
            merge_factor: 1.5,
            skip_top_runs: 0,
        }
    }

    #[test]
    fn merged_run_is_split_at_midpoint() {
        let mut out = Vec::new();
        split_run(VertebraRun { low: 10, high: 29, split: false }, 15.0, 0, &mut out);
        let runs: Vec<_> = out.iter().map(|p| (p.run.low, p.run.high)).collect();
        assert_eq!(runs, vec![(20, 29), (10, 19)]);
    }

    #[test]
    fn single_slice_noise_is_ignored() {
        let selector = RangeSelector::new(config());
        let counts = [0, 5, 0, 0, 5, 5, 5, 0];
        let runs = selector.detect_runs(&counts);
        assert_eq!(runs, vec![VertebraRun { low: 4, high: 6, split: false }]);
    }
}
