//! Per-unit stage sequencing and batch execution.
//!
//! One unit is a patient at a timepoint. Units never share mutable state, so
//! a batch runs them on a worker pool and reports each failure on its own.

use crate::cache::{Artifact, ArtifactCache, CacheKey, NoCache, Stage, fingerprint};
use crate::config::{ConfigError, PipelineConfig};
use crate::enums::{Timepoint, TissueClass};
use crate::indexing::IndexRecord;
use crate::inference::{InferenceError, InferencePass, Orchestrator, SegmentationModel};
use crate::normalizer::{Normalize, NormalizedVolume};
use crate::quantifier::{QuantifyError, TissueVolumeRecord, quantify};
use crate::range_selector::{RangeError, RangeSelector, VertebralRange};
use crate::standardizer::{SpatialStandardizer, StandardizeError};
use crate::volume::{IntensityVolume, LabelMap};
use crate::volume_loader::{LoadError, LoadWarning, LoadedSeries, VolumeLoader};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};
use web_time::Instant;

/// One patient at one timepoint, as listed in a batch manifest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanUnit {
    pub patient: String,
    pub timepoint: Timepoint,
    pub series_dir: PathBuf,
    #[serde(default)]
    pub height_m: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Load,
    Standardize,
    Normalize,
    CoarseInference,
    FineInference,
    RangeSelection,
    Quantify,
}

impl PipelineStage {
    pub fn name(self) -> &'static str {
        match self {
            PipelineStage::Load => "load",
            PipelineStage::Standardize => "standardize",
            PipelineStage::Normalize => "normalize",
            PipelineStage::CoarseInference => "coarse_inference",
            PipelineStage::FineInference => "fine_inference",
            PipelineStage::RangeSelection => "range_selection",
            PipelineStage::Quantify => "quantify",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Standardize(#[from] StandardizeError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error(transparent)]
    Quantify(#[from] QuantifyError),
}

#[derive(Debug, Error)]
#[error("{stage} stage failed: {source}")]
pub struct PipelineError {
    pub stage: PipelineStage,
    #[source]
    pub source: StageError,
}

/// Where a unit's series comes from.
pub trait SeriesSource: Send + Sync {
    fn load(&self, unit: &ScanUnit) -> Result<LoadedSeries, LoadError>;
}

/// Reads the unit's `series_dir` as a directory of DICOM slices.
pub struct DicomDirectory;

impl SeriesSource for DicomDirectory {
    fn load(&self, unit: &ScanUnit) -> Result<LoadedSeries, LoadError> {
        VolumeLoader::load_from_directory(&unit.series_dir)
    }
}

impl<F> SeriesSource for F
where
    F: Fn(&ScanUnit) -> Result<LoadedSeries, LoadError> + Send + Sync,
{
    fn load(&self, unit: &ScanUnit) -> Result<LoadedSeries, LoadError> {
        self(unit)
    }
}

/// Everything produced for one unit, kept for export and QC.
#[derive(Clone, Debug)]
pub struct UnitOutcome {
    pub unit: ScanUnit,
    /// Standardized Hounsfield volume both label maps are aligned with.
    pub standardized: IntensityVolume,
    pub coarse: LabelMap,
    pub fine: LabelMap,
    pub range: VertebralRange,
    pub tissue: TissueVolumeRecord,
    pub warnings: Vec<LoadWarning>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: PipelineStage,
    pub message: String,
}

/// Serializable summary of one unit in a batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    pub patient: String,
    pub timepoint: Timepoint,
    pub series_dir: PathBuf,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub range: Option<VertebralRange>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tissue: Option<TissueVolumeRecord>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub index: Option<IndexRecord>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failure: Option<StageFailure>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub index_error: Option<String>,
}

impl UnitReport {
    fn new(unit: &ScanUnit) -> Self {
        Self {
            patient: unit.patient.clone(),
            timepoint: unit.timepoint,
            series_dir: unit.series_dir.clone(),
            warnings: Vec::new(),
            range: None,
            tissue: None,
            index: None,
            failure: None,
            index_error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub units: Vec<UnitReport>,
}

impl BatchReport {
    pub fn failures(&self) -> usize {
        self.units.iter().filter(|u| !u.succeeded()).count()
    }

    pub fn find(&self, patient: &str, timepoint: Timepoint) -> Option<&UnitReport> {
        self.units
            .iter()
            .find(|u| u.patient == patient && u.timepoint == timepoint)
    }
}

pub struct Pipeline<M> {
    config: PipelineConfig,
    standardizer: SpatialStandardizer,
    orchestrator: Orchestrator<M>,
    selector: RangeSelector,
    cache: Box<dyn ArtifactCache>,
    source: Box<dyn SeriesSource>,
    config_fingerprint: String,
}

impl<M: SegmentationModel> Pipeline<M> {
    pub fn new(config: PipelineConfig, model: M) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            standardizer: SpatialStandardizer::new(config.standardizer.clone()),
            orchestrator: Orchestrator::new(model, config.retry.clone()),
            selector: RangeSelector::new(config.range.clone()),
            cache: Box::new(NoCache),
            source: Box::new(DicomDirectory),
            config_fingerprint: config.fingerprint_input(),
            config,
        })
    }

    pub fn with_cache(mut self, cache: Box<dyn ArtifactCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_source(mut self, source: Box<dyn SeriesSource>) -> Self {
        self.source = source;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Load, standardize, normalize, segment twice, select the vertebral
    /// range and count tissue volumes for one unit.
    pub fn run_unit(&self, unit: &ScanUnit) -> Result<UnitOutcome, PipelineError> {
        let loaded = timed(unit, PipelineStage::Load, || Ok(self.source.load(unit)?))?;
        if let Some(id) = loaded.patient_id.as_deref() {
            if id != unit.patient {
                warn!(patient = %unit.patient, dicom_patient = id, "series patient id differs from manifest");
            }
        }

        let standardized = timed(unit, PipelineStage::Standardize, || {
            Ok(self.standardizer.standardize(&loaded.volume)?)
        })?;
        let normalized = timed(unit, PipelineStage::Normalize, || {
            Ok(standardized.normalize(self.config.hu_window))
        })?;

        let digest = fingerprint(&loaded.volume, &self.config_fingerprint);
        let key = |stage| CacheKey {
            patient: unit.patient.clone(),
            timepoint: unit.timepoint,
            stage,
            fingerprint: digest.clone(),
        };

        let coarse = timed(unit, PipelineStage::CoarseInference, || {
            self.labels_cached(&key(Stage::CoarseLabels), &standardized, &self.config.coarse, &normalized)
        })?;
        let fine = timed(unit, PipelineStage::FineInference, || {
            self.labels_cached(&key(Stage::FineLabels), &standardized, &self.config.fine, &normalized)
        })?;
        let range = timed(unit, PipelineStage::RangeSelection, || Ok(self.selector.select(&coarse)?))?;

        let tissue_key = key(Stage::TissueVolumes);
        let tissue = timed(unit, PipelineStage::Quantify, || {
            if let Some(Artifact::Tissue(record)) = self.cache_get(&tissue_key) {
                if record.range_low == range.low && record.range_high == range.high {
                    return Ok(record);
                }
            }
            let record = quantify(&fine, &range, Some(&standardized))?;
            self.cache_put(&tissue_key, &Artifact::Tissue(record.clone()));
            Ok(record)
        })?;

        info!(
            patient = %unit.patient,
            timepoint = %unit.timepoint,
            range_low = range.low,
            range_high = range.high,
            muscle_cm3 = tissue.volume_cm3(TissueClass::SkeletalMuscle),
            "unit quantified"
        );

        Ok(UnitOutcome {
            unit: unit.clone(),
            standardized,
            coarse,
            fine,
            range,
            tissue,
            warnings: loaded.warnings,
        })
    }

    pub fn run_batch(&self, units: &[ScanUnit]) -> BatchReport {
        self.run_batch_with(units, |_| {})
    }

    /// Run every unit on the worker pool; `sink` sees each successful outcome
    /// before its volumes are dropped. Index records are computed per patient
    /// once all units finished, baseline first.
    pub fn run_batch_with<F>(&self, units: &[ScanUnit], sink: F) -> BatchReport
    where
        F: Fn(&UnitOutcome) + Sync,
    {
        let start = Instant::now();
        let run = || -> Vec<UnitReport> {
            units
                .par_iter()
                .map(|unit| {
                    let mut report = UnitReport::new(unit);
                    match self.run_unit(unit) {
                        Ok(outcome) => {
                            sink(&outcome);
                            report.warnings = outcome.warnings.iter().map(ToString::to_string).collect();
                            report.range = Some(outcome.range);
                            report.tissue = Some(outcome.tissue);
                        }
                        Err(err) => {
                            warn!(patient = %unit.patient, timepoint = %unit.timepoint, error = %err, "unit failed");
                            report.failure = Some(StageFailure {
                                stage: err.stage,
                                message: err.source.to_string(),
                            });
                        }
                    }
                    report
                })
                .collect()
        };

        let mut reports = match rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .build()
        {
            Ok(pool) => pool.install(run),
            Err(err) => {
                warn!(error = %err, "falling back to the global thread pool");
                run()
            }
        };

        index_by_patient(units, &mut reports);

        let report = BatchReport { units: reports };
        info!(
            units = units.len(),
            failures = report.failures(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "batch finished"
        );
        report
    }

    fn labels_cached(
        &self,
        key: &CacheKey,
        standardized: &IntensityVolume,
        pass: &InferencePass,
        normalized: &NormalizedVolume,
    ) -> Result<LabelMap, StageError> {
        if let Some(Artifact::Labels(labels)) = self.cache_get(key) {
            if labels.shape() == standardized.shape() && labels.geometry() == standardized.geometry() {
                return Ok(labels);
            }
            warn!(stage = key.stage.as_str(), "cached label map does not match volume, recomputing");
        }
        let labels = self.orchestrator.run(pass, normalized)?;
        self.cache_put(key, &Artifact::Labels(labels.clone()));
        Ok(labels)
    }

    fn cache_get(&self, key: &CacheKey) -> Option<Artifact> {
        match self.cache.get(key) {
            Ok(hit) => {
                if hit.is_some() {
                    info!(patient = %key.patient, stage = key.stage.as_str(), "cache hit");
                }
                hit
            }
            Err(err) => {
                warn!(patient = %key.patient, stage = key.stage.as_str(), error = %err, "cache read failed");
                None
            }
        }
    }

    fn cache_put(&self, key: &CacheKey, artifact: &Artifact) {
        if let Err(err) = self.cache.put(key, artifact) {
            warn!(patient = %key.patient, stage = key.stage.as_str(), error = %err, "cache write failed");
        }
    }
}

fn timed<T>(
    unit: &ScanUnit,
    stage: PipelineStage,
    f: impl FnOnce() -> Result<T, StageError>,
) -> Result<T, PipelineError> {
    let start = Instant::now();
    info!(patient = %unit.patient, timepoint = %unit.timepoint, stage = stage.name(), "stage started");
    match f() {
        Ok(value) => {
            info!(
                patient = %unit.patient,
                timepoint = %unit.timepoint,
                stage = stage.name(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "stage finished"
            );
            Ok(value)
        }
        Err(source) => {
            warn!(
                patient = %unit.patient,
                timepoint = %unit.timepoint,
                stage = stage.name(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "stage failed"
            );
            Err(PipelineError { stage, source })
        }
    }
}

/// Fill in index records; follow-ups get deltas against the patient's
/// baseline when one succeeded.
fn index_by_patient(units: &[ScanUnit], reports: &mut [UnitReport]) {
    let mut by_patient: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, unit) in units.iter().enumerate() {
        by_patient.entry(unit.patient.as_str()).or_default().push(i);
    }

    for (patient, mut members) in by_patient {
        members.sort_by_key(|&i| units[i].timepoint);

        let mut baseline: Option<IndexRecord> = None;
        for i in members {
            let unit = &units[i];
            let Some(tissue) = reports[i].tissue.as_ref() else {
                continue;
            };
            let record = IndexRecord::compute(patient, unit.timepoint, tissue, unit.height_m).and_then(|record| {
                match (unit.timepoint, baseline.as_ref()) {
                    (Timepoint::FollowUp, Some(base)) => record.with_baseline(base),
                    (Timepoint::FollowUp, None) => {
                        warn!(patient, "follow-up without a usable baseline, no deltas");
                        Ok(record)
                    }
                    (Timepoint::Baseline, _) => Ok(record),
                }
            });
            match record {
                Ok(record) => {
                    if unit.timepoint == Timepoint::Baseline && baseline.is_none() {
                        baseline = Some(record.clone());
                    }
                    reports[i].index = Some(record);
                }
                Err(err) => {
                    warn!(patient, timepoint = %unit.timepoint, error = %err, "index computation failed");
                    reports[i].index_error = Some(err.to_string());
                }
            }
        }
    }
}
