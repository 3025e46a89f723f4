use super::{MODEL_CONTRACT_VERSION, ModelError, PatchGrid, SegmentationModel};
use crate::enums::{Aggregation, PassKind, TissueClass};
use crate::normalizer::NormalizedVolume;
use crate::standardizer::StandardizeError;
use crate::volume::{IntensityVolume, LabelMap};

use ndarray::{Array3, Array4, Array5, ArrayView4, Axis, CowArray, Ix3, Zip, s};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq)]
pub enum InferenceError {
    #[error("model unavailable after {attempts} attempt(s): {reason}")]
    ModelUnavailable { attempts: u32, reason: String },

    #[error("patch shape mismatch in {pass} pass: {reason}")]
    PatchShapeMismatch { pass: PassKind, reason: String },

    #[error("model rejected {pass} batch: {reason}")]
    ModelRejected { pass: PassKind, reason: String },

    #[error("resampling for inference failed: {0}")]
    Resample(#[from] StandardizeError),
}

/// Bounded retry for transient model unavailability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub const MAX_ATTEMPTS: u32 = 20;
    pub const MAX_MULTIPLIER: f64 = 10.0;
    /// Ceiling for any single backoff sleep.
    pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

    /// Retry immediately; for tests and local models.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            multiplier: 1.0,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(1..=Self::MAX_ATTEMPTS).contains(&self.max_attempts) {
            return Err(format!(
                "retry.max_attempts {} outside 1..={}",
                self.max_attempts,
                Self::MAX_ATTEMPTS
            ));
        }
        if !(1.0..=Self::MAX_MULTIPLIER).contains(&self.multiplier) {
            return Err(format!(
                "retry.multiplier {} outside [1, {}]",
                self.multiplier,
                Self::MAX_MULTIPLIER
            ));
        }
        Ok(())
    }

    pub fn first_delay(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms).min(Self::MAX_BACKOFF)
    }

    /// Delay after `delay`, never above [`RetryPolicy::MAX_BACKOFF`].
    pub fn next_delay(&self, delay: Duration) -> Duration {
        let multiplier = if self.multiplier.is_finite() { self.multiplier.max(1.0) } else { 1.0 };
        Duration::try_from_secs_f64(delay.as_secs_f64() * multiplier)
            .unwrap_or(Self::MAX_BACKOFF)
            .min(Self::MAX_BACKOFF)
    }
}

/// One configured inference pass: resolution, tiling and class layout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferencePass {
    pub kind: PassKind,
    /// Spacing in mm the model runs at.
    pub spacing: [f64; 3],
    pub patch_shape: [usize; 3],
    /// Fraction of a patch shared with its neighbour, in `[0, 1)`.
    pub overlap: f64,
    pub batch_size: usize,
    pub aggregation: Aggregation,
    /// Label written for each model output channel.
    pub classes: Vec<TissueClass>,
}

impl InferencePass {
    /// Low-resolution vertebra localization without overlap.
    pub fn coarse() -> Self {
        Self {
            kind: PassKind::Coarse,
            spacing: [3.0, 3.0, 3.0],
            patch_shape: [64, 128, 128],
            overlap: 0.0,
            batch_size: 2,
            aggregation: Aggregation::Sum,
            classes: vec![TissueClass::Background, TissueClass::Vertebra],
        }
    }

    /// Full-resolution tissue segmentation with half-patch overlap.
    pub fn fine() -> Self {
        Self {
            kind: PassKind::Fine,
            spacing: [1.5, 1.5, 1.5],
            patch_shape: [64, 128, 128],
            overlap: 0.5,
            batch_size: 2,
            aggregation: Aggregation::Sum,
            classes: TissueClass::ALL.to_vec(),
        }
    }

    pub fn validate(&self) -> Result<(), InferenceError> {
        let mismatch = |reason: String| InferenceError::PatchShapeMismatch {
            pass: self.kind,
            reason,
        };
        if self.patch_shape.contains(&0) {
            return Err(mismatch(format!("patch shape {:?} has an empty axis", self.patch_shape)));
        }
        if !(0.0..1.0).contains(&self.overlap) {
            return Err(mismatch(format!("overlap {} outside [0, 1)", self.overlap)));
        }
        if self.batch_size == 0 {
            return Err(mismatch("batch size is zero".into()));
        }
        if self.classes.len() < 2 {
            return Err(mismatch(format!("{} output class(es), need at least 2", self.classes.len())));
        }
        if self.spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(mismatch(format!("invalid pass spacing {:?}", self.spacing)));
        }
        Ok(())
    }
}

/// Runs inference passes against one model instance.
pub struct Orchestrator<M> {
    model: M,
    retry: RetryPolicy,
}

impl<M: SegmentationModel> Orchestrator<M> {
    pub fn new(model: M, retry: RetryPolicy) -> Self {
        Self { model, retry }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Segment `input`; the label map has exactly the input's shape and
    /// geometry. Fails without producing a partial map.
    pub fn run(&self, pass: &InferencePass, input: &NormalizedVolume) -> Result<LabelMap, InferenceError> {
        self.check_contract(pass)?;

        let source = input.volume();
        let same_spacing = source
            .geometry()
            .spacing()
            .iter()
            .zip(&pass.spacing)
            .all(|(a, b)| (a - b).abs() < 1e-9);

        let working = if same_spacing {
            None
        } else {
            Some(source.resample(pass.spacing)?)
        };
        let working_ref = working.as_ref().unwrap_or(source);

        info!(
            pass = %pass.kind,
            shape = ?working_ref.shape(),
            overlap = pass.overlap,
            "running inference pass"
        );
        let labels = LabelMap::new(self.segment(pass, working_ref)?, working_ref.geometry().clone());

        if same_spacing {
            Ok(labels)
        } else {
            Ok(labels.resample_onto(source.shape(), source.geometry())?)
        }
    }

    fn check_contract(&self, pass: &InferencePass) -> Result<(), InferenceError> {
        pass.validate()?;
        let contract = self.model.contract(pass.kind);
        let mismatch = |reason: String| InferenceError::PatchShapeMismatch {
            pass: pass.kind,
            reason,
        };
        if contract.version != MODEL_CONTRACT_VERSION {
            return Err(mismatch(format!(
                "model speaks contract v{}, expected v{MODEL_CONTRACT_VERSION}",
                contract.version
            )));
        }
        if contract.patch_shape != pass.patch_shape {
            return Err(mismatch(format!(
                "configured patch {:?}, model expects {:?}",
                pass.patch_shape, contract.patch_shape
            )));
        }
        if contract.num_classes != pass.classes.len() {
            return Err(mismatch(format!(
                "configured {} classes, model produces {}",
                pass.classes.len(),
                contract.num_classes
            )));
        }
        Ok(())
    }

    fn segment(&self, pass: &InferencePass, volume: &IntensityVolume) -> Result<Array3<u8>, InferenceError> {
        let shape = volume.shape();
        let patch = pass.patch_shape;
        let padded_shape = [0, 1, 2].map(|a| shape[a].max(patch[a]));
        let padded = pad_to(volume, padded_shape);

        let grid = PatchGrid::new(padded_shape, patch, pass.overlap);
        let num_classes = pass.classes.len();
        let [pd, ph, pw] = patch;

        let fill = match pass.aggregation {
            Aggregation::Max => f32::NEG_INFINITY,
            Aggregation::Sum | Aggregation::Mean => 0.0,
        };
        let (d, h, w) = (padded_shape[0], padded_shape[1], padded_shape[2]);
        let mut accumulated = Array4::<f32>::from_elem((d, h, w, num_classes), fill);
        let mut coverage = Array3::<f32>::zeros((d, h, w));

        let origins = grid.origins();
        debug!(pass = %pass.kind, patches = origins.len(), "patch grid built");

        for chunk in origins.chunks(pass.batch_size) {
            let mut batch = Array4::<f32>::zeros((chunk.len(), pd, ph, pw));
            for (i, &[z, y, x]) in chunk.iter().enumerate() {
                batch
                    .index_axis_mut(Axis(0), i)
                    .assign(&padded.slice(s![z..z + pd, y..y + ph, x..x + pw]));
            }

            let probabilities = self.infer_with_retry(pass.kind, batch.view())?;
            let expected = (chunk.len(), pd, ph, pw, num_classes);
            if probabilities.dim() != expected {
                return Err(InferenceError::PatchShapeMismatch {
                    pass: pass.kind,
                    reason: format!("model returned {:?}, expected {:?}", probabilities.dim(), expected),
                });
            }

            Self::accumulate(pass.aggregation, &mut accumulated, &mut coverage, chunk, &probabilities);
        }

        if pass.aggregation == Aggregation::Mean {
            accumulated /= &coverage.view().insert_axis(Axis(3));
        }

        let labels: Vec<u8> = pass.classes.iter().map(|c| c.label()).collect();
        let mut output = Array3::<u8>::zeros((d, h, w));
        Zip::indexed(output.view_mut()).par_for_each(|(z, y, x), label| {
            let lane = accumulated.slice(s![z, y, x, ..]);
            let mut best = 0;
            for (c, &p) in lane.iter().enumerate() {
                if p > lane[best] {
                    best = c;
                }
            }
            *label = labels[best];
        });

        Ok(output.slice(s![..shape[0], ..shape[1], ..shape[2]]).to_owned())
    }

    fn accumulate(
        aggregation: Aggregation,
        accumulated: &mut Array4<f32>,
        coverage: &mut Array3<f32>,
        origins: &[[usize; 3]],
        probabilities: &Array5<f32>,
    ) {
        for (i, &[z, y, x]) in origins.iter().enumerate() {
            let patch = probabilities.index_axis(Axis(0), i);
            let (pd, ph, pw, _) = patch.dim();
            let mut region = accumulated.slice_mut(s![z..z + pd, y..y + ph, x..x + pw, ..]);
            match aggregation {
                Aggregation::Sum | Aggregation::Mean => region += &patch,
                Aggregation::Max => {
                    Zip::from(&mut region).and(&patch).for_each(|a, &p| *a = a.max(p));
                }
            }
            coverage
                .slice_mut(s![z..z + pd, y..y + ph, x..x + pw])
                .mapv_inplace(|c| c + 1.0);
        }
    }

    fn infer_with_retry(&self, pass: PassKind, batch: ArrayView4<'_, f32>) -> Result<Array5<f32>, InferenceError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut delay = self.retry.first_delay();
        let mut attempt = 1;
        loop {
            match self.model.infer(batch.view(), pass) {
                Ok(probabilities) => return Ok(probabilities),
                Err(ModelError::Unavailable(reason)) if attempt < max_attempts => {
                    warn!(
                        attempt,
                        pass = %pass,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "model unavailable, retrying"
                    );
                    thread::sleep(delay);
                    delay = self.retry.next_delay(delay);
                    attempt += 1;
                }
                Err(ModelError::Unavailable(reason)) => {
                    return Err(InferenceError::ModelUnavailable {
                        attempts: attempt,
                        reason,
                    });
                }
                Err(ModelError::Invalid(reason)) => {
                    return Err(InferenceError::ModelRejected { pass, reason });
                }
            }
        }
    }
}

/// Zero-pad to at least one patch per axis; borrows when no padding is needed.
fn pad_to(volume: &IntensityVolume, shape: [usize; 3]) -> CowArray<'_, f32, Ix3> {
    let data = volume.data();
    if volume.shape() == shape {
        return CowArray::from(data.view());
    }
    let (d, h, w) = data.dim();
    let mut padded = Array3::<f32>::zeros((shape[0], shape[1], shape[2]));
    padded.slice_mut(s![..d, ..h, ..w]).assign(data);
    CowArray::from(padded)
}
