//! Sliding-window segmentation against an external model.
//!
//! The model is only known through [`SegmentationModel`]: a batch of
//! fixed-shape, window-normalized intensity patches in, per-class
//! probabilities out. Both the coarse vertebra localization and the fine
//! tissue segmentation are [`InferencePass`] instances run by the same
//! [`Orchestrator`].

mod command;
mod orchestrator;
mod tiling;

pub use command::CommandModel;
pub use orchestrator::{InferenceError, InferencePass, Orchestrator, RetryPolicy};
pub use tiling::PatchGrid;

use crate::enums::PassKind;

use ndarray::{Array5, ArrayView4};
use thiserror::Error;

/// Version of the patch/probability exchange described by [`ModelContract`].
pub const MODEL_CONTRACT_VERSION: u32 = 1;

/// What a model expects for one pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelContract {
    pub version: u32,
    /// Patch shape `[D, H, W]`.
    pub patch_shape: [usize; 3],
    pub num_classes: usize,
}

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    /// Transient; the orchestrator retries these with backoff.
    #[error("model unavailable: {0}")]
    Unavailable(String),

    #[error("model returned an invalid result: {0}")]
    Invalid(String),
}

pub trait SegmentationModel: Send + Sync {
    fn contract(&self, pass: PassKind) -> ModelContract;

    /// `batch` is `[B, D, H, W]` intensities in `[0, 1]`; the result must be
    /// `[B, D, H, W, C]` class probabilities.
    fn infer(&self, batch: ArrayView4<'_, f32>, pass: PassKind) -> Result<Array5<f32>, ModelError>;
}

impl<M: SegmentationModel + ?Sized> SegmentationModel for &M {
    fn contract(&self, pass: PassKind) -> ModelContract {
        (**self).contract(pass)
    }

    fn infer(&self, batch: ArrayView4<'_, f32>, pass: PassKind) -> Result<Array5<f32>, ModelError> {
        (**self).infer(batch, pass)
    }
}
