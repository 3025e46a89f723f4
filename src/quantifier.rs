//! Exact voxel counting of tissue classes inside the vertebral range.

use crate::enums::TissueClass;
use crate::range_selector::VertebralRange;
use crate::volume::{IntensityVolume, LabelMap};

use ndarray::{Axis, s};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

const MM3_PER_CM3: f64 = 1000.0;

#[derive(Debug, Error, PartialEq)]
pub enum QuantifyError {
    #[error("range {low}..={high} outside label map with {slices} axial slices")]
    RangeOutOfBounds { low: usize, high: usize, slices: usize },

    #[error("intensity volume {intensity:?} does not match label map {labels:?}")]
    ShapeMismatch {
        labels: [usize; 3],
        intensity: [usize; 3],
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassMeasurement {
    pub voxels: u64,
    pub volume_cm3: f64,
    /// Mean Hounsfield value of the counted voxels; `None` when there are none
    /// or no intensities were supplied.
    pub mean_hu: Option<f64>,
}

/// Per-class tissue volumes within one vertebral range.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TissueVolumeRecord {
    pub range_low: usize,
    pub range_high: usize,
    pub voxel_volume_mm3: f64,
    pub classes: BTreeMap<TissueClass, ClassMeasurement>,
}

impl TissueVolumeRecord {
    /// Volume of `class` in cm³, 0 for classes that were not measured.
    pub fn volume_cm3(&self, class: TissueClass) -> f64 {
        self.classes.get(&class).map_or(0.0, |m| m.volume_cm3)
    }
}

#[derive(Clone, Copy, Default)]
struct Tally {
    voxels: [u64; TissueClass::ALL.len()],
    hu_sum: [f64; TissueClass::ALL.len()],
}

impl Tally {
    fn merge(mut self, other: Tally) -> Tally {
        for i in 0..self.voxels.len() {
            self.voxels[i] += other.voxels[i];
            self.hu_sum[i] += other.hu_sum[i];
        }
        self
    }
}

/// Count every non-background class on the axial slices of `range`
/// (inclusive). Labels outside the known classes are ignored.
pub fn quantify(
    labels: &LabelMap,
    range: &VertebralRange,
    intensities: Option<&IntensityVolume>,
) -> Result<TissueVolumeRecord, QuantifyError> {
    let slices = labels.shape()[0];
    if range.low > range.high || range.high >= slices {
        return Err(QuantifyError::RangeOutOfBounds {
            low: range.low,
            high: range.high,
            slices,
        });
    }
    if let Some(hu) = intensities {
        if hu.shape() != labels.shape() {
            return Err(QuantifyError::ShapeMismatch {
                labels: labels.shape(),
                intensity: hu.shape(),
            });
        }
    }

    let window = s![range.low..=range.high, .., ..];
    let label_slab = labels.data().slice(window);
    let tally = match intensities {
        Some(hu) => {
            let hu_slab = hu.data().slice(window);
            label_slab
                .axis_iter(Axis(0))
                .into_par_iter()
                .zip(hu_slab.axis_iter(Axis(0)).into_par_iter())
                .map(|(l, h)| {
                    let mut tally = Tally::default();
                    for (&label, &value) in l.iter().zip(h.iter()) {
                        if let Some(i) = index_of(label) {
                            tally.voxels[i] += 1;
                            tally.hu_sum[i] += f64::from(value);
                        }
                    }
                    tally
                })
                .reduce(Tally::default, Tally::merge)
        }
        None => label_slab
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|l| {
                let mut tally = Tally::default();
                for &label in l.iter() {
                    if let Some(i) = index_of(label) {
                        tally.voxels[i] += 1;
                    }
                }
                tally
            })
            .reduce(Tally::default, Tally::merge),
    };

    let voxel_volume_mm3 = labels.geometry().voxel_volume_mm3();
    let classes = TissueClass::MEASURED
        .iter()
        .map(|&class| {
            let i = class.label() as usize;
            let voxels = tally.voxels[i];
            let mean_hu = (intensities.is_some() && voxels > 0).then(|| tally.hu_sum[i] / voxels as f64);
            let measurement = ClassMeasurement {
                voxels,
                volume_cm3: voxels as f64 * voxel_volume_mm3 / MM3_PER_CM3,
                mean_hu,
            };
            (class, measurement)
        })
        .collect();

    debug!(low = range.low, high = range.high, voxel_volume_mm3, "tissue volumes counted");
    Ok(TissueVolumeRecord {
        range_low: range.low,
        range_high: range.high,
        voxel_volume_mm3,
        classes,
    })
}

#[inline]
fn index_of(label: u8) -> Option<usize> {
    TissueClass::from_label(label)
        .filter(|c| *c != TissueClass::Background)
        .map(|c| c.label() as usize)
}
