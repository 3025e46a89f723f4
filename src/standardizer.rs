//! Canonical reorientation and resampling onto a fixed voxel spacing.
//!
//! Reorientation only permutes and flips axes, so it never interpolates.
//! Resampling is trilinear for intensity volumes and nearest-neighbour for
//! label maps; the choice follows from the voxel type, so a label map cannot
//! be resampled with weighted averaging.

use crate::geometry::{CANONICAL_DIRECTION, Geometry, GeometryError};
use crate::interpolator::Interpolator;
use crate::volume::{IntensityVolume, LabelMap, Volume};

use ndarray::{Array3, ArrayView3, Axis, Zip};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq)]
pub enum StandardizeError {
    #[error("unsupported orientation: {reason}")]
    UnsupportedOrientation { reason: String },

    #[error("invalid target grid: {0}")]
    InvalidGrid(#[from] GeometryError),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StandardizerConfig {
    /// Target voxel spacing in mm, array-axis order.
    pub target_spacing: [f64; 3],
    /// Largest angle between an array axis and its closest patient axis.
    pub max_obliquity_deg: f64,
}

impl Default for StandardizerConfig {
    fn default() -> Self {
        Self {
            target_spacing: [1.5, 1.5, 1.5],
            max_obliquity_deg: 5.0,
        }
    }
}

pub struct SpatialStandardizer {
    config: StandardizerConfig,
}

impl SpatialStandardizer {
    pub fn new(config: StandardizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StandardizerConfig {
        &self.config
    }

    /// Reorient to the canonical frame, then resample to the target spacing.
    pub fn standardize(&self, volume: &IntensityVolume) -> Result<IntensityVolume, StandardizeError> {
        let canonical = to_canonical(volume, self.config.max_obliquity_deg)?;
        let resampled = canonical.resample(self.config.target_spacing)?;
        debug!(
            from = ?volume.shape(),
            to = ?resampled.shape(),
            spacing = ?self.config.target_spacing,
            "standardized volume"
        );
        Ok(resampled)
    }
}

/// Permute and flip axes so that axis 0 points superior, axis 1 posterior
/// and axis 2 to the patient's left.
pub fn to_canonical<T: Clone>(
    volume: &Volume<T>,
    max_obliquity_deg: f64,
) -> Result<Volume<T>, StandardizeError> {
    let geometry = volume.geometry();
    let direction = geometry.direction();
    let min_cosine = max_obliquity_deg.to_radians().cos();

    // source axis feeding each canonical axis, and whether it runs backwards
    let mut source_of = [usize::MAX; 3];
    let mut flipped = [false; 3];
    for (axis, dir) in direction.iter().enumerate() {
        let (component, value) = dir
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
            .unwrap_or((0, 0.0));
        let norm = dir.iter().map(|c| c * c).sum::<f64>().sqrt();
        if norm == 0.0 || value.abs() / norm < min_cosine {
            return Err(StandardizeError::UnsupportedOrientation {
                reason: format!(
                    "axis {axis} direction {dir:?} is more than {max_obliquity_deg} degrees from any patient axis"
                ),
            });
        }
        // patient x -> axis 2, y -> axis 1, z -> axis 0
        let target = 2 - component;
        if source_of[target] != usize::MAX {
            return Err(StandardizeError::UnsupportedOrientation {
                reason: format!("axes {} and {axis} both align with patient axis {component}", source_of[target]),
            });
        }
        source_of[target] = axis;
        flipped[target] = value < 0.0;
    }

    let shape = volume.shape();
    let mut view = volume.data().view().permuted_axes(source_of);
    let mut first_voxel = [0.0; 3];
    for (target, &flip) in flipped.iter().enumerate() {
        if flip {
            view.invert_axis(Axis(target));
            first_voxel[source_of[target]] = (shape[source_of[target]] - 1) as f64;
        }
    }

    let spacing = geometry.spacing();
    let canonical = Geometry::new(
        [spacing[source_of[0]], spacing[source_of[1]], spacing[source_of[2]]],
        geometry.index_to_physical(first_voxel),
        CANONICAL_DIRECTION,
    )?;

    Ok(Volume::new(view.as_standard_layout().into_owned(), canonical))
}

/// Grid covering the same physical extent as `geometry`/`shape` at `spacing`,
/// with voxel centres aligned to the source half-voxel boundaries.
pub fn target_grid(
    geometry: &Geometry,
    shape: [usize; 3],
    spacing: [f64; 3],
) -> Result<([usize; 3], Geometry), StandardizeError> {
    let source_spacing = geometry.spacing();
    let mut out_shape = [0; 3];
    let mut first_centre = [0.0; 3];
    for axis in 0..3 {
        out_shape[axis] = Interpolator::resampled_len(shape[axis], source_spacing[axis], spacing[axis]);
        first_centre[axis] = 0.5 * spacing[axis] / source_spacing[axis] - 0.5;
    }
    let target = geometry
        .with_spacing(spacing)?
        .with_origin(geometry.index_to_physical(first_centre));
    Ok((out_shape, target))
}

fn resample_with<T, F>(
    volume: &Volume<T>,
    shape: [usize; 3],
    target: &Geometry,
    sample: F,
) -> Result<Volume<T>, StandardizeError>
where
    T: Copy + Default + Send + Sync,
    F: Fn(&ArrayView3<T>, f64, f64, f64) -> T + Sync,
{
    let source = volume.geometry();
    let same_direction = source
        .direction()
        .iter()
        .zip(target.direction().iter())
        .all(|(a, b)| a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-6));
    if !same_direction {
        return Err(StandardizeError::UnsupportedOrientation {
            reason: "source and target grids differ in orientation".into(),
        });
    }

    let start = source.physical_to_index(target.origin());
    let source_shape = volume.shape();
    let coords: Vec<Vec<f64>> = (0..3)
        .map(|axis| {
            Interpolator::axis_coordinates(
                shape[axis],
                start[axis],
                target.spacing()[axis] / source.spacing()[axis],
                source_shape[axis],
            )
        })
        .collect();

    let input = volume.data().view();
    let mut output = Array3::<T>::default((shape[0], shape[1], shape[2]));
    Zip::indexed(output.view_mut()).par_for_each(|(z, y, x), value| {
        *value = sample(&input, coords[0][z], coords[1][y], coords[2][x]);
    });

    Ok(Volume::new(output, target.clone()))
}

impl IntensityVolume {
    /// Trilinear resampling to `spacing`, preserving physical extent.
    pub fn resample(&self, spacing: [f64; 3]) -> Result<Self, StandardizeError> {
        let (shape, target) = target_grid(self.geometry(), self.shape(), spacing)?;
        self.resample_onto(shape, &target)
    }

    pub fn resample_onto(&self, shape: [usize; 3], target: &Geometry) -> Result<Self, StandardizeError> {
        resample_with(self, shape, target, Interpolator::trilinear_interpolate)
    }
}

impl LabelMap {
    /// Nearest-neighbour resampling; every output label exists in the input.
    pub fn resample(&self, spacing: [f64; 3]) -> Result<Self, StandardizeError> {
        let (shape, target) = target_grid(self.geometry(), self.shape(), spacing)?;
        self.resample_onto(shape, &target)
    }

    pub fn resample_onto(&self, shape: [usize; 3], target: &Geometry) -> Result<Self, StandardizeError> {
        resample_with(self, shape, target, Interpolator::nearest::<u8>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reversed_axial_stack_is_flipped_to_superior() {
        // axis 0 runs inferior, in-plane axes swapped (rows along x)
        let geometry = Geometry::new(
            [2.0, 0.5, 0.8],
            [10.0, 20.0, 100.0],
            [[0.0, 0.0, -1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        )
        .unwrap();
        let data = Array3::from_shape_fn((3, 4, 5), |(z, y, x)| (z * 100 + y * 10 + x) as f32);
        let volume = IntensityVolume::new(data, geometry.clone());

        let canonical = to_canonical(&volume, 5.0).unwrap();

        assert_eq!(canonical.shape(), [3, 5, 4]);
        assert!(canonical.geometry().is_canonical());
        assert_eq!(canonical.geometry().spacing(), [2.0, 0.8, 0.5]);
        // new [0, y, x] is old [2, x, y]
        assert_eq!(canonical.data()[[0, 3, 1]], 213.0);
        assert_eq!(canonical.geometry().origin(), geometry.index_to_physical([2.0, 0.0, 0.0]));
    }

    #[test]
    fn oblique_axes_are_rejected() {
        let s = std::f64::consts::FRAC_1_SQRT_2;
        let geometry = Geometry::new(
            [1.0; 3],
            [0.0; 3],
            [[0.0, s, s], [0.0, s, -s], [1.0, 0.0, 0.0]],
        )
        .unwrap();
        let volume = LabelMap::new(Array3::zeros((2, 2, 2)), geometry);
        assert!(matches!(
            to_canonical(&volume, 5.0),
            Err(StandardizeError::UnsupportedOrientation { .. })
        ));
    }

    #[test]
    fn constant_volume_stays_constant() {
        let volume = IntensityVolume::new(
            Array3::from_elem((10, 8, 8), 42.0),
            Geometry::canonical([2.5, 0.7, 0.7]).unwrap(),
        );
        let resampled = volume.resample([1.5, 1.5, 1.5]).unwrap();
        assert_eq!(resampled.shape(), [17, 4, 4]);
        assert!(resampled.data().iter().all(|v| (*v - 42.0).abs() < 1e-4));
    }
}
