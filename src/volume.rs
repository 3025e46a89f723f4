use crate::enums::{Orientation, TissueClass};
use crate::geometry::Geometry;

use ndarray::{Array3, ArrayView2, Axis, s};
use rayon::prelude::*;

/// A dense voxel grid plus the affine that places it in patient space.
#[derive(Clone, Debug, PartialEq)]
pub struct Volume<T> {
    data: Array3<T>,
    geometry: Geometry,
}

/// Hounsfield-unit intensities.
pub type IntensityVolume = Volume<f32>;

/// One [`TissueClass`] label per voxel.
pub type LabelMap = Volume<u8>;

impl<T> Volume<T> {
    pub fn new(data: Array3<T>, geometry: Geometry) -> Self {
        Self { data, geometry }
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn shape(&self) -> [usize; 3] {
        let (d, h, w) = self.data.dim();
        [d, h, w]
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<T> {
        &self.data
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn get_slice_from_axis(
        &self,
        index: usize,
        orientation: Orientation,
    ) -> Option<ArrayView2<'_, T>> {
        if !self.is_valid_index(index, orientation) {
            return None;
        }
        let slice = match orientation {
            Orientation::Axial => self.data.slice(s![index, .., ..]),
            Orientation::Coronal => self.data.slice(s![.., index, ..]),
            Orientation::Sagittal => self.data.slice(s![.., .., index]),
        };
        Some(slice)
    }

    pub fn is_valid_index(&self, index: usize, orientation: Orientation) -> bool {
        index < self.shape()[orientation.axis()]
    }
}

impl LabelMap {
    /// Voxel count of `class` in every axial slice.
    pub fn axial_counts(&self, class: TissueClass) -> Vec<usize> {
        let label = class.label();
        self.data
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|slice| slice.iter().filter(|&&v| v == label).count())
            .collect()
    }

    /// Distinct label values present anywhere in the map, ascending.
    pub fn present_labels(&self) -> Vec<u8> {
        let mut seen = [false; 256];
        for &v in self.data.iter() {
            seen[v as usize] = true;
        }
        (0..=255u8).filter(|&v| seen[v as usize]).collect()
    }
}

impl IntensityVolume {
    pub fn min_max(&self) -> Option<(f32, f32)> {
        self.data
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(None, |acc, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }
}
