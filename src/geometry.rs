//! Index-to-patient mapping of a voxel grid.
//!
//! All per-axis quantities are stored in array-axis order `(axial, row,
//! column)`. Physical coordinates are patient LPS millimetres `(x, y, z)`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Patient axes of the canonical frame, one per array axis:
/// superior (+Z), posterior (+Y), left (+X).
pub const CANONICAL_DIRECTION: [[f64; 3]; 3] = [[0.0, 0.0, 1.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]];

const SINGULAR_EPS: f64 = 1e-6;

#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    #[error("spacing must be positive and finite, got {0:?}")]
    InvalidSpacing([f64; 3]),

    #[error("direction matrix is singular (det = {0})")]
    SingularDirection(f64),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    spacing: [f64; 3],
    origin: [f64; 3],
    direction: [[f64; 3]; 3],
}

impl Geometry {
    pub fn new(
        spacing: [f64; 3],
        origin: [f64; 3],
        direction: [[f64; 3]; 3],
    ) -> Result<Self, GeometryError> {
        if spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(GeometryError::InvalidSpacing(spacing));
        }
        let det = determinant(&direction);
        if !det.is_finite() || det.abs() < SINGULAR_EPS {
            return Err(GeometryError::SingularDirection(det));
        }
        Ok(Self {
            spacing,
            origin,
            direction,
        })
    }

    /// Grid in the canonical frame with its first voxel at the patient origin.
    pub fn canonical(spacing: [f64; 3]) -> Result<Self, GeometryError> {
        Self::new(spacing, [0.0; 3], CANONICAL_DIRECTION)
    }

    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    pub fn origin(&self) -> [f64; 3] {
        self.origin
    }

    pub fn direction(&self) -> [[f64; 3]; 3] {
        self.direction
    }

    pub fn voxel_volume_mm3(&self) -> f64 {
        self.spacing.iter().product()
    }

    pub fn is_canonical(&self) -> bool {
        self.direction
            .iter()
            .zip(CANONICAL_DIRECTION.iter())
            .all(|(a, b)| a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-6))
    }

    pub fn index_to_physical(&self, index: [f64; 3]) -> [f64; 3] {
        let mut p = self.origin;
        for (axis, dir) in self.direction.iter().enumerate() {
            let step = index[axis] * self.spacing[axis];
            for (c, d) in p.iter_mut().zip(dir) {
                *c += d * step;
            }
        }
        p
    }

    /// Inverse of [`Geometry::index_to_physical`]; always defined because
    /// construction rejects singular affines.
    pub fn physical_to_index(&self, point: [f64; 3]) -> [f64; 3] {
        let rel = [
            point[0] - self.origin[0],
            point[1] - self.origin[1],
            point[2] - self.origin[2],
        ];
        // Columns of M are direction[a] * spacing[a]; solve M * idx = rel.
        let m = self.scaled_columns();
        let det = determinant(&m);
        let mut idx = [0.0; 3];
        for (axis, out) in idx.iter_mut().enumerate() {
            let mut replaced = m;
            replaced[axis] = rel;
            *out = determinant(&replaced) / det;
        }
        idx
    }

    /// Same orientation and origin, new spacing.
    pub fn with_spacing(&self, spacing: [f64; 3]) -> Result<Self, GeometryError> {
        Self::new(spacing, self.origin, self.direction)
    }

    pub fn with_origin(&self, origin: [f64; 3]) -> Self {
        Self {
            origin,
            ..self.clone()
        }
    }

    fn scaled_columns(&self) -> [[f64; 3]; 3] {
        let mut m = self.direction;
        for (axis, col) in m.iter_mut().enumerate() {
            for c in col.iter_mut() {
                *c *= self.spacing[axis];
            }
        }
        m
    }
}

/// Determinant of the matrix whose columns are `cols`.
fn determinant(cols: &[[f64; 3]; 3]) -> f64 {
    let [a, b, c] = cols;
    a[0] * (b[1] * c[2] - b[2] * c[1]) - b[0] * (a[1] * c[2] - a[2] * c[1])
        + c[0] * (a[1] * b[2] - a[2] * b[1])
}

pub(crate) fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub(crate) fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_round_trip_on_oblique_grid() {
        let s = std::f64::consts::FRAC_1_SQRT_2;
        let geometry = Geometry::new(
            [2.5, 0.7, 0.7],
            [-120.0, 35.0, 410.0],
            [[0.0, 0.0, 1.0], [0.0, s, s], [1.0, 0.0, 0.0]],
        )
        .unwrap();
        let idx = [12.0, 100.5, 33.25];
        let back = geometry.physical_to_index(geometry.index_to_physical(idx));
        for (a, b) in idx.iter().zip(back) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn rejects_degenerate_affines() {
        assert_eq!(
            Geometry::new([1.0, 0.0, 1.0], [0.0; 3], CANONICAL_DIRECTION),
            Err(GeometryError::InvalidSpacing([1.0, 0.0, 1.0]))
        );
        let flat = [[1.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]];
        assert!(matches!(
            Geometry::new([1.0; 3], [0.0; 3], flat),
            Err(GeometryError::SingularDirection(_))
        ));
    }
}
