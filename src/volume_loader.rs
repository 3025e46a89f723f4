use crate::geometry::{Geometry, cross, dot};
use crate::volume::IntensityVolume;

use dicom::core::Tag;
use dicom::object::{FileDicomObject, InMemDicomObject, open_file};
use dicom::pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder, VoiLutOption};
use dicom_dictionary_std::tags;
use ndarray::{Array2, Array3, s};
use rayon::prelude::*;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Relative deviation from the nominal slice spacing tolerated before a gap
/// is reported.
const SPACING_TOLERANCE: f64 = 0.1;

/// Slices closer than this along the stacking axis are duplicates.
const DUPLICATE_POSITION_MM: f64 = 1e-3;

const ORIENTATION_TOLERANCE: f64 = 1e-3;
const PIXEL_SPACING_TOLERANCE: f64 = 1e-4;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("incomplete series: {reason}")]
    IncompleteSeries { reason: String },

    #[error("inconsistent geometry: {reason}")]
    InconsistentGeometry { reason: String },

    #[error("unreadable slice {}: {reason}", path.display())]
    UnreadableSlice { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoadError {
    fn incomplete(reason: impl Into<String>) -> Self {
        Self::IncompleteSeries {
            reason: reason.into(),
        }
    }

    fn inconsistent(reason: impl Into<String>) -> Self {
        Self::InconsistentGeometry {
            reason: reason.into(),
        }
    }
}

/// Non-fatal findings from series assembly.
#[derive(Clone, Debug, PartialEq)]
pub enum LoadWarning {
    /// Inter-slice distance between sorted slices `index` and `index + 1`
    /// deviates from the nominal spacing.
    IrregularSpacing {
        index: usize,
        spacing_mm: f64,
        nominal_mm: f64,
    },
}

impl fmt::Display for LoadWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadWarning::IrregularSpacing {
                index,
                spacing_mm,
                nominal_mm,
            } => write!(
                f,
                "irregular spacing {spacing_mm:.2} mm after slice {index} (nominal {nominal_mm:.2} mm)"
            ),
        }
    }
}

/// One decoded slice with the metadata needed to place it in a volume.
#[derive(Clone, Debug)]
pub struct SliceRecord {
    pub path: PathBuf,
    /// ImagePositionPatient, centre of the first transmitted pixel.
    pub position: [f64; 3],
    /// ImageOrientationPatient: row cosine followed by column cosine.
    pub orientation: [f64; 6],
    /// PixelSpacing: (between rows, between columns).
    pub pixel_spacing: [f64; 2],
    pub slice_thickness: Option<f64>,
    pub patient_id: Option<String>,
    pub series_uid: Option<String>,
    /// Hounsfield units (modality LUT applied).
    pub pixels: Array2<f32>,
}

#[derive(Clone, Debug)]
pub struct LoadedSeries {
    pub volume: IntensityVolume,
    pub patient_id: Option<String>,
    pub series_uid: Option<String>,
    pub warnings: Vec<LoadWarning>,
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Load a series from a directory containing .dcm files
    ///
    /// # Errors
    ///
    /// Fails when any file cannot be read as a slice, or when the slices do
    /// not form one complete, consistent series.
    pub fn load_from_directory(path: impl AsRef<Path>) -> Result<LoadedSeries, LoadError> {
        let mut paths: Vec<_> = fs::read_dir(path.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(LoadError::incomplete(format!(
                "no .dcm files in {}",
                path.as_ref().display()
            )));
        }

        Self::load_from_file_paths(&paths)
    }

    /// Load a series from file paths
    pub fn load_from_file_paths(paths: &[impl AsRef<Path> + Sync]) -> Result<LoadedSeries, LoadError> {
        let slices = paths
            .par_iter()
            .map(|path| Self::read_slice(path.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(slices = slices.len(), "decoded slices");
        Self::assemble(slices)
    }

    /// Sort, validate and stack parsed slices into one volume.
    pub fn assemble(mut slices: Vec<SliceRecord>) -> Result<LoadedSeries, LoadError> {
        if slices.is_empty() {
            return Err(LoadError::incomplete("series contains no slices"));
        }

        Self::validate_consistency(&slices)?;

        let first = &slices[0];
        let row_cosine = [first.orientation[0], first.orientation[1], first.orientation[2]];
        let col_cosine = [first.orientation[3], first.orientation[4], first.orientation[5]];
        let normal = Self::unit(cross(row_cosine, col_cosine))
            .ok_or_else(|| LoadError::inconsistent("row and column cosines are parallel"))?;

        slices.sort_by(|a, b| dot(a.position, normal).total_cmp(&dot(b.position, normal)));
        let positions: Vec<f64> = slices.iter().map(|s| dot(s.position, normal)).collect();

        let (nominal, warnings) = Self::slice_spacing(&slices, &positions)?;

        let first = &slices[0];
        let geometry = Geometry::new(
            [nominal, first.pixel_spacing[0], first.pixel_spacing[1]],
            first.position,
            [normal, col_cosine, row_cosine],
        )
        .map_err(|e| LoadError::inconsistent(e.to_string()))?;

        let data = Self::build_volume_array(&slices);
        let patient_id = first.patient_id.clone();
        let series_uid = first.series_uid.clone();

        Ok(LoadedSeries {
            volume: IntensityVolume::new(data, geometry),
            patient_id,
            series_uid,
            warnings,
        })
    }

    fn read_slice(path: &Path) -> Result<SliceRecord, LoadError> {
        let unreadable = |reason: String| LoadError::UnreadableSlice {
            path: path.to_path_buf(),
            reason,
        };

        let dicom_object = open_file(path).map_err(|e| unreadable(e.to_string()))?;

        let position = Self::get_floats::<3>(&dicom_object, tags::IMAGE_POSITION_PATIENT)
            .ok_or_else(|| unreadable("missing ImagePositionPatient".into()))?;
        let orientation = Self::get_floats::<6>(&dicom_object, tags::IMAGE_ORIENTATION_PATIENT)
            .ok_or_else(|| unreadable("missing ImageOrientationPatient".into()))?;
        let pixel_spacing = Self::get_floats::<2>(&dicom_object, tags::PIXEL_SPACING)
            .ok_or_else(|| unreadable("missing PixelSpacing".into()))?;
        let slice_thickness = dicom_object
            .element(tags::SLICE_THICKNESS)
            .ok()
            .and_then(|e| e.to_float64().ok());

        let pixels = Self::decode_image(&dicom_object).map_err(unreadable)?;

        Ok(SliceRecord {
            path: path.to_path_buf(),
            position,
            orientation,
            pixel_spacing,
            slice_thickness,
            patient_id: Self::get_string(&dicom_object, tags::PATIENT_ID),
            series_uid: Self::get_string(&dicom_object, tags::SERIES_INSTANCE_UID),
            pixels,
        })
    }

    fn get_floats<const N: usize>(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        tag: Tag,
    ) -> Option<[f64; N]> {
        let values = dicom_object.element(tag).ok()?.to_multi_float64().ok()?;
        values.get(..N)?.try_into().ok()
    }

    fn get_string(dicom_object: &FileDicomObject<InMemDicomObject>, tag: Tag) -> Option<String> {
        let value = dicom_object.element(tag).ok()?.to_str().ok()?;
        let trimmed = value.trim_end_matches(['\0', ' ']).to_string();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    fn decode_image(dicom_object: &FileDicomObject<InMemDicomObject>) -> Result<Array2<f32>, String> {
        let pixel_data = dicom_object.decode_pixel_data().map_err(|e| e.to_string())?;
        let options = ConvertOptions::new()
            .with_modality_lut(ModalityLutOption::Default)
            .with_voi_lut(VoiLutOption::Identity);
        pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .map(|arr| arr.slice_move(s![0, .., .., 0]))
            .map_err(|e| e.to_string())
    }

    fn validate_consistency(slices: &[SliceRecord]) -> Result<(), LoadError> {
        let first = &slices[0];
        let first_dim = first.pixels.dim();
        for slice in &slices[1..] {
            if slice.pixels.dim() != first_dim {
                return Err(LoadError::inconsistent(format!(
                    "{} has {:?} pixels, expected {:?}",
                    slice.path.display(),
                    slice.pixels.dim(),
                    first_dim
                )));
            }
            let spacing_differs = slice
                .pixel_spacing
                .iter()
                .zip(&first.pixel_spacing)
                .any(|(a, b)| (a - b).abs() > PIXEL_SPACING_TOLERANCE);
            if spacing_differs {
                return Err(LoadError::inconsistent(format!(
                    "{} has pixel spacing {:?}, expected {:?}",
                    slice.path.display(),
                    slice.pixel_spacing,
                    first.pixel_spacing
                )));
            }
            let orientation_differs = slice
                .orientation
                .iter()
                .zip(&first.orientation)
                .any(|(a, b)| (a - b).abs() > ORIENTATION_TOLERANCE);
            if orientation_differs {
                return Err(LoadError::inconsistent(format!(
                    "{} has a different image orientation",
                    slice.path.display()
                )));
            }
            if let (Some(a), Some(b)) = (&slice.series_uid, &first.series_uid) {
                if a != b {
                    return Err(LoadError::inconsistent(format!(
                        "slices from more than one series ({b} and {a})"
                    )));
                }
            }
        }
        if first.pixel_spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(LoadError::inconsistent(format!(
                "invalid pixel spacing {:?}",
                first.pixel_spacing
            )));
        }
        Ok(())
    }

    /// Nominal spacing along the stacking axis plus any irregularities.
    fn slice_spacing(
        slices: &[SliceRecord],
        positions: &[f64],
    ) -> Result<(f64, Vec<LoadWarning>), LoadError> {
        if positions.len() == 1 {
            let thickness = slices[0]
                .slice_thickness
                .filter(|t| t.is_finite() && *t > 0.0)
                .ok_or_else(|| LoadError::incomplete("single slice without SliceThickness"))?;
            return Ok((thickness, Vec::new()));
        }

        let gaps: Vec<f64> = positions.windows(2).map(|w| w[1] - w[0]).collect();
        if let Some(i) = gaps.iter().position(|g| *g < DUPLICATE_POSITION_MM) {
            return Err(LoadError::incomplete(format!(
                "duplicate slice position {:.3} mm ({} and {})",
                positions[i],
                slices[i].path.display(),
                slices[i + 1].path.display()
            )));
        }

        let mut sorted = gaps.clone();
        sorted.sort_by(f64::total_cmp);
        let nominal = sorted[sorted.len() / 2];

        let mut warnings = Vec::new();
        for (index, gap) in gaps.iter().copied().enumerate() {
            if ((gap - nominal) / nominal).abs() <= SPACING_TOLERANCE {
                continue;
            }
            let ratio = gap / nominal;
            let missing = ratio.round();
            if missing >= 2.0 && (ratio - missing).abs() <= SPACING_TOLERANCE {
                return Err(LoadError::incomplete(format!(
                    "{} missing slice(s) between positions {:.2} mm and {:.2} mm",
                    missing as usize - 1,
                    positions[index],
                    positions[index + 1]
                )));
            }
            warn!(
                index,
                spacing_mm = gap,
                nominal_mm = nominal,
                "irregular slice spacing"
            );
            warnings.push(LoadWarning::IrregularSpacing {
                index,
                spacing_mm: gap,
                nominal_mm: nominal,
            });
        }

        Ok((nominal, warnings))
    }

    fn build_volume_array(slices: &[SliceRecord]) -> Array3<f32> {
        let (height, width) = slices[0].pixels.dim();
        let depth = slices.len();
        let mut volume = Array3::<f32>::zeros((depth, height, width));

        for (i, slice) in slices.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(&slice.pixels);
        }

        volume
    }

    fn unit(v: [f64; 3]) -> Option<[f64; 3]> {
        let norm = dot(v, v).sqrt();
        (norm > 1e-6).then(|| [v[0] / norm, v[1] / norm, v[2] / norm])
    }
}
