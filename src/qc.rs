//! Review images: windowed slices with tissue overlays and range markers.

use crate::cache::sanitize;
use crate::enums::{Orientation, TissueClass};
use crate::normalizer::HuWindow;
use crate::pipeline::UnitOutcome;
use crate::range_selector::VertebralRange;
use crate::volume::{IntensityVolume, LabelMap};

use image::{ImageBuffer, ImageResult, RgbImage};
use ndarray::{ArrayView2, Axis};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::debug;

const OVERLAY_ALPHA: f32 = 0.45;
const T1_COLOUR: [u8; 3] = [0, 220, 0];
const T12_COLOUR: [u8; 3] = [230, 0, 0];

pub fn class_colour(class: TissueClass) -> Option<[u8; 3]> {
    match class {
        TissueClass::Background => None,
        TissueClass::Vertebra => Some([240, 240, 90]),
        TissueClass::SkeletalMuscle => Some([220, 40, 40]),
        TissueClass::SubcutaneousFat => Some([250, 170, 40]),
        TissueClass::VisceralFat => Some([40, 200, 80]),
        TissueClass::IntermuscularFat => Some([60, 120, 250]),
    }
}

#[inline]
fn normalize_to_u8(hu: f32, window: HuWindow) -> u8 {
    (window.eval(hu) * 255.0).round().clamp(0.0, 255.0) as u8
}

#[inline]
fn blend(gray: u8, colour: [u8; 3]) -> [u8; 3] {
    colour.map(|c| (f32::from(gray) * (1.0 - OVERLAY_ALPHA) + f32::from(c) * OVERLAY_ALPHA).round() as u8)
}

fn rows_to_image(width: usize, height: usize, pixels: Vec<u8>) -> Option<RgbImage> {
    ImageBuffer::from_raw(width as u32, height as u32, pixels)
}

/// Axial slice `slice` of `hu`, windowed to grey, with every labelled voxel
/// tinted by its class colour. `None` when the slice is out of range or the
/// volumes are not aligned.
pub fn render_axial_overlay(
    hu: &IntensityVolume,
    labels: &LabelMap,
    slice: usize,
    window: HuWindow,
) -> Option<RgbImage> {
    if hu.shape() != labels.shape() {
        return None;
    }
    let grey = hu.get_slice_from_axis(slice, Orientation::Axial)?;
    let tissue = labels.get_slice_from_axis(slice, Orientation::Axial)?;
    let (height, width) = grey.dim();

    let pixels: Vec<u8> = grey
        .axis_iter(Axis(0))
        .into_par_iter()
        .zip(tissue.axis_iter(Axis(0)).into_par_iter())
        .flat_map_iter(|(g, t)| {
            g.iter()
                .zip(t.iter())
                .flat_map(|(&value, &label)| {
                    let grey = normalize_to_u8(value, window);
                    match TissueClass::from_label(label).and_then(class_colour) {
                        Some(colour) => blend(grey, colour),
                        None => [grey; 3],
                    }
                })
                .collect::<Vec<u8>>()
        })
        .collect();
    rows_to_image(width, height, pixels)
}

/// Coronal slice through the middle of the volume, superior at the top, with
/// the top of T1 and the bottom of T12 drawn as horizontal lines.
pub fn render_coronal_range(hu: &IntensityVolume, range: &VertebralRange, window: HuWindow) -> Option<RgbImage> {
    let [depth, rows, _] = hu.shape();
    if range.high >= depth {
        return None;
    }
    let coronal: ArrayView2<'_, f32> = hu.get_slice_from_axis(rows / 2, Orientation::Coronal)?;
    let (_, width) = coronal.dim();

    let pixels: Vec<u8> = (0..depth)
        .into_par_iter()
        .flat_map_iter(|row| {
            // axial index grows superior; image rows grow downward
            let z = depth - 1 - row;
            let line = if z == range.high {
                Some(T1_COLOUR)
            } else if z == range.low {
                Some(T12_COLOUR)
            } else {
                None
            };
            coronal
                .row(z)
                .iter()
                .flat_map(|&value| line.unwrap_or([normalize_to_u8(value, window); 3]))
                .collect::<Vec<u8>>()
        })
        .collect();
    rows_to_image(width, depth, pixels)
}

/// Write `<stem>_axial.png` (middle of the range) and `<stem>_coronal.png`
/// for one unit; returns the written paths.
pub fn save_previews(outcome: &UnitOutcome, window: HuWindow, dir: &Path) -> ImageResult<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let stem = format!("{}_{}", sanitize(&outcome.unit.patient), outcome.unit.timepoint);
    let mut written = Vec::new();

    let middle = (outcome.range.low + outcome.range.high) / 2;
    if let Some(image) = render_axial_overlay(&outcome.standardized, &outcome.fine, middle, window) {
        let path = dir.join(format!("{stem}_axial.png"));
        image.save(&path)?;
        written.push(path);
    }
    if let Some(image) = render_coronal_range(&outcome.standardized, &outcome.range, window) {
        let path = dir.join(format!("{stem}_coronal.png"));
        image.save(&path)?;
        written.push(path);
    }
    debug!(files = written.len(), dir = %dir.display(), "qc previews written");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use image::Rgb;
    use ndarray::Array3;

    fn pixel(image: &RgbImage, x: u32, y: u32) -> [u8; 3] {
        let Rgb(p) = *image.get_pixel(x, y);
        p
    }

    fn volume() -> IntensityVolume {
        IntensityVolume::new(
            Array3::from_elem((10, 4, 6), 250.0),
            Geometry::canonical([1.0; 3]).unwrap(),
        )
    }

    #[test]
    fn overlay_tints_labelled_voxels() {
        let mut labels = Array3::<u8>::zeros((10, 4, 6));
        labels[[3, 1, 2]] = TissueClass::SkeletalMuscle.label();
        let labels = LabelMap::new(labels, Geometry::canonical([1.0; 3]).unwrap());

        let image = render_axial_overlay(&volume(), &labels, 3, HuWindow::soft_tissue()).unwrap();
        assert_eq!(image.dimensions(), (6, 4));
        assert_eq!(pixel(&image, 0, 0), [255, 255, 255]);
        assert_eq!(pixel(&image, 2, 1), blend(255, [220, 40, 40]));
        assert!(render_axial_overlay(&volume(), &labels, 10, HuWindow::soft_tissue()).is_none());
    }

    #[test]
    fn coronal_marks_range_bounds() {
        let range = VertebralRange {
            low: 2,
            high: 7,
            levels: Vec::new(),
        };
        let image = render_coronal_range(&volume(), &range, HuWindow::soft_tissue()).unwrap();
        assert_eq!(image.dimensions(), (6, 10));
        assert_eq!(pixel(&image, 0, 9 - 7), T1_COLOUR);
        assert_eq!(pixel(&image, 5, 9 - 2), T12_COLOUR);
        assert_eq!(pixel(&image, 0, 0), [255, 255, 255]);
    }
}
