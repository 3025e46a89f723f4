use ct_bodycomp::enums::TissueClass;
use ct_bodycomp::geometry::Geometry;
use ct_bodycomp::standardizer::{SpatialStandardizer, StandardizerConfig};
use ct_bodycomp::{IntensityVolume, LabelMap};
use ndarray::Array3;

/// Radius in mm of a 5 cm³ sphere.
fn five_cc_radius() -> f64 {
    (3.0 * 5000.0 / (4.0 * std::f64::consts::PI)).cbrt()
}

fn sphere_labels() -> LabelMap {
    let radius = five_cc_radius();
    let centre = [50.0, 32.0, 32.0];
    let data = Array3::from_shape_fn((100, 64, 64), |(z, y, x)| {
        let d2 = (z as f64 - centre[0]).powi(2) + (y as f64 - centre[1]).powi(2) + (x as f64 - centre[2]).powi(2);
        if d2 <= radius * radius {
            TissueClass::SkeletalMuscle.label()
        } else {
            TissueClass::Background.label()
        }
    });
    LabelMap::new(data, Geometry::canonical([1.0; 3]).unwrap())
}

fn muscle_volume_mm3(labels: &LabelMap) -> f64 {
    let voxels = labels
        .data()
        .iter()
        .filter(|&&v| v == TissueClass::SkeletalMuscle.label())
        .count();
    voxels as f64 * labels.geometry().voxel_volume_mm3()
}

#[test]
fn nearest_resampling_only_produces_existing_labels() {
    let classes = [0u8, 2, 5];
    let data = Array3::from_shape_fn((17, 13, 11), |(z, y, x)| classes[(z * 7 + y * 3 + x * 11) % 3]);
    let labels = LabelMap::new(data, Geometry::canonical([2.5, 0.8, 0.8]).unwrap());

    for spacing in [[1.5, 1.5, 1.5], [3.0, 3.0, 3.0], [0.7, 1.1, 2.3]] {
        let resampled = labels.resample(spacing).unwrap();
        for label in resampled.present_labels() {
            assert!(classes.contains(&label), "label {label} appeared at {spacing:?}");
        }
    }
}

#[test]
fn sphere_volume_survives_resampling() {
    let labels = sphere_labels();
    let expected = 5000.0;

    let original = muscle_volume_mm3(&labels);
    assert!((original - expected).abs() / expected < 0.05, "1 mm: {original}");

    let fine = labels.resample([1.5; 3]).unwrap();
    let fine_volume = muscle_volume_mm3(&fine);
    assert!((fine_volume - expected).abs() / expected < 0.05, "1.5 mm: {fine_volume}");

    let coarse = labels.resample([3.0; 3]).unwrap();
    let coarse_volume = muscle_volume_mm3(&coarse);
    assert!((coarse_volume - fine_volume).abs() / fine_volume < 0.15, "3 mm: {coarse_volume}");
}

#[test]
fn resampled_grid_keeps_physical_extent() {
    let volume = IntensityVolume::new(
        Array3::zeros((100, 64, 64)),
        Geometry::canonical([1.0; 3]).unwrap(),
    );
    let resampled = volume.resample([1.5; 3]).unwrap();
    assert_eq!(resampled.shape(), [67, 43, 43]);
    assert_eq!(resampled.geometry().spacing(), [1.5; 3]);
    // first centre moves by half the spacing difference
    for c in resampled.geometry().origin() {
        assert!((c - 0.25).abs() < 1e-9);
    }
}

#[test]
fn standardizer_reorients_and_resamples() {
    let geometry = Geometry::new(
        [3.0, 1.0, 1.0],
        [0.0, 0.0, 90.0],
        [[0.0, 0.0, -1.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]],
    )
    .unwrap();
    let data = Array3::from_shape_fn((10, 6, 6), |(z, _, _)| z as f32);
    let volume = IntensityVolume::new(data, geometry);

    let standardizer = SpatialStandardizer::new(StandardizerConfig {
        target_spacing: [3.0, 1.0, 1.0],
        ..StandardizerConfig::default()
    });
    let standardized = standardizer.standardize(&volume).unwrap();

    assert!(standardized.geometry().is_canonical());
    assert_eq!(standardized.shape(), [10, 6, 6]);
    // the most inferior source slice is now first
    assert_eq!(standardized.data()[[0, 0, 0]], 9.0);
    assert_eq!(standardized.data()[[9, 5, 5]], 0.0);
}
