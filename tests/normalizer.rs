use ct_bodycomp::IntensityVolume;
use ct_bodycomp::geometry::Geometry;
use ct_bodycomp::normalizer::{HuWindow, Normalize};
use ndarray::Array3;

fn ramp() -> IntensityVolume {
    let data = Array3::from_shape_fn((4, 5, 6), |(z, y, x)| -1200.0 + (z * 30 + y * 6 + x) as f32 * 25.0);
    IntensityVolume::new(data, Geometry::canonical([1.5; 3]).unwrap())
}

#[test]
fn normalizing_twice_is_a_fixed_point() {
    let window = HuWindow::soft_tissue();
    let once = ramp().normalize(window);
    let twice = once.normalize(window);
    assert_eq!(once, twice);
}

#[test]
fn normalized_values_lie_in_unit_interval() {
    let normalized = ramp().normalize(HuWindow::default());
    assert!(normalized.volume().data().iter().all(|v| (0.0..=1.0).contains(v)));
    assert_eq!(normalized.volume().geometry(), ramp().geometry());
    assert_eq!(normalized.window(), HuWindow::soft_tissue());
}

#[test]
fn rewindowing_matches_windowing_the_source() {
    let wide = HuWindow::new(-1000.0, 1000.0).unwrap();
    let narrow = HuWindow::soft_tissue();

    let direct = ramp().normalize(narrow);
    let via_wide = ramp().normalize(wide).normalize(narrow);

    assert_eq!(via_wide.window(), narrow);
    for (a, b) in direct.volume().data().iter().zip(via_wide.volume().data().iter()) {
        assert!((a - b).abs() < 1e-5, "{a} vs {b}");
    }
}
