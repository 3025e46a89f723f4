use assert_matches::assert_matches;
use ct_bodycomp::enums::{Aggregation, PassKind, TissueClass};
use ct_bodycomp::geometry::Geometry;
use ct_bodycomp::inference::{
    InferenceError, InferencePass, MODEL_CONTRACT_VERSION, ModelContract, ModelError, Orchestrator, RetryPolicy,
    SegmentationModel,
};
use ct_bodycomp::normalizer::{HuWindow, Normalize, NormalizedVolume};
use ct_bodycomp::IntensityVolume;
use ndarray::{Array3, Array5, ArrayView4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn pass(patch: [usize; 3], overlap: f64, classes: Vec<TissueClass>, aggregation: Aggregation) -> InferencePass {
    InferencePass {
        kind: PassKind::Fine,
        spacing: [1.5; 3],
        patch_shape: patch,
        overlap,
        batch_size: 2,
        aggregation,
        classes,
    }
}

fn normalized(data: Array3<f32>, spacing: f64) -> NormalizedVolume {
    let window = HuWindow::new(0.0, 1.0).unwrap();
    IntensityVolume::new(data, Geometry::canonical([spacing; 3]).unwrap()).normalize(window)
}

/// Per-voxel one-hot class chosen by intensity band.
struct BandModel {
    patch: [usize; 3],
    classes: usize,
    calls: AtomicU32,
}

impl BandModel {
    fn new(patch: [usize; 3], classes: usize) -> Self {
        Self {
            patch,
            classes,
            calls: AtomicU32::new(0),
        }
    }

    fn class_of(&self, v: f32) -> usize {
        ((v * self.classes as f32) as usize).min(self.classes - 1)
    }
}

impl SegmentationModel for BandModel {
    fn contract(&self, _pass: PassKind) -> ModelContract {
        ModelContract {
            version: MODEL_CONTRACT_VERSION,
            patch_shape: self.patch,
            num_classes: self.classes,
        }
    }

    fn infer(&self, batch: ArrayView4<'_, f32>, _pass: PassKind) -> Result<Array5<f32>, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (b, d, h, w) = batch.dim();
        Ok(Array5::from_shape_fn((b, d, h, w, self.classes), |(i, z, y, x, c)| {
            if c == self.class_of(batch[[i, z, y, x]]) { 1.0 } else { 0.0 }
        }))
    }
}

/// Confident in the middle half of each patch along depth, weakly wrong near
/// the patch faces.
struct EdgeBiasedModel {
    patch: [usize; 3],
}

impl SegmentationModel for EdgeBiasedModel {
    fn contract(&self, _pass: PassKind) -> ModelContract {
        ModelContract {
            version: MODEL_CONTRACT_VERSION,
            patch_shape: self.patch,
            num_classes: 2,
        }
    }

    fn infer(&self, batch: ArrayView4<'_, f32>, _pass: PassKind) -> Result<Array5<f32>, ModelError> {
        let (b, d, h, w) = batch.dim();
        let quarter = d / 4;
        Ok(Array5::from_shape_fn((b, d, h, w, 2), |(_, z, _, _, c)| {
            let interior = z >= quarter && z < d - quarter;
            match (interior, c) {
                (true, 1) => 0.9,
                (true, _) => 0.1,
                (false, 1) => 0.45,
                (false, _) => 0.55,
            }
        }))
    }
}

/// Unavailable for the first `failures` calls, then a constant background.
struct FlakyModel {
    failures: u32,
    calls: AtomicU32,
    patch: [usize; 3],
}

impl SegmentationModel for FlakyModel {
    fn contract(&self, _pass: PassKind) -> ModelContract {
        ModelContract {
            version: MODEL_CONTRACT_VERSION,
            patch_shape: self.patch,
            num_classes: 2,
        }
    }

    fn infer(&self, batch: ArrayView4<'_, f32>, _pass: PassKind) -> Result<Array5<f32>, ModelError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(ModelError::Unavailable(format!("connection refused ({call})")));
        }
        let (b, d, h, w) = batch.dim();
        Ok(Array5::from_shape_fn((b, d, h, w, 2), |(.., c)| if c == 0 { 1.0 } else { 0.0 }))
    }
}

#[test]
fn label_map_has_input_shape_and_no_seams() {
    let data = Array3::from_shape_fn((37, 21, 19), |(z, y, x)| ((z * 13 + y * 7 + x * 3) % 6) as f32 / 6.0 + 0.01);
    let input = normalized(data.clone(), 1.5);
    let model = BandModel::new([16, 8, 8], 6);
    let orchestrator = Orchestrator::new(&model, RetryPolicy::immediate(1));

    for aggregation in [Aggregation::Sum, Aggregation::Mean, Aggregation::Max] {
        let p = pass([16, 8, 8], 0.5, TissueClass::ALL.to_vec(), aggregation);
        let labels = orchestrator.run(&p, &input).unwrap();
        assert_eq!(labels.shape(), [37, 21, 19]);
        assert_eq!(labels.geometry(), input.volume().geometry());
        for ((z, y, x), &label) in labels.data().indexed_iter() {
            let value = input.volume().data()[[z, y, x]];
            assert_eq!(label as usize, model.class_of(value), "at {:?}", (z, y, x));
        }
    }
}

#[test]
fn volume_smaller_than_a_patch_is_padded() {
    let input = normalized(Array3::from_elem((5, 3, 3), 0.9), 1.5);
    let model = BandModel::new([16, 8, 8], 2);
    let labels = Orchestrator::new(&model, RetryPolicy::immediate(1))
        .run(&pass([16, 8, 8], 0.0, vec![TissueClass::Background, TissueClass::Vertebra], Aggregation::Sum), &input)
        .unwrap();
    assert_eq!(labels.shape(), [5, 3, 3]);
    assert!(labels.data().iter().all(|&l| l == TissueClass::Vertebra.label()));
    assert_eq!(model.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn overlapping_probabilities_are_aggregated_before_argmax() {
    let input = normalized(Array3::zeros((48, 4, 4)), 1.5);
    let model = EdgeBiasedModel { patch: [16, 4, 4] };
    let orchestrator = Orchestrator::new(&model, RetryPolicy::immediate(1));
    let classes = vec![TissueClass::Background, TissueClass::Vertebra];

    for aggregation in [Aggregation::Sum, Aggregation::Mean, Aggregation::Max] {
        let labels = orchestrator
            .run(&pass([16, 4, 4], 0.5, classes.clone(), aggregation), &input)
            .unwrap();
        for z in 0..48 {
            // every slice away from the volume faces is in some patch's interior
            let expected = if (4..44).contains(&z) { 1 } else { 0 };
            assert!(
                labels.data().index_axis(ndarray::Axis(0), z).iter().all(|&l| l == expected),
                "{aggregation:?} slice {z}"
            );
        }
    }
}

#[test]
fn pass_resolution_is_mapped_back_to_the_input_grid() {
    let input = normalized(Array3::from_elem((20, 10, 10), 0.9), 1.5);
    let model = BandModel::new([8, 4, 4], 2);
    let coarse = InferencePass {
        kind: PassKind::Coarse,
        spacing: [3.0; 3],
        patch_shape: [8, 4, 4],
        overlap: 0.0,
        batch_size: 4,
        aggregation: Aggregation::Sum,
        classes: vec![TissueClass::Background, TissueClass::Vertebra],
    };
    let labels = Orchestrator::new(&model, RetryPolicy::immediate(1)).run(&coarse, &input).unwrap();
    assert_eq!(labels.shape(), [20, 10, 10]);
    assert_eq!(labels.geometry(), input.volume().geometry());
    assert_eq!(labels.present_labels(), vec![TissueClass::Vertebra.label()]);
}

#[test]
fn transient_unavailability_is_retried() {
    let model = FlakyModel {
        failures: 2,
        calls: AtomicU32::new(0),
        patch: [4, 4, 4],
    };
    let input = normalized(Array3::zeros((4, 4, 4)), 1.5);
    let classes = vec![TissueClass::Background, TissueClass::Vertebra];
    let labels = Orchestrator::new(&model, RetryPolicy::immediate(3))
        .run(&pass([4, 4, 4], 0.0, classes, Aggregation::Sum), &input)
        .unwrap();
    assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    assert_eq!(labels.present_labels(), vec![0]);
}

#[test]
fn retries_are_bounded() {
    let model = FlakyModel {
        failures: 10,
        calls: AtomicU32::new(0),
        patch: [4, 4, 4],
    };
    let input = normalized(Array3::zeros((4, 4, 4)), 1.5);
    let classes = vec![TissueClass::Background, TissueClass::Vertebra];
    let err = Orchestrator::new(&model, RetryPolicy::immediate(3))
        .run(&pass([4, 4, 4], 0.0, classes, Aggregation::Sum), &input)
        .unwrap_err();
    assert_matches!(err, InferenceError::ModelUnavailable { attempts: 3, .. });
    assert_eq!(model.calls.load(Ordering::SeqCst), 3);
}

#[test]
fn patch_shape_mismatch_fails_before_any_call() {
    let model = FlakyModel {
        failures: 0,
        calls: AtomicU32::new(0),
        patch: [8, 8, 8],
    };
    let input = normalized(Array3::zeros((4, 4, 4)), 1.5);
    let classes = vec![TissueClass::Background, TissueClass::Vertebra];
    let err = Orchestrator::new(&model, RetryPolicy::immediate(3))
        .run(&pass([4, 4, 4], 0.0, classes, Aggregation::Sum), &input)
        .unwrap_err();
    assert_matches!(err, InferenceError::PatchShapeMismatch { pass: PassKind::Fine, .. });
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn wrong_output_shape_is_not_retried() {
    struct Truncating;
    impl SegmentationModel for Truncating {
        fn contract(&self, _pass: PassKind) -> ModelContract {
            ModelContract {
                version: MODEL_CONTRACT_VERSION,
                patch_shape: [4, 4, 4],
                num_classes: 2,
            }
        }
        fn infer(&self, batch: ArrayView4<'_, f32>, _pass: PassKind) -> Result<Array5<f32>, ModelError> {
            let (b, d, h, w) = batch.dim();
            Ok(Array5::zeros((b, d, h, w, 1)))
        }
    }

    let input = normalized(Array3::zeros((4, 4, 4)), 1.5);
    let classes = vec![TissueClass::Background, TissueClass::Vertebra];
    let err = Orchestrator::new(Truncating, RetryPolicy::immediate(3))
        .run(&pass([4, 4, 4], 0.0, classes, Aggregation::Sum), &input)
        .unwrap_err();
    assert_matches!(err, InferenceError::PatchShapeMismatch { .. });
}

#[test]
fn invalid_overlap_is_a_configuration_error() {
    let model = BandModel::new([4, 4, 4], 2);
    let input = normalized(Array3::zeros((4, 4, 4)), 1.5);
    let classes = vec![TissueClass::Background, TissueClass::Vertebra];
    let err = Orchestrator::new(&model, RetryPolicy::immediate(1))
        .run(&pass([4, 4, 4], 1.0, classes, Aggregation::Sum), &input)
        .unwrap_err();
    assert_matches!(err, InferenceError::PatchShapeMismatch { .. });
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn backoff_growth_is_capped() {
    let runaway = RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 1,
        multiplier: 1e300,
    };
    assert_eq!(runaway.next_delay(Duration::from_millis(1)), RetryPolicy::MAX_BACKOFF);
    assert_eq!(runaway.next_delay(RetryPolicy::MAX_BACKOFF), RetryPolicy::MAX_BACKOFF);
    assert!(runaway.validate().is_err());

    let default = RetryPolicy::default();
    assert!(default.validate().is_ok());
    assert_eq!(default.first_delay(), Duration::from_millis(500));
    assert_eq!(default.next_delay(Duration::from_millis(500)), Duration::from_secs(1));
}
