//! # ct-bodycomp
//!
//! Body composition from a thoracic CT series: tissue volumes over the
//! T1–T12 vertebral range, normalized by patient height.
//!
//! A series is read from a directory of DICOM slices with the dicom-rs
//! ecosystem, reoriented to a canonical frame (axis 0 superior, axis 1
//! posterior, axis 2 left) and resampled to a fixed spacing. Two passes of an
//! external segmentation model follow:
//!  - a coarse pass that only localizes vertebrae, used to find T1–T12
//!  - a fine pass over all tissue classes with overlapping patches
//!
//! Voxels of each class inside the range are counted and converted to cm³,
//! then divided by height squared into the SMVI, SAVI, VAVI and IMVI
//! indices. Follow-up scans get absolute and percentage changes against the
//! patient's baseline.
//!
//! The model is anything implementing [`SegmentationModel`];
//! [`CommandModel`] runs an external program over `.npy` files. Loading,
//! resampling, arg-max and batch execution run in parallel using rayon.
//!
//! # Examples
//!
//! ## Running one patient-timepoint
//!
//! ```no_run
//! # use ct_bodycomp::{CommandModel, Pipeline, PipelineConfig, ScanUnit, Timepoint};
//! let pipeline = Pipeline::new(PipelineConfig::default(), CommandModel::new("segment-ct"))
//!     .expect("default config is valid");
//! let unit = ScanUnit {
//!     patient: "P001".into(),
//!     timepoint: Timepoint::Baseline,
//!     series_dir: "dicom/P001/baseline".into(),
//!     height_m: Some(1.72),
//! };
//! let outcome = pipeline.run_unit(&unit).expect("unit should have been quantified");
//! println!("T1-T12 spans axial slices {}..={}", outcome.range.low, outcome.range.high);
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod enums;
pub mod geometry;
pub mod indexing;
pub mod inference;
mod interpolator;
pub mod normalizer;
pub mod pipeline;
pub mod qc;
pub mod quantifier;
pub mod range_selector;
pub mod standardizer;
pub mod volume;
pub mod volume_loader;

pub use config::PipelineConfig;
pub use enums::{Orientation, PassKind, Timepoint, TissueClass};
pub use inference::{CommandModel, SegmentationModel};
pub use pipeline::{BatchReport, Pipeline, ScanUnit};
pub use volume::{IntensityVolume, LabelMap, Volume};
pub use volume_loader::VolumeLoader;
