//! Height-normalized tissue indices and longitudinal deltas.

use crate::enums::{TissueClass, Timepoint};
use crate::quantifier::TissueVolumeRecord;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum IndexError {
    #[error("patient {patient}: height missing or not positive ({height:?})")]
    MissingHeight { patient: String, height: Option<f64> },

    #[error("baseline {index} is zero, percent change undefined")]
    DivisionByZeroBaseline { index: TissueIndex },

    #[error("baseline belongs to patient {baseline}, follow-up to {follow_up}")]
    PatientMismatch { baseline: String, follow_up: String },
}

/// Tissue volume divided by height squared, in cm³/m².
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TissueIndex {
    /// Skeletal muscle.
    Smvi,
    /// Subcutaneous adipose.
    Savi,
    /// Visceral adipose.
    Vavi,
    /// Intermuscular adipose.
    Imvi,
}

impl TissueIndex {
    pub const ALL: [TissueIndex; 4] = [
        TissueIndex::Smvi,
        TissueIndex::Savi,
        TissueIndex::Vavi,
        TissueIndex::Imvi,
    ];

    pub fn tissue(self) -> TissueClass {
        match self {
            TissueIndex::Smvi => TissueClass::SkeletalMuscle,
            TissueIndex::Savi => TissueClass::SubcutaneousFat,
            TissueIndex::Vavi => TissueClass::VisceralFat,
            TissueIndex::Imvi => TissueClass::IntermuscularFat,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TissueIndex::Smvi => "SMVI",
            TissueIndex::Savi => "SAVI",
            TissueIndex::Vavi => "VAVI",
            TissueIndex::Imvi => "IMVI",
        }
    }
}

impl fmt::Display for TissueIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexDelta {
    /// Follow-up minus baseline.
    pub delta: f64,
    pub percent_delta: f64,
}

impl IndexDelta {
    pub fn between(index: TissueIndex, baseline: f64, follow_up: f64) -> Result<Self, IndexError> {
        if baseline == 0.0 {
            return Err(IndexError::DivisionByZeroBaseline { index });
        }
        let delta = follow_up - baseline;
        Ok(Self {
            delta,
            percent_delta: delta / baseline * 100.0,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub patient: String,
    pub timepoint: Timepoint,
    pub height_m: f64,
    pub indices: BTreeMap<TissueIndex, f64>,
    /// Present on follow-up records that were compared against a baseline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deltas: Option<BTreeMap<TissueIndex, IndexDelta>>,
}

impl IndexRecord {
    pub fn compute(
        patient: &str,
        timepoint: Timepoint,
        volumes: &TissueVolumeRecord,
        height_m: Option<f64>,
    ) -> Result<Self, IndexError> {
        let height = match height_m {
            Some(h) if h.is_finite() && h > 0.0 => h,
            other => {
                return Err(IndexError::MissingHeight {
                    patient: patient.to_string(),
                    height: other,
                });
            }
        };
        let squared = height * height;
        let indices = TissueIndex::ALL
            .iter()
            .map(|&index| (index, volumes.volume_cm3(index.tissue()) / squared))
            .collect();
        Ok(Self {
            patient: patient.to_string(),
            timepoint,
            height_m: height,
            indices,
            deltas: None,
        })
    }

    pub fn get(&self, index: TissueIndex) -> f64 {
        self.indices.get(&index).copied().unwrap_or(0.0)
    }

    /// Tissue volume in cm³ recovered from the index and the recorded height.
    pub fn tissue_volume(&self, index: TissueIndex) -> f64 {
        self.get(index) * self.height_m * self.height_m
    }

    /// Attach per-index deltas against an earlier record of the same patient.
    pub fn with_baseline(mut self, baseline: &IndexRecord) -> Result<Self, IndexError> {
        if baseline.patient != self.patient {
            return Err(IndexError::PatientMismatch {
                baseline: baseline.patient.clone(),
                follow_up: self.patient,
            });
        }
        let mut deltas = BTreeMap::new();
        for index in TissueIndex::ALL {
            deltas.insert(index, IndexDelta::between(index, baseline.get(index), self.get(index))?);
        }
        self.deltas = Some(deltas);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_delta_of_a_decline() {
        let delta = IndexDelta::between(TissueIndex::Smvi, 40.0, 36.0).unwrap();
        assert!((delta.delta + 4.0).abs() < 1e-12);
        assert!((delta.percent_delta + 10.0).abs() < 1e-12);
    }

    #[test]
    fn index_names_serialize_uppercase() {
        assert_eq!(serde_json::to_string(&TissueIndex::Imvi).unwrap(), "\"IMVI\"");
    }
}
