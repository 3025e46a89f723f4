use std::fmt;

use serde::{Deserialize, Serialize};

/// Anatomical viewing planes, named relative to the canonical frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Orientation {
    Axial,
    Coronal,
    Sagittal,
}

impl Orientation {
    /// Array axis that is held fixed when slicing in this plane.
    pub fn axis(self) -> usize {
        match self {
            Orientation::Axial => 0,
            Orientation::Coronal => 1,
            Orientation::Sagittal => 2,
        }
    }
}

/// Closed set of voxel classes produced by segmentation.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TissueClass {
    Background = 0,
    Vertebra = 1,
    SkeletalMuscle = 2,
    SubcutaneousFat = 3,
    VisceralFat = 4,
    IntermuscularFat = 5,
}

impl TissueClass {
    pub const ALL: [TissueClass; 6] = [
        TissueClass::Background,
        TissueClass::Vertebra,
        TissueClass::SkeletalMuscle,
        TissueClass::SubcutaneousFat,
        TissueClass::VisceralFat,
        TissueClass::IntermuscularFat,
    ];

    /// Classes that carry a measured volume (everything but background).
    pub const MEASURED: [TissueClass; 5] = [
        TissueClass::Vertebra,
        TissueClass::SkeletalMuscle,
        TissueClass::SubcutaneousFat,
        TissueClass::VisceralFat,
        TissueClass::IntermuscularFat,
    ];

    #[inline]
    pub fn label(self) -> u8 {
        self as u8
    }

    pub fn from_label(label: u8) -> Option<Self> {
        Self::ALL.get(label as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            TissueClass::Background => "background",
            TissueClass::Vertebra => "vertebra",
            TissueClass::SkeletalMuscle => "skeletal_muscle",
            TissueClass::SubcutaneousFat => "subcutaneous_fat",
            TissueClass::VisceralFat => "visceral_fat",
            TissueClass::IntermuscularFat => "intermuscular_fat",
        }
    }
}

impl fmt::Display for TissueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Timepoint {
    Baseline,
    FollowUp,
}

impl Timepoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Timepoint::Baseline => "baseline",
            Timepoint::FollowUp => "follow_up",
        }
    }
}

impl fmt::Display for Timepoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of the two inference configurations is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    Coarse,
    Fine,
}

impl PassKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PassKind::Coarse => "coarse",
            PassKind::Fine => "fine",
        }
    }
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How overlapping patch probabilities are combined before arg-max.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Sum,
    Mean,
    Max,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_round_trip_through_class() {
        for class in TissueClass::ALL {
            assert_eq!(TissueClass::from_label(class.label()), Some(class));
        }
        assert_eq!(TissueClass::from_label(6), None);
    }
}
