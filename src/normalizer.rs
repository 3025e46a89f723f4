use crate::volume::IntensityVolume;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error("invalid HU window [{low}, {high}]")]
    InvalidWindow { low: f32, high: f32 },
}

/// Hounsfield window applied before rescaling to `[0, 1]`.
///
/// The window is read-only; build a new one to change bounds.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawWindow")]
pub struct HuWindow {
    low: f32,
    high: f32,
}

#[derive(Deserialize)]
struct RawWindow {
    low: f32,
    high: f32,
}

impl TryFrom<RawWindow> for HuWindow {
    type Error = NormalizeError;

    fn try_from(raw: RawWindow) -> Result<Self, Self::Error> {
        HuWindow::new(raw.low, raw.high)
    }
}

impl HuWindow {
    pub fn new(low: f32, high: f32) -> Result<Self, NormalizeError> {
        if low.is_finite() && high.is_finite() && low < high {
            Ok(Self { low, high })
        } else {
            Err(NormalizeError::InvalidWindow { low, high })
        }
    }

    /// Fat and soft tissue, with dense bone and air saturated.
    pub const fn soft_tissue() -> Self {
        Self {
            low: -250.0,
            high: 250.0,
        }
    }

    #[inline]
    pub fn low(&self) -> f32 {
        self.low
    }

    #[inline]
    pub fn high(&self) -> f32 {
        self.high
    }

    #[inline]
    pub fn width(&self) -> f32 {
        self.high - self.low
    }

    /// Clip `hu` to the window and map it linearly onto `[0, 1]`.
    /// Non-finite input maps to 0.
    #[inline]
    pub fn eval(&self, hu: f32) -> f32 {
        if !hu.is_finite() {
            return 0.0;
        }
        (hu.clamp(self.low, self.high) - self.low) / self.width()
    }

    #[inline]
    pub fn to_hu(&self, value: f32) -> f32 {
        self.low + value.clamp(0.0, 1.0) * self.width()
    }
}

impl Default for HuWindow {
    fn default() -> Self {
        Self::soft_tissue()
    }
}

/// Intensities in `[0, 1]`, tagged with the window that produced them.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedVolume {
    volume: IntensityVolume,
    window: HuWindow,
}

impl NormalizedVolume {
    pub fn volume(&self) -> &IntensityVolume {
        &self.volume
    }

    pub fn window(&self) -> HuWindow {
        self.window
    }

    pub fn into_volume(self) -> IntensityVolume {
        self.volume
    }
}

/// Elementwise windowing. Normalizing an already-normalized volume with the
/// same window returns it unchanged.
pub trait Normalize {
    fn normalize(&self, window: HuWindow) -> NormalizedVolume;
}

impl Normalize for IntensityVolume {
    fn normalize(&self, window: HuWindow) -> NormalizedVolume {
        NormalizedVolume {
            volume: map_voxels(self, |hu| window.eval(hu)),
            window,
        }
    }
}

impl Normalize for NormalizedVolume {
    fn normalize(&self, window: HuWindow) -> NormalizedVolume {
        if window == self.window {
            return self.clone();
        }
        let previous = self.window;
        NormalizedVolume {
            volume: map_voxels(&self.volume, |v| window.eval(previous.to_hu(v))),
            window,
        }
    }
}

fn map_voxels(volume: &IntensityVolume, f: impl Fn(f32) -> f32 + Sync + Send) -> IntensityVolume {
    let mut data = volume.data().to_owned();
    data.par_mapv_inplace(f);
    IntensityVolume::new(data, volume.geometry().clone())
}
