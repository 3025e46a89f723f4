//! Injected storage for intermediate stage results.
//!
//! Entries are keyed by patient, timepoint, stage and a fingerprint of the
//! loaded volume plus the pipeline configuration, so stale results are never
//! returned after either changes.

use crate::enums::Timepoint;
use crate::geometry::Geometry;
use crate::quantifier::TissueVolumeRecord;
use crate::volume::{IntensityVolume, LabelMap};

use ndarray::Array3;
use ndarray_npy::{read_npy, write_npy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cache entry {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    CoarseLabels,
    FineLabels,
    TissueVolumes,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::CoarseLabels => "coarse_labels",
            Stage::FineLabels => "fine_labels",
            Stage::TissueVolumes => "tissue_volumes",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub patient: String,
    pub timepoint: Timepoint,
    pub stage: Stage,
    pub fingerprint: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Artifact {
    Labels(LabelMap),
    Tissue(TissueVolumeRecord),
}

pub trait ArtifactCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Result<Option<Artifact>, CacheError>;
    fn put(&self, key: &CacheKey, artifact: &Artifact) -> Result<(), CacheError>;
}

/// SHA-256 over the voxels, the geometry and an opaque configuration string.
pub fn fingerprint(volume: &IntensityVolume, config: &str) -> String {
    let mut hasher = Sha256::new();
    let mut buffer = Vec::with_capacity(4096);
    for value in volume.data().iter() {
        buffer.extend_from_slice(&value.to_le_bytes());
        if buffer.len() >= 4096 {
            hasher.update(&buffer);
            buffer.clear();
        }
    }
    hasher.update(&buffer);
    for dim in volume.shape() {
        hasher.update((dim as u64).to_le_bytes());
    }
    let geometry = volume.geometry();
    for v in geometry
        .spacing()
        .iter()
        .chain(geometry.origin().iter())
        .chain(geometry.direction().iter().flatten())
    {
        hasher.update(v.to_le_bytes());
    }
    hasher.update(config.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Never hits; used when caching is disabled.
pub struct NoCache;

impl ArtifactCache for NoCache {
    fn get(&self, _key: &CacheKey) -> Result<Option<Artifact>, CacheError> {
        Ok(None)
    }

    fn put(&self, _key: &CacheKey, _artifact: &Artifact) -> Result<(), CacheError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<CacheKey, Artifact>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactCache for MemoryCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Artifact>, CacheError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &CacheKey, artifact: &Artifact) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.clone(), artifact.clone());
        Ok(())
    }
}

/// On-disk cache under `<root>/<patient>/<timepoint>/`.
///
/// Label maps are stored as `<stage>-<fingerprint>.npy` with the geometry in a
/// `.geometry.json` sidecar; tissue records as `<stage>-<fingerprint>.json`.
pub struct DirCache {
    root: PathBuf,
}

impl DirCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry_stem(&self, key: &CacheKey) -> PathBuf {
        let short = &key.fingerprint[..key.fingerprint.len().min(16)];
        self.root
            .join(sanitize(&key.patient))
            .join(key.timepoint.as_str())
            .join(format!("{}-{short}", key.stage.as_str()))
    }
}

impl ArtifactCache for DirCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Artifact>, CacheError> {
        let stem = self.entry_stem(key);
        match key.stage {
            Stage::CoarseLabels | Stage::FineLabels => {
                let npy = stem.with_extension("npy");
                let sidecar = stem.with_extension("geometry.json");
                if !npy.exists() || !sidecar.exists() {
                    return Ok(None);
                }
                let data: Array3<u8> = read_npy(&npy).map_err(|e| CacheError::Corrupt {
                    path: npy.clone(),
                    reason: e.to_string(),
                })?;
                let geometry: Geometry = read_json(&sidecar)?;
                Ok(Some(Artifact::Labels(LabelMap::new(data, geometry))))
            }
            Stage::TissueVolumes => {
                let path = stem.with_extension("json");
                if !path.exists() {
                    return Ok(None);
                }
                Ok(Some(Artifact::Tissue(read_json(&path)?)))
            }
        }
    }

    fn put(&self, key: &CacheKey, artifact: &Artifact) -> Result<(), CacheError> {
        let stem = self.entry_stem(key);
        if let Some(parent) = stem.parent() {
            fs::create_dir_all(parent).map_err(|source| CacheError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        match artifact {
            Artifact::Labels(labels) => {
                let npy = stem.with_extension("npy");
                write_npy(&npy, labels.data()).map_err(|e| CacheError::Corrupt {
                    path: npy.clone(),
                    reason: e.to_string(),
                })?;
                write_json(&stem.with_extension("geometry.json"), labels.geometry())
            }
            Artifact::Tissue(record) => write_json(&stem.with_extension("json"), record),
        }
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, CacheError> {
    let bytes = fs::read(path).map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|e| CacheError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CacheError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| CacheError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    fs::write(path, bytes).map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Keep patient ids usable as a single path component.
pub(crate) fn sanitize(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() { "_".into() } else { cleaned }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_tracks_voxels_and_config() {
        let geometry = Geometry::canonical([1.0; 3]).unwrap();
        let a = IntensityVolume::new(Array3::zeros((2, 2, 2)), geometry.clone());
        let mut data = Array3::zeros((2, 2, 2));
        data[[1, 1, 1]] = 1.0;
        let b = IntensityVolume::new(data, geometry);

        assert_eq!(fingerprint(&a, "cfg"), fingerprint(&a, "cfg"));
        assert_ne!(fingerprint(&a, "cfg"), fingerprint(&b, "cfg"));
        assert_ne!(fingerprint(&a, "cfg"), fingerprint(&a, "other"));
        assert_eq!(fingerprint(&a, "cfg").len(), 64);
    }

    #[test]
    fn patient_ids_cannot_escape_the_cache_root() {
        assert_eq!(sanitize("../etc"), "___etc");
        assert_eq!(sanitize(""), "_");
    }
}
