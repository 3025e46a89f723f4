use super::{MODEL_CONTRACT_VERSION, ModelContract, ModelError, SegmentationModel};
use crate::enums::PassKind;

use ndarray::{Array5, ArrayView4};
use ndarray_npy::{read_npy, write_npy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::debug;

/// A segmentation model running as an external program.
///
/// Each batch is written to `input.npy` in a scratch directory and the
/// program is invoked as
/// `<program> <args..> --pass <coarse|fine> --input <input.npy> --output <output.npy>`.
/// It must write `[B, D, H, W, C]` float32 probabilities to the output path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandModel {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub coarse_patch: [usize; 3],
    pub coarse_classes: usize,
    pub fine_patch: [usize; 3],
    pub fine_classes: usize,
}

impl CommandModel {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            coarse_patch: [64, 128, 128],
            coarse_classes: 2,
            fine_patch: [64, 128, 128],
            fine_classes: 6,
        }
    }
}

impl SegmentationModel for CommandModel {
    fn contract(&self, pass: PassKind) -> ModelContract {
        let (patch_shape, num_classes) = match pass {
            PassKind::Coarse => (self.coarse_patch, self.coarse_classes),
            PassKind::Fine => (self.fine_patch, self.fine_classes),
        };
        ModelContract {
            version: MODEL_CONTRACT_VERSION,
            patch_shape,
            num_classes,
        }
    }

    fn infer(&self, batch: ArrayView4<'_, f32>, pass: PassKind) -> Result<Array5<f32>, ModelError> {
        let scratch = tempfile::tempdir().map_err(|e| ModelError::Unavailable(e.to_string()))?;
        let input = scratch.path().join("input.npy");
        let output = scratch.path().join("output.npy");

        write_npy(&input, &batch).map_err(|e| ModelError::Unavailable(e.to_string()))?;

        debug!(program = %self.program.display(), pass = %pass, "invoking model");
        // stdout stays off ours: the batch report may be going there
        let result = Command::new(&self.program)
            .args(&self.args)
            .arg("--pass")
            .arg(pass.as_str())
            .arg("--input")
            .arg(&input)
            .arg("--output")
            .arg(&output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| ModelError::Unavailable(format!("failed to start {}: {e}", self.program.display())))?;

        for line in String::from_utf8_lossy(&result.stdout).lines() {
            debug!(program = %self.program.display(), "{line}");
        }

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let stderr = stderr.trim();
            return Err(ModelError::Invalid(if stderr.is_empty() {
                format!("{} exited with {}", self.program.display(), result.status)
            } else {
                format!("{} exited with {}: {stderr}", self.program.display(), result.status)
            }));
        }

        read_npy::<_, Array5<f32>>(&output)
            .map_err(|e| ModelError::Invalid(format!("unreadable output {}: {e}", output.display())))
    }
}
