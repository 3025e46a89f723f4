/// Patch origins covering a grid, with a fixed overlap fraction between
/// neighbouring patches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchGrid {
    starts: [Vec<usize>; 3],
    patch: [usize; 3],
}

impl PatchGrid {
    /// `shape` must be at least `patch` on every axis; pad first otherwise.
    pub fn new(shape: [usize; 3], patch: [usize; 3], overlap: f64) -> Self {
        let starts = [0, 1, 2].map(|axis| Self::axis_starts(shape[axis], patch[axis], overlap));
        Self { starts, patch }
    }

    /// Starts step by `floor(patch * (1 - overlap))`; the final patch is
    /// pulled back to end exactly at `len`.
    pub fn axis_starts(len: usize, patch: usize, overlap: f64) -> Vec<usize> {
        if len <= patch {
            return vec![0];
        }
        let step = ((patch as f64 * (1.0 - overlap)).floor() as usize).max(1);
        let last = len - patch;
        let mut starts: Vec<usize> = (0..=last).step_by(step).collect();
        if starts.last() != Some(&last) {
            starts.push(last);
        }
        starts
    }

    pub fn patch(&self) -> [usize; 3] {
        self.patch
    }

    pub fn len(&self) -> usize {
        self.starts.iter().map(Vec::len).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn origins(&self) -> Vec<[usize; 3]> {
        let mut origins = Vec::with_capacity(self.len());
        for &z in &self.starts[0] {
            for &y in &self.starts[1] {
                for &x in &self.starts[2] {
                    origins.push([z, y, x]);
                }
            }
        }
        origins
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_overlap_tiles_and_clamps_last_patch() {
        assert_eq!(PatchGrid::axis_starts(100, 32, 0.0), vec![0, 32, 64, 68]);
        assert_eq!(PatchGrid::axis_starts(96, 32, 0.0), vec![0, 32, 64]);
    }

    #[test]
    fn half_overlap_steps_by_half_patch() {
        assert_eq!(PatchGrid::axis_starts(64, 32, 0.5), vec![0, 16, 32]);
        assert_eq!(PatchGrid::axis_starts(70, 32, 0.5), vec![0, 16, 32, 38]);
    }

    #[test]
    fn every_voxel_is_covered() {
        let grid = PatchGrid::new([50, 40, 33], [16, 16, 16], 0.5);
        let mut covered = vec![false; 50 * 40 * 33];
        for [z, y, x] in grid.origins() {
            for dz in 0..16 {
                for dy in 0..16 {
                    for dx in 0..16 {
                        covered[((z + dz) * 40 + y + dy) * 33 + x + dx] = true;
                    }
                }
            }
        }
        assert!(covered.into_iter().all(|c| c));
    }
}
