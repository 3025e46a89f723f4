use ndarray::ArrayView3;

pub(crate) struct Interpolator;

impl Interpolator {
    /// Output voxel count along one axis that keeps the physical extent.
    pub(crate) fn resampled_len(len: usize, spacing: f64, target_spacing: f64) -> usize {
        ((len as f64 * spacing / target_spacing).round() as usize).max(1)
    }

    /// Continuous source indices for every output position along one axis,
    /// clamped to the source grid. `start` is the source index of output 0
    /// and `ratio` the output/source spacing ratio.
    pub(crate) fn axis_coordinates(len: usize, start: f64, ratio: f64, src_len: usize) -> Vec<f64> {
        let last = (src_len - 1) as f64;
        (0..len)
            .map(|dst| (start + dst as f64 * ratio).clamp(0.0, last))
            .collect()
    }

    #[inline]
    pub(crate) fn nearest<T: Copy>(volume: &ArrayView3<T>, z: f64, y: f64, x: f64) -> T {
        let (depth, height, width) = volume.dim();
        let zi = (z.round() as usize).min(depth - 1);
        let yi = (y.round() as usize).min(height - 1);
        let xi = (x.round() as usize).min(width - 1);
        volume[[zi, yi, xi]]
    }

    #[inline]
    pub(crate) fn trilinear_interpolate(volume: &ArrayView3<f32>, z: f64, y: f64, x: f64) -> f32 {
        let (depth, height, width) = volume.dim();

        let z0 = z.floor() as usize;
        let y0 = y.floor() as usize;
        let x0 = x.floor() as usize;
        let z1 = (z0 + 1).min(depth - 1);
        let y1 = (y0 + 1).min(height - 1);
        let x1 = (x0 + 1).min(width - 1);

        let dz = (z - z0 as f64) as f32;
        let dy = (y - y0 as f64) as f32;
        let dx = (x - x0 as f64) as f32;

        let lerp = |a: f32, b: f32, t: f32| a.mul_add(1.0 - t, b * t);

        let c00 = lerp(volume[[z0, y0, x0]], volume[[z0, y0, x1]], dx);
        let c01 = lerp(volume[[z0, y1, x0]], volume[[z0, y1, x1]], dx);
        let c10 = lerp(volume[[z1, y0, x0]], volume[[z1, y0, x1]], dx);
        let c11 = lerp(volume[[z1, y1, x0]], volume[[z1, y1, x1]], dx);

        let c0 = lerp(c00, c01, dy);
        let c1 = lerp(c10, c11, dy);

        lerp(c0, c1, dz)
    }
}
