//! Running per-pixel mean and variance ("pedestal" and "noise").

use ndarray::{Array2, ArrayView2, Zip};

use crate::{Error, Result};

/// Per-pixel running statistics over frames of a fixed `(rows, cols)` shape.
///
/// Uses Welford's online update, so no history is kept. With a sample cap
/// set, pixels that reached the cap switch to an exponentially weighted
/// update with window `max_samples`, which lets long acquisitions follow slow
/// pedestal drifts.
///
/// `Clone` produces a fully independent copy.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelStatistics {
    count: Array2<u32>,
    mean: Array2<f64>,
    m2: Array2<f64>,
    max_samples: Option<u32>,
    frames: u64,
}

fn update(count: &mut u32, mean: &mut f64, m2: &mut f64, value: f64, cap: Option<u32>) {
    match cap {
        Some(window) if *count >= window => {
            let n = f64::from(window);
            let delta = value - *mean;
            *mean += delta / n;
            let variance = (1.0 - 1.0 / n) * (*m2 / n + delta * delta / n);
            *m2 = variance * n;
        }
        _ => {
            *count += 1;
            let delta = value - *mean;
            *mean += delta / f64::from(*count);
            *m2 += delta * (value - *mean);
        }
    }
}

impl PixelStatistics {
    /// Creates empty statistics for a `rows x cols` grid.
    #[must_use]
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            count: Array2::zeros((rows, cols)),
            mean: Array2::zeros((rows, cols)),
            m2: Array2::zeros((rows, cols)),
            max_samples: None,
            frames: 0,
        }
    }

    /// Sets the per-pixel sample cap.
    ///
    /// # Errors
    /// Returns [`Error::ConfigError`] if `max_samples` is zero.
    pub fn try_with_max_samples(mut self, max_samples: u32) -> Result<Self> {
        if max_samples == 0 {
            return Err(Error::ConfigError(
                "max_samples must be at least 1".to_string(),
            ));
        }
        self.max_samples = Some(max_samples);
        Ok(self)
    }

    /// Per-pixel sample cap, if any.
    #[must_use]
    pub fn max_samples(&self) -> Option<u32> {
        self.max_samples
    }

    /// `(rows, cols)` of the grid.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        self.mean.dim()
    }

    /// Number of rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.mean.nrows()
    }

    /// Number of columns.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.mean.ncols()
    }

    /// Number of whole frames pushed since the last reset.
    #[must_use]
    pub fn samples(&self) -> u64 {
        self.frames
    }

    /// Number of samples that contribute to each pixel.
    #[must_use]
    pub fn pixel_samples(&self) -> ArrayView2<'_, u32> {
        self.count.view()
    }

    /// Adds one frame to the statistics.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] if the frame shape differs from the
    /// grid shape and [`Error::NonFinite`] for a NaN or infinite pixel; the
    /// statistics are left untouched.
    pub fn push<P: Copy + Into<f64>>(&mut self, frame: ArrayView2<'_, P>) -> Result<()> {
        if frame.dim() != self.shape() {
            return Err(Error::ShapeMismatch {
                expected: self.shape(),
                actual: frame.dim(),
            });
        }
        check_finite(&frame)?;
        let cap = self.max_samples;
        Zip::from(&mut self.count)
            .and(&mut self.mean)
            .and(&mut self.m2)
            .and(&frame)
            .for_each(|count, mean, m2, &value| update(count, mean, m2, value.into(), cap));
        self.frames += 1;
        Ok(())
    }

    /// Adds one sample to a single pixel.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfBounds`] if the pixel is outside the grid
    /// and [`Error::NonFinite`] for a NaN or infinite value.
    pub fn push_pixel(&mut self, row: usize, col: usize, value: f64) -> Result<()> {
        let index = self.check_index(row, col)?;
        if !value.is_finite() {
            return Err(Error::NonFinite { row, col });
        }
        update(
            &mut self.count[index],
            &mut self.mean[index],
            &mut self.m2[index],
            value,
            self.max_samples,
        );
        Ok(())
    }

    fn check_index(&self, row: usize, col: usize) -> Result<[usize; 2]> {
        let (rows, cols) = self.shape();
        if row >= rows || col >= cols {
            return Err(Error::IndexOutOfBounds {
                index: row * cols + col,
                len: rows * cols,
            });
        }
        Ok([row, col])
    }

    /// Current per-pixel mean (the pedestal).
    #[must_use]
    pub fn mean(&self) -> Array2<f64> {
        self.mean.clone()
    }

    /// Borrowed per-pixel mean.
    #[must_use]
    pub fn mean_view(&self) -> ArrayView2<'_, f64> {
        self.mean.view()
    }

    /// Current per-pixel population variance.
    #[must_use]
    pub fn variance(&self) -> Array2<f64> {
        Zip::from(&self.m2)
            .and(&self.count)
            .map_collect(|&m2, &count| if count == 0 { 0.0 } else { m2 / f64::from(count) })
    }

    /// Current per-pixel standard deviation (the noise).
    #[must_use]
    pub fn std(&self) -> Array2<f64> {
        self.variance().mapv_into(f64::sqrt)
    }

    /// Mean of one pixel.
    ///
    /// # Panics
    /// Panics if the pixel is outside the grid.
    #[must_use]
    pub fn mean_at(&self, row: usize, col: usize) -> f64 {
        self.mean[[row, col]]
    }

    /// Variance of one pixel.
    ///
    /// # Panics
    /// Panics if the pixel is outside the grid.
    #[must_use]
    pub fn variance_at(&self, row: usize, col: usize) -> f64 {
        let count = self.count[[row, col]];
        if count == 0 {
            0.0
        } else {
            self.m2[[row, col]] / f64::from(count)
        }
    }

    /// Standard deviation of one pixel.
    ///
    /// # Panics
    /// Panics if the pixel is outside the grid.
    #[must_use]
    pub fn std_at(&self, row: usize, col: usize) -> f64 {
        self.variance_at(row, col).sqrt()
    }

    /// Zeroes all statistics and the frame counter.
    pub fn reset(&mut self) {
        self.count.fill(0);
        self.mean.fill(0.0);
        self.m2.fill(0.0);
        self.frames = 0;
    }

    /// Zeroes the statistics of a single pixel.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfBounds`] if the pixel is outside the grid.
    pub fn reset_pixel(&mut self, row: usize, col: usize) -> Result<()> {
        let index = self.check_index(row, col)?;
        self.count[index] = 0;
        self.mean[index] = 0.0;
        self.m2[index] = 0.0;
        Ok(())
    }
}

/// Rejects frames holding a NaN or infinite pixel.
///
/// # Errors
/// Returns [`Error::NonFinite`] with the first such pixel in row-major order.
pub fn check_finite<P: Copy + Into<f64>>(frame: &ArrayView2<'_, P>) -> Result<()> {
    match frame
        .indexed_iter()
        .find(|&(_, &value)| !Into::<f64>::into(value).is_finite())
    {
        Some(((row, col), _)) => Err(Error::NonFinite { row, col }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_mean_and_std() {
        let mut stats = PixelStatistics::new(2, 2);
        stats.push(array![[1u16, 2], [3, 4]].view()).unwrap();
        stats.push(array![[3u16, 4], [5, 6]].view()).unwrap();

        assert_eq!(stats.samples(), 2);
        assert_eq!(stats.mean(), array![[2.0, 3.0], [4.0, 5.0]]);
        for &v in &stats.variance() {
            assert_relative_eq!(v, 1.0);
        }
        for &s in &stats.std() {
            assert_relative_eq!(s, 1.0);
        }
        assert_relative_eq!(stats.mean_at(1, 0), 4.0);
        assert_relative_eq!(stats.std_at(0, 1), 1.0);
    }

    #[test]
    fn test_non_finite_frames_are_rejected() {
        let mut stats = PixelStatistics::new(2, 2);
        stats.push(array![[1.0f32, 2.0], [3.0, 4.0]].view()).unwrap();
        let before = stats.clone();

        let err = stats
            .push(array![[1.0f32, 2.0], [f32::NAN, f32::INFINITY]].view())
            .unwrap_err();
        assert!(matches!(err, Error::NonFinite { row: 1, col: 0 }));
        assert!(matches!(
            stats.push_pixel(0, 1, f64::NEG_INFINITY),
            Err(Error::NonFinite { row: 0, col: 1 })
        ));
        assert_eq!(stats, before);
    }

    #[test]
    fn test_matches_two_pass_variance() {
        let values = [12.0f64, 15.5, 9.25, 11.0, 14.0, 13.5, 10.0];
        let mut stats = PixelStatistics::new(1, 1);
        for v in values {
            stats.push(array![[v]].view()).unwrap();
        }
        #[allow(clippy::cast_precision_loss)]
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        assert_relative_eq!(stats.mean_at(0, 0), mean, epsilon = 1e-12);
        assert_relative_eq!(stats.variance_at(0, 0), var, epsilon = 1e-12);
    }

    #[test]
    fn test_shape_mismatch_leaves_statistics_untouched() {
        let mut stats = PixelStatistics::new(2, 3);
        let err = stats.push(Array2::<u16>::ones((3, 2)).view()).unwrap_err();
        assert!(matches!(
            err,
            Error::ShapeMismatch {
                expected: (2, 3),
                actual: (3, 2)
            }
        ));
        assert_eq!(stats.samples(), 0);
        assert_eq!(stats.mean(), Array2::<f64>::zeros((2, 3)));
    }

    #[test]
    fn test_reset_and_reset_pixel() {
        let mut stats = PixelStatistics::new(2, 2);
        stats.push(Array2::<u16>::from_elem((2, 2), 10).view()).unwrap();
        stats.reset_pixel(0, 1).unwrap();
        assert_relative_eq!(stats.mean_at(0, 1), 0.0);
        assert_relative_eq!(stats.mean_at(1, 1), 10.0);
        assert_eq!(stats.pixel_samples()[[0, 1]], 0);
        assert!(stats.reset_pixel(2, 0).is_err());

        stats.reset();
        assert_eq!(stats.samples(), 0);
        assert_eq!(stats.mean(), Array2::<f64>::zeros((2, 2)));
        assert_eq!(stats.variance(), Array2::<f64>::zeros((2, 2)));
    }

    #[test]
    fn test_clone_is_independent() {
        let mut stats = PixelStatistics::new(1, 2);
        stats.push(array![[4u16, 8]].view()).unwrap();
        let copy = stats.clone();
        stats.push(array![[6u16, 10]].view()).unwrap();

        assert_relative_eq!(copy.mean_at(0, 0), 4.0);
        assert_relative_eq!(stats.mean_at(0, 0), 5.0);
        assert_eq!(copy.samples(), 1);
    }

    #[test]
    fn test_push_pixel() {
        let mut stats = PixelStatistics::new(2, 2);
        stats.push_pixel(1, 1, 3.0).unwrap();
        stats.push_pixel(1, 1, 5.0).unwrap();
        assert_relative_eq!(stats.mean_at(1, 1), 4.0);
        assert_relative_eq!(stats.variance_at(1, 1), 1.0);
        assert_eq!(stats.samples(), 0);
        assert!(matches!(
            stats.push_pixel(0, 2, 1.0),
            Err(Error::IndexOutOfBounds { index: 2, len: 4 })
        ));
    }

    #[test]
    fn test_sample_cap_tracks_drift() {
        let mut stats = PixelStatistics::new(1, 1).try_with_max_samples(4).unwrap();
        for _ in 0..4 {
            stats.push(array![[100.0f64]].view()).unwrap();
        }
        assert_eq!(stats.pixel_samples()[[0, 0]], 4);
        for _ in 0..200 {
            stats.push(array![[120.0f64]].view()).unwrap();
        }
        assert_eq!(stats.pixel_samples()[[0, 0]], 4);
        assert_relative_eq!(stats.mean_at(0, 0), 120.0, epsilon = 1e-6);
        assert!(stats.variance_at(0, 0) < 1e-6);

        assert!(PixelStatistics::new(1, 1).try_with_max_samples(0).is_err());
    }
}
