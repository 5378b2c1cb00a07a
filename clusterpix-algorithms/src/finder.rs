//! Single-threaded cluster finder.
//!
//! The finder keeps running pedestal statistics for every pixel and, for each
//! frame, extracts a `W x H` window around every pixel that stands out from
//! the noise and is the maximum of its 3x3 neighborhood.

use clusterpix_core::{
    check_finite, Cluster, ClusterArrays, ClusterBatch, ClusterValue, PixelStatistics,
    DEFAULT_CAPACITY,
};
use ndarray::{Array2, ArrayView2};

use crate::error::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Largest frame dimension whose coordinates fit the `i16` cluster position.
const MAX_FRAME_DIM: usize = 1 << 15;

/// Cluster finder configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FinderConfig {
    /// Seed threshold in units of the pixel noise.
    pub n_sigma: f64,
    /// Initial capacity of the output batch, restored after every steal.
    pub capacity: usize,
    /// Update the pedestal with quiet pixels while clustering.
    pub track_pedestal: bool,
    /// Per-pixel sample cap of the pedestal statistics.
    pub max_pedestal_samples: Option<u32>,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            n_sigma: 5.0,
            capacity: DEFAULT_CAPACITY,
            track_pedestal: false,
            max_pedestal_samples: None,
        }
    }
}

impl FinderConfig {
    /// Creates a new finder configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the seed threshold in units of sigma.
    #[must_use]
    pub fn with_n_sigma(mut self, n_sigma: f64) -> Self {
        self.n_sigma = n_sigma;
        self
    }

    /// Sets the seed threshold, rejecting negative or non-finite values.
    ///
    /// # Errors
    /// Returns [`Error::ConfigError`] for a negative or non-finite threshold.
    pub fn try_with_n_sigma(self, n_sigma: f64) -> Result<Self> {
        if !n_sigma.is_finite() || n_sigma < 0.0 {
            return Err(Error::ConfigError(format!(
                "n_sigma must be finite and non-negative, got {n_sigma}"
            )));
        }
        Ok(self.with_n_sigma(n_sigma))
    }

    /// Sets the initial output capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Enables or disables pedestal tracking during clustering.
    #[must_use]
    pub fn with_pedestal_tracking(mut self, enabled: bool) -> Self {
        self.track_pedestal = enabled;
        self
    }

    /// Sets the per-pixel pedestal sample cap.
    #[must_use]
    pub fn with_max_pedestal_samples(mut self, max_samples: u32) -> Self {
        self.max_pedestal_samples = Some(max_samples);
        self
    }
}

/// Finds `W x H` clusters of type `T` in frames of a fixed shape.
#[derive(Debug, Clone)]
pub struct ClusterFinder<T, const W: usize, const H: usize> {
    config: FinderConfig,
    statistics: PixelStatistics,
    clusters: ClusterBatch<T, W, H>,
}

impl<T: ClusterValue, const W: usize, const H: usize> ClusterFinder<T, W, H> {
    /// Creates a finder for `rows x cols` frames.
    ///
    /// # Errors
    /// Returns an error if the frame is too large for `i16` cluster
    /// coordinates or the pedestal sample cap is zero.
    pub fn new(rows: usize, cols: usize, config: FinderConfig) -> Result<Self> {
        const { assert!(W >= 1 && H >= 1, "cluster must be at least 1x1") };
        if rows > MAX_FRAME_DIM || cols > MAX_FRAME_DIM {
            return Err(Error::ConfigError(format!(
                "frame {rows}x{cols} exceeds the {MAX_FRAME_DIM} pixel coordinate range"
            )));
        }
        let mut statistics = PixelStatistics::new(rows, cols);
        if let Some(max_samples) = config.max_pedestal_samples {
            statistics = statistics.try_with_max_samples(max_samples)?;
        }
        Ok(Self {
            clusters: ClusterBatch::with_capacity(config.capacity),
            config,
            statistics,
        })
    }

    /// Finder configuration.
    #[must_use]
    pub fn config(&self) -> &FinderConfig {
        &self.config
    }

    /// `(rows, cols)` of the frames this finder accepts.
    #[must_use]
    pub fn frame_shape(&self) -> (usize, usize) {
        self.statistics.shape()
    }

    /// Adds a frame to the pedestal statistics.
    ///
    /// # Errors
    /// Returns an error for a frame of the wrong shape or with a NaN or
    /// infinite pixel.
    pub fn push_pedestal_frame<P: Copy + Into<f64>>(
        &mut self,
        frame: ArrayView2<'_, P>,
    ) -> Result<()> {
        self.statistics.push(frame)?;
        Ok(())
    }

    /// Current pedestal (per-pixel mean).
    #[must_use]
    pub fn pedestal(&self) -> Array2<f64> {
        self.statistics.mean()
    }

    /// Current noise (per-pixel standard deviation).
    #[must_use]
    pub fn noise(&self) -> Array2<f64> {
        self.statistics.std()
    }

    /// The pedestal statistics.
    #[must_use]
    pub fn statistics(&self) -> &PixelStatistics {
        &self.statistics
    }

    /// Discards the pedestal statistics.
    pub fn clear_pedestal(&mut self) {
        self.statistics.reset();
    }

    /// Clusters found since the last steal.
    #[must_use]
    pub fn clusters(&self) -> &ClusterBatch<T, W, H> {
        &self.clusters
    }

    /// Finds clusters whose seed exceeds `n_sigma` times the pixel noise.
    ///
    /// Clusters are appended to the internal batch, which is tagged with
    /// `frame_number`.
    ///
    /// # Errors
    /// Returns a shape mismatch error if the frame has the wrong shape and a
    /// non-finite error for a NaN or infinite pixel.
    pub fn find_clusters<P: Copy + Into<f64>>(
        &mut self,
        frame: ArrayView2<'_, P>,
        frame_number: i32,
    ) -> Result<()> {
        self.scan(frame, frame_number, true)
    }

    /// Finds a cluster at every strict local maximum, ignoring the noise.
    ///
    /// # Errors
    /// Same as [`find_clusters`](Self::find_clusters).
    pub fn find_clusters_without_threshold<P: Copy + Into<f64>>(
        &mut self,
        frame: ArrayView2<'_, P>,
        frame_number: i32,
    ) -> Result<()> {
        self.scan(frame, frame_number, false)
    }

    /// Detaches the found clusters, leaving an empty batch of the configured
    /// capacity behind.
    pub fn steal_clusters(&mut self) -> ClusterBatch<T, W, H> {
        let fresh = ClusterBatch::with_capacity(self.config.capacity)
            .with_frame_number(self.clusters.frame_number());
        std::mem::replace(&mut self.clusters, fresh)
    }

    /// Detaches the found clusters as structured arrays.
    ///
    /// # Errors
    /// Returns an error if the batch cannot be laid out as arrays.
    pub fn steal_clusters_as_arrays(&mut self) -> Result<ClusterArrays<T>> {
        Ok(self.steal_clusters().into_arrays()?)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn scan<P: Copy + Into<f64>>(
        &mut self,
        frame: ArrayView2<'_, P>,
        frame_number: i32,
        thresholded: bool,
    ) -> Result<()> {
        let shape = self.statistics.shape();
        if frame.dim() != shape {
            return Err(clusterpix_core::Error::ShapeMismatch {
                expected: shape,
                actual: frame.dim(),
            }
            .into());
        }
        check_finite(&frame)?;
        self.clusters.set_frame_number(frame_number);

        let (rows, cols) = shape;
        let signal = {
            let mean = self.statistics.mean_view();
            ndarray::Zip::from(&frame)
                .and(&mean)
                .map_collect(|&raw, &pedestal| Into::<f64>::into(raw) - pedestal)
        };
        let threshold = self.statistics.std().mapv_into(|rms| rms * self.config.n_sigma);

        if rows >= H && cols >= W {
            for row in H / 2..rows - (H - 1 - H / 2) {
                for col in W / 2..cols - (W - 1 - W / 2) {
                    let value = signal[[row, col]];
                    if thresholded && value <= threshold[[row, col]] {
                        continue;
                    }
                    if !is_local_max(&signal, row, col) {
                        continue;
                    }
                    let mut cluster = Cluster::<T, W, H>::zeros(col as i16, row as i16);
                    let window = signal.slice(ndarray::s![
                        row - H / 2..row - H / 2 + H,
                        col - W / 2..col - W / 2 + W
                    ]);
                    for (dst, &src) in cluster.data.as_flattened_mut().iter_mut().zip(window) {
                        *dst = T::from_f64(src);
                    }
                    self.clusters.push(&cluster);
                }
            }
        }

        if thresholded && self.config.track_pedestal {
            self.track_pedestal(&frame, &signal, &threshold);
        }
        Ok(())
    }

    /// Feeds pixels whose whole window stays within the noise band back into
    /// the pedestal.
    fn track_pedestal<P: Copy + Into<f64>>(
        &mut self,
        frame: &ArrayView2<'_, P>,
        signal: &Array2<f64>,
        threshold: &Array2<f64>,
    ) {
        let (rows, cols) = signal.dim();
        for row in 0..rows {
            for col in 0..cols {
                let limit = threshold[[row, col]];
                let value = signal[[row, col]];
                if value < -limit {
                    continue;
                }
                let quiet = neighborhood(row, col, rows, cols, H / 2, W / 2)
                    .all(|(r, c)| signal[[r, c]] <= limit);
                if quiet {
                    if let Err(e) = self
                        .statistics
                        .push_pixel(row, col, frame[[row, col]].into())
                    {
                        log::warn!("pedestal tracking skipped pixel ({row}, {col}): {e}");
                    }
                }
            }
        }
    }
}

/// Frame positions within `dy` rows and `dx` columns of `(row, col)`, clipped
/// to the frame, in row-major order.
fn neighborhood(
    row: usize,
    col: usize,
    rows: usize,
    cols: usize,
    dy: usize,
    dx: usize,
) -> impl Iterator<Item = (usize, usize)> {
    let rows_range = row.saturating_sub(dy)..(row + dy + 1).min(rows);
    let cols_range = col.saturating_sub(dx)..(col + dx + 1).min(cols);
    rows_range.flat_map(move |r| cols_range.clone().map(move |c| (r, c)))
}

/// Strict local maximum test on the 3x3 neighborhood.
///
/// Neighbors before `(row, col)` in row-major order must be strictly smaller,
/// neighbors after it may be equal, so a plateau seeds at its first pixel.
fn is_local_max(signal: &Array2<f64>, row: usize, col: usize) -> bool {
    let (rows, cols) = signal.dim();
    let value = signal[[row, col]];
    neighborhood(row, col, rows, cols, 1, 1).all(|(r, c)| {
        let neighbor = signal[[r, c]];
        if (r, c) < (row, col) {
            neighbor < value
        } else if (r, c) > (row, col) {
            neighbor <= value
        } else {
            true
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Pedestal of 10 with noise 1 on every pixel.
    fn calibrated_finder(rows: usize, cols: usize) -> ClusterFinder<i32, 3, 3> {
        let mut finder = ClusterFinder::new(rows, cols, FinderConfig::default()).unwrap();
        for value in [9u16, 11] {
            let frame = Array2::from_elem((rows, cols), value);
            finder.push_pedestal_frame(frame.view()).unwrap();
        }
        finder
    }

    #[test]
    fn test_zero_frame_has_no_clusters() {
        let mut finder =
            ClusterFinder::<i32, 3, 3>::new(100, 100, FinderConfig::new().with_n_sigma(5.0))
                .unwrap();
        let frame = Array2::<u16>::zeros((100, 100));
        finder.find_clusters(frame.view(), 0).unwrap();
        assert!(finder.steal_clusters().is_empty());

        finder.find_clusters_without_threshold(frame.view(), 1).unwrap();
        assert!(finder.steal_clusters().is_empty());
    }

    #[test]
    fn test_single_photon() {
        let mut finder = calibrated_finder(10, 12);
        assert_relative_eq!(finder.pedestal()[[3, 3]], 10.0);
        assert_relative_eq!(finder.noise()[[3, 3]], 1.0);

        let mut frame = Array2::<u16>::from_elem((10, 12), 10);
        frame[[5, 5]] = 110;
        frame[[5, 6]] = 40;
        finder.find_clusters(frame.view(), 42).unwrap();

        let clusters = finder.steal_clusters();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters.frame_number(), 42);
        let cluster = clusters.get(0).unwrap();
        assert_eq!((cluster.x, cluster.y), (5, 5));
        assert_eq!(cluster.data, [[0, 0, 0], [0, 100, 30], [0, 0, 0]]);
    }

    #[test]
    fn test_plateau_seeds_once() {
        let mut finder = calibrated_finder(8, 8);
        let mut frame = Array2::<u16>::from_elem((8, 8), 10);
        frame[[3, 3]] = 60;
        frame[[3, 4]] = 60;
        frame[[4, 3]] = 60;
        finder.find_clusters(frame.view(), 0).unwrap();

        let clusters = finder.steal_clusters();
        assert_eq!(clusters.len(), 1);
        assert_eq!((clusters.x()[0], clusters.y()[0]), (3, 3));
    }

    #[test]
    fn test_border_pixels_are_not_seeds() {
        let mut finder = calibrated_finder(6, 6);
        let mut frame = Array2::<u16>::from_elem((6, 6), 10);
        frame[[0, 0]] = 200;
        frame[[5, 3]] = 200;
        frame[[2, 5]] = 200;
        frame[[2, 2]] = 200;
        finder.find_clusters(frame.view(), 0).unwrap();

        let clusters = finder.steal_clusters();
        assert_eq!(clusters.len(), 1);
        assert_eq!((clusters.x()[0], clusters.y()[0]), (2, 2));
    }

    #[test]
    fn test_below_threshold_is_ignored() {
        let mut finder = calibrated_finder(6, 6);
        let mut frame = Array2::<u16>::from_elem((6, 6), 10);
        frame[[2, 2]] = 14;
        finder.find_clusters(frame.view(), 0).unwrap();
        assert!(finder.clusters().is_empty());

        finder.find_clusters_without_threshold(frame.view(), 0).unwrap();
        assert_eq!(finder.clusters().len(), 1);
    }

    #[test]
    fn test_neighbouring_photons_share_pixels() {
        let mut finder = calibrated_finder(8, 8);
        let mut frame = Array2::<u16>::from_elem((8, 8), 10);
        frame[[3, 2]] = 90;
        frame[[3, 4]] = 70;
        finder.find_clusters(frame.view(), 0).unwrap();

        let clusters = finder.steal_clusters();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters.get(0).unwrap().data[1], [0, 80, 0]);
        assert_eq!(clusters.get(1).unwrap().data[1], [0, 60, 0]);
    }

    #[test]
    fn test_even_geometry() {
        let mut finder = ClusterFinder::<f64, 2, 2>::new(6, 6, FinderConfig::default()).unwrap();
        for value in [9u16, 11] {
            finder
                .push_pedestal_frame(Array2::from_elem((6, 6), value).view())
                .unwrap();
        }
        let mut frame = Array2::<u16>::from_elem((6, 6), 10);
        frame[[2, 3]] = 50;
        frame[[1, 2]] = 20;
        finder.find_clusters(frame.view(), 0).unwrap();

        let clusters = finder.steal_clusters();
        assert_eq!(clusters.len(), 1);
        let cluster = clusters.get(0).unwrap();
        assert_eq!((cluster.x, cluster.y), (3, 2));
        assert_eq!(cluster.data, [[10.0, 0.0], [0.0, 40.0]]);
    }

    #[test]
    fn test_shape_mismatch() {
        let mut finder = calibrated_finder(6, 6);
        let frame = Array2::<u16>::zeros((6, 7));
        assert!(matches!(
            finder.find_clusters(frame.view(), 0),
            Err(Error::CoreError(clusterpix_core::Error::ShapeMismatch { .. }))
        ));
        assert!(finder.push_pedestal_frame(frame.view()).is_err());
    }

    #[test]
    fn test_non_finite_frame() {
        let mut finder = calibrated_finder(6, 6);
        let mut frame = Array2::<f32>::from_elem((6, 6), 10.0);
        frame[[2, 3]] = f32::NAN;
        assert!(matches!(
            finder.find_clusters(frame.view(), 0),
            Err(Error::CoreError(clusterpix_core::Error::NonFinite { row: 2, col: 3 }))
        ));
        assert!(finder.clusters().is_empty());
        assert!(finder.push_pedestal_frame(frame.view()).is_err());
        assert_eq!(finder.statistics().samples(), 2);
    }

    #[test]
    fn test_steal_restores_capacity() {
        let config = FinderConfig::new().with_capacity(4);
        let mut finder = ClusterFinder::<i32, 3, 3>::new(20, 20, config).unwrap();
        let mut frame = Array2::<f64>::zeros((20, 20));
        for i in 0..6 {
            frame[[2 + 3 * i, 2 + 3 * i]] = 100.0;
        }
        finder.find_clusters(frame.view(), 3).unwrap();
        assert_eq!(finder.clusters().len(), 6);
        assert!(finder.clusters().capacity() >= 6);

        let stolen = finder.steal_clusters();
        assert_eq!(stolen.len(), 6);
        assert!(finder.clusters().is_empty());
        assert_eq!(finder.clusters().capacity(), 4);

        finder.find_clusters(frame.view(), 4).unwrap();
        let arrays = finder.steal_clusters_as_arrays().unwrap();
        assert_eq!(arrays.data.dim(), (6, 3, 3));
        assert_eq!(arrays.frame_number, 4);
        assert_eq!(arrays.data[[0, 1, 1]], 100);
    }

    #[test]
    fn test_pedestal_tracking() {
        let config = FinderConfig::new().with_pedestal_tracking(true);
        let mut finder = ClusterFinder::<i32, 3, 3>::new(8, 8, config).unwrap();
        for value in [9u16, 11] {
            finder
                .push_pedestal_frame(Array2::from_elem((8, 8), value).view())
                .unwrap();
        }
        let mut frame = Array2::<u16>::from_elem((8, 8), 10);
        frame[[4, 4]] = 100;
        finder.find_clusters(frame.view(), 0).unwrap();

        let samples = finder.statistics().pixel_samples();
        assert_eq!(samples[[0, 0]], 3);
        assert_eq!(samples[[7, 7]], 3);
        // the photon and its neighbors are excluded
        assert_eq!(samples[[4, 4]], 2);
        assert_eq!(samples[[3, 5]], 2);
        assert_eq!(samples[[5, 3]], 2);
        assert_eq!(samples[[2, 4]], 3);
    }

    #[test]
    fn test_config_validation() {
        assert!(FinderConfig::new().try_with_n_sigma(-1.0).is_err());
        assert!(FinderConfig::new().try_with_n_sigma(f64::NAN).is_err());
        let config = FinderConfig::new().try_with_n_sigma(3.0).unwrap();
        assert_relative_eq!(config.n_sigma, 3.0);

        let config = FinderConfig::new().with_max_pedestal_samples(0);
        assert!(ClusterFinder::<i32, 3, 3>::new(4, 4, config).is_err());
        assert!(ClusterFinder::<i32, 3, 3>::new(40_000, 4, FinderConfig::new()).is_err());
    }
}
