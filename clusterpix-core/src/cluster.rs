//! Fixed-geometry clusters and their numeric payload types.
//!
//! A [`Cluster`] is a `W x H` window of pixel values cut out of a frame
//! around a local maximum. Geometry and element type are compile-time
//! parameters, so two clusters can only be combined when they are of the
//! same kind.
//!
//! # Coordinate convention
//!
//! `(x, y)` is the frame position (column, row) of the window element at
//! window column `W / 2` and window row `H / 2`. For odd sizes this is the
//! center pixel; for a 2x2 window it is the bottom-right pixel. Window
//! element `(r, c)` sits at frame pixel `(y - H/2 + r, x - W/2 + c)`, with
//! rows growing downwards.

use std::fmt::{Debug, Display};
use std::ops::Add;

use crate::{Error, Result};

/// Numeric types that can be stored in a cluster payload.
pub trait ClusterValue:
    Copy + Default + PartialOrd + Debug + Display + Send + Sync + Add<Output = Self> + 'static
{
    /// Short dtype name used in file metadata and CLI flags.
    const DTYPE: &'static str;

    /// Little-endian byte representation.
    type Bytes: AsRef<[u8]> + AsMut<[u8]> + Default;

    /// Widens the value to `f64`.
    fn to_f64(self) -> f64;

    /// Narrows an `f64` into this type, truncating toward zero for integers.
    fn from_f64(value: f64) -> Self;

    /// Encodes the value as little-endian bytes.
    fn to_le(self) -> Self::Bytes;

    /// Decodes a value from little-endian bytes.
    fn from_le(bytes: Self::Bytes) -> Self;

    /// Addition used for cluster sums. Integers saturate at their bounds
    /// instead of overflowing.
    fn accumulate(self, rhs: Self) -> Self;
}

impl ClusterValue for i32 {
    const DTYPE: &'static str = "i32";
    type Bytes = [u8; 4];

    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn from_f64(value: f64) -> Self {
        value as i32
    }

    fn to_le(self) -> Self::Bytes {
        self.to_le_bytes()
    }

    fn from_le(bytes: Self::Bytes) -> Self {
        Self::from_le_bytes(bytes)
    }

    fn accumulate(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }
}

impl ClusterValue for f32 {
    const DTYPE: &'static str = "f32";
    type Bytes = [u8; 4];

    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn to_le(self) -> Self::Bytes {
        self.to_le_bytes()
    }

    fn from_le(bytes: Self::Bytes) -> Self {
        Self::from_le_bytes(bytes)
    }

    fn accumulate(self, rhs: Self) -> Self {
        self + rhs
    }
}

impl ClusterValue for f64 {
    const DTYPE: &'static str = "f64";
    type Bytes = [u8; 8];

    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(value: f64) -> Self {
        value
    }

    fn to_le(self) -> Self::Bytes {
        self.to_le_bytes()
    }

    fn from_le(bytes: Self::Bytes) -> Self {
        Self::from_le_bytes(bytes)
    }

    fn accumulate(self, rhs: Self) -> Self {
        self + rhs
    }
}

/// Maximum 2x2 sub-window sum of a cluster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sum2x2<T> {
    /// Sum of the four pixels of the winning sub-window.
    pub sum: T,
    /// Row-major index of the sub-window in the `(H-1) x (W-1)` grid.
    pub index: usize,
}

/// A `W x H` window of pixel values at frame position `(x, y)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cluster<T, const W: usize, const H: usize> {
    /// Frame column of the reference pixel.
    pub x: i16,
    /// Frame row of the reference pixel.
    pub y: i16,
    /// Pixel values, `data[row][col]`.
    pub data: [[T; W]; H],
}

/// 2x2 cluster.
pub type Cluster2x2<T> = Cluster<T, 2, 2>;
/// 3x3 cluster.
pub type Cluster3x3<T> = Cluster<T, 3, 3>;
/// 5x5 cluster.
pub type Cluster5x5<T> = Cluster<T, 5, 5>;

impl<T: ClusterValue, const W: usize, const H: usize> Cluster<T, W, H> {
    /// Window width in pixels.
    pub const WIDTH: usize = W;
    /// Window height in pixels.
    pub const HEIGHT: usize = H;
    /// Number of payload values.
    pub const SIZE: usize = W * H;

    /// Creates a cluster from a position and a payload.
    #[must_use]
    pub fn new(x: i16, y: i16, data: [[T; W]; H]) -> Self {
        Self { x, y, data }
    }

    /// Creates a zero-filled cluster at `(x, y)`.
    #[must_use]
    pub fn zeros(x: i16, y: i16) -> Self {
        Self {
            x,
            y,
            data: [[T::default(); W]; H],
        }
    }

    /// Creates a cluster from a row-major slice of exactly `W * H` values.
    ///
    /// # Errors
    /// Returns [`Error::InvalidPayloadLength`] if the slice has the wrong length.
    pub fn from_slice(x: i16, y: i16, values: &[T]) -> Result<Self> {
        if values.len() != W * H {
            return Err(Error::InvalidPayloadLength {
                expected: W * H,
                actual: values.len(),
            });
        }
        let mut cluster = Self::zeros(x, y);
        cluster.data.as_flattened_mut().copy_from_slice(values);
        Ok(cluster)
    }

    /// Returns the payload as a flat row-major slice.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        self.data.as_flattened()
    }

    /// Returns the value at window position `(row, col)`.
    ///
    /// # Panics
    /// Panics if the position is outside the window.
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> T {
        self.data[row][col]
    }

    /// Sum of all payload values, saturating for integer payloads.
    #[must_use]
    pub fn sum(&self) -> T {
        self.as_slice()
            .iter()
            .fold(T::default(), |acc, &value| acc.accumulate(value))
    }

    /// Sum of the `width x height` sub-window starting at `(row0, col0)`.
    pub(crate) fn window_sum(&self, row0: usize, col0: usize, width: usize, height: usize) -> T {
        self.data[row0..row0 + height]
            .iter()
            .flat_map(|row| &row[col0..col0 + width])
            .fold(T::default(), |acc, &value| acc.accumulate(value))
    }

    /// Finds the `SW x SH` sub-window with the largest sum.
    ///
    /// Returns the sum and the row-major index of the sub-window origin in the
    /// `(H - SH + 1) x (W - SW + 1)` grid. Ties go to the lowest index.
    fn max_window<const SW: usize, const SH: usize>(&self) -> (T, usize) {
        const { assert!(SW >= 1 && SH >= 1 && SW <= W && SH <= H) };
        let grid_cols = W - SW + 1;
        let mut best = (self.window_sum(0, 0, SW, SH), 0);
        for row0 in 0..=H - SH {
            for col0 in 0..=W - SW {
                let sum = self.window_sum(row0, col0, SW, SH);
                if sum > best.0 {
                    best = (sum, row0 * grid_cols + col0);
                }
            }
        }
        best
    }

    /// Largest sum over all `(W-1) x (H-1)` overlapping 2x2 sub-windows.
    ///
    /// For clusters up to 3x3 every 2x2 sub-window touches the reference
    /// pixel. Larger clusters also search windows away from it, so the winner
    /// can differ from the quadrant the eta functions pick, which is always
    /// one of the four 2x2 windows around the reference pixel.
    /// [`reduce_to_2x2`](Self::reduce_to_2x2) follows this search.
    #[must_use]
    pub fn sum_2x2(&self) -> Sum2x2<T> {
        const { assert!(W >= 2 && H >= 2, "sum_2x2 needs at least a 2x2 cluster") };
        let (sum, index) = self.max_window::<2, 2>();
        Sum2x2 { sum, index }
    }

    /// Extracts the `SW x SH` sub-window whose top-left element is at
    /// window position `(row0, col0)`.
    ///
    /// The new cluster keeps the coordinate convention: its `(x, y)` is the
    /// frame position of the sub-window element at `(SH / 2, SW / 2)`.
    ///
    /// # Panics
    /// Panics if the sub-window does not fit inside this cluster.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn window<const SW: usize, const SH: usize>(
        &self,
        row0: usize,
        col0: usize,
    ) -> Cluster<T, SW, SH> {
        assert!(
            row0 + SH <= H && col0 + SW <= W,
            "sub-window ({row0}, {col0}) of size {SW}x{SH} exceeds {W}x{H} cluster"
        );
        let mut out = Cluster::<T, SW, SH>::zeros(
            self.x - (W / 2) as i16 + (col0 + SW / 2) as i16,
            self.y - (H / 2) as i16 + (row0 + SH / 2) as i16,
        );
        for (dst, src) in out.data.iter_mut().zip(&self.data[row0..row0 + SH]) {
            dst.copy_from_slice(&src[col0..col0 + SW]);
        }
        out
    }

    /// Re-centers the cluster on its highest-energy 2x2 sub-window.
    #[must_use]
    pub fn reduce_to_2x2(&self) -> Cluster<T, 2, 2> {
        let best = self.sum_2x2();
        self.window::<2, 2>(best.index / (W - 1), best.index % (W - 1))
    }

    /// Re-centers the cluster on its highest-energy 3x3 sub-window.
    #[must_use]
    pub fn reduce_to_3x3(&self) -> Cluster<T, 3, 3> {
        const { assert!(W >= 3 && H >= 3, "reduce_to_3x3 needs at least a 3x3 cluster") };
        let (_, index) = self.max_window::<3, 3>();
        self.window::<3, 3>(index / (W - 2), index % (W - 2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_slice_checks_length() {
        let cluster = Cluster3x3::<i32>::from_slice(4, 5, &[1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
        assert_eq!(cluster.data, [[1, 2, 3], [4, 5, 6], [7, 8, 9]]);
        assert_eq!(cluster.get(1, 2), 6);
        assert_eq!(cluster.sum(), 45);

        let err = Cluster3x3::<i32>::from_slice(0, 0, &[1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidPayloadLength {
                expected: 9,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_sum_2x2() {
        let cluster = Cluster3x3::<i32>::from_slice(0, 0, &[0, 1, 0, 2, 3, 0, 2, 1, 0]).unwrap();
        let best = cluster.sum_2x2();
        assert_eq!(best.sum, 8);
        assert_eq!(best.index, 2);
    }

    #[test]
    fn test_sum_2x2_tie_goes_to_lowest_index() {
        let cluster = Cluster3x3::<i32>::from_slice(0, 0, &[1; 9]).unwrap();
        let best = cluster.sum_2x2();
        assert_eq!(best.sum, 4);
        assert_eq!(best.index, 0);
    }

    #[test]
    fn test_sum_2x2_rectangular() {
        let cluster = Cluster::<i32, 4, 2>::from_slice(0, 0, &[1, 4, 7, 2, 5, 6, 4, 3]).unwrap();
        let best = cluster.sum_2x2();
        assert_eq!(best.sum, 21);
        assert_eq!(best.index, 1);
    }

    #[test]
    fn test_integer_sums_saturate() {
        let cluster = Cluster2x2::<i32>::from_slice(0, 0, &[i32::MAX, 1, 2, 3]).unwrap();
        assert_eq!(cluster.sum(), i32::MAX);
        assert_eq!(cluster.sum_2x2().sum, i32::MAX);

        let cluster = Cluster2x2::<i32>::from_slice(0, 0, &[i32::MIN, -1, 0, 0]).unwrap();
        assert_eq!(cluster.sum(), i32::MIN);
    }

    #[test]
    fn test_sum_2x2_searches_beyond_center_quadrants() {
        let cluster = Cluster5x5::<i32>::from_slice(
            0,
            0,
            &[
                9, 9, 0, 0, 0, //
                9, 0, 0, 0, 0, //
                0, 0, 5, 1, 0, //
                0, 0, 1, 1, 0, //
                0, 0, 0, 0, 0,
            ],
        )
        .unwrap();
        let best = cluster.sum_2x2();
        assert_eq!(best.sum, 27);
        assert_eq!(best.index, 0);
        assert_eq!(cluster.reduce_to_2x2().data, [[9, 9], [9, 0]]);

        // eta stays on the quadrants around the reference pixel
        let eta = cluster.eta2();
        assert_eq!(eta.c, crate::Corner::BottomRight);
        assert!((eta.sum - 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_sum_2x2_float() {
        let cluster =
            Cluster2x2::<f64>::from_slice(0, 0, &[0.5, 0.25, 0.125, 0.125]).unwrap();
        let best = cluster.sum_2x2();
        assert!((best.sum - 1.0).abs() < 1e-12);
        assert_eq!(best.index, 0);
    }

    #[test]
    fn test_window_keeps_center_convention() {
        let values: Vec<i32> = (0..25).collect();
        let cluster = Cluster5x5::<i32>::from_slice(10, 20, &values).unwrap();

        let sub = cluster.window::<3, 3>(2, 1);
        assert_eq!(sub.data, [[11, 12, 13], [16, 17, 18], [21, 22, 23]]);
        // window element (3, 2) of the 5x5 cluster
        assert_eq!((sub.x, sub.y), (10, 21));

        let corner = cluster.window::<2, 2>(0, 0);
        assert_eq!(corner.data, [[0, 1], [5, 6]]);
        assert_eq!((corner.x, corner.y), (9, 19));
    }

    #[test]
    fn test_reduce_to_2x2() {
        let cluster = Cluster3x3::<i32>::from_slice(5, 5, &[1, 2, 3, 4, 5, 6, 1, 2, 7]).unwrap();
        let reduced = cluster.reduce_to_2x2();
        assert_eq!(reduced.data, [[5, 6], [2, 7]]);
        assert_eq!((reduced.x, reduced.y), (6, 6));
    }

    #[test]
    fn test_reduce_to_3x3() {
        let cluster = Cluster5x5::<i32>::from_slice(
            10,
            10,
            &[
                1, 1, 1, 1, 1, //
                1, 1, 2, 1, 2, //
                1, 9, 8, 1, 4, //
                1, 6, 7, 8, 1, //
                1, 1, 1, 1, 1,
            ],
        )
        .unwrap();
        let reduced = cluster.reduce_to_3x3();
        assert_eq!(reduced.data, [[1, 2, 1], [9, 8, 1], [6, 7, 8]]);
        assert_eq!(reduced.sum(), 43);
        assert_eq!((reduced.x, reduced.y), (10, 10));
    }

    #[test]
    fn test_byte_codec() {
        assert_eq!(i32::from_le((-7i32).to_le()), -7);
        assert_eq!(f32::from_le(1.5f32.to_le()), 1.5);
        assert_eq!(f64::from_le(2.25f64.to_le()), 2.25);
        assert_eq!(i32::from_f64(3.9), 3);
        assert_eq!(i32::from_f64(-3.9), -3);
    }
}
