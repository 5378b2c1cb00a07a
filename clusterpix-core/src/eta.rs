//! Charge-sharing ratios ("eta") used as keys for sub-pixel interpolation.
//!
//! All eta variants return an [`Eta2`] with the ratios in `x`/`y`, the
//! dominant 2x2 quadrant in `c` and the energy estimate in `sum`.
//!
//! The 2x2 variants select the quadrant among the four 2x2 sub-windows that
//! contain the reference pixel (`data[H/2][W/2]`); sub-windows that do not fit
//! inside the cluster are skipped. Ties go to the first quadrant in
//! [`Corner`] order.

use crate::cluster::{Cluster, ClusterValue};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Position of the dominant 2x2 quadrant relative to the reference pixel.
///
/// The reference pixel is the bottom-right pixel of a `TopLeft` quadrant,
/// the bottom-left pixel of a `TopRight` quadrant and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Corner {
    /// Quadrant extends up and to the left.
    #[default]
    TopLeft = 0,
    /// Quadrant extends up and to the right.
    TopRight = 1,
    /// Quadrant extends down and to the left.
    BottomLeft = 2,
    /// Quadrant extends down and to the right.
    BottomRight = 3,
}

impl Corner {
    /// All corners in tie-break order.
    pub const ALL: [Corner; 4] = [
        Corner::TopLeft,
        Corner::TopRight,
        Corner::BottomLeft,
        Corner::BottomRight,
    ];

    /// Corner from its index, if valid.
    #[must_use]
    pub fn from_index(index: u8) -> Option<Corner> {
        Corner::ALL.get(usize::from(index)).copied()
    }

    /// Pixel offset `(dx, dy)` of the quadrant's top-left pixel relative to
    /// the reference pixel.
    #[must_use]
    pub fn offset(self) -> (i8, i8) {
        match self {
            Corner::TopLeft => (-1, -1),
            Corner::TopRight => (0, -1),
            Corner::BottomLeft => (-1, 0),
            Corner::BottomRight => (0, 0),
        }
    }
}

impl From<Corner> for u8 {
    fn from(corner: Corner) -> Self {
        corner as u8
    }
}

/// Eta tuple of one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Eta2 {
    /// Horizontal charge-sharing ratio.
    pub x: f64,
    /// Vertical charge-sharing ratio.
    pub y: f64,
    /// Dominant quadrant.
    pub c: Corner,
    /// Energy of the region the ratios were computed from.
    pub sum: f64,
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

impl<T: ClusterValue, const W: usize, const H: usize> Cluster<T, W, H> {
    /// Top-left window position of the quadrant, if it fits in the window.
    fn quadrant_origin(corner: Corner) -> Option<(usize, usize)> {
        let (dx, dy) = corner.offset();
        let row0 = (H / 2).checked_add_signed(isize::from(dy))?;
        let col0 = (W / 2).checked_add_signed(isize::from(dx))?;
        (row0 + 2 <= H && col0 + 2 <= W).then_some((row0, col0))
    }

    /// Highest-energy quadrant touching the reference pixel and its origin.
    fn max_quadrant(&self) -> (Corner, usize, usize, T) {
        const { assert!(W >= 2 && H >= 2, "eta needs at least a 2x2 cluster") };
        let mut best: Option<(Corner, usize, usize, T)> = None;
        for corner in Corner::ALL {
            if let Some((row0, col0)) = Self::quadrant_origin(corner) {
                let sum = self.window_sum(row0, col0, 2, 2);
                let better = match best {
                    None => true,
                    Some((_, _, _, best_sum)) => sum > best_sum,
                };
                if better {
                    best = Some((corner, row0, col0, sum));
                }
            }
        }
        // TopLeft always fits once W and H are at least 2
        best.unwrap_or((Corner::TopLeft, H / 2 - 1, W / 2 - 1, T::default()))
    }

    /// Eta from the pixel pairs through the reference pixel.
    ///
    /// `x` is the right pixel over the sum of the horizontal pair in the
    /// reference row, `y` the bottom pixel over the sum of the vertical pair
    /// in the reference column, both restricted to the dominant quadrant.
    /// `sum` is the quadrant energy. Zero denominators give zero.
    #[must_use]
    pub fn eta2(&self) -> Eta2 {
        let (c, row0, col0, sum) = self.max_quadrant();
        let (row, col) = (H / 2, W / 2);
        let left = self.data[row][col0].to_f64();
        let right = self.data[row][col0 + 1].to_f64();
        let top = self.data[row0][col].to_f64();
        let bottom = self.data[row0 + 1][col].to_f64();
        Eta2 {
            x: ratio(right, left + right),
            y: ratio(bottom, top + bottom),
            c,
            sum: sum.to_f64(),
        }
    }

    /// Eta from the full dominant quadrant.
    ///
    /// `x` is the right column of the quadrant over the quadrant sum, `y` the
    /// bottom row over the quadrant sum.
    #[must_use]
    pub fn full_eta2(&self) -> Eta2 {
        let (c, row0, col0, sum) = self.max_quadrant();
        let total = sum.to_f64();
        let right = self.window_sum(row0, col0 + 1, 1, 2).to_f64();
        let bottom = self.window_sum(row0 + 1, col0, 2, 1).to_f64();
        Eta2 {
            x: ratio(right, total),
            y: ratio(bottom, total),
            c,
            sum: total,
        }
    }
}

impl<T: ClusterValue> Cluster<T, 3, 3> {
    /// Ratios along the row and column through the center pixel.
    fn center_cross(&self) -> (f64, f64) {
        let d = self.as_slice();
        let (top, left, center, right, bottom) = (
            d[1].to_f64(),
            d[3].to_f64(),
            d[4].to_f64(),
            d[5].to_f64(),
            d[7].to_f64(),
        );
        (
            ratio(right - left, left + center + right),
            ratio(bottom - top, top + center + bottom),
        )
    }

    /// Eta of a 3x3 cluster.
    ///
    /// `x` is (right - left) over the center row, `y` is (bottom - top) over
    /// the center column, both in `[-1, 1]` for non-negative payloads. `sum`
    /// is the total of all nine pixels, `c` is always `TopLeft`.
    #[must_use]
    pub fn eta3(&self) -> Eta2 {
        let (x, y) = self.center_cross();
        Eta2 {
            x,
            y,
            c: Corner::TopLeft,
            sum: self.sum().to_f64(),
        }
    }

    /// Like [`eta3`](Self::eta3), with `sum` restricted to the five pixels
    /// of the cross through the center.
    #[must_use]
    pub fn cross_eta3(&self) -> Eta2 {
        let (x, y) = self.center_cross();
        let d = self.as_slice();
        Eta2 {
            x,
            y,
            c: Corner::TopLeft,
            sum: [1, 3, 4, 5, 7].iter().map(|&i| d[i].to_f64()).sum(),
        }
    }
}
