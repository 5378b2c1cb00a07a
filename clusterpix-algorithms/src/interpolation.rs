//! Sub-pixel interpolation of cluster positions.
//!
//! An [`EtaCube`] is the joint histogram of `(eta_x, eta_y, energy)` collected
//! from calibration data. The [`Interpolator`] turns it into cumulative
//! distribution tables and maps every cluster's eta onto the unit square,
//! which equalizes the charge-sharing response into a uniform sub-pixel
//! position.
//!
//! Photon coordinates put pixel `k` on `[k, k + 1)`.

use clusterpix_core::{ClusterBatch, ClusterValue, Corner, Eta2};
use ndarray::{s, Array3, ArrayView1, ArrayView3, Axis};
use rayon::prelude::*;

use crate::error::Result;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

fn invalid_edges(message: String) -> crate::Error {
    clusterpix_core::Error::InvalidBinEdges(message).into()
}

fn check_edges(name: &str, edges: &[f64], bins: usize) -> Result<()> {
    if bins == 0 {
        return Err(invalid_edges(format!("{name}: at least one bin is needed")));
    }
    if edges.len() != bins + 1 {
        return Err(invalid_edges(format!(
            "{name}: expected {} edges for {bins} bins, got {}",
            bins + 1,
            edges.len()
        )));
    }
    if edges.iter().any(|e| !e.is_finite()) {
        return Err(invalid_edges(format!("{name}: edges must be finite")));
    }
    if edges.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(invalid_edges(format!(
            "{name}: edges must be strictly increasing"
        )));
    }
    Ok(())
}

/// Bin containing `value`, clamped to the first and last bin.
fn clamped_bin(edges: &[f64], value: f64) -> usize {
    let bins = edges.len() - 1;
    edges
        .partition_point(|&edge| edge <= value)
        .saturating_sub(1)
        .min(bins - 1)
}

/// Bin containing `value`, `None` outside the edges. The last bin includes
/// its upper edge.
fn histogram_bin(edges: &[f64], value: f64) -> Option<usize> {
    let (&first, &last) = (edges.first()?, edges.last()?);
    if !(first..=last).contains(&value) {
        return None;
    }
    Some(clamped_bin(edges, value))
}

/// Joint histogram of eta and energy with its bin edges.
///
/// `counts` has shape `(nx, ny, ne)`; the edge vectors have one more entry
/// than the matching axis.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EtaCube {
    /// Histogram counts indexed `[x_bin, y_bin, energy_bin]`.
    pub counts: Array3<f64>,
    /// Bin edges of `eta_x`.
    pub x_edges: Vec<f64>,
    /// Bin edges of `eta_y`.
    pub y_edges: Vec<f64>,
    /// Bin edges of the energy.
    pub e_edges: Vec<f64>,
}

impl EtaCube {
    /// Creates a cube from counts and edges.
    ///
    /// # Errors
    /// Returns an invalid bin edges error if an edge vector does not match
    /// the counts or is not strictly increasing.
    pub fn new(
        counts: Array3<f64>,
        x_edges: Vec<f64>,
        y_edges: Vec<f64>,
        e_edges: Vec<f64>,
    ) -> Result<Self> {
        let cube = Self {
            counts,
            x_edges,
            y_edges,
            e_edges,
        };
        cube.validate()?;
        Ok(cube)
    }

    /// Creates an empty cube over the given edges.
    ///
    /// # Errors
    /// Returns an invalid bin edges error for fewer than two edges per axis
    /// or edges that are not strictly increasing.
    pub fn empty(x_edges: Vec<f64>, y_edges: Vec<f64>, e_edges: Vec<f64>) -> Result<Self> {
        let bins = |edges: &[f64]| edges.len().saturating_sub(1).max(1);
        let counts = Array3::zeros((bins(&x_edges), bins(&y_edges), bins(&e_edges)));
        Self::new(counts, x_edges, y_edges, e_edges)
    }

    /// Checks the edges against the counts.
    ///
    /// # Errors
    /// Returns an invalid bin edges error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let (nx, ny, ne) = self.counts.dim();
        check_edges("x_edges", &self.x_edges, nx)?;
        check_edges("y_edges", &self.y_edges, ny)?;
        check_edges("e_edges", &self.e_edges, ne)?;
        Ok(())
    }

    /// `(nx, ny, ne)` bin counts.
    #[must_use]
    pub fn shape(&self) -> (usize, usize, usize) {
        self.counts.dim()
    }

    /// Adds one eta sample. Samples outside the edges are ignored; returns
    /// whether the sample was counted.
    pub fn fill(&mut self, eta: &Eta2) -> bool {
        let bins = (
            histogram_bin(&self.x_edges, eta.x),
            histogram_bin(&self.y_edges, eta.y),
            histogram_bin(&self.e_edges, eta.sum),
        );
        match bins {
            (Some(ix), Some(iy), Some(ie)) => {
                self.counts[[ix, iy, ie]] += 1.0;
                true
            }
            _ => false,
        }
    }

    /// Adds a slice of eta samples; returns how many were counted.
    pub fn fill_all(&mut self, etas: &[Eta2]) -> usize {
        etas.iter().filter(|eta| self.fill(eta)).count()
    }
}

/// How the `eta_x` table is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CdfMode {
    /// `eta_x` CDF conditioned on the `eta_y` bin.
    #[default]
    Standard,
    /// Rosenblatt transform: marginal `eta_x` CDF, `eta_y` conditioned on the
    /// `eta_x` bin.
    Rosenblatt,
}

/// Interpolated photon position.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Photon {
    /// Column in pixel units.
    pub x: f64,
    /// Row in pixel units.
    pub y: f64,
    /// Energy estimate of the eta region.
    pub energy: f64,
}

/// Normalized cumulative sum of `counts` with a leading zero.
/// An empty slice gives a linear ramp.
fn cumulative(counts: impl ExactSizeIterator<Item = f64>, out: &mut [f64]) {
    let bins = counts.len();
    out[0] = 0.0;
    let mut total = 0.0;
    for (i, count) in counts.enumerate() {
        total += count;
        out[i + 1] = total;
    }
    if total > 0.0 {
        out.iter_mut().for_each(|v| *v /= total);
    } else {
        #[allow(clippy::cast_precision_loss)]
        let bins = bins as f64;
        for (i, v) in out.iter_mut().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let step = i as f64;
            *v = step / bins;
        }
    }
}

/// Maps eta values to uniform sub-pixel positions.
#[derive(Debug, Clone)]
pub struct Interpolator {
    mode: CdfMode,
    /// Shape `(nx + 1, ny, ne)`.
    cdf_x: Array3<f64>,
    /// Shape `(nx, ny + 1, ne)`.
    cdf_y: Array3<f64>,
    x_edges: Vec<f64>,
    y_edges: Vec<f64>,
    e_edges: Vec<f64>,
}

impl Interpolator {
    /// Builds the tables with [`CdfMode::Standard`].
    ///
    /// # Errors
    /// Returns an invalid bin edges error if the cube is inconsistent.
    pub fn new(cube: &EtaCube) -> Result<Self> {
        Self::with_mode(cube, CdfMode::Standard)
    }

    /// Builds the tables in the given mode.
    ///
    /// # Errors
    /// Returns an invalid bin edges error if the cube is inconsistent.
    pub fn with_mode(cube: &EtaCube, mode: CdfMode) -> Result<Self> {
        cube.validate()?;
        let (nx, ny, ne) = cube.shape();
        let counts = &cube.counts;

        let mut cdf_x = Array3::zeros((nx + 1, ny, ne));
        let mut column = vec![0.0; nx + 1];
        for k in 0..ne {
            match mode {
                CdfMode::Standard => {
                    for j in 0..ny {
                        cumulative(counts.slice(s![.., j, k]).iter().copied(), &mut column);
                        cdf_x.slice_mut(s![.., j, k]).assign(&ArrayView1::from(column.as_slice()));
                    }
                }
                CdfMode::Rosenblatt => {
                    let marginal = counts.index_axis(Axis(2), k).sum_axis(Axis(1));
                    cumulative(marginal.iter().copied(), &mut column);
                    for j in 0..ny {
                        cdf_x.slice_mut(s![.., j, k]).assign(&ArrayView1::from(column.as_slice()));
                    }
                }
            }
        }

        let mut cdf_y = Array3::zeros((nx, ny + 1, ne));
        let mut row = vec![0.0; ny + 1];
        for k in 0..ne {
            for i in 0..nx {
                cumulative(counts.slice(s![i, .., k]).iter().copied(), &mut row);
                cdf_y.slice_mut(s![i, .., k]).assign(&ArrayView1::from(row.as_slice()));
            }
        }

        Ok(Self {
            mode,
            cdf_x,
            cdf_y,
            x_edges: cube.x_edges.clone(),
            y_edges: cube.y_edges.clone(),
            e_edges: cube.e_edges.clone(),
        })
    }

    /// Mode the tables were built with.
    #[must_use]
    pub fn mode(&self) -> CdfMode {
        self.mode
    }

    /// Cumulative `eta_x` table, shape `(nx + 1, ny, ne)`.
    #[must_use]
    pub fn cdf_x(&self) -> ArrayView3<'_, f64> {
        self.cdf_x.view()
    }

    /// Cumulative `eta_y` table, shape `(nx, ny + 1, ne)`.
    #[must_use]
    pub fn cdf_y(&self) -> ArrayView3<'_, f64> {
        self.cdf_y.view()
    }

    /// Maps an eta onto `[0, 1] x [0, 1]`.
    ///
    /// Out-of-range eta and energy values are clamped to the nearest bin.
    #[must_use]
    pub fn transform(&self, eta: &Eta2) -> (f64, f64) {
        let ix = clamped_bin(&self.x_edges, eta.x);
        let iy = clamped_bin(&self.y_edges, eta.y);
        let ie = clamped_bin(&self.e_edges, eta.sum);
        let fx = fraction(&self.x_edges, ix, eta.x);
        let fy = fraction(&self.y_edges, iy, eta.y);

        let u = lerp(self.cdf_x[[ix, iy, ie]], self.cdf_x[[ix + 1, iy, ie]], fx);
        let v = lerp(self.cdf_y[[ix, iy, ie]], self.cdf_y[[ix, iy + 1, ie]], fy);
        (u, v)
    }

    /// Interpolates with the 2x2 [`eta2`](clusterpix_core::Cluster::eta2).
    #[must_use]
    pub fn interpolate<T: ClusterValue, const W: usize, const H: usize>(
        &self,
        clusters: &ClusterBatch<T, W, H>,
    ) -> Vec<Photon> {
        self.place(clusters, &clusters.eta2(), true)
    }

    /// Interpolates with the full-quadrant
    /// [`full_eta2`](clusterpix_core::Cluster::full_eta2).
    #[must_use]
    pub fn interpolate_full_eta2<T: ClusterValue, const W: usize, const H: usize>(
        &self,
        clusters: &ClusterBatch<T, W, H>,
    ) -> Vec<Photon> {
        self.place(clusters, &clusters.full_eta2(), true)
    }

    /// Interpolates 3x3 clusters with [`eta3`](clusterpix_core::Cluster::eta3).
    #[must_use]
    pub fn interpolate_eta3<T: ClusterValue>(
        &self,
        clusters: &ClusterBatch<T, 3, 3>,
    ) -> Vec<Photon> {
        self.place(clusters, &clusters.eta3(), false)
    }

    /// Interpolates 3x3 clusters with
    /// [`cross_eta3`](clusterpix_core::Cluster::cross_eta3).
    #[must_use]
    pub fn interpolate_cross_eta3<T: ClusterValue>(
        &self,
        clusters: &ClusterBatch<T, 3, 3>,
    ) -> Vec<Photon> {
        self.place(clusters, &clusters.cross_eta3(), false)
    }

    /// Quadrant-based etas are relative to the shared corner of the dominant
    /// quadrant, whole-window etas to the cluster pixel.
    fn place<T: ClusterValue, const W: usize, const H: usize>(
        &self,
        clusters: &ClusterBatch<T, W, H>,
        etas: &[Eta2],
        quadrant: bool,
    ) -> Vec<Photon> {
        etas.par_iter()
            .zip(clusters.x().par_iter())
            .zip(clusters.y().par_iter())
            .map(|((eta, &x), &y)| {
                let (u, v) = self.transform(eta);
                let (dx, dy) = if quadrant {
                    quadrant_shift(eta.c)
                } else {
                    (0.0, 0.0)
                };
                Photon {
                    x: f64::from(x) + u + dx,
                    y: f64::from(y) + v + dy,
                    energy: eta.sum,
                }
            })
            .collect()
    }
}

/// Offset from the reference pixel corner to the origin of the eta frame.
fn quadrant_shift(corner: Corner) -> (f64, f64) {
    let (dx, dy) = corner.offset();
    (0.5 + f64::from(dx), 0.5 + f64::from(dy))
}

fn fraction(edges: &[f64], bin: usize, value: f64) -> f64 {
    let (lo, hi) = (edges[bin], edges[bin + 1]);
    let f = ((value - lo) / (hi - lo)).clamp(0.0, 1.0);
    if f.is_nan() {
        0.0
    } else {
        f
    }
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}
