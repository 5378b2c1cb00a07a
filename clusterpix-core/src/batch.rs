//! Structure of Arrays (`SoA`) storage for clusters of one kind.
//!
//! [`ClusterBatch`] stores positions and payloads in parallel vectors rather
//! than a vector of [`Cluster`] structs. The payload vector is laid out as a
//! contiguous `(n, H, W)` block, so it can be handed to `ndarray` consumers
//! without copying.

use ndarray::{Array1, Array2, Array3, ArrayView3};

use crate::cluster::{Cluster, ClusterValue, Sum2x2};
use crate::eta::Eta2;
use crate::{Error, Result};

/// Default initial capacity of a batch, in clusters.
pub const DEFAULT_CAPACITY: usize = 1024;

/// A growable batch of `W x H` clusters with payload type `T`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterBatch<T, const W: usize, const H: usize> {
    x: Vec<i16>,
    y: Vec<i16>,
    data: Vec<T>,
    frame_number: i32,
}

impl<T: ClusterValue, const W: usize, const H: usize> Default for ClusterBatch<T, W, H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Structured-array form of a batch: one entry per cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterArrays<T> {
    /// Frame columns.
    pub x: Array1<i16>,
    /// Frame rows.
    pub y: Array1<i16>,
    /// Payloads with shape `(n, H, W)`.
    pub data: Array3<T>,
    /// Frame number the batch is tagged with.
    pub frame_number: i32,
}

/// Structured-array form of a list of eta tuples.
#[derive(Debug, Clone, PartialEq)]
pub struct EtaArrays {
    /// Horizontal ratios.
    pub eta_x: Array1<f64>,
    /// Vertical ratios.
    pub eta_y: Array1<f64>,
    /// Dominant quadrant as its [`Corner`](crate::eta::Corner) index.
    pub c: Array1<u8>,
    /// Energies.
    pub sum: Array1<f64>,
}

impl EtaArrays {
    /// Collects eta tuples into columns.
    #[must_use]
    pub fn from_etas(etas: &[Eta2]) -> Self {
        Self {
            eta_x: etas.iter().map(|e| e.x).collect(),
            eta_y: etas.iter().map(|e| e.y).collect(),
            c: etas.iter().map(|e| u8::from(e.c)).collect(),
            sum: etas.iter().map(|e| e.sum).collect(),
        }
    }
}

impl<T: ClusterValue, const W: usize, const H: usize> ClusterBatch<T, W, H> {
    /// Creates an empty batch with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates an empty batch with room for `capacity` clusters.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            x: Vec::with_capacity(capacity),
            y: Vec::with_capacity(capacity),
            data: Vec::with_capacity(capacity * W * H),
            frame_number: 0,
        }
    }

    /// Returns the number of clusters in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Returns true if the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Number of clusters the batch can hold without reallocating.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.x.capacity()
    }

    /// Frame the clusters (or the most recently appended ones) came from.
    #[must_use]
    pub fn frame_number(&self) -> i32 {
        self.frame_number
    }

    /// Sets the frame tag.
    pub fn set_frame_number(&mut self, frame_number: i32) {
        self.frame_number = frame_number;
    }

    /// Sets the frame tag, builder style.
    #[must_use]
    pub fn with_frame_number(mut self, frame_number: i32) -> Self {
        self.frame_number = frame_number;
        self
    }

    /// Frame columns of all clusters.
    #[must_use]
    pub fn x(&self) -> &[i16] {
        &self.x
    }

    /// Frame rows of all clusters.
    #[must_use]
    pub fn y(&self) -> &[i16] {
        &self.y
    }

    /// All payloads as one flat slice of `len() * W * H` values.
    #[must_use]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Pushes a single cluster into the batch.
    pub fn push(&mut self, cluster: &Cluster<T, W, H>) {
        self.x.push(cluster.x);
        self.y.push(cluster.y);
        self.data.extend_from_slice(cluster.as_slice());
    }

    /// Pushes a cluster given as position and row-major payload slice.
    ///
    /// # Errors
    /// Returns [`Error::InvalidPayloadLength`] if `values` does not hold
    /// exactly `W * H` elements.
    pub fn try_push(&mut self, x: i16, y: i16, values: &[T]) -> Result<()> {
        if values.len() != W * H {
            return Err(Error::InvalidPayloadLength {
                expected: W * H,
                actual: values.len(),
            });
        }
        self.x.push(x);
        self.y.push(y);
        self.data.extend_from_slice(values);
        Ok(())
    }

    /// Returns the cluster at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Cluster<T, W, H>> {
        let values = self.data.get(index * W * H..(index + 1) * W * H)?;
        Cluster::from_slice(self.x[index], self.y[index], values).ok()
    }

    /// Iterates over the clusters by value.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = Cluster<T, W, H>> + '_ {
        let payloads = self.data.chunks_exact(W * H);
        self.x
            .iter()
            .zip(&self.y)
            .zip(payloads)
            .map(|((&x, &y), values)| {
                let mut cluster = Cluster::zeros(x, y);
                cluster.data.as_flattened_mut().copy_from_slice(values);
                cluster
            })
    }

    /// Reserves room for at least `additional` more clusters.
    pub fn reserve(&mut self, additional: usize) {
        self.x.reserve(additional);
        self.y.reserve(additional);
        self.data.reserve(additional * W * H);
    }

    /// Removes all clusters, keeping the allocation and the frame tag.
    pub fn clear(&mut self) {
        self.x.clear();
        self.y.clear();
        self.data.clear();
    }

    /// Appends all clusters from another batch and takes over its frame tag.
    pub fn append(&mut self, other: &ClusterBatch<T, W, H>) {
        self.x.extend_from_slice(&other.x);
        self.y.extend_from_slice(&other.y);
        self.data.extend_from_slice(&other.data);
        self.frame_number = other.frame_number;
    }

    /// Total payload of every cluster, saturating for integer payloads.
    #[must_use]
    pub fn sum(&self) -> Vec<T> {
        self.data
            .chunks_exact(W * H)
            .map(|values| {
                values
                    .iter()
                    .fold(T::default(), |acc, &v| acc.accumulate(v))
            })
            .collect()
    }

    /// Maximum 2x2 sub-window sum and its index for every cluster.
    #[must_use]
    pub fn sum_2x2(&self) -> Vec<Sum2x2<T>> {
        self.iter().map(|cluster| cluster.sum_2x2()).collect()
    }

    /// New batch with every cluster re-centered on its best 2x2 sub-window.
    #[must_use]
    pub fn reduce_to_2x2(&self) -> ClusterBatch<T, 2, 2> {
        self.reduce_with(|cluster| cluster.reduce_to_2x2())
    }

    /// New batch with every cluster re-centered on its best 3x3 sub-window.
    #[must_use]
    pub fn reduce_to_3x3(&self) -> ClusterBatch<T, 3, 3> {
        self.reduce_with(|cluster| cluster.reduce_to_3x3())
    }

    fn reduce_with<const SW: usize, const SH: usize>(
        &self,
        reduce: impl Fn(&Cluster<T, W, H>) -> Cluster<T, SW, SH>,
    ) -> ClusterBatch<T, SW, SH> {
        let mut out = ClusterBatch::with_capacity(self.len());
        for cluster in self.iter() {
            out.push(&reduce(&cluster));
        }
        out.frame_number = self.frame_number;
        out
    }

    /// [`Cluster::eta2`] for every cluster.
    #[must_use]
    pub fn eta2(&self) -> Vec<Eta2> {
        self.iter().map(|cluster| cluster.eta2()).collect()
    }

    /// [`Cluster::full_eta2`] for every cluster.
    #[must_use]
    pub fn full_eta2(&self) -> Vec<Eta2> {
        self.iter().map(|cluster| cluster.full_eta2()).collect()
    }

    /// Histogram of cluster positions over a `(rows, cols)` grid.
    ///
    /// Cell `[y, x]` counts the clusters at that position. Clusters outside
    /// the grid are skipped.
    #[must_use]
    pub fn hitmap(&self, rows: usize, cols: usize) -> Array2<i32> {
        let mut map = Array2::zeros((rows, cols));
        for (&x, &y) in self.x.iter().zip(&self.y) {
            let (Ok(col), Ok(row)) = (usize::try_from(x), usize::try_from(y)) else {
                continue;
            };
            if let Some(count) = map.get_mut((row, col)) {
                *count += 1;
            }
        }
        map
    }

    /// Borrowed `(n, H, W)` view of all payloads.
    ///
    /// # Errors
    /// Returns [`Error::Layout`] if the payload storage is inconsistent.
    pub fn data_view(&self) -> Result<ArrayView3<'_, T>> {
        Ok(ArrayView3::from_shape((self.len(), H, W), &self.data)?)
    }

    /// Converts the batch into structured arrays without copying payloads.
    ///
    /// # Errors
    /// Returns [`Error::Layout`] if the payload storage is inconsistent.
    pub fn into_arrays(self) -> Result<ClusterArrays<T>> {
        let n = self.len();
        Ok(ClusterArrays {
            x: Array1::from(self.x),
            y: Array1::from(self.y),
            data: Array3::from_shape_vec((n, H, W), self.data)?,
            frame_number: self.frame_number,
        })
    }
}

impl<T: ClusterValue> ClusterBatch<T, 3, 3> {
    /// [`Cluster::eta3`] for every cluster.
    #[must_use]
    pub fn eta3(&self) -> Vec<Eta2> {
        self.iter().map(|cluster| cluster.eta3()).collect()
    }

    /// [`Cluster::cross_eta3`] for every cluster.
    #[must_use]
    pub fn cross_eta3(&self) -> Vec<Eta2> {
        self.iter().map(|cluster| cluster.cross_eta3()).collect()
    }
}

impl<T: ClusterValue, const W: usize, const H: usize> Extend<Cluster<T, W, H>>
    for ClusterBatch<T, W, H>
{
    fn extend<I: IntoIterator<Item = Cluster<T, W, H>>>(&mut self, iter: I) {
        for cluster in iter {
            self.push(&cluster);
        }
    }
}

impl<T: ClusterValue, const W: usize, const H: usize> FromIterator<Cluster<T, W, H>>
    for ClusterBatch<T, W, H>
{
    fn from_iter<I: IntoIterator<Item = Cluster<T, W, H>>>(iter: I) -> Self {
        let mut batch = Self::new();
        batch.extend(iter);
        batch
    }
}
