//! Binary cluster files.
//!
//! A file is a sequence of records, one per frame:
//!
//! ```text
//! frame_number   i32 LE
//! cluster_count  u32 LE
//! cluster_count x {
//!     x          i16 LE
//!     y          i16 LE
//!     padding    zero bytes up to the alignment of T
//!     data       W * H values of T, LE, row-major
//! }
//! ```
//!
//! The geometry and value type are not stored; reader and writer must agree
//! on them through their type parameters.
//!
//! The reader can drop clusters while reading, either outside a [`Roi`] or
//! below a [`NoiseCut`]. Filtered reads still return up to the requested
//! number of clusters.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::path::Path;

use clusterpix_core::{Cluster, ClusterBatch, ClusterValue};
use ndarray::Array2;

use crate::{Error, Result};

const HEADER_SIZE: usize = 8;
const POSITION_SIZE: usize = 4;

/// Zero bytes between the position and the payload of a cluster.
#[must_use]
pub fn payload_padding<T>() -> usize {
    POSITION_SIZE.next_multiple_of(align_of::<T>()) - POSITION_SIZE
}

/// Encoded size of one `W x H` cluster of `T`.
#[must_use]
pub fn cluster_record_size<T, const W: usize, const H: usize>() -> usize {
    POSITION_SIZE + payload_padding::<T>() + W * H * size_of::<T>()
}

/// Writes cluster batches as records.
#[derive(Debug)]
pub struct ClusterFileWriter<T, const W: usize, const H: usize> {
    writer: BufWriter<File>,
    buffer: Vec<u8>,
    frames: u64,
    clusters: u64,
    _marker: PhantomData<T>,
}

impl<T: ClusterValue, const W: usize, const H: usize> ClusterFileWriter<T, W, H> {
    /// Creates (or truncates) a cluster file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        log::debug!("writing clusters to {}", path.as_ref().display());
        Ok(Self::from_file(file))
    }

    /// Opens a cluster file for appending, creating it if needed.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened.
    pub fn append<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        log::debug!("appending clusters to {}", path.as_ref().display());
        Ok(Self::from_file(file))
    }

    fn from_file(file: File) -> Self {
        Self {
            writer: BufWriter::new(file),
            buffer: Vec::new(),
            frames: 0,
            clusters: 0,
            _marker: PhantomData,
        }
    }

    /// Writes one record holding the whole batch.
    ///
    /// # Errors
    /// Returns an error on I/O failure or if the batch has more than
    /// `u32::MAX` clusters.
    pub fn write_frame(&mut self, batch: &ClusterBatch<T, W, H>) -> Result<()> {
        let count = u32::try_from(batch.len()).map_err(|_| {
            Error::InvalidFormat(format!("{} clusters do not fit one record", batch.len()))
        })?;
        let padding = [0u8; 8];
        let padding = &padding[..payload_padding::<T>()];

        self.buffer.clear();
        self.buffer
            .reserve(HEADER_SIZE + batch.len() * cluster_record_size::<T, W, H>());
        self.buffer
            .extend_from_slice(&batch.frame_number().to_le_bytes());
        self.buffer.extend_from_slice(&count.to_le_bytes());
        let payloads = batch.data().chunks_exact(W * H);
        for ((x, y), values) in batch.x().iter().zip(batch.y()).zip(payloads) {
            self.buffer.extend_from_slice(&x.to_le_bytes());
            self.buffer.extend_from_slice(&y.to_le_bytes());
            self.buffer.extend_from_slice(padding);
            for &value in values {
                self.buffer.extend_from_slice(value.to_le().as_ref());
            }
        }
        self.writer.write_all(&self.buffer)?;
        self.frames += 1;
        self.clusters += u64::from(count);
        Ok(())
    }

    /// Records written through this writer.
    #[must_use]
    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    /// Clusters written through this writer.
    #[must_use]
    pub fn clusters_written(&self) -> u64 {
        self.clusters
    }

    /// Flushes the writer.
    ///
    /// # Errors
    /// Returns an error if buffered data cannot be written.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Rectangle of cluster positions, bounds included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Roi {
    /// Smallest accepted column.
    pub xmin: i16,
    /// Largest accepted column.
    pub xmax: i16,
    /// Smallest accepted row.
    pub ymin: i16,
    /// Largest accepted row.
    pub ymax: i16,
}

impl Roi {
    /// Creates a region from inclusive bounds.
    #[must_use]
    pub fn new(xmin: i16, xmax: i16, ymin: i16, ymax: i16) -> Self {
        Self {
            xmin,
            xmax,
            ymin,
            ymax,
        }
    }

    /// Whether `(x, y)` lies inside the region.
    #[must_use]
    pub fn contains(&self, x: i16, y: i16) -> bool {
        (self.xmin..=self.xmax).contains(&x) && (self.ymin..=self.ymax).contains(&y)
    }
}

/// Drops clusters that do not stand out from a per-pixel noise map.
///
/// With `s = n_sigma * noise[[y, x]]`, a cluster is kept if its reference
/// pixel exceeds `s`, its best 2x2 sum exceeds `2 s`, or its total exceeds
/// `sqrt(W * H) s`. Clusters positioned outside the map are dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseCut {
    noise: Array2<f64>,
    n_sigma: f64,
}

impl NoiseCut {
    /// Creates a cut from a `(rows, cols)` noise map.
    #[must_use]
    pub fn new(noise: Array2<f64>, n_sigma: f64) -> Self {
        Self { noise, n_sigma }
    }

    /// The noise map.
    #[must_use]
    pub fn noise(&self) -> &Array2<f64> {
        &self.noise
    }

    /// Threshold multiplier.
    #[must_use]
    pub fn n_sigma(&self) -> f64 {
        self.n_sigma
    }

    /// Whether the cluster passes the cut. Clusters must be at least 2x2.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn accepts<T: ClusterValue, const W: usize, const H: usize>(
        &self,
        cluster: &Cluster<T, W, H>,
    ) -> bool {
        let (Ok(row), Ok(col)) = (usize::try_from(cluster.y), usize::try_from(cluster.x)) else {
            return false;
        };
        let Some(&noise) = self.noise.get([row, col]) else {
            return false;
        };
        let sigma = self.n_sigma * noise;
        cluster.data[H / 2][W / 2].to_f64() > sigma
            || cluster.sum_2x2().sum.to_f64() > 2.0 * sigma
            || cluster.sum().to_f64() > ((W * H) as f64).sqrt() * sigma
    }
}

/// Reads cluster records back into batches.
#[derive(Debug)]
pub struct ClusterFileReader<T, const W: usize, const H: usize> {
    reader: BufReader<File>,
    frame_number: i32,
    remaining: u32,
    record: Vec<u8>,
    values: Vec<T>,
    roi: Option<Roi>,
    noise_cut: Option<NoiseCut>,
    skipped: u64,
}

impl<T: ClusterValue, const W: usize, const H: usize> ClusterFileReader<T, W, H> {
    /// Opens a cluster file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        log::debug!("reading clusters from {}", path.as_ref().display());
        Ok(Self {
            reader: BufReader::new(file),
            frame_number: 0,
            remaining: 0,
            record: vec![0; cluster_record_size::<T, W, H>()],
            values: Vec::with_capacity(W * H),
            roi: None,
            noise_cut: None,
            skipped: 0,
        })
    }

    /// Only returns clusters inside `roi`.
    #[must_use]
    pub fn with_roi(mut self, roi: Roi) -> Self {
        self.roi = Some(roi);
        self
    }

    /// Sets or clears the region filter for subsequent reads.
    pub fn set_roi(&mut self, roi: Option<Roi>) {
        self.roi = roi;
    }

    /// Current region filter.
    #[must_use]
    pub fn roi(&self) -> Option<Roi> {
        self.roi
    }

    /// Only returns clusters passing `cut`.
    #[must_use]
    pub fn with_noise_cut(mut self, cut: NoiseCut) -> Self {
        self.noise_cut = Some(cut);
        self
    }

    /// Sets or clears the noise cut for subsequent reads.
    pub fn set_noise_cut(&mut self, cut: Option<NoiseCut>) {
        self.noise_cut = cut;
    }

    /// Current noise cut.
    #[must_use]
    pub fn noise_cut(&self) -> Option<&NoiseCut> {
        self.noise_cut.as_ref()
    }

    /// Clusters dropped by the filters so far.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Clusters of the current record that have not been read yet.
    #[must_use]
    pub fn remaining_in_record(&self) -> u32 {
        self.remaining
    }

    /// Reads the next record. Returns `Ok(None)` at the end of the file.
    ///
    /// Filtered clusters are left out, so the batch may be empty.
    ///
    /// # Errors
    /// Returns [`Error::PartialRecord`] if a previous
    /// [`read_clusters`](Self::read_clusters) stopped inside a record, and
    /// [`Error::InvalidFormat`] for a truncated record.
    pub fn read_frame(&mut self) -> Result<Option<ClusterBatch<T, W, H>>> {
        if self.remaining > 0 {
            return Err(Error::PartialRecord {
                remaining: self.remaining,
            });
        }
        if !self.read_header()? {
            return Ok(None);
        }
        let mut batch = ClusterBatch::with_capacity(self.remaining as usize)
            .with_frame_number(self.frame_number);
        self.read_payloads(self.remaining as usize, &mut batch)?;
        Ok(Some(batch))
    }

    /// Reads up to `n` clusters, crossing record boundaries as needed.
    ///
    /// Filtered clusters do not count towards `n`; reading goes on until `n`
    /// clusters passed the filters or the file ends. The batch is tagged with
    /// the frame number of the last record read from. An empty batch means the
    /// file is exhausted.
    ///
    /// # Errors
    /// Returns [`Error::InvalidFormat`] for a truncated record.
    pub fn read_clusters(&mut self, n: usize) -> Result<ClusterBatch<T, W, H>> {
        let mut batch = ClusterBatch::with_capacity(n);
        while batch.len() < n {
            if self.remaining == 0 {
                if !self.read_header()? {
                    break;
                }
                continue;
            }
            let take = (n - batch.len()).min(self.remaining as usize);
            self.read_payloads(take, &mut batch)?;
        }
        batch.set_frame_number(self.frame_number);
        Ok(batch)
    }

    /// Iterates over the remaining records.
    pub fn frames(&mut self) -> Frames<'_, T, W, H> {
        Frames {
            reader: self,
            done: false,
        }
    }

    /// Iterates over batches of at most `n` clusters.
    pub fn chunks(&mut self, n: usize) -> Chunks<'_, T, W, H> {
        Chunks {
            reader: self,
            size: n,
            done: n == 0,
        }
    }

    /// Reads a record header; `false` at a clean end of file.
    fn read_header(&mut self) -> Result<bool> {
        let mut header = [0u8; HEADER_SIZE];
        match read_full(&mut self.reader, &mut header)? {
            0 => return Ok(false),
            HEADER_SIZE => {}
            got => {
                return Err(Error::InvalidFormat(format!(
                    "truncated record header ({got} of {HEADER_SIZE} bytes)"
                )))
            }
        }
        self.frame_number = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        self.remaining = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        Ok(true)
    }

    fn read_payloads(&mut self, count: usize, batch: &mut ClusterBatch<T, W, H>) -> Result<()> {
        let offset = POSITION_SIZE + payload_padding::<T>();
        batch.reserve(count);
        for _ in 0..count {
            self.reader
                .read_exact(&mut self.record)
                .map_err(|e| match e.kind() {
                    ErrorKind::UnexpectedEof => Error::InvalidFormat(format!(
                        "record of frame {} ends before its {} clusters",
                        self.frame_number, self.remaining
                    )),
                    _ => Error::Io(e),
                })?;
            self.remaining -= 1;
            let x = i16::from_le_bytes([self.record[0], self.record[1]]);
            let y = i16::from_le_bytes([self.record[2], self.record[3]]);
            self.values.clear();
            for chunk in self.record[offset..].chunks_exact(size_of::<T>()) {
                let mut bytes = T::Bytes::default();
                bytes.as_mut().copy_from_slice(chunk);
                self.values.push(T::from_le(bytes));
            }
            let cluster = Cluster::<T, W, H>::from_slice(x, y, &self.values)?;
            if self.accepts(&cluster) {
                batch.push(&cluster);
            } else {
                self.skipped += 1;
            }
        }
        Ok(())
    }

    fn accepts(&self, cluster: &Cluster<T, W, H>) -> bool {
        self.roi.is_none_or(|roi| roi.contains(cluster.x, cluster.y))
            && self
                .noise_cut
                .as_ref()
                .is_none_or(|cut| cut.accepts(cluster))
    }
}

/// Fills `buf` as far as the stream allows and returns the byte count.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Iterator over whole records, see [`ClusterFileReader::frames`].
#[derive(Debug)]
pub struct Frames<'a, T, const W: usize, const H: usize> {
    reader: &'a mut ClusterFileReader<T, W, H>,
    done: bool,
}

impl<T: ClusterValue, const W: usize, const H: usize> Iterator for Frames<'_, T, W, H> {
    type Item = Result<ClusterBatch<T, W, H>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.reader.read_frame().transpose();
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}

/// Iterator over fixed-size batches, see [`ClusterFileReader::chunks`].
#[derive(Debug)]
pub struct Chunks<'a, T, const W: usize, const H: usize> {
    reader: &'a mut ClusterFileReader<T, W, H>,
    size: usize,
    done: bool,
}

impl<T: ClusterValue, const W: usize, const H: usize> Iterator for Chunks<'_, T, W, H> {
    type Item = Result<ClusterBatch<T, W, H>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.read_clusters(self.size) {
            Ok(batch) if batch.is_empty() => {
                self.done = true;
                None
            }
            Ok(batch) => Some(Ok(batch)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
