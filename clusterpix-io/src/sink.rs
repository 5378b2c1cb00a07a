//! Sink writing pipeline output to a cluster file.

use std::path::Path;

use clusterpix_algorithms::{BatchConsumer, ClusterFinderMt, SinkThread, WorkerBatch};
use clusterpix_core::ClusterValue;
use crossbeam_channel::Receiver;

use crate::cluster_file::ClusterFileWriter;
use crate::{Error, Result};

/// Totals reported by a stopped [`ClusterFileSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteSummary {
    /// Records written.
    pub frames: u64,
    /// Clusters written.
    pub clusters: u64,
}

struct FileConsumer<T, const W: usize, const H: usize> {
    writer: ClusterFileWriter<T, W, H>,
    error: Option<Error>,
}

impl<T: ClusterValue, const W: usize, const H: usize> BatchConsumer<T, W, H>
    for FileConsumer<T, W, H>
{
    type Output = Result<WriteSummary>;

    fn consume(&mut self, batch: WorkerBatch<T, W, H>) {
        if self.error.is_some() {
            return;
        }
        if let Err(e) = self.writer.write_frame(&batch.clusters) {
            log::error!(
                "failed to write frame {}: {e}",
                batch.clusters.frame_number()
            );
            self.error = Some(e);
        }
    }

    fn finish(mut self) -> Self::Output {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.writer.flush()?;
        Ok(WriteSummary {
            frames: self.writer.frames_written(),
            clusters: self.writer.clusters_written(),
        })
    }
}

/// Writes every batch from the pipeline's output queue to a cluster file on
/// a dedicated thread, in arrival order.
///
/// Writing stops at the first I/O error, which [`stop`](Self::stop) reports.
#[derive(Debug)]
pub struct ClusterFileSink {
    thread: SinkThread<Result<WriteSummary>>,
    summary: Option<WriteSummary>,
}

impl ClusterFileSink {
    /// Creates the file and starts writing batches from `source`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or the thread cannot
    /// be spawned.
    pub fn new<T, P, const W: usize, const H: usize>(
        path: P,
        source: Receiver<WorkerBatch<T, W, H>>,
    ) -> Result<Self>
    where
        T: ClusterValue,
        P: AsRef<Path>,
    {
        let consumer = FileConsumer {
            writer: ClusterFileWriter::<T, W, H>::create(path)?,
            error: None,
        };
        Ok(Self {
            thread: SinkThread::spawn("cluster-file-sink", source, consumer)?,
            summary: None,
        })
    }

    /// Starts writing the output of `pipeline` to `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or the thread cannot
    /// be spawned.
    pub fn attach<F, T, P, const W: usize, const H: usize>(
        pipeline: &ClusterFinderMt<F, T, W, H>,
        path: P,
    ) -> Result<Self>
    where
        F: Copy + Into<f64> + Send + Sync + 'static,
        T: ClusterValue,
        P: AsRef<Path>,
    {
        Self::new(path, pipeline.output())
    }

    /// Whether the writer thread is still consuming.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread.is_running()
    }

    /// Writes the batches still queued, flushes and closes the file.
    ///
    /// Calling it again returns the same summary.
    ///
    /// # Errors
    /// Returns the first write error, or an error if the thread panicked.
    pub fn stop(&mut self) -> Result<WriteSummary> {
        if let Some(result) = self.thread.stop()? {
            let summary = result?;
            log::debug!(
                "wrote {} clusters in {} records",
                summary.clusters,
                summary.frames
            );
            self.summary = Some(summary);
        }
        Ok(self.summary.unwrap_or_default())
    }
}
