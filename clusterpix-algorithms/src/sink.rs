//! Consumers draining the pipeline's output queue.
//!
//! [`SinkThread`] runs a [`BatchConsumer`] on its own thread until it is
//! stopped, then drains whatever is still queued and finishes the consumer.
//! [`Collector`] is the in-memory consumer; file sinks live in
//! `clusterpix-io`.

use std::thread::{self, JoinHandle};

use clusterpix_core::{ClusterBatch, ClusterValue};
use crossbeam_channel::{bounded, select, Receiver, Sender};

use crate::error::{Error, Result};
use crate::finder_mt::{ClusterFinderMt, WorkerBatch};

/// Something that accepts worker batches one at a time.
pub trait BatchConsumer<T, const W: usize, const H: usize>: Send + 'static {
    /// Value handed back by [`SinkThread::stop`].
    type Output: Send + 'static;

    /// Handles one batch.
    fn consume(&mut self, batch: WorkerBatch<T, W, H>);

    /// Flushes and returns the result once the source is drained.
    fn finish(self) -> Self::Output;
}

/// A consumer running on a dedicated thread.
#[derive(Debug)]
pub struct SinkThread<R> {
    name: String,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<R>>,
}

impl<R: Send + 'static> SinkThread<R> {
    /// Spawns `consumer` on a thread named `name`, fed from `source`.
    ///
    /// # Errors
    /// Returns [`Error::Spawn`] if the thread cannot be created.
    pub fn spawn<T, C, const W: usize, const H: usize>(
        name: &str,
        source: Receiver<WorkerBatch<T, W, H>>,
        mut consumer: C,
    ) -> Result<Self>
    where
        T: ClusterValue,
        C: BatchConsumer<T, W, H, Output = R>,
    {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            loop {
                select! {
                    recv(source) -> msg => match msg {
                        Ok(batch) => consumer.consume(batch),
                        Err(_) => break,
                    },
                    recv(stop_rx) -> _ => {
                        for batch in source.try_iter() {
                            consumer.consume(batch);
                        }
                        break;
                    },
                }
            }
            consumer.finish()
        })?;
        log::debug!("started sink {name}");
        Ok(Self {
            name: name.to_string(),
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Whether the sink thread has not been stopped yet.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Drains the queued batches, stops the thread and returns the
    /// consumer's result. Returns `Ok(None)` when already stopped.
    ///
    /// # Errors
    /// Returns [`Error::ThreadPanicked`] if the consumer panicked.
    pub fn stop(&mut self) -> Result<Option<R>> {
        // disconnecting the stop channel wakes the thread
        self.stop = None;
        let Some(handle) = self.handle.take() else {
            return Ok(None);
        };
        let output = handle.join().map_err(|_| {
            log::error!("sink {} panicked", self.name);
            Error::ThreadPanicked(self.name.clone())
        })?;
        log::debug!("stopped sink {}", self.name);
        Ok(Some(output))
    }
}

impl<R> Drop for SinkThread<R> {
    fn drop(&mut self) {
        self.stop = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("sink {} panicked", self.name);
            }
        }
    }
}

/// Keeps one batch per worker.
#[derive(Debug)]
struct Accumulator<T, const W: usize, const H: usize> {
    batches: Vec<ClusterBatch<T, W, H>>,
}

impl<T: ClusterValue, const W: usize, const H: usize> BatchConsumer<T, W, H>
    for Accumulator<T, W, H>
{
    type Output = Vec<ClusterBatch<T, W, H>>;

    fn consume(&mut self, batch: WorkerBatch<T, W, H>) {
        if batch.worker >= self.batches.len() {
            self.batches.resize_with(batch.worker + 1, ClusterBatch::new);
        }
        self.batches[batch.worker].append(&batch.clusters);
    }

    fn finish(self) -> Self::Output {
        self.batches
    }
}

/// In-memory sink accumulating the clusters of every worker.
///
/// After [`stop`](Self::stop), [`steal_clusters`](Self::steal_clusters)
/// returns exactly one batch per worker, empty for workers that produced
/// nothing.
#[derive(Debug)]
pub struct Collector<T, const W: usize, const H: usize> {
    thread: SinkThread<Vec<ClusterBatch<T, W, H>>>,
    collected: Vec<ClusterBatch<T, W, H>>,
}

impl<T: ClusterValue, const W: usize, const H: usize> Collector<T, W, H> {
    /// Starts collecting from `source`, expecting `workers` producers.
    ///
    /// # Errors
    /// Returns [`Error::Spawn`] if the thread cannot be created.
    pub fn new(source: Receiver<WorkerBatch<T, W, H>>, workers: usize) -> Result<Self> {
        let accumulator = Accumulator {
            batches: (0..workers).map(|_| ClusterBatch::new()).collect(),
        };
        Ok(Self {
            thread: SinkThread::spawn("cluster-collector", source, accumulator)?,
            collected: Vec::new(),
        })
    }

    /// Starts collecting the output of `pipeline`.
    ///
    /// # Errors
    /// Returns [`Error::Spawn`] if the thread cannot be created.
    pub fn attach<P>(pipeline: &ClusterFinderMt<P, T, W, H>) -> Result<Self>
    where
        P: Copy + Into<f64> + Send + Sync + 'static,
    {
        Self::new(pipeline.output(), pipeline.workers())
    }

    /// Whether the collector thread is still consuming.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread.is_running()
    }

    /// Drains the queue and stops collecting.
    ///
    /// # Errors
    /// Returns [`Error::ThreadPanicked`] if the collector thread panicked.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(batches) = self.thread.stop()? {
            self.collected = batches;
        }
        Ok(())
    }

    /// Returns the collected batches, one per worker, and clears storage.
    ///
    /// # Errors
    /// Returns [`Error::SinkRunning`] if the collector was not stopped.
    pub fn steal_clusters(&mut self) -> Result<Vec<ClusterBatch<T, W, H>>> {
        if self.thread.is_running() {
            return Err(Error::SinkRunning);
        }
        Ok(std::mem::take(&mut self.collected))
    }
}
