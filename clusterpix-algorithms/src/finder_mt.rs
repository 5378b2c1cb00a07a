//! Multi-threaded cluster finder pipeline.
//!
//! A fixed pool of worker threads, each owning a [`ClusterFinder`] with its
//! own pedestal statistics. Pedestal frames are broadcast to every worker,
//! data frames are distributed through one shared bounded queue and every
//! processed frame produces one [`WorkerBatch`] on the output channel.
//!
//! The pipeline is either [`PipelineState::Stopped`] or
//! [`PipelineState::Running`]. Statistics belong to the pipeline and survive
//! any number of `stop()` / `start()` cycles.

use std::num::NonZeroUsize;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use clusterpix_core::{ClusterBatch, ClusterValue, PixelStatistics};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use ndarray::{Array2, ArrayView2};

use crate::error::{Error, Result};
use crate::finder::{ClusterFinder, FinderConfig};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Default depth of the input queues.
pub const DEFAULT_QUEUE_DEPTH: usize = 200;

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PipelineConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Capacity of the data queue and of every per-worker pedestal queue.
    pub queue_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(1, NonZeroUsize::get),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl PipelineConfig {
    /// Creates a pipeline configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of workers.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the number of workers, rejecting zero.
    ///
    /// # Errors
    /// Returns [`Error::ConfigError`] if `workers` is zero.
    pub fn try_with_workers(self, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(Error::ConfigError("workers must be at least 1".to_string()));
        }
        Ok(self.with_workers(workers))
    }

    /// Sets the queue depth.
    #[must_use]
    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth;
        self
    }

    /// Sets the queue depth, rejecting zero.
    ///
    /// # Errors
    /// Returns [`Error::ConfigError`] if `queue_depth` is zero.
    pub fn try_with_queue_depth(self, queue_depth: usize) -> Result<Self> {
        if queue_depth == 0 {
            return Err(Error::ConfigError(
                "queue_depth must be at least 1".to_string(),
            ));
        }
        Ok(self.with_queue_depth(queue_depth))
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.queue_depth == 0 {
            return Err(Error::ConfigError(format!(
                "workers and queue_depth must be at least 1 (got {} and {})",
                self.workers, self.queue_depth
            )));
        }
        Ok(())
    }
}

/// Lifecycle state of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    /// No worker threads exist; statistics may be inspected.
    Stopped,
    /// Workers accept pedestal and data frames.
    Running,
}

/// Clusters found in one frame, tagged with the worker that found them.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerBatch<T, const W: usize, const H: usize> {
    /// Index of the producing worker.
    pub worker: usize,
    /// The clusters, tagged with the frame number.
    pub clusters: ClusterBatch<T, W, H>,
}

/// An error raised while a worker processed a frame.
#[derive(Debug)]
pub struct FrameError {
    /// Index of the worker.
    pub worker: usize,
    /// Frame number of the data frame, `None` for pedestal frames.
    pub frame_number: Option<i32>,
    /// What went wrong.
    pub error: Error,
}

struct DataFrame<P> {
    frame_number: i32,
    frame: Array2<P>,
}

#[derive(Debug, Default)]
struct Progress {
    pedestal_submitted: u64,
    pedestal_done: Vec<u64>,
    alive: Vec<bool>,
    frames_submitted: u64,
    frames_done: u64,
}

impl Progress {
    fn is_idle(&self) -> bool {
        if !self.alive.iter().any(|&alive| alive) {
            return true;
        }
        self.frames_done >= self.frames_submitted
            && self
                .pedestal_done
                .iter()
                .zip(&self.alive)
                .all(|(&done, &alive)| !alive || done >= self.pedestal_submitted)
    }
}

#[derive(Debug, Default)]
struct Shared {
    progress: Mutex<Progress>,
    changed: Condvar,
    errors: Mutex<Vec<FrameError>>,
}

impl Shared {
    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut Progress)) {
        f(&mut self.progress());
        self.changed.notify_all();
    }

    fn report(&self, worker: usize, frame_number: Option<i32>, error: Error) {
        match frame_number {
            Some(n) => log::warn!("worker {worker} failed on frame {n}: {error}"),
            None => log::warn!("worker {worker} failed on a pedestal frame: {error}"),
        }
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(FrameError {
                worker,
                frame_number,
                error,
            });
    }
}

/// Counts a data frame as done even if processing panics.
struct FrameDone<'a>(&'a Shared);

impl Drop for FrameDone<'_> {
    fn drop(&mut self) {
        self.0.update(|p| p.frames_done += 1);
    }
}

struct PedestalDone<'a> {
    shared: &'a Shared,
    worker: usize,
}

impl Drop for PedestalDone<'_> {
    fn drop(&mut self) {
        let worker = self.worker;
        self.shared.update(|p| p.pedestal_done[worker] += 1);
    }
}

struct WorkerExit<'a> {
    shared: &'a Shared,
    worker: usize,
}

impl Drop for WorkerExit<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            log::error!("cluster-finder-{} panicked", self.worker);
        }
        let worker = self.worker;
        self.shared.update(|p| p.alive[worker] = false);
    }
}

fn lock<F>(finder: &Mutex<F>) -> MutexGuard<'_, F> {
    finder.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Worker<P, T, const W: usize, const H: usize> {
    id: usize,
    finder: Arc<Mutex<ClusterFinder<T, W, H>>>,
    frames: Receiver<DataFrame<P>>,
    pedestals: Receiver<Arc<Array2<P>>>,
    output: Sender<WorkerBatch<T, W, H>>,
    shared: Arc<Shared>,
}

impl<P, T, const W: usize, const H: usize> Worker<P, T, W, H>
where
    P: Copy + Into<f64>,
    T: ClusterValue,
{
    fn run(self) {
        let _exit = WorkerExit {
            shared: &self.shared,
            worker: self.id,
        };
        loop {
            // pending pedestal frames go before any data frame
            while let Ok(frame) = self.pedestals.try_recv() {
                self.pedestal(&frame);
            }
            select! {
                recv(self.pedestals) -> msg => match msg {
                    Ok(frame) => self.pedestal(&frame),
                    Err(_) => break,
                },
                recv(self.frames) -> msg => match msg {
                    Ok(frame) => self.frame(frame),
                    Err(_) => {
                        for frame in self.pedestals.try_iter() {
                            self.pedestal(&frame);
                        }
                        return;
                    }
                },
            }
        }
        for frame in &self.frames {
            self.frame(frame);
        }
    }

    fn pedestal(&self, frame: &Array2<P>) {
        let _done = PedestalDone {
            shared: &self.shared,
            worker: self.id,
        };
        if let Err(e) = lock(&self.finder).push_pedestal_frame(frame.view()) {
            self.shared.report(self.id, None, e);
        }
    }

    fn frame(&self, data: DataFrame<P>) {
        let _done = FrameDone(&self.shared);
        let mut finder = lock(&self.finder);
        match finder.find_clusters(data.frame.view(), data.frame_number) {
            Ok(()) => {
                let clusters = finder.steal_clusters();
                drop(finder);
                let batch = WorkerBatch {
                    worker: self.id,
                    clusters,
                };
                if let Err(e) = self.output.send(batch) {
                    log::warn!(
                        "cluster-finder-{} dropped frame {}: output queue closed",
                        self.id,
                        e.0.clusters.frame_number()
                    );
                }
            }
            Err(e) => {
                finder.steal_clusters();
                drop(finder);
                self.shared.report(self.id, Some(data.frame_number), e);
            }
        }
    }
}

/// Input side of one worker generation.
struct Generation<P> {
    frames: Option<Sender<DataFrame<P>>>,
    pedestals: Vec<Sender<Arc<Array2<P>>>>,
    handles: Vec<JoinHandle<()>>,
}

impl<P> Generation<P> {
    /// Closes the input queues, lets the workers drain them and joins them.
    /// Returns the indices of workers that panicked.
    fn shutdown(&mut self) -> Vec<usize> {
        self.frames = None;
        self.pedestals.clear();
        self.handles
            .drain(..)
            .enumerate()
            .filter_map(|(id, handle)| handle.join().is_err().then_some(id))
            .collect()
    }
}

impl<P> Drop for Generation<P> {
    fn drop(&mut self) {
        for id in self.shutdown() {
            log::error!("cluster-finder-{id} panicked before shutdown");
        }
    }
}

/// Multi-threaded cluster finder over frames of pixel type `P`.
///
/// # Example
///
/// ```
/// use clusterpix_algorithms::{ClusterFinderMt, FinderConfig, PipelineConfig};
/// use ndarray::Array2;
///
/// let mut pipeline = ClusterFinderMt::<u16, i32, 3, 3>::new(
///     64,
///     64,
///     FinderConfig::default(),
///     PipelineConfig::new().with_workers(2),
/// )?;
/// pipeline.start()?;
/// pipeline.push_pedestal_frame(Array2::<u16>::from_elem((64, 64), 100).view())?;
/// pipeline.sync();
/// let mut frame = Array2::<u16>::from_elem((64, 64), 100);
/// frame[[10, 10]] = 500;
/// pipeline.find_clusters(frame.view(), 0)?;
/// pipeline.stop()?;
///
/// let batch = pipeline.output().try_recv().unwrap();
/// assert_eq!(batch.clusters.len(), 1);
/// # Ok::<(), clusterpix_algorithms::Error>(())
/// ```
pub struct ClusterFinderMt<P, T, const W: usize, const H: usize> {
    // dropped first: workers drain their queues while the output is open
    generation: Option<Generation<P>>,
    config: PipelineConfig,
    shape: (usize, usize),
    finders: Vec<Arc<Mutex<ClusterFinder<T, W, H>>>>,
    shared: Arc<Shared>,
    output_tx: Sender<WorkerBatch<T, W, H>>,
    output_rx: Receiver<WorkerBatch<T, W, H>>,
}

impl<P, T, const W: usize, const H: usize> ClusterFinderMt<P, T, W, H>
where
    P: Copy + Into<f64> + Send + Sync + 'static,
    T: ClusterValue,
{
    /// Creates a stopped pipeline for `rows x cols` frames.
    ///
    /// # Errors
    /// Returns an error for an invalid finder or pipeline configuration.
    pub fn new(
        rows: usize,
        cols: usize,
        finder_config: FinderConfig,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let finders = (0..config.workers)
            .map(|_| ClusterFinder::new(rows, cols, finder_config.clone()).map(Mutex::new))
            .map(|finder| finder.map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let (output_tx, output_rx) = unbounded();
        Ok(Self {
            generation: None,
            config,
            shape: (rows, cols),
            finders,
            shared: Arc::new(Shared::default()),
            output_tx,
            output_rx,
        })
    }

    /// Number of workers.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.finders.len()
    }

    /// Pipeline configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// `(rows, cols)` of accepted frames.
    #[must_use]
    pub fn frame_shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        if self.generation.is_some() {
            PipelineState::Running
        } else {
            PipelineState::Stopped
        }
    }

    /// Whether workers are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.generation.is_some()
    }

    /// Total number of data frames submitted over the pipeline's lifetime.
    #[must_use]
    pub fn frames_submitted(&self) -> u64 {
        self.shared.progress().frames_submitted
    }

    /// Receiving end of the output queue.
    ///
    /// Batches stay queued after `stop()` until a consumer takes them.
    #[must_use]
    pub fn output(&self) -> Receiver<WorkerBatch<T, W, H>> {
        self.output_rx.clone()
    }

    /// Spawns a new generation of workers. Does nothing when already running.
    ///
    /// # Errors
    /// Returns [`Error::Spawn`] if a thread cannot be created; the pipeline
    /// stays stopped.
    pub fn start(&mut self) -> Result<()> {
        if self.generation.is_some() {
            return Ok(());
        }
        let workers = self.workers();
        self.shared.update(|p| {
            p.pedestal_done = vec![p.pedestal_submitted; workers];
            p.alive = vec![false; workers];
            p.frames_done = p.frames_submitted;
        });

        let (frames_tx, frames_rx) = bounded(self.config.queue_depth);
        let mut generation = Generation {
            frames: Some(frames_tx),
            pedestals: Vec::with_capacity(workers),
            handles: Vec::with_capacity(workers),
        };
        for (id, finder) in self.finders.iter().enumerate() {
            let (pedestal_tx, pedestal_rx) = bounded(self.config.queue_depth);
            let worker = Worker {
                id,
                finder: Arc::clone(finder),
                frames: frames_rx.clone(),
                pedestals: pedestal_rx,
                output: self.output_tx.clone(),
                shared: Arc::clone(&self.shared),
            };
            self.shared.update(|p| p.alive[id] = true);
            let spawned = thread::Builder::new()
                .name(format!("cluster-finder-{id}"))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => {
                    generation.pedestals.push(pedestal_tx);
                    generation.handles.push(handle);
                }
                Err(e) => {
                    self.shared.update(|p| p.alive[id] = false);
                    return Err(Error::Spawn(e));
                }
            }
        }
        log::debug!("started {workers} cluster finder workers");
        self.generation = Some(generation);
        Ok(())
    }

    /// Stops the workers after all queued frames are processed.
    ///
    /// Does nothing when already stopped.
    ///
    /// # Errors
    /// Returns [`Error::ThreadPanicked`] if a worker panicked; the pipeline
    /// is stopped either way.
    pub fn stop(&mut self) -> Result<()> {
        let Some(mut generation) = self.generation.take() else {
            return Ok(());
        };
        let panicked = generation.shutdown();
        log::debug!(
            "stopped cluster finder workers after {} frames",
            self.frames_submitted()
        );
        match panicked.first() {
            None => Ok(()),
            Some(id) => Err(Error::ThreadPanicked(format!("cluster-finder-{id}"))),
        }
    }

    fn check_shape<S>(&self, frame: &ArrayView2<'_, S>) -> Result<()> {
        if frame.dim() == self.shape {
            Ok(())
        } else {
            Err(clusterpix_core::Error::ShapeMismatch {
                expected: self.shape,
                actual: frame.dim(),
            }
            .into())
        }
    }

    /// Sends a pedestal frame to every worker.
    ///
    /// Blocks while any worker's pedestal queue is full.
    ///
    /// # Errors
    /// Returns [`Error::NotRunning`] when stopped, or a shape mismatch.
    pub fn push_pedestal_frame(&self, frame: ArrayView2<'_, P>) -> Result<()> {
        let generation = self.generation.as_ref().ok_or(Error::NotRunning)?;
        self.check_shape(&frame)?;
        let frame = Arc::new(frame.to_owned());
        self.shared.update(|p| p.pedestal_submitted += 1);
        for (id, queue) in generation.pedestals.iter().enumerate() {
            if queue.send(Arc::clone(&frame)).is_err() {
                log::warn!("cluster-finder-{id} is gone; pedestal frame dropped");
            }
        }
        Ok(())
    }

    /// Queues a data frame, copying it.
    ///
    /// Blocks while the input queue is full. The shape is checked here;
    /// failures while a worker processes the frame, such as a NaN pixel, are
    /// collected by [`take_errors`](Self::take_errors).
    ///
    /// # Errors
    /// Returns [`Error::NotRunning`] when stopped, or a shape mismatch.
    pub fn find_clusters(&self, frame: ArrayView2<'_, P>, frame_number: i32) -> Result<()> {
        self.check_shape(&frame)?;
        self.find_clusters_owned(frame.to_owned(), frame_number)
    }

    /// Queues an owned data frame.
    ///
    /// # Errors
    /// Returns [`Error::NotRunning`] when stopped, or a shape mismatch.
    pub fn find_clusters_owned(&self, frame: Array2<P>, frame_number: i32) -> Result<()> {
        let generation = self.generation.as_ref().ok_or(Error::NotRunning)?;
        let queue = generation.frames.as_ref().ok_or(Error::NotRunning)?;
        self.check_shape(&frame.view())?;
        self.shared.update(|p| p.frames_submitted += 1);
        if queue
            .send(DataFrame {
                frame_number,
                frame,
            })
            .is_err()
        {
            self.shared.update(|p| p.frames_submitted -= 1);
            return Err(Error::NotRunning);
        }
        Ok(())
    }

    /// Blocks until every submitted pedestal and data frame is processed.
    ///
    /// Returns immediately when stopped.
    pub fn sync(&self) {
        if self.generation.is_none() {
            return;
        }
        let guard = self.shared.progress();
        let _idle = self
            .shared
            .changed
            .wait_while(guard, |p| !p.is_idle())
            .unwrap_or_else(PoisonError::into_inner);
    }

    fn stopped_finder(&self, worker: usize) -> Result<&Mutex<ClusterFinder<T, W, H>>> {
        if self.generation.is_some() {
            return Err(Error::Running);
        }
        self.finders
            .get(worker)
            .map(|finder| &**finder)
            .ok_or(Error::WorkerIndex {
                index: worker,
                workers: self.finders.len(),
            })
    }

    /// Pedestal of one worker.
    ///
    /// # Errors
    /// Returns [`Error::Running`] while running, or [`Error::WorkerIndex`].
    pub fn pedestal(&self, worker: usize) -> Result<Array2<f64>> {
        Ok(lock(self.stopped_finder(worker)?).pedestal())
    }

    /// Noise of one worker.
    ///
    /// # Errors
    /// Returns [`Error::Running`] while running, or [`Error::WorkerIndex`].
    pub fn noise(&self, worker: usize) -> Result<Array2<f64>> {
        Ok(lock(self.stopped_finder(worker)?).noise())
    }

    /// Copy of one worker's pedestal statistics.
    ///
    /// # Errors
    /// Returns [`Error::Running`] while running, or [`Error::WorkerIndex`].
    pub fn statistics(&self, worker: usize) -> Result<PixelStatistics> {
        Ok(lock(self.stopped_finder(worker)?).statistics().clone())
    }

    /// Discards the pedestal statistics of every worker.
    ///
    /// # Errors
    /// Returns [`Error::Running`] while running.
    pub fn clear_pedestal(&mut self) -> Result<()> {
        if self.generation.is_some() {
            return Err(Error::Running);
        }
        for finder in &self.finders {
            lock(finder).clear_pedestal();
        }
        Ok(())
    }

    /// Takes the per-frame errors recorded so far.
    pub fn take_errors(&self) -> Vec<FrameError> {
        std::mem::take(&mut *self.shared.errors.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl<P, T, const W: usize, const H: usize> std::fmt::Debug for ClusterFinderMt<P, T, W, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterFinderMt")
            .field("config", &self.config)
            .field("shape", &self.shape)
            .field("running", &self.generation.is_some())
            .finish_non_exhaustive()
    }
}
