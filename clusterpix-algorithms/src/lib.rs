//! clusterpix-algorithms: Cluster finding and sub-pixel interpolation.
//!
//! This crate provides:
//! - **`ClusterFinder`** - single-threaded, pedestal-subtracting finder
//! - **`ClusterFinderMt`** - worker pool feeding an output queue
//! - **Sinks** - consumers draining the output queue (`Collector`)
//! - **`Interpolator`** - eta-based sub-pixel positions from an `EtaCube`
//!
#![warn(missing_docs)]

pub mod error;
mod finder;
mod finder_mt;
mod interpolation;
pub mod sink;

pub use error::{Error, Result};
pub use finder::{ClusterFinder, FinderConfig};
pub use finder_mt::{
    ClusterFinderMt, FrameError, PipelineConfig, PipelineState, WorkerBatch, DEFAULT_QUEUE_DEPTH,
};
pub use interpolation::{CdfMode, EtaCube, Interpolator, Photon};
pub use sink::{BatchConsumer, Collector, SinkThread};

// Re-export the core cluster types
pub use clusterpix_core::{Cluster, ClusterBatch, ClusterValue, Corner, Eta2, PixelStatistics};
