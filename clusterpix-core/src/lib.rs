//! clusterpix-core: Core types for pixel detector cluster processing.
//!
//! This crate provides fixed-geometry clusters, the growable cluster batch
//! with its reduction and eta operations, and per-pixel running statistics
//! used as pedestal and noise estimates.
//!

pub mod batch;
pub mod cluster;
pub mod error;
pub mod eta;
pub mod statistics;

pub use batch::{ClusterArrays, ClusterBatch, EtaArrays, DEFAULT_CAPACITY};
pub use cluster::{Cluster, Cluster2x2, Cluster3x3, Cluster5x5, ClusterValue, Sum2x2};
pub use error::{Error, Result};
pub use eta::{Corner, Eta2};
pub use statistics::{check_finite, PixelStatistics};
