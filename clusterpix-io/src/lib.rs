//! clusterpix-io: Cluster files and calibration storage for clusterpix.
//!
//! This crate provides the binary cluster file codec, a sink that writes
//! pipeline output to disk on its own thread, and JSON storage for eta
//! calibration cubes.
//!

pub mod cluster_file;
mod error;
mod eta_cube;
mod sink;

pub use cluster_file::{Chunks, ClusterFileReader, ClusterFileWriter, Frames, NoiseCut, Roi};
pub use error::{Error, Result};
pub use eta_cube::{eta_cube_from_json, eta_cube_to_json, load_eta_cube, save_eta_cube};
pub use sink::{ClusterFileSink, WriteSummary};
