//! JSON storage for eta calibration cubes.
//!
//! The schema keeps the counts as nested lists indexed
//! `counts[x_bin][y_bin][energy_bin]`, which is what `numpy.ndarray.tolist()`
//! produces:
//!
//! ```json
//! {
//!   "x_edges": [0.0, 0.5, 1.0],
//!   "y_edges": [0.0, 0.5, 1.0],
//!   "e_edges": [0.0, 100.0],
//!   "counts": [[[3.0], [1.0]], [[1.0], [3.0]]]
//! }
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use clusterpix_algorithms::EtaCube;
use ndarray::{Array3, Axis};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
struct JsonEtaCube {
    x_edges: Vec<f64>,
    y_edges: Vec<f64>,
    e_edges: Vec<f64>,
    counts: Vec<Vec<Vec<f64>>>,
}

impl JsonEtaCube {
    fn from_cube(cube: &EtaCube) -> Self {
        let counts = cube
            .counts
            .axis_iter(Axis(0))
            .map(|plane| plane.outer_iter().map(|lane| lane.to_vec()).collect())
            .collect();
        Self {
            x_edges: cube.x_edges.clone(),
            y_edges: cube.y_edges.clone(),
            e_edges: cube.e_edges.clone(),
            counts,
        }
    }

    fn into_cube(self) -> Result<EtaCube> {
        let nx = self.counts.len();
        let ny = self.counts.first().map_or(0, Vec::len);
        let ne = self
            .counts
            .first()
            .and_then(|plane| plane.first())
            .map_or(0, Vec::len);
        let mut flat = Vec::with_capacity(nx * ny * ne);
        for (ix, plane) in self.counts.into_iter().enumerate() {
            if plane.len() != ny {
                return Err(Error::InvalidFormat(format!(
                    "counts[{ix}] has {} rows, expected {ny}",
                    plane.len()
                )));
            }
            for (iy, lane) in plane.into_iter().enumerate() {
                if lane.len() != ne {
                    return Err(Error::InvalidFormat(format!(
                        "counts[{ix}][{iy}] has {} energy bins, expected {ne}",
                        lane.len()
                    )));
                }
                flat.extend(lane);
            }
        }
        let counts = Array3::from_shape_vec((nx, ny, ne), flat)
            .map_err(|e| Error::InvalidFormat(e.to_string()))?;
        Ok(EtaCube::new(counts, self.x_edges, self.y_edges, self.e_edges)?)
    }
}

/// Loads an eta cube from a JSON file.
///
/// # Errors
/// Returns an error if the file cannot be read, is not valid JSON, or the
/// counts and edges are inconsistent.
pub fn load_eta_cube<P: AsRef<Path>>(path: P) -> Result<EtaCube> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);
    let json: JsonEtaCube = serde_json::from_reader(reader)?;
    log::debug!("loaded eta cube from {}", path.as_ref().display());
    json.into_cube()
}

/// Parses an eta cube from a JSON string.
///
/// # Errors
/// Returns an error for invalid JSON or inconsistent counts and edges.
pub fn eta_cube_from_json(json: &str) -> Result<EtaCube> {
    let json: JsonEtaCube = serde_json::from_str(json)?;
    json.into_cube()
}

/// Serializes an eta cube to a JSON string.
///
/// # Errors
/// Returns an error if serialization fails.
pub fn eta_cube_to_json(cube: &EtaCube) -> Result<String> {
    Ok(serde_json::to_string(&JsonEtaCube::from_cube(cube))?)
}

/// Saves an eta cube as a JSON file.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn save_eta_cube<P: AsRef<Path>>(path: P, cube: &EtaCube) -> Result<()> {
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, &JsonEtaCube::from_cube(cube))?;
    writer.flush()?;
    Ok(())
}
