//! Command-line tools for clusterpix cluster files.
#![allow(clippy::uninlined_format_args)]

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use clusterpix_algorithms::{CdfMode, Interpolator, Photon};
use clusterpix_core::{ClusterBatch, ClusterValue};
use clusterpix_io::{load_eta_cube, ClusterFileReader};
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    ClusterIo(#[from] clusterpix_io::Error),

    #[error("{0}")]
    Algorithm(#[from] clusterpix_algorithms::Error),
}

/// Cluster value type stored in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Dtype {
    I32,
    F32,
    F64,
}

/// Eta variant used for interpolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EtaKind {
    /// Pixel pairs in the dominant 2x2 quadrant
    Eta2,
    /// Full dominant 2x2 quadrant
    FullEta2,
    /// Full 3x3 window
    Eta3,
    /// Cross through the center pixel
    CrossEta3,
}

/// How the eta cube is turned into lookup tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Standard,
    Rosenblatt,
}

impl From<Mode> for CdfMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Standard => CdfMode::Standard,
            Mode::Rosenblatt => CdfMode::Rosenblatt,
        }
    }
}

/// Inspect and post-process pixel detector cluster files.
#[derive(Parser)]
#[command(name = "clusterpix")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show record and cluster counts of a cluster file
    Info {
        /// Input cluster file
        input: PathBuf,

        /// Cluster edge length (2 or 3)
        #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(2..=3))]
        size: u8,

        /// Cluster value type
        #[arg(long, value_enum, default_value = "i32")]
        dtype: Dtype,
    },

    /// Print the clusters of a cluster file
    Dump {
        /// Input cluster file
        input: PathBuf,

        /// Cluster edge length (2 or 3)
        #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(2..=3))]
        size: u8,

        /// Cluster value type
        #[arg(long, value_enum, default_value = "i32")]
        dtype: Dtype,

        /// Stop after this many clusters
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Print CSV with a header line
        #[arg(long)]
        csv: bool,
    },

    /// Interpolate 3x3 clusters to sub-pixel photon positions
    Interpolate {
        /// Input cluster file (3x3 clusters)
        input: PathBuf,

        /// Eta cube JSON file
        #[arg(long)]
        cube: PathBuf,

        /// Output CSV file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Cluster value type
        #[arg(long, value_enum, default_value = "i32")]
        dtype: Dtype,

        /// Eta variant
        #[arg(long, value_enum, default_value = "eta2")]
        eta: EtaKind,

        /// Lookup table construction
        #[arg(long, value_enum, default_value = "standard")]
        mode: Mode,
    },
}

/// Calls `$func::<T, S, S>(args)` for the selected size and dtype.
macro_rules! dispatch {
    ($size:expr, $dtype:expr, $func:ident($($arg:expr),* $(,)?)) => {
        match ($size, $dtype) {
            (2, Dtype::I32) => $func::<i32, 2, 2>($($arg),*),
            (2, Dtype::F32) => $func::<f32, 2, 2>($($arg),*),
            (2, Dtype::F64) => $func::<f64, 2, 2>($($arg),*),
            (_, Dtype::I32) => $func::<i32, 3, 3>($($arg),*),
            (_, Dtype::F32) => $func::<f32, 3, 3>($($arg),*),
            (_, Dtype::F64) => $func::<f64, 3, 3>($($arg),*),
        }
    };
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match cli.command {
        Commands::Info { input, size, dtype } => {
            let info = dispatch!(size, dtype, file_info(&input))?;
            writeln!(out, "file:     {}", input.display())?;
            writeln!(out, "geometry: {0}x{0} {1:?}", size, dtype)?;
            write_info(&mut out, &info)?;
        }
        Commands::Dump {
            input,
            size,
            dtype,
            limit,
            csv,
        } => {
            let limit = limit.unwrap_or(usize::MAX);
            let written = dispatch!(size, dtype, dump(&input, &mut out, limit, csv))?;
            log::debug!("dumped {written} clusters");
        }
        Commands::Interpolate {
            input,
            cube,
            output,
            dtype,
            eta,
            mode,
        } => {
            let cube = load_eta_cube(&cube)?;
            let interpolator = Interpolator::with_mode(&cube, mode.into())?;
            let run = |out: &mut dyn Write| match dtype {
                Dtype::I32 => interpolate::<i32>(&input, &interpolator, eta, out),
                Dtype::F32 => interpolate::<f32>(&input, &interpolator, eta, out),
                Dtype::F64 => interpolate::<f64>(&input, &interpolator, eta, out),
            };
            let photons = match output {
                Some(path) => {
                    let mut writer = BufWriter::new(File::create(&path)?);
                    let n = run(&mut writer)?;
                    writer.flush()?;
                    n
                }
                None => run(&mut out)?,
            };
            log::info!("interpolated {photons} photons");
        }
    }
    Ok(())
}

/// Summary of a cluster file.
#[derive(Debug, Default, PartialEq, Eq)]
struct FileInfo {
    records: u64,
    clusters: u64,
    first_frame: Option<i32>,
    last_frame: Option<i32>,
    min_frame: Option<i32>,
    max_frame: Option<i32>,
}

fn file_info<T: ClusterValue, const W: usize, const H: usize>(path: &Path) -> Result<FileInfo> {
    let mut reader = ClusterFileReader::<T, W, H>::open(path)?;
    let mut info = FileInfo::default();
    for batch in reader.frames() {
        let batch = batch?;
        let frame = batch.frame_number();
        info.records += 1;
        info.clusters += batch.len() as u64;
        info.first_frame.get_or_insert(frame);
        info.last_frame = Some(frame);
        info.min_frame = Some(info.min_frame.map_or(frame, |m| m.min(frame)));
        info.max_frame = Some(info.max_frame.map_or(frame, |m| m.max(frame)));
    }
    Ok(info)
}

fn write_info(out: &mut impl Write, info: &FileInfo) -> io::Result<()> {
    writeln!(out, "records:  {}", info.records)?;
    writeln!(out, "clusters: {}", info.clusters)?;
    match (info.first_frame, info.last_frame, info.min_frame, info.max_frame) {
        (Some(first), Some(last), Some(min), Some(max)) => {
            writeln!(out, "frames:   {first} .. {last} (min {min}, max {max})")
        }
        _ => writeln!(out, "frames:   none"),
    }
}

fn dump<T: ClusterValue, const W: usize, const H: usize>(
    path: &Path,
    out: &mut impl Write,
    limit: usize,
    csv: bool,
) -> Result<usize> {
    let mut reader = ClusterFileReader::<T, W, H>::open(path)?;
    let separator = if csv { "," } else { " " };
    if csv {
        write!(out, "frame,x,y")?;
        for i in 0..W * H {
            write!(out, ",d{i}")?;
        }
        writeln!(out)?;
    }
    let mut written = 0;
    'records: for batch in reader.frames() {
        let batch: ClusterBatch<T, W, H> = batch?;
        for cluster in batch.iter() {
            if written == limit {
                break 'records;
            }
            write!(
                out,
                "{}{sep}{}{sep}{}",
                batch.frame_number(),
                cluster.x,
                cluster.y,
                sep = separator
            )?;
            for value in cluster.as_slice() {
                write!(out, "{separator}{value}")?;
            }
            writeln!(out)?;
            written += 1;
        }
    }
    Ok(written)
}

fn interpolate<T: ClusterValue>(
    path: &Path,
    interpolator: &Interpolator,
    eta: EtaKind,
    out: &mut dyn Write,
) -> Result<usize> {
    let mut reader = ClusterFileReader::<T, 3, 3>::open(path)?;
    writeln!(out, "frame,x,y,energy")?;
    let mut total = 0;
    for batch in reader.frames() {
        let batch = batch?;
        let photons: Vec<Photon> = match eta {
            EtaKind::Eta2 => interpolator.interpolate(&batch),
            EtaKind::FullEta2 => interpolator.interpolate_full_eta2(&batch),
            EtaKind::Eta3 => interpolator.interpolate_eta3(&batch),
            EtaKind::CrossEta3 => interpolator.interpolate_cross_eta3(&batch),
        };
        for photon in &photons {
            writeln!(
                out,
                "{},{},{},{}",
                batch.frame_number(),
                photon.x,
                photon.y,
                photon.energy
            )?;
        }
        total += photons.len();
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterpix_algorithms::EtaCube;
    use clusterpix_core::Cluster;
    use clusterpix_io::ClusterFileWriter;
    use tempfile::TempDir;

    fn write_sample(path: &Path) {
        let mut writer = ClusterFileWriter::<i32, 3, 3>::create(path).unwrap();
        for (frame, count) in [(7, 2i16), (3, 0), (9, 1)] {
            let mut batch = ClusterBatch::new().with_frame_number(frame);
            for i in 0..count {
                batch.push(&Cluster::new(i + 1, 2, [[0, 0, 0], [0, 6, 2], [0, 2, 0]]));
            }
            writer.write_frame(&batch).unwrap();
        }
        writer.flush().unwrap();
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["clusterpix", "dump", "a.bin", "--size", "2", "--csv"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Dump {
                size: 2,
                csv: true,
                limit: None,
                dtype: Dtype::I32,
                ..
            }
        ));
        assert!(Cli::try_parse_from(["clusterpix", "info", "a.bin", "--size", "5"]).is_err());
    }

    #[test]
    fn test_file_info() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.bin");
        write_sample(&path);

        let info = file_info::<i32, 3, 3>(&path).unwrap();
        assert_eq!(
            info,
            FileInfo {
                records: 3,
                clusters: 3,
                first_frame: Some(7),
                last_frame: Some(9),
                min_frame: Some(3),
                max_frame: Some(9),
            }
        );
        let mut text = Vec::new();
        write_info(&mut text, &info).unwrap();
        let text = String::from_utf8(text).unwrap();
        assert!(text.contains("frames:   7 .. 9 (min 3, max 9)"));
    }

    #[test]
    fn test_dump_csv_with_limit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.bin");
        write_sample(&path);

        let mut out = Vec::new();
        let written = dump::<i32, 3, 3>(&path, &mut out, 2, true).unwrap();
        assert_eq!(written, 2);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "frame,x,y,d0,d1,d2,d3,d4,d5,d6,d7,d8");
        assert_eq!(lines[1], "7,1,2,0,0,0,0,6,2,0,2,0");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_interpolate_csv() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.bin");
        write_sample(&path);
        let cube = EtaCube::new(
            ndarray::Array3::ones((2, 2, 1)),
            vec![0.0, 0.5, 1.0],
            vec![0.0, 0.5, 1.0],
            vec![0.0, 100.0],
        )
        .unwrap();
        let interpolator = Interpolator::new(&cube).unwrap();

        let mut out = Vec::new();
        let n = interpolate::<i32>(&path, &interpolator, EtaKind::Eta2, &mut out).unwrap();
        assert_eq!(n, 3);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "frame,x,y,energy");
        assert_eq!(lines[1], "7,1.75,2.75,10");
        assert_eq!(lines[3], "9,1.75,2.75,10");
    }
}
