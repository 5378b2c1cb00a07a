use approx::assert_relative_eq;
use clusterpix_algorithms::{
    ClusterFinderMt, CdfMode, EtaCube, FinderConfig, Interpolator, PipelineConfig,
};
use clusterpix_core::{Cluster, ClusterBatch};
use clusterpix_io::{
    load_eta_cube, save_eta_cube, ClusterFileReader, ClusterFileSink, ClusterFileWriter,
    NoiseCut, Roi,
};
use ndarray::{Array2, Array3};
use tempfile::TempDir;

/// `frames` records with 0, 1, 2, ... clusters.
fn sample_batches(frames: i16) -> Vec<ClusterBatch<f64, 3, 3>> {
    (0..frames)
        .map(|frame| {
            let mut batch = ClusterBatch::new().with_frame_number(i32::from(frame) * 10);
            for i in 0..frame {
                let v = f64::from(frame * 100 + i);
                batch.push(&Cluster::new(i, frame, [[v, 0.5, -v], [1.0, v, 2.0], [0.0, -1.5, v]]));
            }
            batch
        })
        .collect()
}

fn write_all<const W: usize, const H: usize>(
    path: &std::path::Path,
    batches: &[ClusterBatch<f64, W, H>],
) {
    let mut writer = ClusterFileWriter::<f64, W, H>::create(path).unwrap();
    for batch in batches {
        writer.write_frame(batch).unwrap();
    }
    writer.flush().unwrap();
}

#[test]
fn test_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("clusters.bin");
    let batches = sample_batches(6);
    write_all(&path, &batches);

    let mut reader = ClusterFileReader::<f64, 3, 3>::open(&path).unwrap();
    let read: Vec<_> = reader.frames().collect::<Result<_, _>>().unwrap();
    assert_eq!(read, batches);
    assert!(reader.read_frame().unwrap().is_none());
}

#[test]
fn test_append_adds_records() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("clusters.bin");
    let batches = sample_batches(4);
    write_all(&path, &batches[..2]);

    let mut writer = ClusterFileWriter::<f64, 3, 3>::append(&path).unwrap();
    for batch in &batches[2..] {
        writer.write_frame(batch).unwrap();
    }
    assert_eq!(writer.frames_written(), 2);
    assert_eq!(writer.clusters_written(), 5);
    drop(writer);

    let mut reader = ClusterFileReader::<f64, 3, 3>::open(&path).unwrap();
    let frames: Vec<i32> = reader
        .frames()
        .map(|batch| batch.unwrap().frame_number())
        .collect();
    assert_eq!(frames, [0, 10, 20, 30]);
}

#[test]
fn test_split_reads_match_one_read() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("clusters.bin");
    let batches = sample_batches(7);
    write_all(&path, &batches);
    let total: usize = batches.iter().map(ClusterBatch::len).sum();

    let mut whole = ClusterFileReader::<f64, 3, 3>::open(&path).unwrap();
    let all = whole.read_clusters(total).unwrap();
    assert_eq!(all.len(), total);
    assert_eq!(all.frame_number(), 60);

    for k in [1, 5, 9, total - 1] {
        let mut reader = ClusterFileReader::<f64, 3, 3>::open(&path).unwrap();
        let mut joined = reader.read_clusters(k).unwrap();
        let rest = reader.read_clusters(total - k).unwrap();
        joined.append(&rest);
        assert_eq!(joined, all, "split at {k}");
        assert!(reader.read_clusters(1).unwrap().is_empty());
    }
}

#[test]
fn test_chunks() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("clusters.bin");
    write_all(&path, &sample_batches(6));

    let mut reader = ClusterFileReader::<f64, 3, 3>::open(&path).unwrap();
    let sizes: Vec<usize> = reader.chunks(4).map(|chunk| chunk.unwrap().len()).collect();
    assert_eq!(sizes, [4, 4, 4, 3]);
}

#[test]
fn test_roi_skips_outside_clusters() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("clusters.bin");
    write_all(&path, &sample_batches(6));
    let roi = Roi::new(1, 2, 2, 4);
    assert!(roi.contains(1, 2) && roi.contains(2, 4));
    assert!(!roi.contains(0, 3) && !roi.contains(1, 5));

    let mut reader = ClusterFileReader::<f64, 3, 3>::open(&path)
        .unwrap()
        .with_roi(roi);
    let sizes: Vec<usize> = reader.frames().map(|batch| batch.unwrap().len()).collect();
    assert_eq!(sizes, [0, 0, 1, 2, 2, 0]);
    assert_eq!(reader.skipped(), 10);

    let mut reader = ClusterFileReader::<f64, 3, 3>::open(&path).unwrap();
    reader.set_roi(Some(roi));
    let first = reader.read_clusters(3).unwrap();
    assert_eq!(first.x(), [1, 1, 2]);
    assert_eq!(first.y(), [2, 3, 3]);
    assert_eq!(first.frame_number(), 30);
    let rest = reader.read_clusters(10).unwrap();
    assert_eq!(rest.x(), [1, 2]);
    assert_eq!(rest.y(), [4, 4]);
    for cluster in first.iter().chain(rest.iter()) {
        assert!(roi.contains(cluster.x, cluster.y));
    }
}

#[test]
fn test_noise_cut_drops_weak_clusters() {
    let weak = |x| Cluster::new(x, x, [[0.0, 0.0, 0.0], [0.0, 3.0, 0.0], [0.0, 0.0, 0.0]]);
    let strong = |x, y| Cluster::new(x, y, [[0.0, 0.0, 0.0], [0.0, 6.0, 0.0], [0.0, 0.0, 0.0]]);
    // best 2x2 is 12 against a 10 threshold
    let spread = Cluster::new(4, 4, [[0.0, 0.0, 0.0], [0.0, 4.0, 4.0], [0.0, 4.0, 0.0]]);
    // total is 16.2 against a 15 threshold
    let diffuse = Cluster::new(5, 5, [[1.8; 3]; 3]);
    let records = [
        vec![weak(1), strong(2, 2), weak(3)],
        vec![weak(1), spread, strong(20, 1)],
        vec![diffuse, weak(7), strong(6, 6)],
    ];
    let batches: Vec<ClusterBatch<f64, 3, 3>> = records
        .iter()
        .zip(0..)
        .map(|(clusters, frame)| {
            let mut batch = ClusterBatch::new().with_frame_number(frame);
            for cluster in clusters {
                batch.push(cluster);
            }
            batch
        })
        .collect();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("clusters.bin");
    write_all(&path, &batches);

    let cut = NoiseCut::new(Array2::from_elem((10, 10), 1.0), 5.0);
    assert!(cut.accepts(&strong(2, 2)));
    assert!(!cut.accepts(&weak(1)));
    assert!(!cut.accepts(&strong(20, 1)));
    assert!(!cut.accepts(&strong(-1, 1)));

    let mut reader = ClusterFileReader::<f64, 3, 3>::open(&path)
        .unwrap()
        .with_noise_cut(cut);
    let first = reader.read_clusters(3).unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(first.x(), [2, 4, 5]);
    assert_eq!(first.frame_number(), 2);
    let rest = reader.read_clusters(3).unwrap();
    assert_eq!(rest.x(), [6]);
    assert_eq!(reader.skipped(), 5);
    assert!(reader.read_clusters(3).unwrap().is_empty());
}

#[test]
fn test_file_sink_writes_pipeline_output() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pipeline.bin");

    let mut pipeline = ClusterFinderMt::<u16, i32, 3, 3>::new(
        20,
        20,
        FinderConfig::default(),
        PipelineConfig::new().with_workers(3),
    )
    .unwrap();
    let mut sink = ClusterFileSink::attach(&pipeline, &path).unwrap();
    pipeline.start().unwrap();
    for value in [99u16, 101] {
        pipeline
            .push_pedestal_frame(Array2::from_elem((20, 20), value).view())
            .unwrap();
    }
    pipeline.sync();
    for n in 0..12 {
        let mut frame = Array2::from_elem((20, 20), 100u16);
        frame[[5, 5]] = 400;
        frame[[12, 14]] = 300;
        pipeline.find_clusters(frame.view(), n).unwrap();
    }
    pipeline.stop().unwrap();

    let summary = sink.stop().unwrap();
    assert!(!sink.is_running());
    assert_eq!(summary.frames, 12);
    assert_eq!(summary.clusters, 24);
    assert_eq!(sink.stop().unwrap(), summary);

    let mut reader = ClusterFileReader::<i32, 3, 3>::open(&path).unwrap();
    let mut frames: Vec<i32> = Vec::new();
    for batch in reader.frames() {
        let batch = batch.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.get(0).unwrap().data[1][1], 300);
        frames.push(batch.frame_number());
    }
    frames.sort_unstable();
    assert_eq!(frames, (0..12).collect::<Vec<_>>());
}

#[test]
fn test_eta_cube_json_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cube.json");
    let mut counts = Array3::zeros((2, 3, 2));
    counts[[0, 2, 1]] = 5.0;
    counts[[1, 0, 0]] = 2.5;
    let cube = EtaCube::new(
        counts,
        vec![0.0, 0.5, 1.0],
        vec![-1.0, 0.0, 1.0, 2.0],
        vec![0.0, 10.0, 20.0],
    )
    .unwrap();

    save_eta_cube(&path, &cube).unwrap();
    let loaded = load_eta_cube(&path).unwrap();
    assert_eq!(loaded, cube);

    let interpolator = Interpolator::with_mode(&loaded, CdfMode::Rosenblatt).unwrap();
    assert_relative_eq!(interpolator.cdf_x()[[2, 0, 1]], 1.0);
}
