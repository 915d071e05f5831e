use multidisplay_core::config::EngineConfig;
use multidisplay_core::datalog::{
    encode_capture, parse_capture, CaptureError, CaptureWarning, DataStore, LogFormat,
};
use multidisplay_core::demo::DemoSimulator;
use multidisplay_core::engine::Engine;
use multidisplay_core::sink::{EngineEvent, Origin};
use multidisplay_core::protocol::{DataSample, DecodeError, CHANNELS};
use pretty_assertions::assert_eq;
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn demo_store(count: usize) -> DataStore {
    let store = DataStore::new();
    for sample in DemoSimulator::seeded(5).generate(count, 25) {
        store.append(sample);
    }
    store
}

fn values(store: &DataStore) -> Vec<DataSample> {
    store.snapshot().iter().map(|s| DataSample::clone(s)).collect()
}

#[test]
fn test_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.mdv2");

    let original = demo_store(300);
    original.save(&path).unwrap();
    assert_eq!(LogFormat::from_extension(&path), Some(LogFormat::Capture));

    let loaded = DataStore::new();
    let report = loaded.load(&path).unwrap();

    assert_eq!(report.samples, 300);
    assert!(report.warnings.is_empty());
    assert_eq!(values(&loaded), values(&original));
    assert_eq!(loaded.viewport().size, 100);
}

#[test]
fn test_save_refuses_samples_that_would_not_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.mdv2");

    let store = DataStore::new();
    let mut over_rev = DataSample::from_raw(0, &[]);
    over_rev.values[0] = 20000.0;
    store.append(over_rev);
    store.append(DataSample::from_raw(100, &[3000]));

    assert!(matches!(
        store.save(&path),
        Err(CaptureError::Unrepresentable {
            index: 0,
            source: DecodeError::OutOfRange { field: "rpm", .. },
        })
    ));
    assert!(!path.exists());
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

    // Once the data set is valid, everything comes back
    store.clear();
    store.append(DataSample::from_raw(0, &[12000]));
    store.append(DataSample::from_raw(100, &[3000]));
    store.save(&path).unwrap();

    let loaded = DataStore::new();
    let report = loaded.load(&path).unwrap();
    assert_eq!(report.samples, 2);
    assert!(report.warnings.is_empty());
    assert_eq!(values(&loaded), values(&store));
}

#[test]
fn test_truncated_capture_keeps_complete_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cut.mdv2");

    let original = demo_store(50);
    original.save(&path).unwrap();

    let mut bytes = fs::read(&path).unwrap();
    bytes.truncate(bytes.len() - 10);
    fs::write(&path, &bytes).unwrap();

    let store = DataStore::new();
    let report = store.load(&path).unwrap();

    assert_eq!(report.samples, 49);
    assert!(report
        .warnings
        .iter()
        .any(|w| matches!(w, CaptureWarning::TruncatedTail { .. })));
    assert_eq!(values(&store), values(&original)[..49].to_vec());
}

#[test]
fn test_failed_load_leaves_data_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let store = demo_store(20);
    let before = values(&store);

    let missing = dir.path().join("missing.mdv2");
    assert!(matches!(store.load(&missing), Err(CaptureError::Io(_))));

    let garbage = dir.path().join("garbage.mdv2");
    fs::write(&garbage, b"definitely not a capture").unwrap();
    assert!(matches!(store.load(&garbage), Err(CaptureError::BadMagic)));

    let cut_header = dir.path().join("header.mdv2");
    let mut bytes = Vec::new();
    encode_capture(&mut bytes, &[]).unwrap();
    fs::write(&cut_header, &bytes[..bytes.len() - 3]).unwrap();
    assert!(matches!(
        store.load(&cut_header),
        Err(CaptureError::TruncatedHeader)
    ));

    assert_eq!(values(&store), before);
}

#[test]
fn test_corrupt_frame_in_body_is_skipped() {
    // All-zero channels keep stray start delimiters out of the frames
    let samples: Vec<_> = [0, 100, 200]
        .into_iter()
        .map(|ts| Arc::new(DataSample::from_raw(ts, &[])))
        .collect();

    let mut bytes = Vec::new();
    encode_capture(&mut bytes, &samples).unwrap();

    // Flip the CRC of the middle frame. Header length is fixed for the channel table.
    let frame_len = (bytes.len() - header_len()) / 3;
    let crc_at = header_len() + frame_len + frame_len - 3;
    bytes[crc_at] ^= 0x01;

    let capture = parse_capture(&bytes).unwrap();
    let timestamps: Vec<u32> = capture.samples.iter().map(|s| s.timestamp_ms).collect();
    assert_eq!(timestamps, vec![0, 200]);
    assert!(matches!(
        capture.warnings.as_slice(),
        [CaptureWarning::CorruptFrames { frames: 1, .. }]
    ));
}

fn header_len() -> usize {
    4 + 2 + 8 + 2 + CHANNELS.iter().map(|c| 2 + c.name.len()).sum::<usize>()
}

#[test]
fn test_csv_export() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.csv");

    let store = DataStore::new();
    store.append(DataSample::from_raw(1500, &[2500, -250]));
    store.export_csv(&path).unwrap();

    let csv = fs::read_to_string(&path).unwrap();
    let mut lines = csv.lines();
    let header = lines.next().unwrap();
    assert!(header.starts_with("Time,rpm,boost,throttle"));
    assert_eq!(header.split(',').count(), CHANNELS.len() + 1);

    let row = lines.next().unwrap();
    assert!(row.starts_with("1.500,2500,-0.250,0.0"), "row: {}", row);
    assert!(lines.next().is_none());
}

#[test]
fn test_engine_default_capture_name() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        capture_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let engine = Engine::new(config);
    engine.store().append(DataSample::from_raw(0, &[]));

    let path = engine.save_capture_default().unwrap();
    assert_eq!(path.parent(), Some(dir.path()));
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("mdv2"));
    // YYYY-MM-DDTHHMM
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap();
    assert_eq!(stem.len(), 15);
    assert_eq!(&stem[10..11], "T");
    assert!(Path::new(&path).exists());
}

#[test]
fn test_engine_open_capture() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.mdv2");
    demo_store(120).save(&path).unwrap();

    let mut engine = Engine::new(EngineConfig::default());
    let report = engine.open_capture(&path).unwrap();
    assert_eq!(report.samples, 120);
    assert_eq!(engine.store().sample_count(), 120);
}

#[test]
fn test_engine_reports_capture_warnings() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cut.mdv2");
    demo_store(10).save(&path).unwrap();
    let mut bytes = fs::read(&path).unwrap();
    bytes.truncate(bytes.len() - 4);
    fs::write(&path, &bytes).unwrap();

    let mut engine = Engine::new(EngineConfig::default());
    let mut events = engine.subscribe();
    engine.open_capture(&path).unwrap();

    let warnings: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|event| match event {
            EngineEvent::Warning { origin, message } => Some((origin, message)),
            _ => None,
        })
        .collect();
    assert!(!warnings.is_empty());
    assert!(warnings.iter().all(|(origin, _)| *origin == Origin::Capture));
    assert!(warnings.iter().any(|(_, message)| message.contains("incomplete")));
}
