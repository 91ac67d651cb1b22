use std::io::Write;
use std::sync::Arc;

use dd_compiler::{compile_json, BuildOptions};
use dd_core::{DataSet, DataSetError, DetectionConfig, DeviceDetector, LoadMode};

const SAMPLE: &str = include_str!("../../dd-compiler/tests/data/sample.json");
const IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0) Safari/604.1";

fn compile(name: &str) -> Vec<u8> {
    let json = SAMPLE.replacen("\"name\": \"Sample\"", &format!("\"name\": \"{name}\""), 1);
    compile_json(&json, &BuildOptions::default()).expect("sample should compile")
}

fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(bytes).expect("write data set");
    file.flush().expect("flush data set");
    file
}

#[test]
fn every_load_mode_gives_same_results() {
    let file = write_temp(&compile("Sample"));
    for (mode, kind) in [
        (LoadMode::Memory, "memory"),
        (LoadMode::Mapped, "mapped"),
        (LoadMode::File, "file"),
    ] {
        for cache in [0, 16] {
            let config = DetectionConfig::new()
                .with_mode(mode)
                .with_cache_capacity(cache)
                .with_concurrency(2);
            let data_set = Arc::new(DataSet::from_file(file.path(), config).expect("data set should load"));
            assert_eq!(data_set.source_kind(), kind);

            let results = data_set.process_user_agent(IPHONE);
            assert_eq!(results.device_id(), "2-11-21-30", "{kind} cache {cache}");
            assert_eq!(
                results.value_string("Features", ",").expect("features"),
                "webgl,webp",
                "{kind} cache {cache}"
            );
        }
    }
}

#[test]
fn memory_estimate_depends_on_mode() {
    let bytes = compile("Sample");
    let file = write_temp(&bytes);

    let memory = DataSet::estimate_memory(file.path(), DetectionConfig::new()).expect("estimate");
    let mapped = DataSet::estimate_memory(file.path(), DetectionConfig::new().with_mode(LoadMode::Mapped))
        .expect("estimate");
    let cached = DataSet::estimate_memory(
        file.path(),
        DetectionConfig::new().with_mode(LoadMode::File).with_cache_capacity(100),
    )
    .expect("estimate");
    let uncached = DataSet::estimate_memory(file.path(), DetectionConfig::new().with_mode(LoadMode::File))
        .expect("estimate");

    assert!(memory >= bytes.len());
    assert!(mapped < memory);
    assert!(cached > uncached);
}

#[test]
fn missing_file_is_reported() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("missing.dds");
    let err = DataSet::from_file(&path, DetectionConfig::new()).unwrap_err();
    assert!(matches!(err, DataSetError::FileNotFound(p) if p == path));
}

#[test]
fn reload_keeps_in_flight_results() {
    let detector = DeviceDetector::from_memory(compile("First"), DetectionConfig::new()).expect("load");
    let before = detector.process_user_agent(IPHONE);

    detector.reload_from_memory(compile("Second")).expect("reload");
    assert_eq!(detector.generation(), 1);

    let after = detector.process_user_agent(IPHONE);
    assert_eq!(before.data_set().name(), "First");
    assert_eq!(after.data_set().name(), "Second");
    assert_eq!(before.value_string("HardwareModel", ",").expect("model"), "iPhone");
    assert_eq!(before.device_id(), after.device_id());
}

#[test]
fn failed_reload_keeps_current_data_set() {
    let detector = DeviceDetector::from_memory(compile("First"), DetectionConfig::new()).expect("load");

    let err = detector.reload_from_memory(vec![0; 8]).unwrap_err();
    assert!(matches!(err, DataSetError::DataTooShort));
    assert!(matches!(detector.reload_from_file(), Err(DataSetError::NoReloadSource)));

    assert_eq!(detector.generation(), 0);
    assert_eq!(detector.data_set().name(), "First");
}

#[test]
fn reload_from_file_picks_up_new_contents() {
    let file = write_temp(&compile("First"));
    let detector = DeviceDetector::from_file(file.path(), DetectionConfig::new()).expect("load");
    assert_eq!(detector.data_set().name(), "First");

    std::fs::write(file.path(), compile("Second")).expect("rewrite data set");
    detector.reload_from_file().expect("reload");
    assert_eq!(detector.data_set().name(), "Second");
    assert_eq!(detector.generation(), 1);
}

#[test]
fn concurrent_requests_survive_reloads() {
    let detector = DeviceDetector::from_memory(compile("Gen"), DetectionConfig::new()).expect("load");
    let replacement = compile("Gen");

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..200 {
                    let results = detector.process_user_agent(IPHONE);
                    assert_eq!(results.device_id(), "2-11-21-30");
                    assert_eq!(results.value_string("IsMobile", ",").expect("is mobile"), "True");
                }
            });
        }
        for _ in 0..10 {
            detector.reload_from_memory(replacement.clone()).expect("reload");
            std::thread::yield_now();
        }
    });

    assert_eq!(detector.generation(), 10);
}

#[test]
fn file_mode_serves_concurrent_readers() {
    let file = write_temp(&compile("Pool"));
    let config = DetectionConfig::new().with_mode(LoadMode::File).with_concurrency(2);
    let data_set = Arc::new(DataSet::from_file(file.path(), config).expect("load"));

    std::thread::scope(|scope| {
        for _ in 0..8 {
            let data_set = Arc::clone(&data_set);
            scope.spawn(move || {
                for _ in 0..50 {
                    assert_eq!(data_set.process_user_agent(IPHONE).device_id(), "2-11-21-30");
                }
            });
        }
    });
}
