use super::*;
use std::io::Read;
use std::thread::sleep;
use tempfile::tempdir;

#[test]
fn test_phase_builder_detail() {
    let builder = PhaseBuilder::new("activate")
        .field("stack", "clone")
        .field("regions", 512);
    assert_eq!(builder.detail(), "stack=clone regions=512");
    assert_eq!(PhaseBuilder::new("empty").detail(), "");
}

#[test]
fn test_phase_guard_elapsed() {
    let guard = PhaseBuilder::new("hydrate").enter();
    sleep(Duration::from_millis(5));
    assert!(guard.elapsed() >= Duration::from_millis(5));
    assert_eq!(guard.name(), "hydrate");
}

#[test]
fn test_shared_file_creates_parent() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("dmstack.log");

    let mut writer = SharedFile::open(&path).unwrap();
    let mut second = writer.clone();
    writer.write_all(b"first\n").unwrap();
    second.write_all(b"second\n").unwrap();
    second.flush().unwrap();

    let mut contents = String::new();
    File::open(&path)
        .unwrap()
        .read_to_string(&mut contents)
        .unwrap();
    assert_eq!(contents, "first\nsecond\n");
}

#[test]
fn test_shared_file_appends() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dmstack.log");
    std::fs::write(&path, "old\n").unwrap();

    SharedFile::open(&path).unwrap().write_all(b"new\n").unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "old\nnew\n");
}

#[test]
fn test_file_output_requires_path() {
    let config = LogConfig {
        output: LogOutput::File,
        ..LogConfig::default()
    };
    assert!(matches!(
        init_logging(&config),
        Err(TelemetryError::Logging(_))
    ));
}
