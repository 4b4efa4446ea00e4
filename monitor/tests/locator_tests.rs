mod common;

use common::{process, FakeTable};
use std::path::Path;
use tempfile::tempdir;
use trainwatch::collector::ReadError;
use trainwatch::config::DiscoveryConfig;
use trainwatch::locator::{read_marker, Discovery, Locate, ManualLocator, ProcessLocator};
use trainwatch::session::OriginKind;

const SELF_PID: u32 = 1;

fn discovery(marker: &Path) -> DiscoveryConfig {
    DiscoveryConfig {
        marker_path: marker.to_path_buf(),
        marker_name_hint: String::new(),
        interpreter_hint: "python".into(),
        script_marker: ".py".into(),
    }
}

fn locator(table: &FakeTable, config: &DiscoveryConfig) -> ProcessLocator<FakeTable> {
    ProcessLocator::new(table.clone(), config).with_self_pid(SELF_PID)
}

#[test]
fn test_marker_names_target() {
    let dir = tempdir().unwrap();
    let marker = dir.path().join("training_pid.txt");
    std::fs::write(&marker, "4821\n").unwrap();

    let table = FakeTable::new();
    table
        .add(process(4821, "MATLAB", "matlab -batch train_model"))
        .add(process(300, "python3", "python3 train.py"));

    match locator(&table, &discovery(&marker)).acquire() {
        Discovery::Found(target) => {
            assert_eq!(target.pid, 4821);
            assert_eq!(target.origin, OriginKind::FlagFile);
            assert_eq!(target.label, "MATLAB (PID: 4821) CMD: matlab -batch train_model");
            assert_eq!(target.marker.as_deref(), Some(marker.as_path()));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_unusable_marker_falls_back_to_scan() {
    let dir = tempdir().unwrap();
    let marker = dir.path().join("training_pid.txt");
    let table = FakeTable::new();
    table.add(process(300, "python3", "python3 /home/me/train.py --epochs 3"));
    let config = discovery(&marker);

    for content in ["not a pid", "", "9999"] {
        std::fs::write(&marker, content).unwrap();
        match locator(&table, &config).acquire() {
            Discovery::Found(target) => {
                assert_eq!(target.pid, 300, "marker {:?}", content);
                assert_eq!(target.origin, OriginKind::HeuristicMatch);
                assert_eq!(target.label, "python3: python3 /home/me/train.py --epochs 3");
                assert!(target.marker.is_none());
            }
            other => panic!("unexpected {:?} for marker {:?}", other, content),
        }
    }
}

#[test]
fn test_marker_name_hint_filters_target() {
    let dir = tempdir().unwrap();
    let marker = dir.path().join("training_pid.txt");
    std::fs::write(&marker, "4821").unwrap();

    let table = FakeTable::new();
    table.add(process(4821, "bash", "bash run.sh"));
    let mut config = discovery(&marker);
    config.marker_name_hint = "MATLAB".into();

    assert_eq!(locator(&table, &config).acquire(), Discovery::NotFound { skipped: 0 });

    table.add(process(4821, "MATLAB", "matlab"));
    assert!(matches!(locator(&table, &config).acquire(), Discovery::Found(t) if t.pid == 4821));
}

#[test]
fn test_scan_skips_own_process() {
    let dir = tempdir().unwrap();
    let table = FakeTable::new();
    table
        .add(process(SELF_PID, "python3", "python3 trainwatch.py"))
        .add(process(400, "python3", "python3 fit.py"));

    match locator(&table, &discovery(&dir.path().join("none"))).acquire() {
        Discovery::Found(target) => assert_eq!(target.pid, 400),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_scan_requires_interpreter_and_script() {
    let dir = tempdir().unwrap();
    let table = FakeTable::new();
    table
        .add(process(10, "python3", "python3 -m http.server"))
        .add(process(11, "vim", "vim train.py"))
        .add(process(12, "Python", "Python TRAIN.PY"));

    match locator(&table, &discovery(&dir.path().join("none"))).acquire() {
        Discovery::Found(target) => assert_eq!(target.pid, 12),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_scan_takes_first_match_in_table_order() {
    let dir = tempdir().unwrap();
    let table = FakeTable::new();
    table
        .add(process(50, "python3", "python3 a.py"))
        .add(process(20, "python3", "python3 b.py"));

    match locator(&table, &discovery(&dir.path().join("none"))).acquire() {
        Discovery::Found(target) => assert_eq!(target.pid, 50),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_unreadable_candidates_are_counted() {
    let dir = tempdir().unwrap();
    let table = FakeTable::new();
    table
        .add_error(ReadError::AccessDenied(60))
        .add_error(ReadError::Gone(61))
        .add(process(62, "bash", "bash"));

    let result = locator(&table, &discovery(&dir.path().join("none"))).acquire();
    assert_eq!(result, Discovery::NotFound { skipped: 2 });
}

#[test]
fn test_read_marker() {
    let dir = tempdir().unwrap();
    let marker = dir.path().join("pid.txt");
    assert_eq!(read_marker(&marker).unwrap(), None);

    std::fs::write(&marker, "  77 \n").unwrap();
    assert_eq!(read_marker(&marker).unwrap(), Some(77));

    std::fs::write(&marker, "-3").unwrap();
    assert!(read_marker(&marker).is_err());
}

#[test]
fn test_manual_locator() {
    let table = FakeTable::new();
    table.add(process(900, "julia", "julia train.jl"));

    match ManualLocator::new(table.clone(), 900).acquire() {
        Discovery::Found(target) => {
            assert_eq!(target.origin, OriginKind::Manual);
            assert_eq!(target.label, "julia (PID: 900) CMD: julia train.jl");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(ManualLocator::new(table, 901).acquire(), Discovery::NotFound { skipped: 0 });
}
