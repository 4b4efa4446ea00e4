//! End-to-end runs: locator, sampler, controller and real sinks together

mod common;

use common::{process, FakeTable};
use std::path::Path;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::timeout;
use trainwatch::config::{DiscoveryConfig, FlushMode};
use trainwatch::controller::{ControllerSettings, SamplingController};
use trainwatch::export::SOURCE_PREFIX;
use trainwatch::history::{Database, HistorySink};
use trainwatch::locator::ProcessLocator;
use trainwatch::sampler::ProcSampler;
use trainwatch::session::{EndReason, SessionState};
use trainwatch::sink::{Fanout, FileSink};

fn discovery(marker: &Path) -> DiscoveryConfig {
    DiscoveryConfig {
        marker_path: marker.to_path_buf(),
        marker_name_hint: String::new(),
        interpreter_hint: "python".into(),
        script_marker: ".py".into(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_discovered_process_is_logged_to_csv_and_history() {
    let dir = tempdir().unwrap();
    let csv_dir = dir.path().join("csv");
    let db_path = dir.path().join("history.db");

    let table = FakeTable::new();
    table
        .add(process(1, "systemd", "/sbin/init"))
        .add(process(500, "python3", "python3 train.py --epochs 3"));

    let db = Database::open(&db_path).unwrap();
    db.init_schema().unwrap();
    let sinks = Fanout::new().with(FileSink::csv(&csv_dir)).with(HistorySink::new(db));

    let locator = ProcessLocator::new(table.clone(), &discovery(&dir.path().join("no_marker"))).with_self_pid(2);
    let settings = ControllerSettings { mode: FlushMode::Immediate, ..ControllerSettings::default() };
    let (controller, handle) =
        SamplingController::new(settings, locator, ProcSampler::new(table.clone()), sinks);
    let task = tokio::spawn(controller.run());

    let exiting = table.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        exiting.remove(500);
    });

    let snapshot = timeout(Duration::from_secs(60), handle.wait_for(|s| s.state == SessionState::Finished))
        .await
        .expect("session did not finish")
        .unwrap();
    assert_eq!(snapshot.end_reason, Some(EndReason::ProcessExited));
    assert_eq!(snapshot.rows.len(), 3);
    assert!(snapshot.rows.to_vec().iter().all(|r| r.ram_mb == 64.0 && r.cpu_percent == 0.0));
    assert!(snapshot.last_error.is_none());

    handle.shutdown().await.unwrap();
    task.await.unwrap();

    let files: Vec<_> = std::fs::read_dir(&csv_dir).unwrap().flatten().collect();
    assert_eq!(files.len(), 1);
    let text = std::fs::read_to_string(files[0].path()).unwrap();
    assert_eq!(text.lines().count(), 6);
    assert_eq!(
        text.lines().last().unwrap(),
        format!("{},python3: python3 train.py --epochs 3", SOURCE_PREFIX)
    );

    let db = Database::open(&db_path).unwrap();
    let sessions = db.list_sessions(10).unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].row_count, 3);
    assert!(sessions[0].finished_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_marker_handoff_ends_when_marker_is_removed() {
    let dir = tempdir().unwrap();
    let marker = dir.path().join("training_pid.txt");
    std::fs::write(&marker, "4821").unwrap();

    let table = FakeTable::new();
    table
        .add(process(300, "python3", "python3 other.py"))
        .add(process(4821, "MATLAB", "matlab -batch train_model"));

    let locator = ProcessLocator::new(table.clone(), &discovery(&marker)).with_self_pid(2);
    let (controller, handle) = SamplingController::new(
        ControllerSettings::default(),
        locator,
        ProcSampler::new(table.clone()),
        Fanout::new(),
    );
    let task = tokio::spawn(controller.run());

    let removed = marker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        std::fs::remove_file(removed).unwrap();
    });

    let snapshot = timeout(Duration::from_secs(60), handle.wait_for(|s| s.state == SessionState::Finished))
        .await
        .expect("session did not finish")
        .unwrap();
    assert_eq!(snapshot.end_reason, Some(EndReason::MarkerRemoved));
    assert_eq!(snapshot.target.as_ref().map(|t| t.pid), Some(4821));
    assert_eq!(snapshot.rows.len(), 2);
    assert!(snapshot.rows.to_vec().iter().all(|r| r.source == "MATLAB (PID: 4821) CMD: matlab -batch train_model"));

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}
