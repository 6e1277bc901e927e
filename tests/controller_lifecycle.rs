//! Integration tests for the controller's link, ingestion and session lifecycle
//! against the in-memory rig.

mod common;

use common::{open_rig, settle, test_config, PORT};
use rig_daq::config::RigConfig;
use rig_daq::serial::mock::MockBackend;
use rig_daq::serial::PortListing;
use rig_daq::session::SessionPhase;
use rig_daq::telemetry::Timestamp;
use rig_daq::{RigController, RigError};
use serde_json::json;
use std::sync::Arc;
use tracing_test::traced_test;

#[tokio::test(start_paused = true)]
async fn test_events_classified_in_arrival_order() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, _backend, mut device) = open_rig(dir.path()).await;
    controller.start().await.unwrap();
    device.expect_line("START-PROGRAM").await;

    device.send_line("LH_LEVER,ACTIVE_PRESS,100,150");
    device.send_raw(b"FRAME,110\nPUMP,INFUSION,120,_\n");
    device.send_line("FRAME,140");
    device.send_line("LICK_CIRCUIT,LICK,150,155");
    settle().await;

    let events = controller.get_events().await;
    let summary: Vec<_> = events
        .iter()
        .map(|e| (e.component.as_str(), e.action.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("LH_LEVER", "ACTIVE_PRESS"),
            ("PUMP", "INFUSION"),
            ("LICK_CIRCUIT", "LICK"),
        ]
    );
    assert_eq!(events[0].start_timestamp, Timestamp::Tick(100));
    assert_eq!(events[1].end_timestamp, Timestamp::Unset);

    let frames: Vec<_> = controller
        .get_frames()
        .await
        .into_iter()
        .map(|f| f.timestamp)
        .collect();
    assert_eq!(frames, vec!["110", "140"]);

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_malformed_lines_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, _backend, mut device) = open_rig(dir.path()).await;
    controller.start().await.unwrap();
    device.expect_line("START-PROGRAM").await;

    for line in ["READY", "CUE,ON,130", "A,B,C,D,E", "1,2,3,4,5,6", "LH_LEVER,PRESS,soon,_"] {
        device.send_line(line);
    }
    device.send_line("FRAME,1");
    settle().await;

    assert!(controller.get_events().await.is_empty());
    assert_eq!(controller.get_frames().await.len(), 1);
    assert!(controller.is_running());
    assert!(logs_contain("Dropping unrecognized telemetry line"));

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_configuration_is_replaced_wholesale() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, _backend, mut device) = open_rig(dir.path()).await;
    controller.start().await.unwrap();
    device.expect_line("START-PROGRAM").await;

    device.send_line(r#"{"ratio": 5, "timeout_ms": 20000}"#);
    settle().await;
    assert_eq!(controller.get_configuration().await["ratio"], json!(5));

    device.send_line(r#"{"ratio": 10}"#);
    settle().await;
    let configuration = controller.get_configuration().await;
    assert_eq!(configuration["ratio"], json!(10));
    assert!(!configuration.contains_key("timeout_ms"));

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_lines_ignored_unless_running() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, _backend, mut device) = open_rig(dir.path()).await;

    // Idle
    device.send_line("LH_LEVER,ACTIVE_PRESS,1,2");
    settle().await;
    assert!(controller.get_events().await.is_empty());

    controller.start().await.unwrap();
    device.expect_line("START-PROGRAM").await;
    controller.pause().unwrap();
    device.send_line("LH_LEVER,ACTIVE_PRESS,3,4");
    settle().await;
    assert!(controller.get_events().await.is_empty());

    controller.resume().unwrap();
    device.send_line("LH_LEVER,ACTIVE_PRESS,5,6");
    settle().await;
    let events = controller.get_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].start_timestamp, Timestamp::Tick(5));

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_handshake_discards_stale_input() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::with_ports([PORT]);
    backend.preload(PORT, b"PUMP,INFUSION,1,2\nboot noise\n");

    let controller = RigController::with_backend(test_config(dir.path()), Arc::new(backend.clone()));
    controller.set_port(PORT).unwrap();
    controller.open().await.unwrap();
    controller.start().await.unwrap();

    let mut device = backend.take_device(PORT).unwrap();
    device.expect_line("LINK").await;
    device.expect_line("START-PROGRAM").await;
    device.send_line("PUMP,INFUSION,50,_");
    settle().await;

    let events = controller.get_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].start_timestamp, Timestamp::Tick(50));

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_close_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, _backend, mut device) = open_rig(dir.path()).await;

    controller.close().await;
    controller.close().await;

    assert_eq!(device.written_lines(), vec!["UNLINK"]);
    assert!(matches!(
        controller.send_command("ARM_LEVER_RH").await,
        Err(RigError::PortNotOpen)
    ));

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reopen_closes_previous_link() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, backend, mut first) = open_rig(dir.path()).await;

    controller.open().await.unwrap();
    assert_eq!(first.written_lines(), vec!["UNLINK"]);

    let mut second = backend.take_device(PORT).unwrap();
    second.expect_line("LINK").await;
    assert_eq!(backend.open_count(PORT), 2);

    controller.send_command("SET_RATIO:4").await.unwrap();
    second.expect_line("SET_RATIO:4").await;

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_signals_rig_and_closes_link() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, _backend, mut device) = open_rig(dir.path()).await;

    controller.start().await.unwrap();
    assert_eq!(controller.phase(), SessionPhase::Running);
    assert!(controller.get_start_time().is_some());
    assert!(controller.get_end_time().is_none());

    controller.stop().await.unwrap();
    assert_eq!(controller.phase(), SessionPhase::Stopped);
    assert!(!controller.is_running());
    assert!(controller.get_end_time().is_some());
    assert_eq!(
        device.written_lines(),
        vec!["START-PROGRAM", "END-PROGRAM", "UNLINK"]
    );

    // A second stop has nothing left to do
    controller.stop().await.unwrap();
    assert!(device.written_lines().is_empty());

    // The link is gone, so a new session needs a new open
    assert!(matches!(controller.start().await, Err(RigError::PortNotOpen)));
    assert_eq!(controller.phase(), SessionPhase::Stopped);

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_when_idle_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, _backend, mut device) = open_rig(dir.path()).await;

    controller.stop().await.unwrap();
    assert_eq!(controller.phase(), SessionPhase::Idle);
    assert!(device.written_lines().is_empty());

    // Link untouched
    controller.send_command("LASER_TEST").await.unwrap();
    device.expect_line("LASER_TEST").await;

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_invalid_transitions_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, _backend, mut device) = open_rig(dir.path()).await;

    assert!(matches!(
        controller.pause(),
        Err(RigError::InvalidTransition { phase: SessionPhase::Idle, .. })
    ));
    assert!(controller.resume().is_err());

    controller.start().await.unwrap();
    device.expect_line("START-PROGRAM").await;
    assert!(matches!(
        controller.start().await,
        Err(RigError::InvalidTransition { phase: SessionPhase::Running, .. })
    ));
    // Rejected starts send nothing
    assert!(device.written_lines().is_empty());

    assert!(controller.resume().is_err());
    controller.pause().unwrap();
    assert!(controller.pause().is_err());
    assert!(controller.set_limits("Time", None, Some(60), None).is_err());

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_setup_errors_reach_caller() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::with_ports([PORT]);
    let controller = RigController::with_backend(test_config(dir.path()), Arc::new(backend.clone()));

    assert!(matches!(controller.open().await, Err(RigError::PortNotSelected)));
    assert!(matches!(
        controller.set_port("/dev/ttyNOPE"),
        Err(RigError::PortUnavailable(port)) if port == "/dev/ttyNOPE"
    ));
    assert!(matches!(
        controller.send_command("ARM_LEVER_RH").await,
        Err(RigError::PortNotOpen)
    ));
    assert!(matches!(controller.start().await, Err(RigError::PortNotOpen)));
    assert_eq!(controller.phase(), SessionPhase::Idle);
    assert!(matches!(
        controller.set_limits("Forever", None, None, None),
        Err(RigError::InvalidLimitKind(_))
    ));

    // Unplugged after selection
    controller.set_port(PORT).unwrap();
    backend.detach(PORT);
    assert!(matches!(controller.open().await, Err(RigError::PortUnavailable(_))));

    controller.shutdown().await;
}

#[tokio::test]
async fn test_no_ports_is_distinguished() {
    let controller = RigController::with_backend(
        test_config(std::env::temp_dir().as_path()),
        Arc::new(MockBackend::default()),
    );
    assert_eq!(controller.list_ports().unwrap(), PortListing::NoPorts);

    let backend = MockBackend::with_ports(["/dev/ttyACM0", "/dev/ttyACM1"]);
    let controller = RigController::with_backend(RigConfig::default(), Arc::new(backend));
    assert_eq!(
        controller.list_ports().unwrap(),
        PortListing::Available(vec!["/dev/ttyACM0".into(), "/dev/ttyACM1".into()])
    );
}

#[tokio::test(start_paused = true)]
async fn test_session_writes_event_logs_to_data_folder() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, _backend, mut device) = open_rig(dir.path()).await;

    controller.set_filename("rat_7");
    let folder = controller.make_destination_folder().unwrap();
    assert_eq!(folder, dir.path().join("DATA").join("rat_7"));
    assert_eq!(controller.get_log_destination(), folder);

    controller.start().await.unwrap();
    device.expect_line("START-PROGRAM").await;
    device.send_line("PUMP,INFUSION,1000,_");
    device.send_line("FRAME,1010");
    settle().await;
    controller.stop().await.unwrap();

    let mut behavior = None;
    let mut frames = None;
    for entry in std::fs::read_dir(&folder).unwrap() {
        let path = entry.unwrap().path();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        if name.ends_with("-behavior.csv") {
            behavior = Some(std::fs::read_to_string(&path).unwrap());
        } else if name.ends_with("-frames.csv") {
            frames = Some(std::fs::read_to_string(&path).unwrap());
        }
    }
    assert_eq!(
        behavior.expect("behavior log written"),
        "Component,Action,Start Timestamp,End Timestamp\nPUMP,INFUSION,1000,_\n"
    );
    assert_eq!(frames.expect("frame log written"), "Frame Timestamp\n1010\n");

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reset_restores_initial_state() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, _backend, mut device) = open_rig(dir.path()).await;

    controller.set_limits("Infusion", Some(10), None, Some(5)).unwrap();
    controller.set_filename("mouse_3");
    controller.start().await.unwrap();
    device.expect_line("START-PROGRAM").await;
    device.send_line("LH_LEVER,ACTIVE_PRESS,1,2");
    device.send_line(r#"{"ratio": 1}"#);
    settle().await;
    assert_eq!(controller.get_events().await.len(), 1);

    controller.reset().await;

    assert_eq!(controller.phase(), SessionPhase::Idle);
    assert!(controller.get_events().await.is_empty());
    assert!(controller.get_frames().await.is_empty());
    assert!(controller.get_configuration().await.is_empty());
    assert!(controller.get_start_time().is_none());
    assert!(controller.get_filename().is_none());
    assert!(controller.get_port().is_none());
    assert_eq!(controller.get_limits(), Default::default());
    assert_eq!(
        device.written_lines(),
        vec!["END-PROGRAM", "UNLINK"]
    );

    controller.shutdown().await;
}
