//! Shared fixtures for controller integration tests.

#![allow(dead_code)]

use rig_daq::config::RigConfig;
use rig_daq::serial::mock::{MockBackend, MockDevice};
use rig_daq::RigController;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const PORT: &str = "/dev/ttyMOCK0";

/// Defaults without settle delays, with all files under `dir`.
pub fn test_config(dir: &Path) -> RigConfig {
    let mut config = RigConfig::default().without_settle_delays();
    config.storage.data_dir = dir.join("DATA");
    config.storage.log_dir = dir.join("LOG");
    config
}

/// A controller wired to a mock rig on [`PORT`], link open and handshake consumed.
pub async fn open_rig(dir: &Path) -> (RigController, MockBackend, MockDevice) {
    let backend = MockBackend::with_ports([PORT]);
    let controller = RigController::with_backend(test_config(dir), Arc::new(backend.clone()));
    controller.set_port(PORT).expect("port should be listed");
    controller.open().await.expect("open should succeed");

    let mut device = backend.take_device(PORT).expect("device for open port");
    device.expect_line("LINK").await;
    (controller, backend, device)
}

/// Let the reader and consumer tasks catch up.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

pub async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
