//! The device-session controller.
//!
//! [`RigController`] owns everything about one rig: the serial link and its
//! ingestion workers, the received events and configuration, the session
//! state machine and the limit monitor. It is cheap to clone; every clone
//! drives the same rig.
//!
//! # Locking
//!
//! | Lock                         | Guards                                                     |
//! |------------------------------|------------------------------------------------------------|
//! | `link` (tokio)               | open/close lifecycle and the worker handles                 |
//! | `shared` (tokio)             | link write half, configuration, events, frames, event log  |
//! | `session` (parking_lot)      | phase, clock, limits; never held across an await           |
//!
//! `link` is always taken before `shared`. The queue consumer only ever takes
//! `shared`, so joining it while holding `link` cannot deadlock.

use crate::config::RigConfig;
use crate::error::{AppResult, RigError};
use crate::link::{write_line, LineHandler, LinkTiming, LinkWorkers};
use crate::serial::{DynLink, PortDescriptor, PortListing, SerialBackend, SystemSerial};
use crate::session::{LimitDecision, LimitKind, Session, SessionLimits, SessionPhase};
use crate::storage::{self, FileSettings, SessionLog};
use crate::telemetry::{self, BehaviorEvent, FrameEvent, Telemetry};
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Handshake sent after opening the link.
pub const LINK_COMMAND: &str = "LINK";
/// Sent before the link is closed.
pub const UNLINK_COMMAND: &str = "UNLINK";
/// Tells the rig to begin its behavioral program.
pub const START_COMMAND: &str = "START-PROGRAM";
/// Tells the rig to end its behavioral program.
pub const END_COMMAND: &str = "END-PROGRAM";

/// State guarded by the shared lock.
#[derive(Default)]
struct Shared {
    writer: Option<WriteHalf<DynLink>>,
    configuration: Map<String, Value>,
    events: Vec<BehaviorEvent>,
    /// Index of the first event of the current session
    session_events_from: usize,
    frames: Vec<FrameEvent>,
    event_log: Option<SessionLog>,
}

struct Inner {
    config: RigConfig,
    backend: Arc<dyn SerialBackend>,
    port: parking_lot::Mutex<Option<String>>,
    link: Mutex<Option<LinkWorkers>>,
    shared: Mutex<Shared>,
    session: parking_lot::Mutex<Session>,
    files: parking_lot::Mutex<FileSettings>,
    lifetime: watch::Sender<bool>,
}

/// Controller for a single behavioral rig.
///
/// Must be created inside a tokio runtime: the limit monitor is spawned on
/// construction and runs until [`shutdown`](Self::shutdown) or until the
/// last clone is dropped.
#[derive(Clone)]
pub struct RigController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RigController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RigController")
            .field("port", &*self.inner.port.lock())
            .field("phase", &self.phase())
            .finish()
    }
}

impl RigController {
    /// Controller for real serial hardware.
    pub fn new(config: RigConfig) -> Self {
        Self::with_backend(config, Arc::new(SystemSerial))
    }

    /// Controller driving ports through `backend`, e.g. a [`MockBackend`](crate::serial::mock::MockBackend).
    pub fn with_backend(config: RigConfig, backend: Arc<dyn SerialBackend>) -> Self {
        let (lifetime, lifetime_rx) = watch::channel(false);
        let monitor_interval = config.session.monitor_interval();

        let inner = Arc::new(Inner {
            config,
            backend,
            port: parking_lot::Mutex::new(None),
            link: Mutex::new(None),
            shared: Mutex::new(Shared::default()),
            session: parking_lot::Mutex::new(Session::default()),
            files: parking_lot::Mutex::new(FileSettings::default()),
            lifetime,
        });

        tokio::spawn(monitor_loop(
            Arc::downgrade(&inner),
            lifetime_rx,
            monitor_interval,
        ));

        Self { inner }
    }

    /// Configuration the controller was built with.
    pub fn config(&self) -> &RigConfig {
        &self.inner.config
    }

    // =========================================================================
    // Port and link
    // =========================================================================

    /// Attached, hardware-identified serial devices with their USB ids.
    pub fn list_devices(&self) -> AppResult<Vec<PortDescriptor>> {
        self.inner.backend.available_ports()
    }

    /// Names of the attached, hardware-identified serial devices.
    pub fn list_ports(&self) -> AppResult<PortListing> {
        let names = self
            .list_devices()?
            .into_iter()
            .map(|port| port.name)
            .collect();
        Ok(PortListing::from_names(names))
    }

    /// Select the port used by [`open`](Self::open).
    pub fn set_port(&self, port: &str) -> AppResult<()> {
        if !self.list_ports()?.contains(port) {
            return Err(RigError::PortUnavailable(port.to_string()));
        }
        *self.inner.port.lock() = Some(port.to_string());
        info!(port, "Serial port selected");
        Ok(())
    }

    /// The selected port, if any.
    pub fn get_port(&self) -> Option<String> {
        self.inner.port.lock().clone()
    }

    /// Open the selected port, handshake, and start the ingestion workers.
    ///
    /// An already-open link is closed first.
    pub async fn open(&self) -> AppResult<()> {
        let port = self.get_port().ok_or(RigError::PortNotSelected)?;
        if !self.list_ports()?.contains(&port) {
            return Err(RigError::PortUnavailable(port));
        }

        let serial = &self.inner.config.serial;
        let mut link = self.inner.link.lock().await;
        if link.is_some() {
            self.close_locked(&mut link).await;
            tokio::time::sleep(serial.reopen_settle()).await;
        }

        let mut stream = self.inner.backend.open(&port, serial.baud_rate).await?;
        // The board resets when the port opens; give it time to boot
        tokio::time::sleep(serial.handshake_settle()).await;

        timeout(serial.io_timeout(), write_line(&mut stream, LINK_COMMAND))
            .await
            .map_err(|_| timed_out(LINK_COMMAND))??;
        stream.clear_input()?;

        let (read_half, write_half) = tokio::io::split(stream);
        self.inner.shared.lock().await.writer = Some(write_half);

        let timing = LinkTiming {
            read_retry: serial.read_retry(),
            queue_poll: self.inner.config.session.queue_poll(),
        };
        *link = Some(LinkWorkers::spawn(read_half, self.inner.clone(), timing));

        info!(port = %port, baud_rate = serial.baud_rate, "Serial link established");
        Ok(())
    }

    /// Close the link. Idempotent; teardown errors are logged, never returned.
    pub async fn close(&self) {
        let mut link = self.inner.link.lock().await;
        self.close_locked(&mut link).await;
    }

    async fn close_locked(&self, link: &mut Option<LinkWorkers>) {
        let Some(workers) = link.take() else {
            debug!("Serial link already closed");
            return;
        };

        let serial = &self.inner.config.serial;
        let writer = self.inner.shared.lock().await.writer.take();
        if let Some(mut writer) = writer {
            match timeout(serial.io_timeout(), write_line(&mut writer, UNLINK_COMMAND)).await {
                Ok(Ok(())) => debug!("UNLINK sent"),
                Ok(Err(e)) => warn!(error = %e, "Failed to send UNLINK"),
                Err(_) => warn!("Timed out sending UNLINK"),
            }
            tokio::time::sleep(serial.unlink_grace()).await;
            match timeout(serial.io_timeout(), writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Error while closing serial port"),
                Err(_) => warn!("Timed out closing serial port"),
            }
        }

        workers.shutdown(self.inner.config.session.join_timeout()).await;
        info!("Serial port closed");
    }

    /// Send an opaque command line to the rig.
    pub async fn send_command(&self, command: &str) -> AppResult<()> {
        let mut shared = self.inner.shared.lock().await;
        self.transmit(&mut shared, command).await
    }

    async fn transmit(&self, shared: &mut Shared, command: &str) -> AppResult<()> {
        let writer = shared.writer.as_mut().ok_or(RigError::PortNotOpen)?;
        timeout(
            self.inner.config.serial.io_timeout(),
            write_line(writer, command),
        )
        .await
        .map_err(|_| timed_out(command))??;
        debug!(command, "Command sent");
        Ok(())
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Configure stop conditions. Times are in seconds.
    ///
    /// Only allowed while no session is in progress.
    pub fn set_limits(
        &self,
        kind: &str,
        infusion_limit: Option<u32>,
        time_limit: Option<u64>,
        stop_delay: Option<u64>,
    ) -> AppResult<()> {
        let kind: LimitKind = kind.parse()?;
        let mut session = self.inner.session.lock();
        session.ensure_can_start().map_err(|_| RigError::InvalidTransition {
            operation: "set limits",
            phase: session.phase(),
        })?;
        session.set_limits(SessionLimits {
            kind,
            infusion_limit,
            time_limit: time_limit.map(Duration::from_secs),
            stop_delay: stop_delay.map(Duration::from_secs),
        });
        info!(?kind, ?infusion_limit, ?time_limit, ?stop_delay, "Session limits set");
        Ok(())
    }

    /// Stop conditions for the next or current session.
    pub fn get_limits(&self) -> SessionLimits {
        self.inner.session.lock().limits().clone()
    }

    /// Open the event log, signal the rig and start the session clock.
    pub async fn start(&self) -> AppResult<()> {
        self.inner.session.lock().ensure_can_start()?;

        let mut shared = self.inner.shared.lock().await;
        if shared.writer.is_none() {
            return Err(RigError::PortNotOpen);
        }

        let log_dir = self
            .inner
            .files
            .lock()
            .log_destination_or(&self.inner.config.storage.log_dir);
        let event_log = SessionLog::create(log_dir, storage::stamp(Local::now())).await?;

        // Running before the command goes out, so the first replies are kept
        let previous = {
            let mut session = self.inner.session.lock();
            let previous = session.clone();
            session.start(Instant::now(), Utc::now())?;
            previous
        };
        if let Err(e) = self.transmit(&mut shared, START_COMMAND).await {
            *self.inner.session.lock() = previous;
            return Err(e);
        }
        shared.event_log = Some(event_log);
        shared.session_events_from = shared.events.len();

        info!("Program started");
        Ok(())
    }

    /// End the session: signal the rig, drain pending telemetry, close the link.
    ///
    /// A no-op when no session is running or another stop is in progress.
    pub async fn stop(&self) -> AppResult<()> {
        if !self.inner.session.lock().begin_stop(Instant::now()) {
            debug!("Stop requested with no session in progress");
            return Ok(());
        }
        info!("Ending program");

        if let Err(e) = self.send_command(END_COMMAND).await {
            warn!(error = %e, "Failed to send END-PROGRAM");
        }

        {
            let mut link = self.inner.link.lock().await;
            if let Some(workers) = link.as_mut() {
                workers
                    .drain(self.inner.config.session.join_timeout())
                    .await;
            }
            self.close_locked(&mut link).await;
        }

        self.inner.shared.lock().await.event_log = None;
        self.inner.session.lock().finish_stop(Utc::now());
        info!("Program ended");
        Ok(())
    }

    /// Pause the session clock. Telemetry keeps being collected.
    pub fn pause(&self) -> AppResult<()> {
        self.inner.session.lock().pause(Instant::now())?;
        info!("Program paused");
        Ok(())
    }

    /// Resume a paused session.
    pub fn resume(&self) -> AppResult<()> {
        self.inner.session.lock().resume(Instant::now())?;
        info!("Program resumed");
        Ok(())
    }

    /// `true` only while running and not paused.
    pub fn is_running(&self) -> bool {
        self.inner.session.lock().is_running()
    }

    /// Current session phase.
    pub fn phase(&self) -> SessionPhase {
        self.inner.session.lock().phase()
    }

    /// Running time of the current session, net of pauses.
    pub fn elapsed(&self) -> Duration {
        self.inner.session.lock().clock().elapsed(Instant::now())
    }

    /// Wall-clock start of the latest session.
    pub fn get_start_time(&self) -> Option<DateTime<Utc>> {
        self.inner.session.lock().clock().started_at()
    }

    /// Wall-clock end of the latest session, once stopped.
    pub fn get_end_time(&self) -> Option<DateTime<Utc>> {
        self.inner.session.lock().clock().ended_at()
    }

    async fn enforce_limits(&self) {
        if !self.is_running() {
            return;
        }
        let infusions = {
            let shared = self.inner.shared.lock().await;
            shared
                .events
                .iter()
                .skip(shared.session_events_from)
                .filter(|event| event.is_infusion())
                .count()
        };

        let decision = self
            .inner
            .session
            .lock()
            .check_limits(Instant::now(), infusions);
        if let LimitDecision::Stop(reason) = decision {
            info!(%reason, "Session limit met, stopping program");
            if let Err(e) = self.stop().await {
                warn!(error = %e, "Automatic stop failed");
            }
        }
    }

    // =========================================================================
    // Collected data
    // =========================================================================

    /// Behavior events in arrival order.
    pub async fn get_events(&self) -> Vec<BehaviorEvent> {
        self.inner.shared.lock().await.events.clone()
    }

    /// Imaging-frame events in arrival order.
    pub async fn get_frames(&self) -> Vec<FrameEvent> {
        self.inner.shared.lock().await.frames.clone()
    }

    /// Last configuration document the rig reported.
    pub async fn get_configuration(&self) -> Map<String, Value> {
        self.inner.shared.lock().await.configuration.clone()
    }

    // =========================================================================
    // Files
    // =========================================================================

    /// Set the data filename; `.csv` is appended if missing.
    pub fn set_filename(&self, name: &str) {
        self.inner.files.lock().set_filename(name);
    }

    /// The data filename, if set.
    pub fn get_filename(&self) -> Option<String> {
        self.inner.files.lock().filename().map(str::to_string)
    }

    /// Set the root directory for data folders.
    pub fn set_destination(&self, path: impl Into<PathBuf>) {
        self.inner.files.lock().set_destination(path);
    }

    /// The data root, if set.
    pub fn get_destination(&self) -> Option<PathBuf> {
        self.inner.files.lock().destination().map(|p| p.to_path_buf())
    }

    /// Directory for the event logs of sessions started from now on.
    pub fn set_log_destination(&self, path: impl Into<PathBuf>) {
        self.inner.files.lock().set_log_destination(path);
    }

    /// Directory the next session's event logs go to.
    pub fn get_log_destination(&self) -> PathBuf {
        self.inner
            .files
            .lock()
            .log_destination_or(&self.inner.config.storage.log_dir)
    }

    /// Create the data folder for the current filename and redirect event logs into it.
    pub fn make_destination_folder(&self) -> AppResult<PathBuf> {
        self.inner
            .files
            .lock()
            .make_destination_folder(&self.inner.config.storage.data_dir, Local::now())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stop any session, close the link and forget everything collected.
    ///
    /// The limit monitor keeps running.
    pub async fn reset(&self) {
        info!("Resetting controller");
        if let Err(e) = self.stop().await {
            warn!(error = %e, "Stop during reset failed");
        }
        self.close().await;

        *self.inner.shared.lock().await = Shared::default();
        *self.inner.session.lock() = Session::default();
        *self.inner.files.lock() = FileSettings::default();
        *self.inner.port.lock() = None;
        info!("Controller reset complete");
    }

    /// Stop any session, close the link and end the limit monitor.
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop().await {
            warn!(error = %e, "Stop during shutdown failed");
        }
        self.close().await;
        let _ = self.inner.lifetime.send(true);
        info!("Controller shut down");
    }
}

fn timed_out(command: &str) -> RigError {
    RigError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("timed out writing '{command}'"),
    ))
}

impl Inner {
    /// Handle to the open event log, taken without holding the lock during writes.
    async fn session_log(&self) -> Option<SessionLog> {
        self.shared.lock().await.event_log.clone()
    }
}

#[async_trait]
impl LineHandler for Inner {
    fn accepting(&self) -> bool {
        // Stopping still drains what the rig sent before END-PROGRAM
        matches!(
            self.session.lock().phase(),
            SessionPhase::Running | SessionPhase::Stopping
        )
    }

    async fn handle_line(&self, line: &str) {
        match telemetry::classify(line) {
            Ok(Telemetry::Configuration(document)) => {
                debug!(keys = document.len(), "Rig configuration updated");
                self.shared.lock().await.configuration = document;
            }
            Ok(Telemetry::Behavior(event)) => {
                debug!(component = %event.component, action = %event.action, "Behavior event");
                if let Some(log) = self.session_log().await {
                    if let Err(e) = log.append_behavior(event.clone()).await {
                        warn!(error = %e, "Failed to persist behavior event");
                    }
                }
                self.shared.lock().await.events.push(event);
            }
            Ok(Telemetry::Frame(frame)) => {
                debug!(timestamp = %frame.timestamp, "Frame event");
                if let Some(log) = self.session_log().await {
                    if let Err(e) = log.append_frame(frame.clone()).await {
                        warn!(error = %e, "Failed to persist frame event");
                    }
                }
                self.shared.lock().await.frames.push(frame);
            }
            Err(reason) => debug!(line, %reason, "Dropping unrecognized telemetry line"),
        }
    }
}

async fn monitor_loop(inner: Weak<Inner>, mut lifetime: watch::Receiver<bool>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = lifetime.changed() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        RigController { inner }.enforce_limits().await;
    }
    debug!("Limit monitor stopped");
}
