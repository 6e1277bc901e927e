//! Durable event logs and data-folder management.
//!
//! Each session appends to two CSV files in the log directory:
//!
//! - `log-<stamp>-behavior.csv` with header `Component,Action,Start Timestamp,End Timestamp`
//! - `log-<stamp>-frames.csv` with header `Frame Timestamp`
//!
//! Files are opened in append mode and every row is flushed before the
//! append returns, so a crash loses at most the row being written.
//!
//! [`EventLog`] is synchronous. Async callers go through [`SessionLog`], which
//! runs each write on the blocking pool.

use crate::error::{AppResult, RigError};
use crate::telemetry::{BehaviorEvent, FrameEvent};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Header row of the behavior log.
pub const BEHAVIOR_HEADER: [&str; 4] = ["Component", "Action", "Start Timestamp", "End Timestamp"];
/// Header row of the frame log.
pub const FRAME_HEADER: [&str; 1] = ["Frame Timestamp"];

/// Timestamp format used in generated file and folder names.
pub const STAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// `now` rendered with [`STAMP_FORMAT`].
pub fn stamp(now: DateTime<Local>) -> String {
    now.format(STAMP_FORMAT).to_string()
}

/// Append-only CSV logs for one session.
pub struct EventLog {
    behavior_path: PathBuf,
    frames_path: PathBuf,
    behavior: csv::Writer<File>,
    frames: csv::Writer<File>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("behavior_path", &self.behavior_path)
            .field("frames_path", &self.frames_path)
            .finish()
    }
}

impl EventLog {
    /// Open (or continue) the logs for `stamp` under `dir`, creating `dir` if needed.
    pub fn create(dir: &Path, stamp: &str) -> AppResult<Self> {
        std::fs::create_dir_all(dir)?;
        let behavior_path = dir.join(format!("log-{stamp}-behavior.csv"));
        let frames_path = dir.join(format!("log-{stamp}-frames.csv"));

        let behavior = open_table(&behavior_path, &BEHAVIOR_HEADER)?;
        let frames = open_table(&frames_path, &FRAME_HEADER)?;

        tracing::info!(
            behavior = %behavior_path.display(),
            frames = %frames_path.display(),
            "Event log opened"
        );

        Ok(Self {
            behavior_path,
            frames_path,
            behavior,
            frames,
        })
    }

    /// Append one behavior row and flush.
    pub fn append_behavior(&mut self, event: &BehaviorEvent) -> AppResult<()> {
        let start = event.start_timestamp.to_string();
        let end = event.end_timestamp.to_string();
        self.behavior.write_record([
            event.component.as_str(),
            event.action.as_str(),
            start.as_str(),
            end.as_str(),
        ])?;
        self.behavior.flush()?;
        Ok(())
    }

    /// Append one frame row and flush.
    pub fn append_frame(&mut self, frame: &FrameEvent) -> AppResult<()> {
        self.frames.write_record([frame.timestamp.as_str()])?;
        self.frames.flush()?;
        Ok(())
    }

    /// Path of the behavior log.
    pub fn behavior_path(&self) -> &Path {
        &self.behavior_path
    }

    /// Path of the frame log.
    pub fn frames_path(&self) -> &Path {
        &self.frames_path
    }
}

/// Shared handle to a session's [`EventLog`] for async code.
///
/// Clones write to the same files. Each call waits for its row to be flushed,
/// so rows from one caller land in call order.
#[derive(Debug, Clone)]
pub struct SessionLog {
    log: Arc<Mutex<EventLog>>,
}

impl SessionLog {
    /// [`EventLog::create`] on the blocking pool.
    pub async fn create(dir: PathBuf, stamp: String) -> AppResult<Self> {
        let log = blocking(move || EventLog::create(&dir, &stamp)).await?;
        Ok(Self {
            log: Arc::new(Mutex::new(log)),
        })
    }

    /// Append a behavior row without blocking the runtime.
    pub async fn append_behavior(&self, event: BehaviorEvent) -> AppResult<()> {
        let log = Arc::clone(&self.log);
        blocking(move || log.lock().append_behavior(&event)).await
    }

    /// Append a frame row without blocking the runtime.
    pub async fn append_frame(&self, frame: FrameEvent) -> AppResult<()> {
        let log = Arc::clone(&self.log);
        blocking(move || log.lock().append_frame(&frame)).await
    }

    /// Paths of the behavior and frame logs.
    pub fn paths(&self) -> (PathBuf, PathBuf) {
        let log = self.log.lock();
        (log.behavior_path().to_path_buf(), log.frames_path().to_path_buf())
    }
}

async fn blocking<T, F>(f: F) -> AppResult<T>
where
    F: FnOnce() -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RigError::Storage(format!("event log task failed: {e}")))?
}

fn open_table(path: &Path, header: &[&str]) -> AppResult<csv::Writer<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let is_empty = file.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if is_empty {
        writer.write_record(header)?;
        writer.flush()?;
    }
    Ok(writer)
}

/// Where session data goes.
///
/// Unset fields fall back to the configured storage directories when used.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSettings {
    filename: Option<String>,
    destination: Option<PathBuf>,
    log_destination: Option<PathBuf>,
}

impl FileSettings {
    /// Set the data filename, appending `.csv` if missing.
    pub fn set_filename(&mut self, name: &str) {
        let name = if name.ends_with(".csv") {
            name.to_string()
        } else {
            format!("{name}.csv")
        };
        self.filename = Some(name);
    }

    /// Data filename, with its `.csv` extension.
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// Root directory for data folders.
    pub fn set_destination(&mut self, path: impl Into<PathBuf>) {
        self.destination = Some(path.into());
    }

    /// Root directory for data folders, if set.
    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    /// Directory for event logs of sessions started from now on.
    pub fn set_log_destination(&mut self, path: impl Into<PathBuf>) {
        self.log_destination = Some(path.into());
    }

    /// Directory for event logs, `default` unless one was set.
    pub fn log_destination_or(&self, default: &Path) -> PathBuf {
        self.log_destination
            .clone()
            .unwrap_or_else(|| default.to_path_buf())
    }

    /// Create the per-session data folder and return its path.
    ///
    /// The folder is `<destination>/<filename stem>`, or
    /// `<destination>/<stem>-<unix seconds>` if that already exists. Event logs
    /// are redirected into the new folder.
    pub fn make_destination_folder(
        &mut self,
        default_root: &Path,
        now: DateTime<Local>,
    ) -> AppResult<PathBuf> {
        let destination = self
            .destination
            .get_or_insert_with(|| default_root.to_path_buf())
            .clone();
        let filename = self
            .filename
            .get_or_insert_with(|| format!("{}.csv", stamp(now)))
            .clone();

        let stem = filename.split('.').next().unwrap_or_default();
        let mut folder = destination.join(stem);
        if folder.exists() {
            let unix = now.timestamp_micros() as f64 / 1_000_000.0;
            folder = destination.join(format!("{stem}-{unix:.4}"));
        }

        std::fs::create_dir_all(&folder)?;
        self.log_destination = Some(folder.clone());
        tracing::info!(folder = %folder.display(), "Data folder created");
        Ok(folder)
    }
}
