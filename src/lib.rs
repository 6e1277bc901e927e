//! # Rig DAQ Core Library
//!
//! Host-side controller for a microcontroller-driven behavioral rig (levers,
//! pumps, cues, lasers, lick circuits, imaging triggers). The controller owns
//! the serial link, ingests the rig's line-delimited telemetry, persists
//! events as they arrive, tracks session time net of pauses, and ends the
//! session on its own when the configured limits are met.
//!
//! ## Crate Structure
//!
//! - **`controller`**: `RigController`, the single entry point dashboards and
//!   the HTTP layer drive.
//! - **`session`**: session phases, the pause-aware clock and the stop-condition policy.
//! - **`telemetry`**: pure classification of telemetry lines into configuration
//!   documents, behavior events and frame events.
//! - **`link`**: reader and consumer tasks connecting an open port to the controller.
//! - **`serial`**: port enumeration and opening behind the `SerialBackend` trait,
//!   with an in-memory rig in `serial::mock`.
//! - **`storage`**: append-only CSV event logs and data-folder management.
//! - **`http`**: JSON control plane on `hyper`.
//! - **`config`**: layered configuration (defaults, TOML, environment) via `figment`.
//! - **`logging`**: `tracing-subscriber` setup for the binary.
//! - **`error`**: the `RigError` enum shared by all operations.

pub mod config;
pub mod controller;
pub mod error;
pub mod http;
pub mod link;
pub mod logging;
pub mod serial;
pub mod session;
pub mod storage;
pub mod telemetry;

pub use controller::RigController;
pub use error::{AppResult, RigError};
