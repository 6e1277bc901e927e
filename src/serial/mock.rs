//! In-memory serial rig for tests and simulation.
//!
//! [`MockBackend`] stands in for [`SystemSerial`](super::SystemSerial). Each
//! `open()` produces a connected pair:
//! - `MockSerialPort` (handed to the controller): implements the link traits
//! - [`MockDevice`] (kept by the test): plays the microcontroller
//!
//! Bytes queued with [`MockBackend::preload`] are already sitting in the input
//! buffer when the port opens, the way a freshly reset board's boot chatter
//! would be.
//!
//! # Example
//!
//! ```rust,ignore
//! let backend = MockBackend::with_ports(["/dev/ttyACM0"]);
//! let controller = RigController::with_backend(config, Arc::new(backend.clone()));
//! controller.set_port("/dev/ttyACM0")?;
//! controller.open().await?;
//!
//! let mut device = backend.take_device("/dev/ttyACM0").unwrap();
//! device.expect_line("LINK").await;
//! device.send_line("PUMP,INFUSION,100,_");
//! ```

use super::{DynLink, PortDescriptor, SerialBackend, SerialLink};
use crate::error::{AppResult, RigError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

/// Arduino-style identifiers reported for every mock port.
const MOCK_VID: u16 = 0x2341;
const MOCK_PID: u16 = 0x0043;

/// Controller side of a mock connection.
#[derive(Debug)]
pub struct MockSerialPort {
    writes_tx: UnboundedSender<Vec<u8>>,
    reads_rx: UnboundedReceiver<Vec<u8>>,
    read_buffer: VecDeque<u8>,
}

/// Device side of a mock connection.
#[derive(Debug)]
pub struct MockDevice {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    write_buffer: Vec<u8>,
}

/// Create a connected port/device pair.
pub fn pair() -> (MockSerialPort, MockDevice) {
    let (client_to_device_tx, client_to_device_rx) = mpsc::unbounded_channel();
    let (device_to_client_tx, device_to_client_rx) = mpsc::unbounded_channel();

    let port = MockSerialPort {
        writes_tx: client_to_device_tx,
        reads_rx: device_to_client_rx,
        read_buffer: VecDeque::new(),
    };
    let device = MockDevice {
        writes_rx: client_to_device_rx,
        reads_tx: device_to_client_tx,
        write_buffer: Vec::new(),
    };
    (port, device)
}

impl MockSerialPort {
    fn drain_into(&mut self, buf: &mut ReadBuf<'_>) {
        let to_read = std::cmp::min(buf.remaining(), self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..to_read).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buffer.is_empty() {
            self.drain_into(buf);
            return Poll::Ready(Ok(()));
        }

        match self.reads_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                self.read_buffer.extend(chunk);
                self.drain_into(buf);
                Poll::Ready(Ok(()))
            }
            // Device dropped: end of file
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl SerialLink for MockSerialPort {
    fn clear_input(&mut self) -> io::Result<()> {
        self.read_buffer.clear();
        loop {
            match self.reads_rx.try_recv() {
                Ok(_) => continue,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }
}

impl MockDevice {
    /// Emit `line` followed by a newline.
    ///
    /// Returns `false` once the controller side has been dropped.
    pub fn send_line(&self, line: &str) -> bool {
        self.send_raw(format!("{line}\n").as_bytes())
    }

    /// Emit raw bytes, possibly containing several lines or a partial one.
    pub fn send_raw(&self, data: &[u8]) -> bool {
        self.reads_tx.send(data.to_vec()).is_ok()
    }

    /// Next newline-terminated line the controller wrote, without the newline.
    ///
    /// Returns `None` if the controller dropped its side or nothing arrives
    /// within two seconds.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.take_buffered_line() {
                return Some(line);
            }
            match tokio::time::timeout(Duration::from_secs(2), self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// Wait for the controller to write `expected` as its next line.
    ///
    /// # Panics
    /// Panics if a different line arrives or nothing arrives in time.
    pub async fn expect_line(&mut self, expected: &str) {
        match self.next_line().await {
            Some(line) => assert_eq!(line, expected, "unexpected line written to device"),
            None => panic!("timed out waiting for '{expected}'"),
        }
    }

    /// Every complete line written so far, without waiting.
    pub fn written_lines(&mut self) -> Vec<String> {
        loop {
            match self.writes_rx.try_recv() {
                Ok(chunk) => self.write_buffer.extend_from_slice(&chunk),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        std::iter::from_fn(|| self.take_buffered_line()).collect()
    }

    fn take_buffered_line(&mut self) -> Option<String> {
        let end = self.write_buffer.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.write_buffer.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line).trim_end().to_string())
    }
}

#[derive(Debug, Default)]
struct MockState {
    ports: Vec<String>,
    devices: HashMap<String, MockDevice>,
    preloaded: HashMap<String, Vec<u8>>,
    opens: HashMap<String, usize>,
}

/// A set of simulated ports.
///
/// Cloning shares the same ports; keep one clone in the test and hand the
/// other to the controller.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    /// Backend with `ports` attached.
    pub fn with_ports<I, S>(ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let backend = Self::default();
        for port in ports {
            backend.attach(port);
        }
        backend
    }

    /// Plug in a device.
    pub fn attach(&self, port: impl Into<String>) {
        let port = port.into();
        let mut state = self.state.lock();
        if !state.ports.contains(&port) {
            state.ports.push(port);
        }
    }

    /// Unplug a device. An open link to it stays usable until closed.
    pub fn detach(&self, port: &str) {
        self.state.lock().ports.retain(|p| p != port);
    }

    /// Queue bytes that will be pending in the input buffer at the next open.
    pub fn preload(&self, port: &str, data: &[u8]) {
        self.state
            .lock()
            .preloaded
            .entry(port.to_string())
            .or_default()
            .extend_from_slice(data);
    }

    /// Device end of the most recent open of `port`.
    pub fn take_device(&self, port: &str) -> Option<MockDevice> {
        self.state.lock().devices.remove(port)
    }

    /// How many times `port` has been opened.
    pub fn open_count(&self, port: &str) -> usize {
        self.state.lock().opens.get(port).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SerialBackend for MockBackend {
    fn available_ports(&self) -> AppResult<Vec<PortDescriptor>> {
        Ok(self
            .state
            .lock()
            .ports
            .iter()
            .map(|name| PortDescriptor {
                name: name.clone(),
                vid: MOCK_VID,
                pid: MOCK_PID,
                product: Some("Mock Rig".to_string()),
            })
            .collect())
    }

    async fn open(&self, port: &str, _baud_rate: u32) -> AppResult<DynLink> {
        let mut state = self.state.lock();
        if !state.ports.iter().any(|p| p == port) {
            return Err(RigError::PortUnavailable(port.to_string()));
        }

        let (link, device) = pair();
        if let Some(stale) = state.preloaded.remove(port) {
            device.send_raw(&stale);
        }
        state.devices.insert(port.to_string(), device);
        *state.opens.entry(port.to_string()).or_default() += 1;

        Ok(Box::new(link))
    }
}
