//! Serial port abstractions.
//!
//! The controller never touches `serialport`/`tokio-serial` directly. It goes
//! through a [`SerialBackend`], which enumerates ports and opens links, so the
//! same controller can drive real hardware ([`SystemSerial`]) or the in-memory
//! rig in [`mock`].
//!
//! # Types
//!
//! - [`SerialLink`]: an open, async, byte-oriented connection that can also
//!   discard its pending input
//! - [`DynLink`]: type-erased boxed link
//! - [`PortListing`]: result of a port scan, distinguishing "found nothing"
//!   from a populated list

pub mod mock;

use crate::error::{AppResult, RigError};
use async_trait::async_trait;
use serde::{Serialize, Serializer};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

/// Marker rendered for an empty port scan.
pub const NO_PORTS_MARKER: &str = "No available ports";

/// An open serial connection.
pub trait SerialLink: AsyncRead + AsyncWrite + Send + Unpin {
    /// Discard bytes received but not yet read.
    fn clear_input(&mut self) -> std::io::Result<()>;
}

/// Type-erased boxed serial link.
pub type DynLink = Box<dyn SerialLink>;

impl SerialLink for tokio_serial::SerialStream {
    fn clear_input(&mut self) -> std::io::Result<()> {
        tokio_serial::SerialPort::clear(self, tokio_serial::ClearBuffer::Input)
            .map_err(std::io::Error::from)
    }
}

/// A hardware-identified serial device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortDescriptor {
    /// OS device name, e.g. `/dev/ttyACM0` or `COM3`
    pub name: String,
    /// USB vendor id
    pub vid: u16,
    /// USB product id
    pub pid: u16,
    /// USB product string, when the device reports one
    pub product: Option<String>,
}

/// Outcome of a port scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortListing {
    /// Port names in scan order
    Available(Vec<String>),
    /// Nothing attached
    NoPorts,
}

impl PortListing {
    /// [`NoPorts`](Self::NoPorts) for an empty list.
    pub fn from_names(names: Vec<String>) -> Self {
        if names.is_empty() {
            PortListing::NoPorts
        } else {
            PortListing::Available(names)
        }
    }

    /// Port names; empty for [`NoPorts`](Self::NoPorts).
    pub fn names(&self) -> &[String] {
        match self {
            PortListing::Available(names) => names,
            PortListing::NoPorts => &[],
        }
    }

    /// Whether `port` was found.
    pub fn contains(&self, port: &str) -> bool {
        self.names().iter().any(|name| name == port)
    }
}

impl fmt::Display for PortListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortListing::Available(names) => f.write_str(&names.join(", ")),
            PortListing::NoPorts => f.write_str(NO_PORTS_MARKER),
        }
    }
}

// Dashboards read a list of strings either way.
impl Serialize for PortListing {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PortListing::Available(names) => names.serialize(serializer),
            PortListing::NoPorts => [NO_PORTS_MARKER].serialize(serializer),
        }
    }
}

/// Port enumeration and opening.
#[async_trait]
pub trait SerialBackend: Send + Sync {
    /// Currently attached devices that report both a vendor and product id.
    fn available_ports(&self) -> AppResult<Vec<PortDescriptor>>;

    /// Open `port` at `baud_rate`, 8N1, no flow control.
    async fn open(&self, port: &str, baud_rate: u32) -> AppResult<DynLink>;
}

/// Real serial hardware.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSerial;

#[async_trait]
impl SerialBackend for SystemSerial {
    fn available_ports(&self) -> AppResult<Vec<PortDescriptor>> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .filter_map(|info| match info.port_type {
                serialport::SerialPortType::UsbPort(usb) => Some(PortDescriptor {
                    name: info.port_name,
                    vid: usb.vid,
                    pid: usb.pid,
                    product: usb.product,
                }),
                _ => None,
            })
            .collect())
    }

    async fn open(&self, port: &str, baud_rate: u32) -> AppResult<DynLink> {
        use tokio_serial::SerialPortBuilderExt;

        let port = port.to_string();
        let stream = tokio::task::spawn_blocking(move || {
            tokio_serial::new(&port, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
        })
        .await
        .map_err(|e| RigError::Io(std::io::Error::other(e)))??;

        Ok(Box::new(stream))
    }
}
