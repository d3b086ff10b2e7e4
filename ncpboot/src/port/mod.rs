//! Serial transport.
//!
//! Protocol code only needs `std::io::{Read, Write}`. [`Port`] adds the
//! handful of line controls the CLI uses, and [`SerialConfig`] describes how
//! to open a native port.
//!
//! The bootloader UART runs 8-N-1; only the baud rate, timeout and flow
//! control are configurable.

#[cfg(feature = "native")]
pub mod native;

#[cfg(feature = "native")]
pub use native::NativePort;

use crate::error::Result;
use std::io::{Read, Write};
use std::time::Duration;

/// Default bootloader UART speed.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Serial port configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Per-read timeout.
    pub timeout: Duration,
    /// Flow control.
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: Duration::from_millis(100),
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Configuration for `port_name` at `baud_rate`.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the per-read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set flow control.
    #[must_use]
    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// None.
    #[default]
    None,
    /// RTS/CTS.
    Hardware,
    /// XON/XOFF.
    Software,
}

/// An open serial line.
pub trait Port: Read + Write + Send {
    /// Port name/path.
    fn name(&self) -> &str;

    /// Drop anything pending in the input and output buffers.
    fn clear_buffers(&mut self) -> Result<()>;
}
