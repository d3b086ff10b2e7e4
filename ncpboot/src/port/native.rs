//! Serial ports through the `serialport` crate.

use crate::error::Result;
use crate::port::{FlowControl, Port, SerialConfig};
use log::debug;
use serialport::{ClearBuffer, SerialPort};
use std::io::{Read, Write};

/// Native serial port.
pub struct NativePort {
    port: Box<dyn SerialPort>,
    name: String,
}

impl NativePort {
    /// Open a port as 8-N-1 with the given configuration.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        debug!(
            "Opening {} at {} baud (flow control {:?})",
            config.port_name, config.baud_rate, config.flow_control
        );
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(config.flow_control.into())
            .open()?;

        Ok(Self {
            port,
            name: config
                .port_name
                .clone(),
        })
    }
}

impl Port for NativePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.port
            .clear(ClearBuffer::All)?;
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port.flush()
    }
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => Self::None,
            FlowControl::Hardware => Self::Hardware,
            FlowControl::Software => Self::Software,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_serial_config_defaults_to_bootloader_uart() {
        let config = SerialConfig::new("/dev/ttyACM0", 115_200);
        assert_eq!(config.port_name, "/dev/ttyACM0");
        assert_eq!(config.flow_control, FlowControl::None);
        assert_eq!(config.timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_serial_config_builder() {
        let config = SerialConfig::new("COM3", 921_600)
            .with_timeout(Duration::from_secs(1))
            .with_flow_control(FlowControl::Hardware);
        assert_eq!(config.baud_rate, 921_600);
        assert_eq!(config.timeout, Duration::from_secs(1));
        assert_eq!(
            serialport::FlowControl::from(config.flow_control),
            serialport::FlowControl::Hardware
        );
    }

    #[test]
    fn test_open_missing_port_fails() {
        let config = SerialConfig::new("/dev/ncpboot-does-not-exist", 115_200);
        assert!(NativePort::open(&config).is_err());
    }
}
