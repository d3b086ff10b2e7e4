//! Serial port discovery for Silicon Labs kits and USB-UART bridges.

use crate::error::{Error, Result};

#[cfg(feature = "native")]
use log::{debug, info, trace};

/// USB-UART bridge kinds seen on EFM32/EFR32 hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DeviceKind {
    /// SEGGER J-Link OB virtual COM port on a Wireless Starter Kit.
    WstkVcom,
    /// Silicon Labs CP210x USB-to-UART bridge.
    Cp210x,
    /// FTDI USB-to-UART bridge.
    Ftdi,
    /// Anything else.
    Unknown,
}

/// VID with the PIDs that identify each bridge (empty list: any PID).
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (0x1366, &[], DeviceKind::WstkVcom),
    (0x10C4, &[0xEA60, 0xEA61, 0xEA70, 0xEA71], DeviceKind::Cp210x),
    (0x0403, &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015], DeviceKind::Ftdi),
];

impl DeviceKind {
    /// Classify a USB VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_USB_DEVICES
            .iter()
            .find(|(known_vid, pids, _)| vid == *known_vid && (pids.is_empty() || pids.contains(&pid)))
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Display name.
    pub fn name(self) -> &'static str {
        match self {
            Self::WstkVcom => "WSTK VCOM",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Unknown => "Unknown",
        }
    }

    /// Auto-selection rank, lower first.
    fn rank(self) -> u8 {
        match self {
            Self::WstkVcom => 0,
            Self::Cp210x => 1,
            Self::Ftdi => 2,
            Self::Unknown => 3,
        }
    }
}

/// A serial port found on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Port name/path.
    pub name: String,
    /// Bridge classification.
    pub device: DeviceKind,
    /// USB vendor ID.
    pub vid: Option<u16>,
    /// USB product ID.
    pub pid: Option<u16>,
    /// Manufacturer string.
    pub manufacturer: Option<String>,
    /// Product string.
    pub product: Option<String>,
    /// Serial number.
    pub serial: Option<String>,
}

impl DetectedPort {
    /// One-line description for listings.
    pub fn describe(&self) -> String {
        let device = match (self.device, self.vid, self.pid) {
            (DeviceKind::Unknown, Some(vid), Some(pid)) => format!(" [VID:{vid:04X} PID:{pid:04X}]"),
            (DeviceKind::Unknown, ..) => String::new(),
            (kind, ..) => format!(" [{}]", kind.name()),
        };
        let product = self
            .product
            .as_ref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();
        format!("{}{device}{product}", self.name)
    }
}

/// List serial ports with USB metadata.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            return Vec::new();
        },
    };

    ports
        .into_iter()
        .map(|info| match info.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                let device = DeviceKind::from_vid_pid(usb.vid, usb.pid);
                trace!(
                    "USB port {} (VID {:04X} PID {:04X}): {}",
                    info.port_name,
                    usb.vid,
                    usb.pid,
                    device.name()
                );
                DetectedPort {
                    name: info.port_name,
                    device,
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                    manufacturer: usb.manufacturer,
                    product: usb.product,
                    serial: usb.serial_number,
                }
            },
            _ => DetectedPort {
                name: info.port_name,
                device: DeviceKind::Unknown,
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                serial: None,
            },
        })
        .collect()
}

/// Without native serial support there is nothing to list.
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Pick the most likely bootloader port out of `ports`.
pub fn select_port(ports: &[DetectedPort]) -> Option<&DetectedPort> {
    ports
        .iter()
        .min_by_key(|p| p.device.rank())
}

/// Pick a port automatically.
pub fn auto_detect_port() -> Result<DetectedPort> {
    let ports = detect_ports();
    let port = select_port(&ports).ok_or(Error::DeviceNotFound)?;
    #[cfg(feature = "native")]
    info!("Auto-detected {} ({})", port.name, port.device.name());
    Ok(port.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, device: DeviceKind, ids: Option<(u16, u16)>) -> DetectedPort {
        DetectedPort {
            name: name.to_string(),
            device,
            vid: ids.map(|(v, _)| v),
            pid: ids.map(|(_, p)| p),
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    #[test]
    fn test_device_kind_from_vid_pid() {
        assert_eq!(DeviceKind::from_vid_pid(0x1366, 0x0105), DeviceKind::WstkVcom);
        assert_eq!(DeviceKind::from_vid_pid(0x10C4, 0xEA60), DeviceKind::Cp210x);
        assert_eq!(DeviceKind::from_vid_pid(0x10C4, 0x0001), DeviceKind::Unknown);
        assert_eq!(DeviceKind::from_vid_pid(0x0403, 0x6015), DeviceKind::Ftdi);
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x7523), DeviceKind::Unknown);
    }

    #[test]
    fn test_select_port_prefers_kit_vcom() {
        let ports = vec![
            port("/dev/ttyS0", DeviceKind::Unknown, None),
            port("/dev/ttyUSB0", DeviceKind::Ftdi, Some((0x0403, 0x6001))),
            port("/dev/ttyACM0", DeviceKind::WstkVcom, Some((0x1366, 0x0105))),
            port("/dev/ttyUSB1", DeviceKind::Cp210x, Some((0x10C4, 0xEA60))),
        ];
        assert_eq!(select_port(&ports).map(|p| p.name.as_str()), Some("/dev/ttyACM0"));
        assert_eq!(select_port(&ports[..2]).map(|p| p.name.as_str()), Some("/dev/ttyUSB0"));
        assert_eq!(select_port(&ports[..1]).map(|p| p.name.as_str()), Some("/dev/ttyS0"));
        assert!(select_port(&[]).is_none());
    }

    #[test]
    fn test_describe() {
        let mut kit = port("/dev/ttyACM0", DeviceKind::WstkVcom, Some((0x1366, 0x0105)));
        kit.product = Some("J-Link".into());
        assert_eq!(kit.describe(), "/dev/ttyACM0 [WSTK VCOM] - J-Link");
        assert_eq!(
            port("/dev/ttyUSB3", DeviceKind::Unknown, Some((0x1A86, 0x7523))).describe(),
            "/dev/ttyUSB3 [VID:1A86 PID:7523]"
        );
        assert_eq!(port("COM1", DeviceKind::Unknown, None).describe(), "COM1");
    }
}
