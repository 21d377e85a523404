//! Serial port discovery and classification.
//!
//! M5Stack and other ESP32 boards show up either behind a USB-UART bridge
//! (CH9102, CP2104, FTDI) or as the chip's own USB Serial/JTAG interface.

use crate::error::{Error, Result};

#[cfg(feature = "native")]
use log::{debug, info, trace};

/// Known USB bridge/device kinds found on MicroPython boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DeviceKind {
    /// WCH CH340/CH341/CH9102 USB-to-Serial converter.
    Ch340,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// FTDI FT232/FT2232 USB-to-Serial converter.
    Ftdi,
    /// Espressif built-in USB Serial/JTAG (ESP32-S3, ESP32-C3).
    Espressif,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs. An empty PID list matches any product.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x55D4, 0x55D3],
        DeviceKind::Ch340,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71], DeviceKind::Cp210x),
    (0x0403, &[0x6001, 0x6010, 0x6014, 0x6015], DeviceKind::Ftdi),
    (0x303A, &[], DeviceKind::Espressif),
];

impl DeviceKind {
    /// Classify a USB VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_USB_DEVICES
            .iter()
            .find(|(known_vid, pids, _)| {
                vid == *known_vid && (pids.is_empty() || pids.contains(&pid))
            })
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH9102",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Espressif => "ESP32 USB Serial/JTAG",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the kind is one of the known bridges.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Bridges M5Stack boards ship with; preferred during auto-selection.
    pub fn is_high_priority(&self) -> bool {
        matches!(self, Self::Espressif | Self::Ch340 | Self::Cp210x)
    }
}

/// A serial port found on the host.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// A port with no USB metadata.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// Whether the port is likely a MicroPython board.
    pub fn is_likely_board(&self) -> bool {
        self.device.is_known()
    }
}

/// Enumerate all serial ports with USB metadata.
#[cfg(feature = "native")]
#[must_use]
pub fn discover_ports() -> Vec<DetectedPort> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            return Vec::new();
        },
    };

    ports
        .into_iter()
        .map(|port_info| {
            let mut detected = DetectedPort::plain(port_info.port_name.clone());
            if let serialport::SerialPortType::UsbPort(usb) = port_info.port_type {
                detected.device = DeviceKind::from_vid_pid(usb.vid, usb.pid);
                trace!(
                    "Found USB port: {} (VID: {:04X}, PID: {:04X}, Device: {:?})",
                    port_info.port_name, usb.vid, usb.pid, detected.device
                );
                detected.vid = Some(usb.vid);
                detected.pid = Some(usb.pid);
                detected.manufacturer = usb.manufacturer;
                detected.product = usb.product;
                detected.serial = usb.serial_number;
            }
            detected
        })
        .collect()
}

/// Enumerate serial ports (no native support compiled in).
#[cfg(not(feature = "native"))]
#[must_use]
pub fn discover_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Ports that look like MicroPython boards.
#[must_use]
pub fn discover_board_ports() -> Vec<DetectedPort> {
    discover_ports()
        .into_iter()
        .filter(DetectedPort::is_likely_board)
        .collect()
}

/// Pick the best candidate from `ports`.
pub fn select_port(mut ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    let index = ports
        .iter()
        .position(|p| p.device.is_high_priority())
        .or_else(|| ports.iter().position(|p| p.device.is_known()))
        .or_else(|| (!ports.is_empty()).then_some(0))
        .ok_or(Error::NoPortFound)?;
    Ok(ports.swap_remove(index))
}

/// Auto-detect a single serial port.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Result<DetectedPort> {
    let port = select_port(discover_ports())?;
    info!("Auto-detected {} port: {}", port.device.name(), port.name);
    Ok(port)
}

/// Auto-detect a single serial port (no native support compiled in).
#[cfg(not(feature = "native"))]
pub fn auto_detect_port() -> Result<DetectedPort> {
    Err(Error::NoPortFound)
}

/// Format detected ports for display, one line each.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let device_info = if port.device.is_known() {
                format!(" [{}]", port.device.name())
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" [VID:{vid:04X} PID:{pid:04X}]")
            } else {
                String::new()
            };

            let product_info = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();

            format!("{}{}{}", port.name, device_info, product_info)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(name: &str, vid: u16, pid: u16) -> DetectedPort {
        DetectedPort {
            device: DeviceKind::from_vid_pid(vid, pid),
            vid: Some(vid),
            pid: Some(pid),
            ..DetectedPort::plain(name)
        }
    }

    #[test]
    fn test_device_kind_from_vid_pid() {
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x55D4), DeviceKind::Ch340);
        assert_eq!(DeviceKind::from_vid_pid(0x10C4, 0xEA60), DeviceKind::Cp210x);
        assert_eq!(DeviceKind::from_vid_pid(0x0403, 0x6001), DeviceKind::Ftdi);
        assert_eq!(DeviceKind::from_vid_pid(0x303A, 0x1001), DeviceKind::Espressif);
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x0001), DeviceKind::Unknown);
        assert_eq!(DeviceKind::from_vid_pid(0x1234, 0x5678), DeviceKind::Unknown);
    }

    #[test]
    fn test_select_prefers_board_bridges() {
        let ports = vec![
            DetectedPort::plain("/dev/ttyS0"),
            usb("/dev/ttyUSB0", 0x0403, 0x6001),
            usb("/dev/ttyACM0", 0x303A, 0x1001),
        ];
        assert_eq!(select_port(ports).unwrap().name, "/dev/ttyACM0");
    }

    #[test]
    fn test_select_falls_back_to_known_then_first() {
        let ports = vec![
            DetectedPort::plain("/dev/ttyS0"),
            usb("/dev/ttyUSB0", 0x0403, 0x6001),
        ];
        assert_eq!(select_port(ports).unwrap().name, "/dev/ttyUSB0");

        let ports = vec![DetectedPort::plain("/dev/ttyS0")];
        assert_eq!(select_port(ports).unwrap().name, "/dev/ttyS0");
    }

    #[test]
    fn test_select_empty_fails() {
        assert!(matches!(select_port(Vec::new()), Err(Error::NoPortFound)));
    }

    #[test]
    fn test_format_port_list() {
        let mut bridge = usb("/dev/ttyUSB0", 0x1A86, 0x55D4);
        bridge.product = Some("USB Single Serial".to_string());
        let ports = vec![
            bridge,
            usb("/dev/ttyUSB1", 0x1234, 0x5678),
            DetectedPort::plain("/dev/ttyS0"),
        ];

        let formatted = format_port_list(&ports);
        assert_eq!(
            formatted,
            vec![
                "/dev/ttyUSB0 [CH340/CH9102] - USB Single Serial".to_string(),
                "/dev/ttyUSB1 [VID:1234 PID:5678]".to_string(),
                "/dev/ttyS0".to_string(),
            ]
        );
    }
}
