//! Device discovery and classification utilities.
//!
//! Paired Bluetooth SPP devices show up as ordinary serial ports, so
//! discovery enumerates serial ports and classifies each by port type,
//! description keywords and USB VID/PID.

#[cfg(feature = "native")]
use log::{debug, trace};

/// Transport type for discovered endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Serial port backed by a Bluetooth SPP link.
    Bluetooth,
    /// USB CDC or USB-to-UART bridge.
    Usb,
    /// Built-in or PCI serial port.
    Serial,
    /// Unknown or unclassified transport.
    Unknown,
}

impl TransportKind {
    /// Short label for listings.
    pub fn name(self) -> &'static str {
        match self {
            Self::Bluetooth => "bluetooth",
            Self::Usb => "usb",
            Self::Serial => "serial",
            Self::Unknown => "unknown",
        }
    }
}

/// Known device kinds that can carry the actuator controller's link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Bluetooth Serial Port Profile endpoint.
    BluetoothSpp,
    /// Espressif native USB (ESP32-S2/S3/C3 USB-Serial-JTAG).
    Espressif,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// CH340/CH341/CH9102 USB-to-Serial converter.
    Ch340,
    /// FTDI FT232/FT2232 USB-to-Serial converter.
    Ftdi,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs of bridges found on ESP32 controller boards.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (0x303A, &[], DeviceKind::Espressif),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], DeviceKind::Cp210x),
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x55D4],
        DeviceKind::Ch340,
    ),
    (0x0403, &[0x6001, 0x6010, 0x6014, 0x6015], DeviceKind::Ftdi),
];

/// Description fragments that identify Bluetooth serial ports on
/// Windows ("Standard Serial over Bluetooth link") and Linux/macOS.
const BLUETOOTH_KEYWORDS: &[&str] = &["bluetooth", "bth", "serial over", "standard serial"];

impl DeviceKind {
    /// Classify a USB endpoint by VID/PID.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        for (known_vid, pids, device) in KNOWN_USB_DEVICES {
            if vid == *known_vid && (pids.is_empty() || pids.contains(&pid)) {
                return *device;
            }
        }
        Self::Unknown
    }

    /// Get a human-readable name for the device kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::BluetoothSpp => "Bluetooth SPP",
            Self::Espressif => "Espressif USB",
            Self::Cp210x => "CP210x",
            Self::Ch340 => "CH340/CH341",
            Self::Ftdi => "FTDI",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this is a known/expected device kind.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Whether a port name or description looks like a Bluetooth serial port.
pub fn looks_like_bluetooth(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    BLUETOOTH_KEYWORDS.iter().any(|k| lower.contains(k))
        || lower.contains("rfcomm")
        || (lower.starts_with("/dev/cu.") && !lower.contains("usb"))
}

/// Discovered device endpoint information.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Endpoint name/path (e.g., "/dev/rfcomm0" or "COM5").
    pub name: String,
    /// Transport type.
    #[cfg_attr(feature = "serde", serde(serialize_with = "ser_transport"))]
    pub transport: TransportKind,
    /// Classified device kind.
    #[cfg_attr(feature = "serde", serde(serialize_with = "ser_device"))]
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string or OS description (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

#[cfg(feature = "serde")]
fn ser_transport<S: serde::Serializer>(t: &TransportKind, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(t.name())
}

#[cfg(feature = "serde")]
fn ser_device<S: serde::Serializer>(d: &DeviceKind, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(d.name())
}

impl DetectedPort {
    /// Create an entry with only a name and transport.
    pub fn bare(name: impl Into<String>, transport: TransportKind) -> Self {
        let device = if transport == TransportKind::Bluetooth {
            DeviceKind::BluetoothSpp
        } else {
            DeviceKind::Unknown
        };
        Self {
            name: name.into(),
            transport,
            device,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// Check if this endpoint is likely the actuator controller.
    pub fn is_likely_controller(&self) -> bool {
        self.device.is_known()
    }
}

/// Which endpoints a scan yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanFilter {
    /// Every serial endpoint.
    All,
    /// Only Bluetooth SPP endpoints.
    Bluetooth,
    /// Bluetooth endpoints and known USB bridges.
    #[default]
    Likely,
}

impl ScanFilter {
    /// Whether `port` passes this filter.
    pub fn accepts(self, port: &DetectedPort) -> bool {
        match self {
            Self::All => true,
            Self::Bluetooth => port.transport == TransportKind::Bluetooth,
            Self::Likely => port.is_likely_controller(),
        }
    }
}

/// Lazy, finite sequence of discovered endpoints.
///
/// Enumeration happens once when the scan is created; filtering happens as
/// the iterator is consumed, so callers can stop at the first match.
#[derive(Debug)]
pub struct Scan {
    ports: std::vec::IntoIter<DetectedPort>,
    filter: ScanFilter,
}

impl Scan {
    /// Scan over a fixed set of endpoints.
    pub fn from_ports(ports: Vec<DetectedPort>, filter: ScanFilter) -> Self {
        Self {
            ports: ports.into_iter(),
            filter,
        }
    }
}

impl Iterator for Scan {
    type Item = DetectedPort;

    fn next(&mut self) -> Option<Self::Item> {
        let filter = self.filter;
        self.ports.by_ref().find(|p| filter.accepts(p))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.ports.size_hint().1)
    }
}

/// Start a scan of the host's serial endpoints.
pub fn scan(filter: ScanFilter) -> Scan {
    Scan::from_ports(detect_ports(), filter)
}

/// Detect all available endpoints with metadata.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    let mut result = Vec::new();

    match serialport::available_ports() {
        Ok(ports) => {
            for port_info in ports {
                let detected = classify(port_info);
                trace!(
                    "Found port: {} ({}, {})",
                    detected.name,
                    detected.transport.name(),
                    detected.device.name()
                );
                result.push(detected);
            }
        },
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
        },
    }

    result
}

/// Detect all available endpoints (stub without native support).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

#[cfg(feature = "native")]
fn classify(port_info: serialport::SerialPortInfo) -> DetectedPort {
    match port_info.port_type {
        serialport::SerialPortType::BluetoothPort => {
            DetectedPort::bare(port_info.port_name, TransportKind::Bluetooth)
        },
        serialport::SerialPortType::UsbPort(usb_info) => {
            let description = usb_info.product.clone().unwrap_or_default();
            let (transport, device) = if looks_like_bluetooth(&description) {
                (TransportKind::Bluetooth, DeviceKind::BluetoothSpp)
            } else {
                (
                    TransportKind::Usb,
                    DeviceKind::from_vid_pid(usb_info.vid, usb_info.pid),
                )
            };
            DetectedPort {
                name: port_info.port_name,
                transport,
                device,
                vid: Some(usb_info.vid),
                pid: Some(usb_info.pid),
                manufacturer: usb_info.manufacturer,
                product: usb_info.product,
                serial: usb_info.serial_number,
            }
        },
        serialport::SerialPortType::PciPort => {
            DetectedPort::bare(port_info.port_name, TransportKind::Serial)
        },
        serialport::SerialPortType::Unknown => {
            let transport = if looks_like_bluetooth(&port_info.port_name) {
                TransportKind::Bluetooth
            } else {
                TransportKind::Unknown
            };
            DetectedPort::bare(port_info.port_name, transport)
        },
    }
}

/// Format a list of detected endpoints for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    let mut result = Vec::new();

    for port in ports {
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

        result.push(format!("{}{}{}", port.name, device_info, product_info));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(name: &str, vid: u16, pid: u16) -> DetectedPort {
        DetectedPort {
            name: name.to_string(),
            transport: TransportKind::Usb,
            device: DeviceKind::from_vid_pid(vid, pid),
            vid: Some(vid),
            pid: Some(pid),
            manufacturer: None,
            product: Some("USB-Serial".to_string()),
            serial: None,
        }
    }

    #[test]
    fn test_device_kind_from_vid_pid() {
        assert_eq!(DeviceKind::from_vid_pid(0x303A, 0x1001), DeviceKind::Espressif);
        assert_eq!(DeviceKind::from_vid_pid(0x10C4, 0xEA60), DeviceKind::Cp210x);
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x7523), DeviceKind::Ch340);
        assert_eq!(DeviceKind::from_vid_pid(0x0403, 0x6001), DeviceKind::Ftdi);
        assert_eq!(DeviceKind::from_vid_pid(0x1234, 0x5678), DeviceKind::Unknown);
    }

    #[test]
    fn test_bluetooth_keywords() {
        assert!(looks_like_bluetooth("Standard Serial over Bluetooth link (COM5)"));
        assert!(looks_like_bluetooth("BTHENUM\\{00001101}"));
        assert!(looks_like_bluetooth("/dev/rfcomm0"));
        assert!(looks_like_bluetooth("/dev/cu.ServoCtrl-SPP"));
        assert!(!looks_like_bluetooth("/dev/cu.usbserial-0001"));
        assert!(!looks_like_bluetooth("/dev/ttyUSB0"));
    }

    #[test]
    fn test_scan_filters() {
        let ports = vec![
            DetectedPort::bare("/dev/rfcomm0", TransportKind::Bluetooth),
            usb("/dev/ttyUSB0", 0x10C4, 0xEA60),
            DetectedPort::bare("/dev/ttyS0", TransportKind::Serial),
        ];

        let all: Vec<_> = Scan::from_ports(ports.clone(), ScanFilter::All).collect();
        assert_eq!(all.len(), 3);

        let bt: Vec<_> = Scan::from_ports(ports.clone(), ScanFilter::Bluetooth)
            .map(|p| p.name)
            .collect();
        assert_eq!(bt, vec!["/dev/rfcomm0"]);

        let likely: Vec<_> = Scan::from_ports(ports, ScanFilter::Likely)
            .map(|p| p.name)
            .collect();
        assert_eq!(likely, vec!["/dev/rfcomm0", "/dev/ttyUSB0"]);
    }

    #[test]
    fn test_scan_is_lazy_and_finite() {
        let ports = vec![
            DetectedPort::bare("/dev/rfcomm0", TransportKind::Bluetooth),
            DetectedPort::bare("/dev/rfcomm1", TransportKind::Bluetooth),
        ];
        let mut scan = Scan::from_ports(ports, ScanFilter::Bluetooth);
        assert_eq!(scan.next().map(|p| p.name).as_deref(), Some("/dev/rfcomm0"));
        assert_eq!(scan.next().map(|p| p.name).as_deref(), Some("/dev/rfcomm1"));
        assert!(scan.next().is_none());
        assert!(scan.next().is_none());
    }

    #[test]
    fn test_format_port_list() {
        let ports = vec![
            usb("/dev/ttyUSB0", 0x10C4, 0xEA60),
            DetectedPort {
                vid: Some(0xAAAA),
                pid: Some(0xBBBB),
                product: None,
                ..DetectedPort::bare("/dev/ttyACM1", TransportKind::Usb)
            },
        ];

        let formatted = format_port_list(&ports);
        assert_eq!(formatted.len(), 2);
        assert!(formatted[0].contains("/dev/ttyUSB0"));
        assert!(formatted[0].contains("CP210x"));
        assert!(formatted[0].contains("USB-Serial"));
        assert!(formatted[1].contains("VID:AAAA PID:BBBB"));
    }
}
