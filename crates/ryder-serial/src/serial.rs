//! Serial port handling
//!
//! Port enumeration and low-level open helpers for Ryder devices.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::time::Duration;

use crate::error::DriverError;
use crate::{RYDER_PID, RYDER_VID};

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Whether this port carries the Ryder USB vendor/product identifiers.
    pub fn is_ryder(&self) -> bool {
        self.vid == Some(RYDER_VID) && self.pid == Some(RYDER_PID)
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
                usb_info.serial_number,
            ),
            _ => (None, None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
            serial_number,
        }
    }
}

/// Helper used to sort port names so that:
///  - ttyUSB* ports come first (sorted numerically by suffix)
///  - then ttyACM* ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    // Collect from serialport API
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
    {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Linux-only: Add /dev/ttyUSB* and /dev/ttyACM* entries if present but not found by API
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyUSB") || fname.starts_with("ttyACM") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert_with(|| PortInfo {
                        name: full,
                        vid: None,
                        pid: None,
                        manufacturer: None,
                        product: None,
                        serial_number: None,
                    });
                }
            }
        }
    }

    // Collect and sort deterministically
    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// List only ports that identify as Ryder devices (VID 0x10c4, PID 0xea60).
pub fn ryder_ports() -> Vec<PortInfo> {
    list_ports().into_iter().filter(PortInfo::is_ryder).collect()
}

/// Open a serial port configured for the device: 8-N-1, short read timeout,
/// and (on unix) an exclusive TTY lock when `exclusive` is set.
pub fn open_port(
    name: &str,
    baud_rate: u32,
    exclusive: bool,
) -> Result<Box<dyn SerialPort>, DriverError> {
    let builder = serialport::new(name, baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        // Short timeout for responsive non-blocking reads
        .timeout(Duration::from_millis(100));

    #[cfg(unix)]
    {
        let mut port = builder
            .open_native()
            .map_err(|e| DriverError::Serial(e.to_string()))?;
        port.set_exclusive(exclusive)
            .map_err(|e| DriverError::Serial(e.to_string()))?;
        Ok(Box::new(port))
    }

    #[cfg(not(unix))]
    {
        let _ = exclusive;
        builder
            .open()
            .map_err(|e| DriverError::Serial(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, vid: Option<u16>, pid: Option<u16>) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            vid,
            pid,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    #[test]
    fn test_list_ports() {
        // This test just ensures the function doesn't panic
        let ports = list_ports();
        for p in &ports {
            println!("Found port: {} - {:?}", p.name, p.product);
        }
    }

    #[test]
    fn test_port_sorting() {
        let names = vec![
            "/dev/ttyACM1",
            "/dev/ttyUSB1",
            "/dev/ttyACM0",
            "/dev/ttyUSB0",
            "/dev/someport",
            "/dev/ttyUSB10",
        ];
        let mut ports: Vec<PortInfo> = names.into_iter().map(|n| port(n, None, None)).collect();

        ports.sort_by_key(|p| port_sort_key(&p.name));
        let ordered: Vec<String> = ports.into_iter().map(|p| p.name).collect();

        assert_eq!(
            ordered,
            vec![
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/ttyUSB10",
                "/dev/ttyACM0",
                "/dev/ttyACM1",
                "/dev/someport",
            ]
        );
    }

    #[test]
    fn test_ryder_identification() {
        assert!(port("/dev/ttyUSB0", Some(0x10c4), Some(0xea60)).is_ryder());
        assert!(!port("/dev/ttyUSB1", Some(0x10c4), Some(0x0001)).is_ryder());
        assert!(!port("/dev/ttyUSB2", Some(0x2341), Some(0xea60)).is_ryder());
        assert!(!port("/dev/ttyS0", None, None).is_ryder());
    }
}
