use serde::Serialize;
use serialport::SerialPortType;

/// A serial port as shown by `--list-ports`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub port_name: String,
    pub port_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
}

impl From<serialport::SerialPortInfo> for PortInfo {
    fn from(port: serialport::SerialPortInfo) -> Self {
        let mut info = PortInfo {
            port_name: port.port_name,
            port_type: "unknown",
            vid: None,
            pid: None,
            serial: None,
            manufacturer: None,
            product: None,
        };
        match port.port_type {
            SerialPortType::UsbPort(usb) => {
                info.port_type = "usb";
                info.vid = Some(usb.vid);
                info.pid = Some(usb.pid);
                info.serial = usb.serial_number;
                info.manufacturer = usb.manufacturer;
                info.product = usb.product;
            }
            SerialPortType::PciPort => info.port_type = "pci",
            SerialPortType::BluetoothPort => info.port_type = "bluetooth",
            SerialPortType::Unknown => {}
        }
        info
    }
}

/// Return the available ports sorted by name and without duplicates.
pub fn enumerate_ports() -> Vec<PortInfo> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(err) => {
            log::warn!("Failed to enumerate serial ports: {}", err);
            return Vec::new();
        }
    };
    let mut ports: Vec<PortInfo> = ports.into_iter().map(PortInfo::from).collect();
    ports.sort_by(|a, b| a.port_name.cmp(&b.port_name));
    ports.dedup_by(|a, b| a.port_name == b.port_name);
    ports
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::{SerialPortInfo, UsbPortInfo};

    #[test]
    fn test_usb_port_details() {
        let info = PortInfo::from(SerialPortInfo {
            port_name: "/dev/ttyUSB0".to_string(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid: 0x0403,
                pid: 0x6001,
                serial_number: Some("A1".to_string()),
                manufacturer: Some("FTDI".to_string()),
                product: None,
            }),
        });
        assert_eq!(info.port_type, "usb");
        assert_eq!(info.vid, Some(0x0403));

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["manufacturer"], "FTDI");
        assert!(json.get("product").is_none());
    }
}
