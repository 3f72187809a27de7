//! Serial transport
//!
//! A narrow write-side trait the engine owns, its `serialport`-backed
//! implementation, and port enumeration for front-ends. The read side
//! runs on a dedicated thread that splits the byte stream into lines
//! and forwards them to the engine's channel; Grbl guarantees no
//! framing beyond newline-terminated text.

use grblhost_core::error::TransportError;
use std::io::Read;
use std::time::Duration;
use tokio::sync::mpsc;

/// Write side of the serial link
pub trait Transport: Send {
    /// Write raw bytes; fire-and-forget.
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Port name for diagnostics.
    fn port_name(&self) -> &str;

    /// Close the port.
    fn close(&mut self);
}

/// Serial parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity bit (8-N-1, the Grbl default).
    #[default]
    None,
    /// Even parity.
    Even,
    /// Odd parity.
    Odd,
}

/// Options for opening a serial port
#[derive(Debug, Clone)]
pub struct PortOptions {
    /// Port path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Parity.
    pub parity: Parity,
}

impl PortOptions {
    /// Options for a port at the Grbl default 115200 baud, 8-N-1
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: 115_200,
            parity: Parity::None,
        }
    }
}

/// Events forwarded from the reader thread
#[derive(Debug, Clone, PartialEq)]
pub enum SerialEvent {
    /// One complete line, newline stripped.
    Line(String),
    /// The port went away; the engine closes down.
    Closed(String),
}

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq)]
pub struct PortInfo {
    /// Port path.
    pub port_name: String,
    /// Human-readable description.
    pub description: String,
    /// Manufacturer, if the port reports one.
    pub manufacturer: Option<String>,
}

/// List serial ports that look like CNC controllers
///
/// Filters to the patterns controllers enumerate as:
/// - Windows: `COM*`
/// - Linux: `/dev/ttyUSB*`, `/dev/ttyACM*`
/// - macOS: `/dev/cu.usbserial-*`, `/dev/cu.usbmodem*`
pub fn list_ports() -> Result<Vec<PortInfo>, TransportError> {
    let ports = serialport::available_ports().map_err(|e| TransportError::FailedToOpen {
        port: "<enumeration>".to_string(),
        reason: e.to_string(),
    })?;

    Ok(ports
        .iter()
        .filter(|p| is_controller_port(&p.port_name))
        .map(|p| {
            let (description, manufacturer) = match &p.port_type {
                serialport::SerialPortType::UsbPort(usb) => (
                    format!(
                        "USB {} {}",
                        usb.manufacturer.as_deref().unwrap_or("Device"),
                        usb.product.as_deref().unwrap_or("Serial Port")
                    ),
                    usb.manufacturer.clone(),
                ),
                serialport::SerialPortType::BluetoothPort => {
                    ("Bluetooth Serial".to_string(), None)
                }
                serialport::SerialPortType::PciPort => ("PCI Serial".to_string(), None),
                _ => ("Serial Port".to_string(), None),
            };
            PortInfo {
                port_name: p.port_name.clone(),
                description,
                manufacturer,
            }
        })
        .collect())
}

fn is_controller_port(port_name: &str) -> bool {
    if let Some(rest) = port_name.strip_prefix("COM") {
        return !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit());
    }

    port_name.starts_with("/dev/ttyUSB")
        || port_name.starts_with("/dev/ttyACM")
        || port_name.starts_with("/dev/cu.usbserial-")
        || port_name.starts_with("/dev/cu.usbmodem")
}

/// `serialport`-backed transport
pub struct SerialTransport {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
}

impl SerialTransport {
    /// Open a port and spawn its reader thread. Returns the write-side
    /// transport and a channel of inbound lines.
    pub fn open(
        options: &PortOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SerialEvent>), TransportError> {
        let parity = match options.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        };

        let port = serialport::new(&options.port, options.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(parity)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|e| TransportError::FailedToOpen {
                port: options.port.clone(),
                reason: e.to_string(),
            })?;

        let reader = port.try_clone().map_err(|e| TransportError::FailedToOpen {
            port: options.port.clone(),
            reason: e.to_string(),
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let port_name = options.port.clone();
        std::thread::Builder::new()
            .name(format!("serial-reader {}", port_name))
            .spawn(move || read_lines(reader, tx))
            .map_err(TransportError::Io)?;

        Ok((
            Self {
                port: Some(port),
                name: options.port.clone(),
            },
            rx,
        ))
    }
}

fn read_lines(
    mut reader: Box<dyn serialport::SerialPort>,
    tx: mpsc::UnboundedSender<SerialEvent>,
) {
    let mut pending = String::new();
    let mut buf = [0u8; 256];

    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                let _ = tx.send(SerialEvent::Closed("end of stream".to_string()));
                return;
            }
            Ok(n) => {
                pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                while let Some(pos) = pending.find('\n') {
                    let line = pending[..pos].trim_end_matches('\r').to_string();
                    pending.drain(..=pos);
                    if tx.send(SerialEvent::Line(line)).is_err() {
                        return;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.send(SerialEvent::Closed(e.to_string()));
                return;
            }
        }
    }
}

impl Transport for SerialTransport {
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let Some(port) = self.port.as_mut() else {
            return Err(TransportError::NotOpen);
        };
        use std::io::Write;
        port.write_all(data).map_err(|e| {
            tracing::error!("serial write failed: {}", e);
            TransportError::Disconnected {
                reason: e.to_string(),
            }
        })
    }

    fn port_name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) {
        // Dropping the handle closes the descriptor; the reader thread
        // notices on its next read.
        self.port = None;
    }
}
