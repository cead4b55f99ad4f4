use crate::{PortBackend, PortInfo, Result, SerialBus, TransportError};
use serialport::{SerialPort, SerialPortType};
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

/// Operating-system serial ports through the `serialport` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeBackend;

impl PortBackend for NativeBackend {
    fn list(&self) -> Result<Vec<PortInfo>> {
        let mut out = Vec::new();
        for p in serialport::available_ports().map_err(|e| TransportError::Io(e.to_string()))? {
            let driver = match p.port_type {
                SerialPortType::UsbPort(u) => format!("usb:{:04x}:{:04x}", u.vid, u.pid),
                SerialPortType::PciPort => "pci".to_string(),
                SerialPortType::BluetoothPort => "bluetooth".to_string(),
                SerialPortType::Unknown => "serial".to_string(),
            };
            out.push(PortInfo::new(p.port_name, driver));
        }
        Ok(out)
    }

    fn open(&self, name: &str, baud_rate: u32) -> Result<Box<dyn SerialBus>> {
        let port = serialport::new(name, baud_rate)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => TransportError::PortNotFound(name.to_string()),
                _ => TransportError::Io(e.to_string()),
            })?;
        tracing::debug!(port = name, baud_rate, "serial port opened");
        Ok(Box::new(NativePort {
            name: name.to_string(),
            port: Some(port),
        }))
    }
}

pub struct NativePort {
    name: String,
    port: Option<Box<dyn SerialPort>>,
}

impl NativePort {
    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(TransportError::NotOpen)
    }
}

impl SerialBus for NativePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.port()?;
        port.write_all(bytes)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        port.flush().map_err(|e| TransportError::Io(e.to_string()))
    }

    fn read_exact(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let port = self.port()?;
        let mut got = 0;
        while got < buf.len() {
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout {
                    got,
                    wanted: buf.len(),
                });
            }
            match port.read(&mut buf[got..]) {
                Ok(0) => continue,
                Ok(n) => got += n,
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                    continue
                }
                Err(e) => return Err(TransportError::Io(e.to_string())),
            }
        }
        Ok(())
    }

    fn clear_input(&mut self) -> Result<()> {
        self.port()?
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the handle releases the OS descriptor.
        if self.port.take().is_none() {
            return Err(TransportError::NotOpen);
        }
        Ok(())
    }
}
