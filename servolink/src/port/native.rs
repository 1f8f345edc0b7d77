//! Native serial port implementation using the `serialport` crate.
//!
//! On Windows a paired SPP device appears as an outgoing COM port, on Linux as
//! `/dev/rfcommN`, on macOS as `/dev/cu.<name>`; all are opened the same way.

use {
    crate::{
        error::{Error, Result},
        port::{DataBits, FlowControl, Parity, Port, PortOpener, SerialConfig, StopBits},
    },
    log::{debug, trace},
    serialport::ClearBuffer,
    std::{
        io::{Read, Write},
        time::Duration,
    },
};

/// Native serial port implementation.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    timeout: Duration,
    baud_rate: u32,
}

impl NativePort {
    /// Open a serial port with the given configuration.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        debug!(
            "Opening {} at {} baud",
            config.port_name, config.baud_rate
        );
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(config.data_bits.into())
            .parity(config.parity.into())
            .stop_bits(config.stop_bits.into())
            .flow_control(config.flow_control.into())
            .open()?;

        Ok(Self {
            port: Some(port),
            name: config.port_name.clone(),
            timeout: config.timeout,
            baud_rate: config.baud_rate,
        })
    }

    fn closed_error() -> Error {
        Error::Serial(serialport::Error::new(
            serialport::ErrorKind::NoDevice,
            "Port is closed",
        ))
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        let p = self.port.as_mut().ok_or_else(Self::closed_error)?;
        p.set_timeout(timeout)?;
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.clear(ClearBuffer::All)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the boxed handle closes the OS port.
        if self.port.take().is_some() {
            trace!("Closed {}", self.name);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.read(buf))
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(std::io::Write::flush)
    }
}

/// Opens [`NativePort`]s and classifies open failures as connection errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeOpener;

impl PortOpener for NativeOpener {
    fn open(&self, config: &SerialConfig) -> Result<Box<dyn Port>> {
        match NativePort::open(config) {
            Ok(port) => Ok(Box::new(port)),
            Err(Error::Serial(e)) => Err(Error::Connection(describe_open_error(
                &config.port_name,
                &e,
            ))),
            Err(e) => Err(e),
        }
    }
}

/// Turn a `serialport` open failure into a user-facing reason.
fn describe_open_error(port: &str, err: &serialport::Error) -> String {
    match err.kind() {
        serialport::ErrorKind::NoDevice => format!("{port} is unavailable: {err}"),
        serialport::ErrorKind::Io(kind)
            if matches!(
                kind,
                std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::ResourceBusy
            ) =>
        {
            format!("{port} is busy: {err}")
        },
        serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
            format!("{port} does not exist")
        },
        _ => format!("cannot open {port}: {err}"),
    }
}

// Type conversions from our types to serialport types

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => Self::Seven,
            DataBits::Eight => Self::Eight,
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => Self::None,
            Parity::Odd => Self::Odd,
            Parity::Even => Self::Even,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => Self::One,
            StopBits::Two => Self::Two,
        }
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

    #[test]
    fn test_open_missing_port_is_connection_error() {
        let config = SerialConfig::new("/dev/servolink-does-not-exist", 115_200);
        match NativeOpener.open(&config) {
            Err(Error::Connection(msg)) => {
                assert!(msg.contains("servolink-does-not-exist"));
            },
            Err(other) => panic!("expected connection error, got {other}"),
            Ok(_) => panic!("opening a missing port must fail"),
        }
    }

    #[test]
    fn test_describe_busy_port() {
        let err = serialport::Error::new(
            serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied),
            "access denied",
        );
        assert!(describe_open_error("COM5", &err).contains("busy"));
    }

    #[test]
    fn test_describe_unavailable_port() {
        let err = serialport::Error::new(serialport::ErrorKind::NoDevice, "gone");
        assert!(describe_open_error("COM5", &err).contains("unavailable"));
    }
}
