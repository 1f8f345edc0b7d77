//! Connection manager: owns at most one open device handle.
//!
//! ```text
//!  Disconnected ──connect──▶ Connecting ──PONG──▶ Connected
//!        ▲                       │                    │
//!        │                   open/PING             I/O error
//!        │                     failed                 │
//!        └──────disconnect────── Error ◀──────────────┘
//! ```

use std::fmt;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};

use crate::device::{self, Scan, ScanFilter};
use crate::error::{Error, Result};
use crate::event::{Event, EventBus};
use crate::link::Link;
use crate::port::{PortOpener, SerialConfig};
use crate::session::SessionConfig;
use crate::session::command::CommandSession;

/// Connection state of the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No handle open.
    #[default]
    Disconnected,
    /// Opening the port and waiting for the handshake.
    Connecting,
    /// Handshake done, link running.
    Connected,
    /// The last connect failed or the link dropped.
    Error,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// State shared between the manager and the link thread.
#[derive(Debug, Default)]
pub(crate) struct ConnectionShared {
    state: Mutex<ConnectionState>,
    port: Mutex<Option<String>>,
    last_error: Mutex<Option<String>>,
    events: EventBus,
}

impl ConnectionShared {
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Update the state, publishing only actual changes.
    pub(crate) fn set_state(&self, new: ConnectionState) {
        let changed = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = *state != new;
            *state = new;
            changed
        };
        if changed {
            debug!("Connection state: {new}");
            self.events.publish(&Event::ConnectionChanged {
                state: new,
                port: self.port(),
            });
        }
    }

    pub(crate) fn port(&self) -> Option<String> {
        self.port
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_port(&self, port: Option<String>) {
        *self.port.lock().unwrap_or_else(PoisonError::into_inner) = port;
    }

    pub(crate) fn set_error(&self, reason: &str) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.to_string());
    }

    fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }
}

/// An open connection to one device.
pub struct DeviceHandle {
    baud_rate: u32,
    link: Arc<Link>,
}

impl DeviceHandle {
    /// Port name/path.
    pub fn port_name(&self) -> &str {
        self.link.port_name()
    }

    /// Baud rate the port was opened with.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Whether the link is still running.
    pub fn is_alive(&self) -> bool {
        self.link.is_alive()
    }

    pub(crate) fn link(&self) -> &Arc<Link> {
        &self.link
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("port", &self.port_name())
            .field("baud_rate", &self.baud_rate)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Discovers, opens and monitors the serial link to one paired device.
pub struct ConnectionManager {
    opener: Arc<dyn PortOpener>,
    config: SessionConfig,
    shared: Arc<ConnectionShared>,
    handle: Option<DeviceHandle>,
}

impl ConnectionManager {
    /// Create a manager that opens ports through `opener`.
    pub fn new(opener: Arc<dyn PortOpener>, config: SessionConfig) -> Self {
        Self {
            opener,
            config,
            shared: Arc::new(ConnectionShared::default()),
            handle: None,
        }
    }

    /// Create a manager for native serial ports.
    #[cfg(feature = "native")]
    pub fn native(config: SessionConfig) -> Self {
        Self::new(Arc::new(crate::port::NativeOpener), config)
    }

    /// Enumerate endpoints matching `filter`.
    pub fn scan(&self, filter: ScanFilter) -> Scan {
        device::scan(filter)
    }

    /// Open `port`, wait for it to settle and check the device answers `PING`.
    ///
    /// An existing handle is closed first.
    pub fn connect(&mut self, port: &str, baud_rate: u32) -> Result<&DeviceHandle> {
        if self.handle.is_some() {
            info!("Closing current connection before connecting to {port}");
            self.disconnect();
        }

        self.shared.set_port(Some(port.to_string()));
        self.shared.set_state(ConnectionState::Connecting);
        info!("Connecting to {port} at {baud_rate} baud");

        match self.open_and_handshake(port, baud_rate) {
            Ok(link) => {
                self.shared.set_state(ConnectionState::Connected);
                info!("Connected to {port}");
                Ok(self.handle.insert(DeviceHandle {
                    baud_rate,
                    link: Arc::new(link),
                }))
            },
            Err(e) => {
                warn!("Connection to {port} failed: {e}");
                self.shared.set_error(&e.to_string());
                self.shared.set_state(ConnectionState::Error);
                Err(e)
            },
        }
    }

    fn open_and_handshake(&self, port: &str, baud_rate: u32) -> Result<Link> {
        let serial = SerialConfig::new(port, baud_rate).with_timeout(self.config.ack_timeout);
        let opened = self.opener.open(&serial)?;
        std::thread::sleep(self.config.settle_delay);

        let link = Link::spawn(opened, Arc::clone(&self.shared))?;
        match CommandSession::new(&link, &self.config).handshake() {
            Ok(()) => Ok(link),
            Err(Error::Timeout(_)) => Err(Error::Connection(format!(
                "{port} opened but the device did not answer PING; check that it is paired and powered"
            ))),
            Err(Error::ConnectionLost) => Err(Error::Connection(format!(
                "{port} closed during the handshake"
            ))),
            Err(e @ (Error::Protocol(_) | Error::Rejected(_))) => Err(Error::Connection(
                format!("{port} is not an actuator controller: {e}"),
            )),
            Err(e) => Err(e),
        }
    }

    /// Close the handle, if any. Always leaves the manager disconnected.
    pub fn disconnect(&mut self) {
        if let Some(handle) = self.handle.take() {
            info!("Disconnecting from {}", handle.port_name());
            handle.link.close();
        }
        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.set_port(None);
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// The open handle, if any.
    pub fn handle(&self) -> Option<&DeviceHandle> {
        self.handle.as_ref()
    }

    /// Reason of the last connect failure or link loss.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error()
    }

    /// Session timeouts used by this manager.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Subscribe to connection, report and progress events.
    pub fn subscribe(&self) -> Receiver<Event> {
        self.shared.events().subscribe()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.disconnect();
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Error.is_connected());
    }

    #[test]
    fn test_set_state_publishes_only_changes() {
        let shared = ConnectionShared::default();
        let rx = shared.events().subscribe();

        shared.set_state(ConnectionState::Connecting);
        shared.set_state(ConnectionState::Connecting);
        shared.set_state(ConnectionState::Connected);

        let states: Vec<ConnectionState> = rx
            .try_iter()
            .filter_map(|e| match e {
                Event::ConnectionChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }
}
