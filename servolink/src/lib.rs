//! # servolink
//!
//! A library for controlling servo actuators and updating their controller
//! firmware over a Bluetooth serial link.
//!
//! The controller (an ESP32 running the actuator firmware) is reached through
//! a serial port, usually the one the OS creates for a paired Bluetooth SPP
//! device. This crate provides:
//!
//! - Port discovery with Bluetooth / USB bridge classification
//! - A connection manager with a `PING`/`PONG` handshake
//! - Sequence-numbered commands with bounded acknowledgement waits
//! - Host-driven cycling with cooperative cancellation
//! - Block-based firmware updates with CRC checks and bounded retries
//! - A simulated controller for tests and demos
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via the `serialport` crate
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use servolink::{Command, Controller, FirmwareImage, Position, SessionConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let mut controller = Controller::native(SessionConfig::default());
//!         controller.connect("/dev/rfcomm0", 115_200)?;
//!
//!         controller.command(Command::SetPosition(Position::Extend))?;
//!
//!         let report = controller.start_cycle(5, Duration::from_millis(500))?.wait()?;
//!         println!("{} cycles done", report.state.current);
//!
//!         let image = FirmwareImage::from_file("firmware.bin", 512)?;
//!         let update = controller.begin_firmware_update(image)?.wait()?;
//!         update.into_result()?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod connection;
pub mod controller;
pub mod device;
pub mod error;
pub mod event;
pub mod image;
mod link;
pub mod port;
pub mod protocol;
pub mod session;
pub mod sim;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Only the first
/// registration takes effect.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativeOpener, NativePort};
pub use {
    connection::{ConnectionManager, ConnectionState, DeviceHandle},
    controller::Controller,
    device::{DetectedPort, DeviceKind, Scan, ScanFilter, TransportKind},
    error::{Error, Result},
    event::{Event, EventBus},
    image::{AppDescriptor, FirmwareImage},
    port::{Port, PortOpener, SerialConfig},
    protocol::{Command, Position, Report, Response, Stroke},
    session::{
        ActuatorProfile, CancelToken, CycleReport, CycleState, FirmwareRisk, Pending, Phase,
        SessionConfig, SlotState, TransferState, UpdateOutcome, UpdateReport,
    },
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_default_false() {
        assert!(!is_interrupted_requested());
    }
}
