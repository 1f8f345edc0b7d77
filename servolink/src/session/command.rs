//! Command session: one command in flight, matched to its reply by sequence
//! number.

use std::time::{Duration, Instant};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::link::Link;
use crate::protocol::{Command, Inbound, Response, Stroke};
use crate::session::SessionConfig;

/// Actuator settings pushed to the controller after connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ActuatorProfile {
    /// Actuator model (6600 or 6700).
    pub actuator_type: u16,
    /// Extension end offset in degrees.
    pub extend_offset: i16,
    /// Retraction end offset in degrees.
    pub retract_offset: i16,
    /// Dwell at the extended end.
    pub extend_dwell_ms: u32,
    /// Dwell at the retracted end.
    pub retract_dwell_ms: u32,
    /// Speed in percent.
    pub speed: u8,
    /// Cycle target for device-driven cycling (0 = infinite).
    pub cycles: u32,
}

impl Default for ActuatorProfile {
    fn default() -> Self {
        Self {
            actuator_type: 6700,
            extend_offset: 0,
            retract_offset: 0,
            extend_dwell_ms: 2200,
            retract_dwell_ms: 2200,
            speed: 100,
            cycles: 0,
        }
    }
}

impl ActuatorProfile {
    /// Commands that apply this profile, in the order the controller expects.
    pub fn commands(&self) -> Vec<Command> {
        vec![
            Command::SetActuatorType(self.actuator_type),
            Command::SetOffset {
                stroke: Stroke::Extend,
                degrees: self.extend_offset,
            },
            Command::SetOffset {
                stroke: Stroke::Retract,
                degrees: self.retract_offset,
            },
            Command::SetTiming {
                stroke: Stroke::Extend,
                dwell_ms: self.extend_dwell_ms,
            },
            Command::SetTiming {
                stroke: Stroke::Retract,
                dwell_ms: self.retract_dwell_ms,
            },
            Command::SetSpeed(self.speed),
            Command::SetCycles(self.cycles),
        ]
    }

    /// Check every value before anything is sent.
    pub fn validate(&self) -> Result<()> {
        self.commands().iter().try_for_each(Command::validate)
    }
}

pub(crate) struct CommandSession<'a> {
    link: &'a Link,
    config: &'a SessionConfig,
}

impl<'a> CommandSession<'a> {
    pub(crate) fn new(link: &'a Link, config: &'a SessionConfig) -> Self {
        Self { link, config }
    }

    /// Send `command` and wait for its reply within the ack timeout.
    pub(crate) fn send(&self, command: &Command) -> Result<Response> {
        self.send_with_timeout(command, self.config.ack_timeout)
    }

    pub(crate) fn send_with_timeout(
        &self,
        command: &Command,
        timeout: Duration,
    ) -> Result<Response> {
        let response = self.exchange(command, timeout)?;
        if response.is_error() {
            return Err(Error::Rejected(format!("{command}: {response}")));
        }
        Ok(response)
    }

    /// Send `command` and return whatever reply carries its sequence number,
    /// `ERR` replies included.
    pub(crate) fn exchange(&self, command: &Command, timeout: Duration) -> Result<Response> {
        command.validate()?;
        self.link.drain_stale();

        let seq = self.link.next_seq();
        debug!("Sending {command} (#{seq})");
        self.link.send(command.encode(seq))?;

        let deadline = Instant::now() + timeout;
        loop {
            match self.link.recv(deadline)? {
                None => {
                    return Err(Error::Timeout(format!(
                        "no reply to {command} within {} ms",
                        timeout.as_millis()
                    )));
                },
                Some(Inbound::Reply { seq: got, response }) if got == seq => {
                    if response.is_error() {
                        debug!("{command} rejected: {response}");
                        return Ok(response);
                    }
                    debug!("{command} acknowledged: {response}");
                    self.link.shared().events().publish(&Event::CommandAcked {
                        command: command.clone(),
                        response: response.clone(),
                    });
                    return Ok(response);
                },
                Some(Inbound::Reply { seq: got, .. }) => {
                    debug!("Discarding reply #{got} while waiting for #{seq}");
                },
                Some(Inbound::Malformed(line)) => {
                    return Err(Error::Protocol(format!(
                        "malformed reply to {command}: '{line}'"
                    )));
                },
                Some(other) => debug!("Ignoring {other:?} while waiting for #{seq}"),
            }
        }
    }

    /// Queue `command` without waiting for a reply.
    pub(crate) fn notify(&self, command: &Command) -> Result<()> {
        let seq = self.link.next_seq();
        debug!("Sending {command} (#{seq}, no wait)");
        self.link.send(command.encode(seq))
    }

    /// Check the device answers `PING` with `PONG`.
    pub(crate) fn handshake(&self) -> Result<()> {
        let response = self.send(&Command::Ping)?;
        if response.kind != "PONG" {
            return Err(Error::Protocol(format!(
                "expected PONG, device answered {response}"
            )));
        }
        Ok(())
    }

    /// Push every setting of `profile`, stopping at the first failure.
    pub(crate) fn sync_profile(&self, profile: &ActuatorProfile) -> Result<()> {
        profile.validate()?;
        for command in profile.commands() {
            self.send(&command)?;
        }
        info!("Actuator profile synced to {}", self.link.port_name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profile_matches_controller_defaults() {
        let profile = ActuatorProfile::default();
        assert_eq!(profile.actuator_type, 6700);
        assert_eq!(profile.extend_dwell_ms, 2200);
        assert_eq!(profile.speed, 100);
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn test_profile_commands_order() {
        let bodies: Vec<String> = ActuatorProfile::default()
            .commands()
            .iter()
            .map(Command::body)
            .collect();
        assert_eq!(
            bodies,
            vec![
                "SET_TYPE:6700",
                "SET_EXTEND:0",
                "SET_RETRACT:0",
                "SET_DWELL_EXT:2200",
                "SET_DWELL_RET:2200",
                "SET_SPEED:100",
                "SET_CYCLES:0",
            ]
        );
    }

    #[test]
    fn test_invalid_profile_is_rejected_up_front() {
        let profile = ActuatorProfile {
            speed: 0,
            ..ActuatorProfile::default()
        };
        assert!(matches!(profile.validate(), Err(Error::InvalidCommand(_))));
    }
}
