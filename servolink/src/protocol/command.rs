//! Text command protocol spoken by the actuator controller.
//!
//! ## Frame Format
//!
//! Host to device, one line per command:
//!
//! ```text
//! BODY#SEQ\n          e.g.  SET_SPEED:80#17
//! ```
//!
//! Device to host, one line per message:
//!
//! ```text
//! TYPE[:payload]#SEQ  reply to command SEQ (ERR = rejected)
//! OTA_ACK:n           firmware block n accepted
//! OTA_NAK:n           firmware block n must be resent
//! TYPE[:payload]      unsolicited report (PROGRESS, COMPLETE, STATUS, ...)
//! ```
//!
//! Payloads are comma separated; `K=V` items become fields, bare items
//! become flags (`OK:OTA_READY,SIZE=4096`).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Highest accepted speed, in percent.
pub const MAX_SPEED: u8 = 100;

/// Longest accepted dwell time.
pub const MAX_DWELL_MS: u32 = 60_000;

/// Largest stroke offset in degrees, either direction.
pub const MAX_OFFSET_DEG: i16 = 90;

/// Largest finite cycle target; 0 means "run until stopped".
pub const MAX_CYCLES: u32 = 100_000;

/// Actuator models the controller firmware knows.
pub const ACTUATOR_TYPES: &[u16] = &[6600, 6700];

/// Separates a command body from its sequence number on the wire.
const SEQ_SEPARATOR: char = '#';

/// Commands starting with this belong to the firmware update exchange.
const FIRMWARE_PREFIX: &str = "OTA_";

/// Target position of the actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Neutral centre position.
    Home,
    /// Fully extended.
    Extend,
    /// Fully retracted.
    Retract,
}

impl Position {
    /// The other end of the stroke; `Home` maps to `Extend`.
    pub fn opposite(self) -> Self {
        match self {
            Self::Extend => Self::Retract,
            Self::Retract | Self::Home => Self::Extend,
        }
    }
}

impl FromStr for Position {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "home" => Ok(Self::Home),
            "extend" | "ext" => Ok(Self::Extend),
            "retract" | "ret" => Ok(Self::Retract),
            other => Err(Error::InvalidCommand(format!("unknown position '{other}'"))),
        }
    }
}

/// One end of the stroke, used for per-direction settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stroke {
    /// Extension stroke.
    Extend,
    /// Retraction stroke.
    Retract,
}

/// An outbound instruction to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Liveness probe, answered with `PONG`.
    Ping,
    /// Move to a position.
    SetPosition(Position),
    /// Movement speed in percent (1..=100).
    SetSpeed(u8),
    /// Dwell time at one end of the stroke.
    SetTiming {
        /// Which end.
        stroke: Stroke,
        /// Dwell in milliseconds.
        dwell_ms: u32,
    },
    /// Angular offset of one end of the stroke.
    SetOffset {
        /// Which end.
        stroke: Stroke,
        /// Offset in degrees.
        degrees: i16,
    },
    /// Select the actuator model.
    SetActuatorType(u16),
    /// Cycle target for device-driven cycling (0 = infinite).
    SetCycles(u32),
    /// Start device-driven cycling.
    StartCycle,
    /// Stop cycling and idle.
    StopCycle,
    /// Pause cycling.
    PauseCycle,
    /// Resume paused cycling.
    ResumeCycle,
    /// Query state and position.
    Status,
    /// Query stored settings.
    GetSettings,
    /// Query firmware version.
    GetVersion,
    /// Announce a firmware image.
    OtaStart {
        /// Image size in bytes.
        size: u32,
        /// CRC-32 of the image.
        crc: u32,
        /// Block payload size.
        block_size: u16,
    },
    /// All blocks sent, request verification.
    OtaEnd,
    /// Abandon a firmware transfer.
    OtaAbort,
    /// Free-form line, sent verbatim.
    Raw(String),
}

impl Command {
    /// Check parameter ranges.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::SetSpeed(p) if *p == 0 || *p > MAX_SPEED => Err(Error::InvalidCommand(
                format!("speed {p}% outside 1..={MAX_SPEED}"),
            )),
            Self::SetTiming { dwell_ms, .. } if *dwell_ms > MAX_DWELL_MS => {
                Err(Error::InvalidCommand(format!(
                    "dwell {dwell_ms} ms exceeds {MAX_DWELL_MS} ms"
                )))
            },
            Self::SetOffset { degrees, .. } if degrees.unsigned_abs() > MAX_OFFSET_DEG.unsigned_abs() => {
                Err(Error::InvalidCommand(format!(
                    "offset {degrees} deg outside -{MAX_OFFSET_DEG}..={MAX_OFFSET_DEG}"
                )))
            },
            Self::SetActuatorType(t) if !ACTUATOR_TYPES.contains(t) => Err(
                Error::InvalidCommand(format!("unknown actuator type {t}")),
            ),
            Self::SetCycles(n) if *n > MAX_CYCLES => Err(Error::InvalidCommand(format!(
                "cycle target {n} exceeds {MAX_CYCLES}"
            ))),
            Self::OtaStart { size, block_size, .. } if *size == 0 || *block_size == 0 => {
                Err(Error::InvalidCommand("empty firmware announcement".into()))
            },
            Self::Raw(text) if text.trim().is_empty() => {
                Err(Error::InvalidCommand("empty command".into()))
            },
            Self::Raw(text) if text.contains(['\n', '\r']) => Err(Error::InvalidCommand(
                "command must be a single line".into(),
            )),
            Self::Raw(text) if text.contains(SEQ_SEPARATOR) => Err(Error::InvalidCommand(
                format!("'{SEQ_SEPARATOR}' is reserved for sequence numbers"),
            )),
            Self::Raw(_) if self.is_firmware() => Err(Error::InvalidCommand(format!(
                "{self} is reserved for firmware updates"
            ))),
            _ => Ok(()),
        }
    }

    /// Whether this command belongs to the firmware update exchange.
    pub fn is_firmware(&self) -> bool {
        match self {
            Self::OtaStart { .. } | Self::OtaEnd | Self::OtaAbort => true,
            Self::Raw(text) => text
                .trim_start()
                .get(..FIRMWARE_PREFIX.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(FIRMWARE_PREFIX)),
            _ => false,
        }
    }

    /// Command text without sequence number.
    pub fn body(&self) -> String {
        match self {
            Self::Ping => "PING".into(),
            Self::SetPosition(Position::Home) => "GO_HOME".into(),
            Self::SetPosition(Position::Extend) => "GO_EXTEND".into(),
            Self::SetPosition(Position::Retract) => "GO_RETRACT".into(),
            Self::SetSpeed(p) => format!("SET_SPEED:{p}"),
            Self::SetTiming {
                stroke: Stroke::Extend,
                dwell_ms,
            } => format!("SET_DWELL_EXT:{dwell_ms}"),
            Self::SetTiming {
                stroke: Stroke::Retract,
                dwell_ms,
            } => format!("SET_DWELL_RET:{dwell_ms}"),
            Self::SetOffset {
                stroke: Stroke::Extend,
                degrees,
            } => format!("SET_EXTEND:{degrees}"),
            Self::SetOffset {
                stroke: Stroke::Retract,
                degrees,
            } => format!("SET_RETRACT:{degrees}"),
            Self::SetActuatorType(t) => format!("SET_TYPE:{t}"),
            Self::SetCycles(n) => format!("SET_CYCLES:{n}"),
            Self::StartCycle => "START".into(),
            Self::StopCycle => "STOP".into(),
            Self::PauseCycle => "PAUSE".into(),
            Self::ResumeCycle => "RESUME".into(),
            Self::Status => "STATUS".into(),
            Self::GetSettings => "GET_SETTINGS".into(),
            Self::GetVersion => "GET_VERSION".into(),
            Self::OtaStart {
                size,
                crc,
                block_size,
            } => format!("OTA_START:{size},{crc:08X},{block_size}"),
            Self::OtaEnd => "OTA_END".into(),
            Self::OtaAbort => "OTA_ABORT".into(),
            Self::Raw(text) => text.trim().to_string(),
        }
    }

    /// Encode as a wire line carrying `seq`.
    pub fn encode(&self, seq: u16) -> Vec<u8> {
        format!("{}{SEQ_SEPARATOR}{seq}\n", self.body()).into_bytes()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.body())
    }
}

fn parse_arg<T: FromStr>(name: &str, arg: Option<&str>) -> Result<T> {
    let arg = arg.ok_or_else(|| Error::InvalidCommand(format!("{name} needs a value")))?;
    arg.trim()
        .parse()
        .map_err(|_| Error::InvalidCommand(format!("{name}: invalid value '{arg}'")))
}

impl FromStr for Command {
    type Err = Error;

    /// Parse the command text a user would type (`SET_SPEED:80`, `go_home`).
    ///
    /// Firmware commands are not accepted here.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (name, arg) = match s.split_once(':') {
            Some((n, a)) => (n, Some(a)),
            None => (s, None),
        };
        let name = name.trim().to_ascii_uppercase();
        let cmd = match name.as_str() {
            "PING" => Self::Ping,
            "GO_HOME" => Self::SetPosition(Position::Home),
            "GO_EXTEND" => Self::SetPosition(Position::Extend),
            "GO_RETRACT" => Self::SetPosition(Position::Retract),
            "SET_SPEED" => Self::SetSpeed(parse_arg(&name, arg)?),
            "SET_DWELL_EXT" => Self::SetTiming {
                stroke: Stroke::Extend,
                dwell_ms: parse_arg(&name, arg)?,
            },
            "SET_DWELL_RET" => Self::SetTiming {
                stroke: Stroke::Retract,
                dwell_ms: parse_arg(&name, arg)?,
            },
            "SET_EXTEND" => Self::SetOffset {
                stroke: Stroke::Extend,
                degrees: parse_arg(&name, arg)?,
            },
            "SET_RETRACT" => Self::SetOffset {
                stroke: Stroke::Retract,
                degrees: parse_arg(&name, arg)?,
            },
            "SET_TYPE" => Self::SetActuatorType(parse_arg(&name, arg)?),
            "SET_CYCLES" => Self::SetCycles(parse_arg(&name, arg)?),
            "START" => Self::StartCycle,
            "STOP" => Self::StopCycle,
            "PAUSE" => Self::PauseCycle,
            "RESUME" => Self::ResumeCycle,
            "STATUS" => Self::Status,
            "GET_SETTINGS" => Self::GetSettings,
            "GET_VERSION" => Self::GetVersion,
            other => {
                return Err(Error::InvalidCommand(format!("unknown command '{other}'")));
            },
        };
        cmd.validate()?;
        Ok(cmd)
    }
}

/// A decoded `TYPE[:payload]` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Message type (`OK`, `PONG`, `ERR`, `STATUS`, ...).
    pub kind: String,
    /// Raw payload after the first `:`.
    pub payload: String,
    /// `K=V` items of the payload.
    pub fields: BTreeMap<String, String>,
    /// Payload items without `=`.
    pub flags: Vec<String>,
}

impl Response {
    /// Split `TYPE[:payload]` into its parts.
    pub fn parse(text: &str) -> Self {
        let (kind, payload) = match text.split_once(':') {
            Some((k, p)) => (k.trim(), p.trim()),
            None => (text.trim(), ""),
        };

        let mut fields = BTreeMap::new();
        let mut flags = Vec::new();
        for item in payload.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            match item.split_once('=') {
                Some((k, v)) => {
                    fields.insert(k.trim().to_string(), v.trim().to_string());
                },
                None => flags.push(item.to_string()),
            }
        }

        Self {
            kind: kind.to_string(),
            payload: payload.to_string(),
            fields,
            flags,
        }
    }

    /// Whether the device rejected the command.
    pub fn is_error(&self) -> bool {
        self.kind == "ERR"
    }

    /// Whether a bare flag such as `OTA_READY` is present.
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    /// Field as text.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Field as an integer, when it parses as one.
    pub fn int(&self, key: &str) -> Option<i64> {
        self.text(key).and_then(|v| v.parse().ok())
    }

    /// Field as a hexadecimal `u32` (checksums).
    pub fn hex(&self, key: &str) -> Option<u32> {
        self.text(key).and_then(|v| {
            let v = v.trim_start_matches("0x").trim_start_matches("0X");
            u32::from_str_radix(v, 16).ok()
        })
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            f.write_str(&self.kind)
        } else {
            write!(f, "{}:{}", self.kind, self.payload)
        }
    }
}

/// Unsolicited device message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    /// Device-driven cycling progress.
    Progress {
        /// Cycles finished so far.
        cycle: u32,
        /// Cycle target (0 = infinite).
        target: u32,
    },
    /// Device-driven cycling finished.
    Complete {
        /// Cycles performed.
        cycles: u32,
    },
    /// Periodic or requested state report.
    Status {
        /// Controller state name (`IDLE`, `RUNNING`, `PAUSED`, ...).
        state: String,
        /// Current position in degrees.
        position: Option<i64>,
    },
    /// Firmware write progress in percent, as seen by the device.
    OtaProgress(u8),
    /// Anything else the device printed.
    Log(String),
}

impl Report {
    fn from_line(line: &str) -> Self {
        let msg = Response::parse(line);
        let count = |key: &str| {
            msg.int(key)
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(0)
        };
        match msg.kind.as_str() {
            "PROGRESS" => Self::Progress {
                cycle: count("CYCLE"),
                target: count("TARGET"),
            },
            "COMPLETE" => Self::Complete {
                cycles: count("CYCLES"),
            },
            "STATUS" => Self::Status {
                state: msg.text("STATE").unwrap_or("UNKNOWN").to_string(),
                position: msg.int("POS"),
            },
            "OTA_PROGRESS" => match msg.payload.parse::<u8>() {
                Ok(pct) => Self::OtaProgress(pct.min(100)),
                Err(_) => Self::Log(line.to_string()),
            },
            _ => Self::Log(line.to_string()),
        }
    }
}

/// Classified inbound line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Reply to the command with sequence number `seq`.
    Reply {
        /// Sequence number echoed by the device.
        seq: u16,
        /// Decoded reply.
        response: Response,
    },
    /// Verdict on a firmware block.
    BlockAck {
        /// Block index.
        index: u16,
        /// `true` for `OTA_ACK`, `false` for `OTA_NAK`.
        accepted: bool,
    },
    /// Unsolicited report.
    Report(Report),
    /// A reply-shaped line that could not be decoded.
    Malformed(String),
}

fn is_type_token(s: &str) -> bool {
    !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
}

/// Classify one line received from the device.
pub fn parse_line(line: &str) -> Inbound {
    let line = line.trim_end_matches(['\r', '\n']);
    let kind = line.split(':').next().unwrap_or_default();

    if let Some((head, seq)) = line.rsplit_once(SEQ_SEPARATOR) {
        let head_kind = head.split(':').next().unwrap_or_default();
        if is_type_token(head_kind) && !seq.contains(char::is_whitespace) {
            return match seq.parse::<u16>() {
                Ok(seq) if seq != 0 => Inbound::Reply {
                    seq,
                    response: Response::parse(head),
                },
                _ => Inbound::Malformed(line.to_string()),
            };
        }
    }

    if kind == "OTA_ACK" || kind == "OTA_NAK" {
        let accepted = kind == "OTA_ACK";
        return match line[kind.len()..].trim_start_matches(':').trim().parse() {
            Ok(index) => Inbound::BlockAck { index, accepted },
            Err(_) => Inbound::Malformed(line.to_string()),
        };
    }

    Inbound::Report(Report::from_line(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command_lines() {
        assert_eq!(Command::Ping.encode(1), b"PING#1\n");
        assert_eq!(
            Command::SetPosition(Position::Retract).encode(42),
            b"GO_RETRACT#42\n"
        );
        assert_eq!(
            Command::SetTiming {
                stroke: Stroke::Extend,
                dwell_ms: 2200
            }
            .body(),
            "SET_DWELL_EXT:2200"
        );
        assert_eq!(
            Command::SetOffset {
                stroke: Stroke::Retract,
                degrees: -12
            }
            .body(),
            "SET_RETRACT:-12"
        );
        assert_eq!(
            Command::OtaStart {
                size: 4096,
                crc: 0xCBF4_3926,
                block_size: 512
            }
            .body(),
            "OTA_START:4096,CBF43926,512"
        );
    }

    #[test]
    fn test_validate_ranges() {
        assert!(Command::SetSpeed(100).validate().is_ok());
        assert!(Command::SetSpeed(0).validate().is_err());
        assert!(Command::SetSpeed(101).validate().is_err());
        assert!(
            Command::SetTiming {
                stroke: Stroke::Retract,
                dwell_ms: 60_001
            }
            .validate()
            .is_err()
        );
        assert!(
            Command::SetOffset {
                stroke: Stroke::Extend,
                degrees: -91
            }
            .validate()
            .is_err()
        );
        assert!(Command::SetActuatorType(6700).validate().is_ok());
        assert!(Command::SetActuatorType(1234).validate().is_err());
        assert!(Command::SetCycles(0).validate().is_ok());
        assert!(Command::SetCycles(100_001).validate().is_err());
        assert!(Command::Raw("A\nB".into()).validate().is_err());
        assert!(Command::Raw("  ".into()).validate().is_err());
        assert!(Command::Raw("STATUS#7".into()).validate().is_err());
        assert!(Command::Raw("OTA_START:100,DEADBEEF,64".into()).validate().is_err());
        assert!(Command::Raw(" ota_abort".into()).validate().is_err());
        assert!(Command::Raw("FACTORY_RESET".into()).validate().is_ok());
    }

    #[test]
    fn test_raw_firmware_text_is_firmware() {
        assert!(Command::Raw("OTA_END".into()).is_firmware());
        assert!(Command::Raw("ota_start:1,0,1".into()).is_firmware());
        assert!(!Command::Raw("GOTA".into()).is_firmware());
        assert!(!Command::Raw("OT".into()).is_firmware());
    }

    #[test]
    fn test_command_from_str() {
        assert_eq!("ping".parse::<Command>().ok(), Some(Command::Ping));
        assert_eq!(
            "SET_SPEED:80".parse::<Command>().ok(),
            Some(Command::SetSpeed(80))
        );
        assert_eq!(
            "set_dwell_ret: 500".parse::<Command>().ok(),
            Some(Command::SetTiming {
                stroke: Stroke::Retract,
                dwell_ms: 500
            })
        );
        assert!("SET_SPEED".parse::<Command>().is_err());
        assert!("SET_SPEED:fast".parse::<Command>().is_err());
        assert!("SET_SPEED:0".parse::<Command>().is_err());
        assert!("OTA_START:10".parse::<Command>().is_err());
    }

    #[test]
    fn test_response_fields_and_flags() {
        let r = Response::parse("OK:OTA_READY,SIZE=4096,CRC=0000ABCD");
        assert_eq!(r.kind, "OK");
        assert!(r.has_flag("OTA_READY"));
        assert_eq!(r.int("SIZE"), Some(4096));
        assert_eq!(r.hex("CRC"), Some(0xABCD));
        assert!(!r.is_error());

        let bare = Response::parse("PONG");
        assert_eq!(bare.kind, "PONG");
        assert!(bare.payload.is_empty());
        assert_eq!(bare.to_string(), "PONG");
    }

    #[test]
    fn test_parse_reply_lines() {
        match parse_line("PONG#7\r\n") {
            Inbound::Reply { seq, response } => {
                assert_eq!(seq, 7);
                assert_eq!(response.kind, "PONG");
            },
            other => panic!("unexpected {other:?}"),
        }

        match parse_line("ERR:RANGE#3") {
            Inbound::Reply { seq, response } => {
                assert_eq!(seq, 3);
                assert!(response.is_error());
                assert_eq!(response.payload, "RANGE");
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_malformed_reply() {
        assert!(matches!(parse_line("OK#abc"), Inbound::Malformed(_)));
        assert!(matches!(parse_line("OK#0"), Inbound::Malformed(_)));
        assert!(matches!(parse_line("OK#"), Inbound::Malformed(_)));
    }

    #[test]
    fn test_hash_in_log_text_is_not_a_reply() {
        assert_eq!(
            parse_line("Cycle #5 done"),
            Inbound::Report(Report::Log("Cycle #5 done".into()))
        );
    }

    #[test]
    fn test_parse_block_acks() {
        assert_eq!(
            parse_line("OTA_ACK:4"),
            Inbound::BlockAck {
                index: 4,
                accepted: true
            }
        );
        assert_eq!(
            parse_line("OTA_NAK:0"),
            Inbound::BlockAck {
                index: 0,
                accepted: false
            }
        );
        assert!(matches!(parse_line("OTA_ACK:x"), Inbound::Malformed(_)));
    }

    #[test]
    fn test_parse_reports() {
        assert_eq!(
            parse_line("PROGRESS:CYCLE=3,TARGET=10"),
            Inbound::Report(Report::Progress {
                cycle: 3,
                target: 10
            })
        );
        assert_eq!(
            parse_line("COMPLETE:CYCLES=10"),
            Inbound::Report(Report::Complete { cycles: 10 })
        );
        assert_eq!(
            parse_line("STATUS:STATE=RUNNING,POS=45"),
            Inbound::Report(Report::Status {
                state: "RUNNING".into(),
                position: Some(45)
            })
        );
        assert_eq!(
            parse_line("OTA_PROGRESS:55"),
            Inbound::Report(Report::OtaProgress(55))
        );
        assert_eq!(
            parse_line("boot: ready"),
            Inbound::Report(Report::Log("boot: ready".into()))
        );
    }

    #[test]
    fn test_position_opposite() {
        assert_eq!(Position::Extend.opposite(), Position::Retract);
        assert_eq!(Position::Retract.opposite(), Position::Extend);
        assert_eq!(Position::Home.opposite(), Position::Extend);
        assert_eq!("ext".parse::<Position>().ok(), Some(Position::Extend));
    }
}
