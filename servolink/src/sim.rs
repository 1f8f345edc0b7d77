//! Simulated actuator controller.
//!
//! [`SimOpener`] hands out [`SimDevice`] ports that answer the command
//! protocol and accept firmware blocks like the real controller, with knobs
//! in [`SimBehavior`] to lose blocks, reject updates, report a wrong checksum
//! or drop off the bus. Used by the integration tests and `servolink --simulate`.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};

use crate::device::{DetectedPort, TransportKind};
use crate::error::{Error, Result};
use crate::port::{Port, PortOpener, SerialConfig};
use crate::protocol::block::{BlockFrame, STX};
use crate::protocol::crc::crc32;
use crate::protocol::{Command, Position, Stroke};
use crate::session::ActuatorProfile;

/// Default name of the simulated port.
pub const SIM_PORT: &str = "sim://actuator";

/// Firmware version the simulator reports.
pub const SIM_VERSION: &str = "2.1.0-sim";

/// Failure modes of the simulated controller.
#[derive(Debug, Clone, Default)]
pub struct SimBehavior {
    /// Ignore every command (a paired but wrong or dead device).
    pub silent: bool,
    /// Refuse to open, as if another program held the port.
    pub busy: bool,
    /// Answer `OTA_START` with `ERR`.
    pub reject_ota: bool,
    /// Blocks whose frames are lost on every attempt.
    pub lose_blocks: BTreeSet<u16>,
    /// Blocks answered with `OTA_NAK` on their first attempt.
    pub nak_once: BTreeSet<u16>,
    /// Checksum reported during verification instead of the real one.
    pub verify_crc: Option<u32>,
    /// Drop off the bus when this block arrives.
    pub unplug_at_block: Option<u16>,
    /// Delay before each reply becomes readable.
    pub reply_delay: Duration,
}

#[derive(Debug)]
struct OtaUpload {
    size: usize,
    crc: u32,
    data: Vec<u8>,
    next: u16,
}

#[derive(Debug)]
struct SimState {
    behavior: SimBehavior,
    profile: ActuatorProfile,
    position: Position,
    running: bool,
    paused: bool,
    unplugged: bool,
    input: Vec<u8>,
    output: VecDeque<(Instant, Vec<u8>)>,
    commands: Vec<String>,
    block_attempts: HashMap<u16, usize>,
    naked: BTreeSet<u16>,
    applied: Vec<u16>,
    ota: Option<OtaUpload>,
    installed: Option<Vec<u8>>,
}

impl SimState {
    fn new(behavior: SimBehavior) -> Self {
        Self {
            behavior,
            profile: ActuatorProfile::default(),
            position: Position::Home,
            running: false,
            paused: false,
            unplugged: false,
            input: Vec::new(),
            output: VecDeque::new(),
            commands: Vec::new(),
            block_attempts: HashMap::new(),
            naked: BTreeSet::new(),
            applied: Vec::new(),
            ota: None,
            installed: None,
        }
    }

    fn emit(&mut self, line: &str) {
        trace!("SIM TX {line}");
        let ready = Instant::now() + self.behavior.reply_delay;
        self.output.push_back((ready, format!("{line}\n").into_bytes()));
    }

    fn process_input(&mut self) {
        loop {
            if self.unplugged || self.input.is_empty() {
                return;
            }
            if self.input[0] == STX {
                let Some(total) = BlockFrame::peek_len(&self.input) else {
                    return;
                };
                if self.input.len() < total {
                    return;
                }
                let frame: Vec<u8> = self.input.drain(..total).collect();
                self.handle_block(&frame);
                continue;
            }
            let Some(pos) = self.input.iter().position(|&b| b == b'\n') else {
                return;
            };
            let raw: Vec<u8> = self.input.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                self.handle_line(&line);
            }
        }
    }

    fn handle_line(&mut self, line: &str) {
        trace!("SIM RX {line}");
        let (body, seq) = match line.rsplit_once('#') {
            Some((body, seq)) => (body, seq.parse::<u16>().ok()),
            None => (line, None),
        };
        self.commands.push(body.to_string());
        if self.behavior.silent {
            return;
        }

        let reply = self.execute(body);
        match seq {
            Some(seq) => self.emit(&format!("{reply}#{seq}")),
            None => self.emit(&reply),
        }
    }

    fn execute(&mut self, body: &str) -> String {
        let name = body.split(':').next().unwrap_or_default();
        match name {
            "OTA_START" => return self.ota_start(body),
            "OTA_END" => return self.ota_end(),
            "OTA_ABORT" => {
                self.ota = None;
                return "OK:OTA_ABORTED".into();
            },
            _ => {},
        }

        let command = match body.parse::<Command>() {
            Ok(command) => command,
            Err(Error::InvalidCommand(msg)) if msg.starts_with("unknown command") => {
                return "ERR:UNKNOWN_CMD".into();
            },
            Err(_) => return "ERR:RANGE".into(),
        };

        match command {
            Command::Ping => "PONG".into(),
            Command::SetPosition(position) => {
                self.position = position;
                "OK".into()
            },
            Command::SetSpeed(p) => {
                self.profile.speed = p;
                "OK".into()
            },
            Command::SetTiming { stroke, dwell_ms } => {
                match stroke {
                    Stroke::Extend => self.profile.extend_dwell_ms = dwell_ms,
                    Stroke::Retract => self.profile.retract_dwell_ms = dwell_ms,
                }
                "OK".into()
            },
            Command::SetOffset { stroke, degrees } => {
                match stroke {
                    Stroke::Extend => self.profile.extend_offset = degrees,
                    Stroke::Retract => self.profile.retract_offset = degrees,
                }
                "OK".into()
            },
            Command::SetActuatorType(t) => {
                self.profile.actuator_type = t;
                "OK".into()
            },
            Command::SetCycles(n) => {
                self.profile.cycles = n;
                "OK".into()
            },
            Command::StartCycle => self.start_cycling(),
            Command::StopCycle => {
                self.running = false;
                self.paused = false;
                self.position = Position::Home;
                "OK".into()
            },
            Command::PauseCycle if self.running => {
                self.paused = true;
                "OK".into()
            },
            Command::ResumeCycle if self.running => {
                self.paused = false;
                "OK".into()
            },
            Command::PauseCycle | Command::ResumeCycle => "ERR:NOT_RUNNING".into(),
            Command::Status => format!(
                "STATUS:STATE={},POS={}",
                self.state_name(),
                self.position_degrees()
            ),
            Command::GetSettings => {
                let p = &self.profile;
                format!(
                    "SETTINGS:TYPE={},EXT={},RET={},DWELL_EXT={},DWELL_RET={},SPEED={},CYCLES={}",
                    p.actuator_type,
                    p.extend_offset,
                    p.retract_offset,
                    p.extend_dwell_ms,
                    p.retract_dwell_ms,
                    p.speed,
                    p.cycles
                )
            },
            Command::GetVersion => format!("VERSION:{SIM_VERSION}"),
            Command::OtaStart { .. } | Command::OtaEnd | Command::OtaAbort | Command::Raw(_) => {
                "ERR:UNKNOWN_CMD".into()
            },
        }
    }

    fn state_name(&self) -> &'static str {
        match (self.running, self.paused) {
            (true, true) => "PAUSED",
            (true, false) => "RUNNING",
            _ => "IDLE",
        }
    }

    fn position_degrees(&self) -> i32 {
        match self.position {
            Position::Home => 0,
            Position::Extend => 90 + i32::from(self.profile.extend_offset),
            Position::Retract => -90 + i32::from(self.profile.retract_offset),
        }
    }

    /// Device-driven cycling finishes instantly in the simulator.
    fn start_cycling(&mut self) -> String {
        let target = self.profile.cycles;
        if target == 0 {
            self.running = true;
            return "OK".into();
        }
        for cycle in 1..=target.min(1000) {
            self.emit(&format!("PROGRESS:CYCLE={cycle},TARGET={target}"));
        }
        self.emit(&format!("COMPLETE:CYCLES={target}"));
        self.running = false;
        "OK".into()
    }

    fn ota_start(&mut self, body: &str) -> String {
        if self.behavior.reject_ota {
            return "ERR:OTA_BUSY".into();
        }
        let args: Vec<&str> = body
            .split_once(':')
            .map(|(_, a)| a.split(',').collect())
            .unwrap_or_default();
        let (Some(size), Some(crc)) = (
            args.first().and_then(|s| s.parse::<usize>().ok()),
            args.get(1).and_then(|s| u32::from_str_radix(s, 16).ok()),
        ) else {
            return "ERR:OTA_ARGS".into();
        };

        self.ota = Some(OtaUpload {
            size,
            crc,
            data: Vec::with_capacity(size),
            next: 0,
        });
        self.applied.clear();
        format!("OK:OTA_READY,SIZE={size},CRC={crc:08X}")
    }

    fn ota_end(&mut self) -> String {
        let Some(upload) = self.ota.take() else {
            return "ERR:OTA_NOT_STARTED".into();
        };
        let actual = crc32(&upload.data);
        let reported = self.behavior.verify_crc.unwrap_or(actual);
        if upload.data.len() != upload.size || actual != upload.crc {
            return format!("ERR:OTA_VERIFY,CRC={reported:08X}");
        }
        self.installed = Some(upload.data);
        format!("OK:OTA_VERIFY,CRC={reported:08X}")
    }

    fn handle_block(&mut self, frame: &[u8]) {
        let index = LittleEndian::read_u16(&frame[1..3]);
        *self.block_attempts.entry(index).or_insert(0) += 1;

        if self.behavior.unplug_at_block == Some(index) {
            debug!("SIM unplugged at block {index}");
            self.unplugged = true;
            return;
        }
        if self.behavior.lose_blocks.contains(&index) {
            trace!("SIM lost block {index}");
            return;
        }
        if self.behavior.nak_once.contains(&index) && self.naked.insert(index) {
            self.emit(&format!("OTA_NAK:{index}"));
            return;
        }

        let Ok(block) = BlockFrame::parse(frame) else {
            self.emit(&format!("OTA_NAK:{index}"));
            return;
        };
        let Some(upload) = self.ota.as_mut() else {
            return;
        };
        if block.index == upload.next {
            upload.data.extend_from_slice(&block.data);
            upload.next += 1;
            self.applied.push(block.index);
        }
        if block.index < upload.next {
            let progress = upload.data.len() * 100 / upload.size.max(1);
            self.emit(&format!("OTA_ACK:{}", block.index));
            self.emit(&format!("OTA_PROGRESS:{progress}"));
        } else {
            self.emit(&format!("OTA_NAK:{}", block.index));
        }
    }
}

#[derive(Debug)]
struct SimShared {
    state: Mutex<SimState>,
    readable: Condvar,
}

impl SimShared {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Opens simulated ports that all talk to the same simulated controller.
#[derive(Debug, Clone)]
pub struct SimOpener {
    port_name: String,
    shared: Arc<SimShared>,
}

impl Default for SimOpener {
    fn default() -> Self {
        Self::new(SimBehavior::default())
    }
}

impl SimOpener {
    /// Simulated controller on [`SIM_PORT`].
    pub fn new(behavior: SimBehavior) -> Self {
        Self {
            port_name: SIM_PORT.to_string(),
            shared: Arc::new(SimShared {
                state: Mutex::new(SimState::new(behavior)),
                readable: Condvar::new(),
            }),
        }
    }

    /// Inspect and steer the simulated controller.
    pub fn probe(&self) -> SimProbe {
        SimProbe {
            shared: Arc::clone(&self.shared),
        }
    }

    /// The simulated port as discovery would report it.
    pub fn detected_port(&self) -> DetectedPort {
        DetectedPort {
            product: Some("Simulated actuator controller".into()),
            ..DetectedPort::bare(self.port_name.clone(), TransportKind::Bluetooth)
        }
    }
}

impl PortOpener for SimOpener {
    fn open(&self, config: &SerialConfig) -> Result<Box<dyn Port>> {
        if config.port_name != self.port_name {
            return Err(Error::Connection(format!(
                "{} does not exist",
                config.port_name
            )));
        }
        let mut state = self.shared.lock();
        if state.behavior.busy {
            return Err(Error::Connection(format!(
                "{} is busy: in use by another program",
                self.port_name
            )));
        }
        if state.unplugged {
            return Err(Error::Connection(format!(
                "{} is unavailable",
                self.port_name
            )));
        }
        state.input.clear();
        state.output.clear();
        drop(state);

        Ok(Box::new(SimDevice {
            name: self.port_name.clone(),
            baud_rate: config.baud_rate,
            timeout: config.timeout,
            open: true,
            shared: Arc::clone(&self.shared),
        }))
    }
}

/// Test-side view of the simulated controller.
#[derive(Debug, Clone)]
pub struct SimProbe {
    shared: Arc<SimShared>,
}

impl SimProbe {
    /// Command bodies received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.shared.lock().commands.clone()
    }

    /// Frames received for block `index`, including lost ones.
    pub fn block_attempts(&self, index: u16) -> usize {
        self.shared
            .lock()
            .block_attempts
            .get(&index)
            .copied()
            .unwrap_or(0)
    }

    /// Blocks written to the staging area, in order.
    pub fn applied_blocks(&self) -> Vec<u16> {
        self.shared.lock().applied.clone()
    }

    /// Image accepted by the last successful verification.
    pub fn installed_image(&self) -> Option<Vec<u8>> {
        self.shared.lock().installed.clone()
    }

    /// Whether a firmware upload is open on the device.
    pub fn ota_in_progress(&self) -> bool {
        self.shared.lock().ota.is_some()
    }

    /// Current actuator settings.
    pub fn profile(&self) -> ActuatorProfile {
        self.shared.lock().profile.clone()
    }

    /// Replace the failure modes.
    pub fn set_behavior(&self, behavior: SimBehavior) {
        self.shared.lock().behavior = behavior;
    }

    /// Make the device print an unsolicited line.
    pub fn emit_line(&self, line: &str) {
        self.shared.lock().emit(line);
        self.shared.readable.notify_all();
    }

    /// Drop the device off the bus; open ports start failing.
    pub fn unplug(&self) {
        self.shared.lock().unplugged = true;
        self.shared.readable.notify_all();
    }

    /// Bring the device back.
    pub fn replug(&self) {
        self.shared.lock().unplugged = false;
    }
}

/// A port connected to the simulated controller.
#[derive(Debug)]
pub struct SimDevice {
    name: String,
    baud_rate: u32,
    timeout: Duration,
    open: bool,
    shared: Arc<SimShared>,
}

impl SimDevice {
    fn gone() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "device disconnected")
    }
}

impl Read for SimDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        let deadline = Instant::now() + self.timeout;
        let mut state = self.shared.lock();
        loop {
            if state.unplugged {
                return Err(Self::gone());
            }
            let now = Instant::now();
            let ready_at = state.output.front().map(|(at, _)| *at);
            match ready_at {
                Some(at) if at <= now => {
                    let Some((_, mut chunk)) = state.output.pop_front() else {
                        continue;
                    };
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        chunk.drain(..n);
                        state.output.push_front((at, chunk));
                    }
                    return Ok(n);
                },
                _ => {},
            }
            if now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            let wake = ready_at.map_or(deadline, |at| at.min(deadline));
            let (guard, _) = self
                .shared
                .readable
                .wait_timeout(state, wake.saturating_duration_since(now))
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }
}

impl Write for SimDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        let mut state = self.shared.lock();
        if state.unplugged {
            return Err(Self::gone());
        }
        state.input.extend_from_slice(buf);
        state.process_input();
        drop(state);
        self.shared.readable.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for SimDevice {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
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
        let mut state = self.shared.lock();
        state.input.clear();
        state.output.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(opener: &SimOpener) -> Box<dyn Port> {
        let config = SerialConfig::new(SIM_PORT, 115_200).with_timeout(Duration::from_millis(50));
        opener.open(&config).unwrap()
    }

    fn read_line(port: &mut Box<dyn Port>) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        while !out.ends_with(b"\n") {
            let n = port.read(&mut buf).unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        String::from_utf8(out).unwrap().trim().to_string()
    }

    #[test]
    fn test_ping_pong() {
        let opener = SimOpener::default();
        let mut port = open(&opener);
        port.write_all(b"PING#5\n").unwrap();
        assert_eq!(read_line(&mut port), "PONG#5");
        assert_eq!(opener.probe().commands(), vec!["PING"]);
    }

    #[test]
    fn test_range_error_and_unknown_command() {
        let opener = SimOpener::default();
        let mut port = open(&opener);
        port.write_all(b"SET_SPEED:0#1\nFLY#2\n").unwrap();
        assert_eq!(read_line(&mut port), "ERR:RANGE#1");
        assert_eq!(read_line(&mut port), "ERR:UNKNOWN_CMD#2");
    }

    #[test]
    fn test_block_applied_and_acked() {
        let opener = SimOpener::default();
        let mut port = open(&opener);
        let data = b"hello";
        port.write_all(format!("OTA_START:5,{:08X},512#1\n", crc32(data)).as_bytes())
            .unwrap();
        assert!(read_line(&mut port).starts_with("OK:OTA_READY"));

        port.write_all(&BlockFrame::new(0, data).build()).unwrap();
        assert_eq!(read_line(&mut port), "OTA_ACK:0");
        assert_eq!(opener.probe().applied_blocks(), vec![0]);
    }

    #[test]
    fn test_busy_and_wrong_name() {
        let opener = SimOpener::new(SimBehavior {
            busy: true,
            ..SimBehavior::default()
        });
        let busy = opener.open(&SerialConfig::new(SIM_PORT, 115_200));
        assert!(matches!(busy, Err(Error::Connection(msg)) if msg.contains("busy")));

        let missing = SimOpener::default().open(&SerialConfig::new("COM9", 115_200));
        assert!(matches!(missing, Err(Error::Connection(_))));
    }

    #[test]
    fn test_unplugged_port_fails_reads() {
        let opener = SimOpener::default();
        let mut port = open(&opener);
        opener.probe().unplug();
        let mut buf = [0u8; 8];
        assert_eq!(
            port.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }
}
