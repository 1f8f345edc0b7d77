//! Link I/O thread.
//!
//! One thread per open handle owns the [`Port`]. Everything written to the
//! device is queued to it; everything read is split into lines, classified
//! and routed:
//!
//! - replies, block acks and malformed reply lines go to the active session
//! - reports go to the [`EventBus`](crate::event::EventBus)
//!
//! An I/O error marks the connection `Error` and stops the thread, which
//! drops the session channel so any waiter fails with `ConnectionLost`.

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};

use crate::connection::{ConnectionShared, ConnectionState};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::port::Port;
use crate::protocol::{Inbound, parse_line};

/// Read timeout of the I/O thread; bounds write latency as well.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Longest line kept while waiting for a terminator.
const MAX_LINE_LEN: usize = 4096;

/// Drain buffered bytes into text without stalling on invalid UTF-8.
///
/// - Valid UTF-8 is emitted as-is.
/// - Invalid byte sequences emit the replacement char `�` and continue.
/// - An incomplete UTF-8 suffix is kept in `buffer` for the next read.
pub(crate) fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&buffer[..valid_up_to]) {
                    output.push_str(valid);
                }

                match err.error_len() {
                    Some(invalid_len) => {
                        output.push('�');
                        let drain_to = valid_up_to.saturating_add(invalid_len).min(buffer.len());
                        buffer.drain(..drain_to);
                    },
                    None => {
                        buffer.drain(..valid_up_to);
                        break;
                    },
                }
            },
        }
    }

    output
}

/// Splits decoded text into complete lines.
#[derive(Debug, Default)]
struct LineSplitter {
    bytes: Vec<u8>,
    text: String,
}

impl LineSplitter {
    fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.bytes.extend_from_slice(data);
        self.text.push_str(&drain_utf8_lossy(&mut self.bytes));

        let mut lines = Vec::new();
        while let Some(pos) = self.text.find('\n') {
            let line: String = self.text.drain(..=pos).collect();
            let line = line.trim_end_matches(['\r', '\n']);
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        if self.text.len() > MAX_LINE_LEN {
            warn!("Discarding {} bytes without line terminator", self.text.len());
            self.text.clear();
        }
        lines
    }
}

/// Handle to a running link.
pub(crate) struct Link {
    port_name: String,
    outbound: Sender<Vec<u8>>,
    inbound: Mutex<Receiver<Inbound>>,
    alive: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    next_seq: AtomicU16,
    shared: Arc<ConnectionShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Link {
    /// Take ownership of `port` and start the I/O thread.
    pub(crate) fn spawn(mut port: Box<dyn Port>, shared: Arc<ConnectionShared>) -> Result<Self> {
        port.set_timeout(POLL_INTERVAL)?;
        port.clear_buffers()?;

        let port_name = port.name().to_string();
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>();
        let (in_tx, in_rx) = mpsc::channel::<Inbound>();
        let alive = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let alive = Arc::clone(&alive);
            let stop = Arc::clone(&stop);
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("link-{port_name}"))
                .spawn(move || {
                    io_loop(&mut *port, &out_rx, &in_tx, &stop, &shared);
                    alive.store(false, Ordering::SeqCst);
                    if let Err(e) = port.close() {
                        debug!("Error closing {}: {e}", port.name());
                    }
                })?
        };

        Ok(Self {
            port_name,
            outbound: out_tx,
            inbound: Mutex::new(in_rx),
            alive,
            stop,
            next_seq: AtomicU16::new(1),
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn port_name(&self) -> &str {
        &self.port_name
    }

    pub(crate) fn shared(&self) -> &ConnectionShared {
        &self.shared
    }

    /// Whether the I/O thread is still running.
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Next command sequence number; wraps and skips 0.
    pub(crate) fn next_seq(&self) -> u16 {
        loop {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            if seq != 0 {
                return seq;
            }
        }
    }

    /// Queue bytes for the device.
    pub(crate) fn send(&self, bytes: Vec<u8>) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::ConnectionLost);
        }
        self.outbound.send(bytes).map_err(|_| Error::ConnectionLost)
    }

    /// Wait for the next session message until `deadline`.
    ///
    /// `Ok(None)` means the deadline passed.
    pub(crate) fn recv(&self, deadline: Instant) -> Result<Option<Inbound>> {
        let rx = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(msg) => Ok(Some(msg)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ConnectionLost),
        }
    }

    /// Discard session messages nobody waited for.
    pub(crate) fn drain_stale(&self) {
        let rx = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match rx.try_recv() {
                Ok(msg) => debug!("Discarding stale message: {msg:?}"),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Stop the I/O thread and close the port.
    pub(crate) fn close(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Link thread for {} panicked", self.port_name);
            }
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}

fn io_loop(
    port: &mut dyn Port,
    outbound: &Receiver<Vec<u8>>,
    inbound: &Sender<Inbound>,
    stop: &AtomicBool,
    shared: &ConnectionShared,
) {
    let mut buf = [0u8; 1024];
    let mut splitter = LineSplitter::default();

    while !stop.load(Ordering::SeqCst) {
        loop {
            match outbound.try_recv() {
                Ok(bytes) => {
                    trace!("TX {} bytes", bytes.len());
                    if let Err(e) = port.write_all_bytes(&bytes) {
                        link_failed(shared, &e.to_string());
                        return;
                    }
                },
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        match port.read(&mut buf) {
            Ok(0) => {},
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    trace!("RX {line}");
                    route(&line, inbound, shared);
                }
            },
            Err(ref e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {},
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {},
            Err(e) => {
                link_failed(shared, &e.to_string());
                return;
            },
        }
    }

    // Flush what was queued before the stop request, e.g. a final OTA_ABORT.
    while let Ok(bytes) = outbound.try_recv() {
        if port.write_all_bytes(&bytes).is_err() {
            break;
        }
    }
}

fn route(line: &str, inbound: &Sender<Inbound>, shared: &ConnectionShared) {
    match parse_line(line) {
        Inbound::Report(report) => shared.events().publish(&Event::Report(report)),
        msg => {
            // Nobody listening only means the session already gave up.
            let _ = inbound.send(msg);
        },
    }
}

fn link_failed(shared: &ConnectionShared, reason: &str) {
    error!("Link I/O failed: {reason}");
    shared.set_error(reason);
    shared.set_state(ConnectionState::Error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_utf8_lossy_keeps_incomplete_suffix() {
        let mut buf = vec![b'O', b'K', 0xE2, 0x82];
        assert_eq!(drain_utf8_lossy(&mut buf), "OK");
        assert_eq!(buf, vec![0xE2, 0x82]);

        buf.push(0xAC);
        assert_eq!(drain_utf8_lossy(&mut buf), "€");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_drain_utf8_lossy_replaces_invalid() {
        let mut buf = vec![b'A', 0xFF, b'B'];
        assert_eq!(drain_utf8_lossy(&mut buf), "A�B");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_line_splitter_handles_partial_and_crlf() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push(b"PON").is_empty());
        assert_eq!(splitter.push(b"G#1\r\nSTATUS:"), vec!["PONG#1"]);
        assert_eq!(
            splitter.push(b"STATE=IDLE\n\nOK#2\n"),
            vec!["STATUS:STATE=IDLE", "OK#2"]
        );
    }
}
