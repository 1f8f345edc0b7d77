//! Sessions running on top of an open link.
//!
//! A handle runs at most one activity at a time. The [`SessionSlot`] enforces
//! that: single commands may queue behind each other, while a cycle run or a
//! firmware update needs the handle to itself.
//!
//! ```text
//!   Idle ──send──▶ Commands(n) ──all resolved──▶ Idle
//!   Idle ──start_cycle──▶ Cycle ──report──▶ Idle
//!   Idle ──begin_firmware_update──▶ Firmware ──outcome──▶ Idle
//! ```

pub(crate) mod command;
pub mod cycle;
pub mod firmware;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::is_interrupted_requested;
use crate::protocol::block::DEFAULT_BLOCK_SIZE;

pub use command::ActuatorProfile;
pub use cycle::{CycleReport, CycleState};
pub use firmware::{FirmwareRisk, Phase, TransferState, UpdateOutcome, UpdateReport};

/// Default time to wait for a command reply.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Default time to wait for `OTA_READY`.
pub const DEFAULT_OTA_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time to wait for a block verdict.
pub const DEFAULT_BLOCK_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Default attempts per firmware block.
pub const DEFAULT_BLOCK_ATTEMPTS: u32 = 3;

/// Default time to wait for the verification reply.
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default pause between opening the port and the first `PING`.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Cancellation poll granularity.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Timeouts and retry bounds of all sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Wait for a command reply.
    pub ack_timeout: Duration,
    /// Wait for the device to accept a firmware announcement.
    pub ota_ready_timeout: Duration,
    /// Wait for each block verdict.
    pub block_ack_timeout: Duration,
    /// Attempts per block before the update aborts.
    pub block_attempts: u32,
    /// Wait for the verification reply.
    pub verify_timeout: Duration,
    /// Firmware block payload size.
    pub block_size: u16,
    /// Pause after opening the port, before the handshake.
    pub settle_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            ota_ready_timeout: DEFAULT_OTA_READY_TIMEOUT,
            block_ack_timeout: DEFAULT_BLOCK_ACK_TIMEOUT,
            block_attempts: DEFAULT_BLOCK_ATTEMPTS,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            block_size: DEFAULT_BLOCK_SIZE,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

/// Cooperative cancellation flag.
///
/// Also reports cancellation when the embedding application signalled an
/// interrupt through [`crate::set_interrupt_checker`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Clear a previous request.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || is_interrupted_requested()
    }

    /// Sleep for `duration`, waking early with `Cancelled`.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            std::thread::sleep(remaining.min(CANCEL_POLL));
        }
    }
}

/// What the handle is busy with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    /// Nothing running.
    #[default]
    Idle,
    /// `n` single commands queued or in flight.
    Commands(usize),
    /// A host-driven cycle run.
    Cycle,
    /// A firmware update.
    Firmware,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Commands(n) => write!(f, "{n} command(s) pending"),
            Self::Cycle => write!(f, "cycle running"),
            Self::Firmware => write!(f, "firmware update running"),
        }
    }
}

/// Activity kinds that can claim the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Single command.
    Command,
    /// Cycle run.
    Cycle,
    /// Firmware update.
    Firmware,
}

/// Mutual exclusion between activities on one handle.
#[derive(Debug, Default)]
pub struct SessionSlot {
    state: Mutex<SlotState>,
}

impl SessionSlot {
    /// Create an idle slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current occupancy.
    pub fn state(&self) -> SlotState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the slot for `activity`, failing with `Busy` on conflict.
    pub fn acquire(self: &Arc<Self>, activity: Activity) -> Result<SlotGuard> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let next = match (*state, activity) {
            (SlotState::Idle, Activity::Command) => SlotState::Commands(1),
            (SlotState::Commands(n), Activity::Command) => SlotState::Commands(n + 1),
            (SlotState::Idle, Activity::Cycle) => SlotState::Cycle,
            (SlotState::Idle, Activity::Firmware) => SlotState::Firmware,
            (current, _) => return Err(Error::Busy(current.to_string())),
        };
        *state = next;
        Ok(SlotGuard {
            slot: Arc::clone(self),
        })
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = match *state {
            SlotState::Commands(n) if n > 1 => SlotState::Commands(n - 1),
            _ => SlotState::Idle,
        };
    }
}

/// Releases its claim on the [`SessionSlot`] when dropped.
#[derive(Debug)]
pub struct SlotGuard {
    slot: Arc<SessionSlot>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slot.release();
    }
}

/// Completion of a job submitted to the session worker.
#[derive(Debug)]
pub struct Pending<T> {
    rx: Receiver<Result<T>>,
    taken: bool,
}

impl<T> Pending<T> {
    pub(crate) fn new(rx: Receiver<Result<T>>) -> Self {
        Self { rx, taken: false }
    }

    /// Block until the job finishes.
    ///
    /// Fails with [`Error::InvalidCommand`] if the result was already taken
    /// through [`Pending::try_take`] or [`Pending::wait_timeout`].
    pub fn wait(self) -> Result<T> {
        if self.taken {
            return Err(Error::InvalidCommand("result already taken".into()));
        }
        self.rx.recv().map_err(|_| Error::ConnectionLost)?
    }

    /// Wait at most `timeout`; `None` if the job is still running.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<T>> {
        if self.taken {
            return None;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(result) => {
                self.taken = true;
                Some(result)
            },
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.taken = true;
                Some(Err(Error::ConnectionLost))
            },
        }
    }

    /// Take the result if the job already finished.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        if self.taken {
            return None;
        }
        match self.rx.try_recv() {
            Ok(result) => {
                self.taken = true;
                Some(result)
            },
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.taken = true;
                Some(Err(Error::ConnectionLost))
            },
        }
    }
}
