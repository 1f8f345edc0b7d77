//! Host-driven cycling: alternating extend/retract commands, one per cycle.

use std::time::{Duration, Instant};

use log::{info, warn};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::link::Link;
use crate::protocol::{Command, Position};
use crate::session::command::CommandSession;
use crate::session::{CancelToken, SessionConfig};

/// Progress of a cycle run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleState {
    /// Cycles acknowledged so far.
    pub current: u32,
    /// Cycles requested.
    pub total: u32,
    /// Time since the run started.
    pub elapsed: Duration,
}

impl CycleState {
    fn new(total: u32) -> Self {
        Self {
            current: 0,
            total,
            elapsed: Duration::ZERO,
        }
    }

    /// Whether every requested cycle was acknowledged.
    pub fn is_complete(&self) -> bool {
        self.current >= self.total
    }
}

/// Result of a cycle run that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Final progress.
    pub state: CycleState,
    /// Whether the run stopped early on request.
    pub cancelled: bool,
}

/// Run `total` cycles, waiting `interval` between them.
///
/// Cancellation is honoured between steps and during the interval, never
/// while a command is in flight. A cancelled run sends `STOP`.
pub(crate) fn run(
    link: &Link,
    config: &SessionConfig,
    total: u32,
    interval: Duration,
    cancel: &CancelToken,
) -> Result<CycleReport> {
    let session = CommandSession::new(link, config);
    let started = Instant::now();
    let mut state = CycleState::new(total);
    let mut position = Position::Extend;
    let mut cancelled = false;

    info!("Starting {total} cycles on {}", link.port_name());

    while state.current < total {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }

        session.send(&Command::SetPosition(position))?;
        state.current += 1;
        state.elapsed = started.elapsed();
        link.shared()
            .events()
            .publish(&Event::CycleProgress(state.clone()));
        position = position.opposite();

        if state.current < total {
            match cancel.sleep(interval) {
                Ok(()) => {},
                Err(Error::Cancelled) => {
                    cancelled = true;
                    break;
                },
                Err(e) => return Err(e),
            }
        }
    }

    state.elapsed = started.elapsed();
    if cancelled {
        info!("Cycle run cancelled after {}/{total}", state.current);
        if let Err(e) = session.send(&Command::StopCycle) {
            warn!("STOP after cancel was not acknowledged: {e}");
        }
    } else {
        info!("Completed {total} cycles in {:.1}s", state.elapsed.as_secs_f32());
    }

    Ok(CycleReport { state, cancelled })
}
