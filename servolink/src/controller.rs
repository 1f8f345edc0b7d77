//! Front-end facade over the connection manager and the session worker.
//!
//! Every connected handle gets one worker thread. Jobs (single commands,
//! cycle runs, firmware updates) run on it in submission order, so a command
//! is never transmitted before the previous one resolved. Callers get a
//! [`Pending`] completion back immediately.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};

use crate::connection::{ConnectionManager, ConnectionState};
use crate::device::{Scan, ScanFilter};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::image::FirmwareImage;
use crate::link::Link;
use crate::port::PortOpener;
use crate::protocol::{Command, Response};
use crate::session::command::CommandSession;
use crate::session::firmware::FirmwareSession;
use crate::session::{
    ActuatorProfile, Activity, CancelToken, CycleReport, Pending, SessionConfig, SessionSlot,
    SlotState, UpdateReport, cycle,
};

type Job = Box<dyn FnOnce(&Link, &SessionConfig) + Send>;

struct Worker {
    jobs: Sender<Job>,
    thread: JoinHandle<()>,
}

impl Worker {
    fn spawn(link: Arc<Link>, config: SessionConfig) -> Result<Self> {
        let (jobs, rx) = mpsc::channel::<Job>();
        let thread = std::thread::Builder::new()
            .name(format!("session-{}", link.port_name()))
            .spawn(move || {
                for job in rx {
                    job(&link, &config);
                }
                debug!("Session worker for {} stopped", link.port_name());
            })?;
        Ok(Self { jobs, thread })
    }

    fn stop(self) {
        drop(self.jobs);
        if self.thread.join().is_err() {
            warn!("Session worker panicked");
        }
    }
}

/// Controls one actuator controller: connection, commands, cycling and
/// firmware updates.
pub struct Controller {
    manager: ConnectionManager,
    worker: Option<Worker>,
    slot: Arc<SessionSlot>,
    cycle_cancel: Mutex<CancelToken>,
    update_cancel: Mutex<CancelToken>,
}

impl Controller {
    /// Create a controller that opens ports through `opener`.
    pub fn new(opener: Arc<dyn PortOpener>, config: SessionConfig) -> Self {
        Self {
            manager: ConnectionManager::new(opener, config),
            worker: None,
            slot: Arc::new(SessionSlot::new()),
            cycle_cancel: Mutex::default(),
            update_cancel: Mutex::default(),
        }
    }

    /// Create a controller for native serial ports.
    #[cfg(feature = "native")]
    pub fn native(config: SessionConfig) -> Self {
        Self::new(Arc::new(crate::port::NativeOpener), config)
    }

    /// Enumerate endpoints matching `filter`.
    pub fn scan(&self, filter: ScanFilter) -> Scan {
        self.manager.scan(filter)
    }

    /// Connect to `port`, replacing any current connection.
    ///
    /// A session running on the old connection ends first, the same way
    /// [`Controller::disconnect`] ends it.
    pub fn connect(&mut self, port: &str, baud_rate: u32) -> Result<()> {
        if self.worker.is_some() {
            self.disconnect();
        }
        let link = Arc::clone(self.manager.connect(port, baud_rate)?.link());
        let worker = Worker::spawn(link, self.manager.config().clone());
        match worker {
            Ok(worker) => {
                self.worker = Some(worker);
                Ok(())
            },
            Err(e) => {
                self.manager.disconnect();
                Err(e)
            },
        }
    }

    /// Close the connection. Running sessions end with `ConnectionLost`.
    pub fn disconnect(&mut self) {
        cancel_token(&self.cycle_cancel);
        cancel_token(&self.update_cancel);
        self.manager.disconnect();
        self.stop_worker();
    }

    fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// What the session worker is busy with.
    pub fn activity(&self) -> SlotState {
        self.slot.state()
    }

    /// Name of the connected port.
    pub fn port_name(&self) -> Option<&str> {
        self.manager.handle().map(|h| h.port_name())
    }

    /// Reason of the last connect failure or link loss.
    pub fn last_error(&self) -> Option<String> {
        self.manager.last_error()
    }

    /// Subscribe to connection, report and progress events.
    pub fn subscribe(&self) -> Receiver<Event> {
        self.manager.subscribe()
    }

    /// Session timeouts in use.
    pub fn config(&self) -> &SessionConfig {
        self.manager.config()
    }

    fn submit<T, F>(&self, activity: Activity, job: F) -> Result<Pending<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Link, &SessionConfig) -> Result<T> + Send + 'static,
    {
        let worker = self.worker.as_ref().ok_or(Error::NotConnected)?;
        if !self.manager.state().is_connected() {
            return Err(Error::NotConnected);
        }
        let guard = self.slot.acquire(activity)?;
        let (tx, rx) = mpsc::channel();
        let job: Job = Box::new(move |link, config| {
            let result = job(link, config);
            drop(guard);
            // The caller may have dropped its Pending.
            let _ = tx.send(result);
        });
        worker.jobs.send(job).map_err(|_| Error::ConnectionLost)?;
        Ok(Pending::new(rx))
    }

    /// Queue `command`; resolves with the device reply.
    ///
    /// Firmware commands are only sent by [`Controller::begin_firmware_update`].
    pub fn send(&self, command: Command) -> Result<Pending<Response>> {
        if command.is_firmware() {
            return Err(Error::InvalidCommand(format!(
                "{command} is reserved for firmware updates"
            )));
        }
        command.validate()?;
        self.submit(Activity::Command, move |link, config| {
            CommandSession::new(link, config).send(&command)
        })
    }

    /// Send `command` and wait for its reply.
    pub fn command(&self, command: Command) -> Result<Response> {
        self.send(command)?.wait()
    }

    /// Push `profile` to the device.
    pub fn sync_profile(&self, profile: ActuatorProfile) -> Result<Pending<()>> {
        profile.validate()?;
        self.submit(Activity::Command, move |link, config| {
            CommandSession::new(link, config).sync_profile(&profile)
        })
    }

    /// Run `total` host-driven cycles with `interval` between steps.
    pub fn start_cycle(&self, total: u32, interval: Duration) -> Result<Pending<CycleReport>> {
        if total == 0 {
            return Err(Error::InvalidCommand("cycle count must be positive".into()));
        }
        let token = CancelToken::new();
        let cancel = token.clone();
        let pending = self.submit(Activity::Cycle, move |link, config| {
            cycle::run(link, config, total, interval, &cancel)
        })?;
        *lock(&self.cycle_cancel) = token;
        Ok(pending)
    }

    /// Ask the running cycle to stop after the current step.
    pub fn cancel_cycle(&self) {
        if self.slot.state() == SlotState::Cycle {
            info!("Cancelling cycle run");
        }
        cancel_token(&self.cycle_cancel);
    }

    /// Start streaming `image` to the device.
    ///
    /// The returned completion always ends in a terminal outcome; an aborted
    /// update is never retried automatically.
    pub fn begin_firmware_update(&self, image: FirmwareImage) -> Result<Pending<UpdateReport>> {
        let token = CancelToken::new();
        let cancel = token.clone();
        let pending = self.submit(Activity::Firmware, move |link, config| {
            Ok(FirmwareSession::new(link, config, &image, &cancel).run())
        })?;
        *lock(&self.update_cancel) = token;
        Ok(pending)
    }

    /// Ask the running firmware update to abort.
    pub fn cancel_update(&self) {
        if self.slot.state() == SlotState::Firmware {
            info!("Cancelling firmware update");
        }
        cancel_token(&self.update_cancel);
    }
}

fn lock(token: &Mutex<CancelToken>) -> std::sync::MutexGuard<'_, CancelToken> {
    token.lock().unwrap_or_else(PoisonError::into_inner)
}

fn cancel_token(token: &Mutex<CancelToken>) {
    lock(token).cancel();
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("manager", &self.manager)
            .field("activity", &self.slot.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SIM_PORT, SimOpener};

    fn fast_config() -> SessionConfig {
        SessionConfig {
            ack_timeout: Duration::from_millis(300),
            settle_delay: Duration::ZERO,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_operations_need_a_connection() {
        let controller = Controller::new(Arc::new(SimOpener::default()), fast_config());
        assert!(matches!(
            controller.send(Command::Ping),
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            controller.start_cycle(3, Duration::ZERO),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_firmware_commands_are_reserved() {
        let opener = SimOpener::default();
        let probe = opener.probe();
        let mut controller = Controller::new(Arc::new(opener), fast_config());
        controller.connect(SIM_PORT, 115_200).unwrap();
        assert!(matches!(
            controller.send(Command::OtaEnd),
            Err(Error::InvalidCommand(_))
        ));
        assert!(matches!(
            controller.command(Command::Raw("OTA_START:100,DEADBEEF,64".into())),
            Err(Error::InvalidCommand(_))
        ));
        assert!(matches!(
            controller.send(Command::Raw("PING#9".into())),
            Err(Error::InvalidCommand(_))
        ));
        assert!(!probe.ota_in_progress());
        assert_eq!(controller.activity(), SlotState::Idle);
    }

    #[test]
    fn test_invalid_command_fails_before_queueing() {
        let mut controller = Controller::new(Arc::new(SimOpener::default()), fast_config());
        controller.connect(SIM_PORT, 115_200).unwrap();
        assert!(matches!(
            controller.send(Command::SetSpeed(0)),
            Err(Error::InvalidCommand(_))
        ));
        assert_eq!(controller.activity(), SlotState::Idle);
    }
}
