//! Notifications published to front ends.
//!
//! Subscribers get their own channel; a subscriber that drops its receiver
//! is removed on the next publish.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};

use crate::connection::ConnectionState;
use crate::protocol::{Command, Report, Response};
use crate::session::{CycleState, TransferState};

/// Something a front end may want to show.
#[derive(Debug, Clone)]
pub enum Event {
    /// The connection state changed.
    ConnectionChanged {
        /// New state.
        state: ConnectionState,
        /// Port of the handle the change belongs to.
        port: Option<String>,
    },
    /// Unsolicited device report.
    Report(Report),
    /// A command was acknowledged.
    CommandAcked {
        /// The command.
        command: Command,
        /// The device reply.
        response: Response,
    },
    /// A host-driven cycle step was acknowledged.
    CycleProgress(CycleState),
    /// Firmware transfer state changed or a block was acknowledged.
    Firmware(TransferState),
}

/// Fan-out of [`Event`]s to any number of subscribers.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<Event>>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber.
    pub fn publish(&self, event: &Event) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(&Event::Report(Report::Log("hello".into())));

        assert!(matches!(a.try_recv(), Ok(Event::Report(Report::Log(_)))));
        assert!(matches!(b.try_recv(), Ok(Event::Report(Report::Log(_)))));
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(&Event::Report(Report::OtaProgress(10)));
        assert_eq!(bus.subscriber_count(), 1);
        assert!(keep.try_recv().is_ok());
    }
}
