//! Command, cycle and firmware sessions against the simulated controller.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use servolink::sim::{SIM_PORT, SimBehavior, SimOpener, SimProbe};
use servolink::{
    ActuatorProfile, Command, ConnectionState, Controller, Error, Event, FirmwareImage,
    FirmwareRisk, Phase, Position, Report, SessionConfig, SlotState, UpdateOutcome,
};

const WAIT: Duration = Duration::from_secs(10);

fn fast_config() -> SessionConfig {
    SessionConfig {
        ack_timeout: Duration::from_millis(500),
        ota_ready_timeout: Duration::from_millis(500),
        block_ack_timeout: Duration::from_millis(100),
        verify_timeout: Duration::from_millis(500),
        block_size: 64,
        settle_delay: Duration::ZERO,
        ..SessionConfig::default()
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn connected(behavior: SimBehavior) -> (Controller, SimProbe) {
    init_logging();
    let opener = SimOpener::new(behavior);
    let probe = opener.probe();
    let mut controller = Controller::new(Arc::new(opener), fast_config());
    controller.connect(SIM_PORT, 115_200).unwrap();
    (controller, probe)
}

fn image(blocks: usize) -> FirmwareImage {
    let data: Vec<u8> = (0..blocks * 64).map(|i| (i % 251) as u8).collect();
    FirmwareImage::from_bytes(data, 64).unwrap()
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn cycle_progress(events: &Receiver<Event>) -> Vec<u32> {
    events
        .try_iter()
        .filter_map(|e| match e {
            Event::CycleProgress(state) => Some(state.current),
            _ => None,
        })
        .collect()
}

#[test]
fn test_connect_publishes_state_changes() {
    let opener = SimOpener::default();
    let mut controller = Controller::new(Arc::new(opener), fast_config());
    let events = controller.subscribe();

    controller.connect(SIM_PORT, 115_200).unwrap();
    assert_eq!(controller.state(), ConnectionState::Connected);
    assert_eq!(controller.port_name(), Some(SIM_PORT));

    controller.disconnect();
    assert_eq!(controller.state(), ConnectionState::Disconnected);

    let states: Vec<ConnectionState> = events
        .try_iter()
        .filter_map(|e| match e {
            Event::ConnectionChanged { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected
        ]
    );
}

#[test]
fn test_connect_fails_without_pong() {
    let opener = SimOpener::new(SimBehavior {
        silent: true,
        ..SimBehavior::default()
    });
    let mut controller = Controller::new(Arc::new(opener), fast_config());

    let err = controller.connect(SIM_PORT, 115_200).unwrap_err();
    assert!(matches!(&err, Error::Connection(msg) if msg.contains("PING")));
    assert_eq!(controller.state(), ConnectionState::Error);
    assert!(controller.last_error().is_some());
}

#[test]
fn test_connect_fails_on_busy_or_missing_port() {
    let opener = SimOpener::new(SimBehavior {
        busy: true,
        ..SimBehavior::default()
    });
    let mut controller = Controller::new(Arc::new(opener), fast_config());
    let err = controller.connect(SIM_PORT, 115_200).unwrap_err();
    assert!(matches!(&err, Error::Connection(msg) if msg.contains("busy")));

    let mut controller = Controller::new(Arc::new(SimOpener::default()), fast_config());
    assert!(matches!(
        controller.connect("/dev/rfcomm7", 115_200),
        Err(Error::Connection(_))
    ));
}

#[test]
fn test_reconnect_replaces_handle() {
    let (mut controller, probe) = connected(SimBehavior::default());
    controller.connect(SIM_PORT, 115_200).unwrap();
    assert_eq!(controller.state(), ConnectionState::Connected);
    controller.command(Command::Ping).unwrap();
    assert_eq!(
        probe.commands().iter().filter(|c| *c == "PING").count(),
        3
    );
}

#[test]
fn test_acknowledgements_follow_send_order() {
    let (controller, probe) = connected(SimBehavior::default());
    let events = controller.subscribe();

    let commands = vec![
        Command::SetSpeed(40),
        Command::SetPosition(Position::Extend),
        Command::Status,
        Command::SetPosition(Position::Retract),
        Command::GetVersion,
    ];
    let pending: Vec<_> = commands
        .iter()
        .map(|c| controller.send(c.clone()).unwrap())
        .collect();
    for p in pending {
        p.wait().unwrap();
    }

    let acked: Vec<Command> = events
        .try_iter()
        .filter_map(|e| match e {
            Event::CommandAcked { command, .. } => Some(command),
            _ => None,
        })
        .collect();
    assert_eq!(acked, commands);

    let sent = probe.commands();
    assert_eq!(
        &sent[1..],
        &["SET_SPEED:40", "GO_EXTEND", "STATUS", "GO_RETRACT", "GET_VERSION"]
    );
    assert_eq!(controller.activity(), SlotState::Idle);
}

#[test]
fn test_device_rejection_and_timeout() {
    let (controller, probe) = connected(SimBehavior::default());
    assert!(matches!(
        controller.command(Command::PauseCycle),
        Err(Error::Rejected(msg)) if msg.contains("NOT_RUNNING")
    ));

    probe.set_behavior(SimBehavior {
        silent: true,
        ..SimBehavior::default()
    });
    assert!(matches!(
        controller.command(Command::Status),
        Err(Error::Timeout(_))
    ));
}

#[test]
fn test_sync_profile_updates_device() {
    let (controller, probe) = connected(SimBehavior::default());
    let profile = ActuatorProfile {
        actuator_type: 6600,
        extend_offset: -5,
        speed: 70,
        cycles: 12,
        ..ActuatorProfile::default()
    };
    controller.sync_profile(profile.clone()).unwrap().wait().unwrap();
    assert_eq!(probe.profile(), profile);
}

#[test]
fn test_device_driven_cycling_reports() {
    let (controller, _probe) = connected(SimBehavior::default());
    let events = controller.subscribe();
    controller.command(Command::SetCycles(3)).unwrap();
    controller.command(Command::StartCycle).unwrap();

    let mut reports = Vec::new();
    wait_for(|| {
        reports.extend(events.try_iter().filter_map(|e| match e {
            Event::Report(r) => Some(r),
            _ => None,
        }));
        reports.contains(&Report::Complete { cycles: 3 })
    });
    assert!(reports.contains(&Report::Progress {
        cycle: 2,
        target: 3
    }));
}

#[test]
fn test_cycle_progresses_one_to_five() {
    let (controller, probe) = connected(SimBehavior::default());
    let events = controller.subscribe();

    let report = controller
        .start_cycle(5, Duration::from_millis(500))
        .unwrap()
        .wait()
        .unwrap();

    assert!(!report.cancelled);
    assert!(report.state.is_complete());
    assert_eq!(cycle_progress(&events), vec![1, 2, 3, 4, 5]);
    assert_eq!(
        &probe.commands()[1..],
        &["GO_EXTEND", "GO_RETRACT", "GO_EXTEND", "GO_RETRACT", "GO_EXTEND"]
    );
}

#[test]
fn test_cancelled_cycle_stops_device() {
    let (controller, probe) = connected(SimBehavior::default());
    let events = controller.subscribe();
    let mut pending = controller
        .start_cycle(1000, Duration::from_millis(20))
        .unwrap();

    let mut seen = Vec::new();
    wait_for(|| {
        seen.extend(cycle_progress(&events));
        seen.len() >= 3
    });
    controller.cancel_cycle();

    let report = pending.wait_timeout(WAIT).unwrap().unwrap();
    assert!(report.cancelled);
    assert!(report.state.current < 1000);

    let sent = probe.commands();
    let moves = sent.iter().filter(|c| c.starts_with("GO_")).count();
    assert_eq!(moves, report.state.current as usize);
    assert_eq!(sent.last().map(String::as_str), Some("STOP"));
    assert_eq!(controller.activity(), SlotState::Idle);
}

#[test]
fn test_cycle_excludes_other_activities() {
    let (controller, _probe) = connected(SimBehavior::default());
    let mut pending = controller
        .start_cycle(1000, Duration::from_millis(20))
        .unwrap();

    assert!(matches!(
        controller.begin_firmware_update(image(2)),
        Err(Error::Busy(_))
    ));
    assert!(matches!(
        controller.send(Command::Status),
        Err(Error::Busy(_))
    ));

    controller.cancel_cycle();
    assert!(pending.wait_timeout(WAIT).unwrap().unwrap().cancelled);
    controller.command(Command::Status).unwrap();
}

#[test]
fn test_unplug_during_cycle_fails_promptly() {
    let (controller, probe) = connected(SimBehavior::default());
    let events = controller.subscribe();
    let mut pending = controller
        .start_cycle(1000, Duration::from_millis(20))
        .unwrap();

    wait_for(|| !cycle_progress(&events).is_empty());
    probe.unplug();

    let result = pending.wait_timeout(WAIT).expect("cycle hung after unplug");
    assert!(matches!(result, Err(Error::ConnectionLost)));
    wait_for(|| controller.state() == ConnectionState::Error);
    assert!(matches!(
        controller.send(Command::Ping),
        Err(Error::NotConnected)
    ));
}

#[test]
fn test_disconnect_during_cycle_ends_it() {
    let (mut controller, _probe) = connected(SimBehavior::default());
    let mut pending = controller
        .start_cycle(1000, Duration::from_millis(20))
        .unwrap();
    std::thread::sleep(Duration::from_millis(100));

    controller.disconnect();
    let result = pending.try_take().expect("cycle still running after disconnect");
    match result {
        Ok(report) => assert!(report.cancelled),
        Err(e) => assert!(e.is_connection_error()),
    }
}

#[test]
fn test_reconnect_during_cycle_ends_it() {
    let (mut controller, probe) = connected(SimBehavior::default());
    let mut pending = controller
        .start_cycle(1000, Duration::from_millis(20))
        .unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    controller.connect(SIM_PORT, 115_200).unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    let result = pending.try_take().expect("old cycle still running after reconnect");
    match result {
        Ok(report) => {
            assert!(report.cancelled);
            assert!(report.state.current < 1000);
        },
        Err(e) => assert!(e.is_connection_error()),
    }
    let moves = probe.commands().iter().filter(|c| c.starts_with("GO_")).count();
    assert!(moves < 1000);

    controller.command(Command::Ping).unwrap();
    assert_eq!(controller.activity(), SlotState::Idle);
}

#[test]
fn test_firmware_update_completes() {
    let (controller, probe) = connected(SimBehavior::default());
    let events = controller.subscribe();
    let image = image(10);
    let data = image.data().to_vec();

    let report = controller.begin_firmware_update(image).unwrap().wait().unwrap();
    assert!(report.outcome.is_success());
    assert_eq!(report.transfer.phase, Phase::Completed);
    assert_eq!(report.transfer.acked_blocks, 10);
    assert_eq!(report.transfer.percent(), 100);
    assert_eq!(probe.applied_blocks(), (0..10).collect::<Vec<u16>>());
    assert_eq!(probe.installed_image(), Some(data));

    let phases: Vec<Phase> = events
        .try_iter()
        .filter_map(|e| match e {
            Event::Firmware(state) => Some(state.phase),
            _ => None,
        })
        .collect();
    assert_eq!(phases.first(), Some(&Phase::Negotiating));
    assert_eq!(phases.last(), Some(&Phase::Completed));
}

#[test]
fn test_nak_is_retried() {
    let (controller, probe) = connected(SimBehavior {
        nak_once: BTreeSet::from([2]),
        ..SimBehavior::default()
    });
    let report = controller.begin_firmware_update(image(4)).unwrap().wait().unwrap();
    assert!(report.outcome.is_success());
    assert_eq!(report.transfer.attempts, vec![1, 1, 2, 1]);
    assert_eq!(probe.block_attempts(2), 2);
}

#[test]
fn test_lost_block_aborts_after_three_attempts() {
    let (controller, probe) = connected(SimBehavior {
        lose_blocks: BTreeSet::from([3]),
        ..SimBehavior::default()
    });

    let report = controller.begin_firmware_update(image(10)).unwrap().wait().unwrap();

    match &report.outcome {
        UpdateOutcome::Aborted { reason, risk } => {
            assert!(matches!(reason, Error::Timeout(msg) if msg.contains("block 3")));
            assert_eq!(*risk, FirmwareRisk::DeviceUnchanged);
        },
        UpdateOutcome::Completed => panic!("update must not complete"),
    }
    assert_eq!(report.transfer.phase, Phase::Aborted);
    assert_eq!(report.transfer.acked_blocks, 3);
    assert_eq!(probe.block_attempts(3), 3);
    assert_eq!(probe.block_attempts(4), 0);
    assert_eq!(probe.applied_blocks(), vec![0, 1, 2]);

    wait_for(|| probe.commands().iter().any(|c| c == "OTA_ABORT"));
    assert!(!probe.ota_in_progress());
    assert!(probe.installed_image().is_none());
}

#[test]
fn test_rejected_announcement_leaves_device_unchanged() {
    let (controller, probe) = connected(SimBehavior {
        reject_ota: true,
        ..SimBehavior::default()
    });
    let report = controller.begin_firmware_update(image(2)).unwrap().wait().unwrap();
    assert!(matches!(
        report.outcome,
        UpdateOutcome::Aborted {
            reason: Error::Rejected(_),
            risk: FirmwareRisk::DeviceUnchanged
        }
    ));
    assert_eq!(probe.block_attempts(0), 0);
}

#[test]
fn test_checksum_mismatch_is_integrity_error() {
    let (controller, _probe) = connected(SimBehavior {
        verify_crc: Some(0xDEAD_BEEF),
        ..SimBehavior::default()
    });
    let report = controller.begin_firmware_update(image(3)).unwrap().wait().unwrap();
    match report.outcome {
        UpdateOutcome::Aborted {
            reason: Error::Integrity { actual, .. },
            risk,
        } => {
            assert_eq!(actual, Some(0xDEAD_BEEF));
            assert_eq!(risk, FirmwareRisk::Uncertain);
        },
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn test_unplug_during_transfer_aborts() {
    let (controller, probe) = connected(SimBehavior {
        unplug_at_block: Some(4),
        ..SimBehavior::default()
    });
    let mut pending = controller.begin_firmware_update(image(10)).unwrap();

    let report = pending
        .wait_timeout(WAIT)
        .expect("update hung after unplug")
        .unwrap();
    assert!(matches!(
        report.outcome,
        UpdateOutcome::Aborted {
            reason: Error::ConnectionLost,
            risk: FirmwareRisk::DeviceUnchanged
        }
    ));
    assert_eq!(report.transfer.acked_blocks, 4);
    assert_eq!(probe.applied_blocks(), vec![0, 1, 2, 3]);
    wait_for(|| controller.state() == ConnectionState::Error);
}

#[test]
fn test_disconnect_during_transfer_aborts() {
    let (mut controller, probe) = connected(SimBehavior {
        lose_blocks: BTreeSet::from([2]),
        ..SimBehavior::default()
    });
    let mut pending = controller.begin_firmware_update(image(6)).unwrap();
    wait_for(|| probe.block_attempts(2) > 0);

    controller.disconnect();
    let report = pending
        .try_take()
        .expect("update still running after disconnect")
        .unwrap();
    match &report.outcome {
        UpdateOutcome::Aborted { reason, .. } => {
            assert!(matches!(reason, Error::Cancelled) || reason.is_connection_error());
        },
        UpdateOutcome::Completed => panic!("update must not complete"),
    }
    assert_eq!(report.transfer.phase, Phase::Aborted);
    assert_eq!(report.transfer.acked_blocks, 2);
    assert!(probe.installed_image().is_none());
    assert_eq!(controller.state(), ConnectionState::Disconnected);
}

#[test]
fn test_cancelled_update_aborts_and_can_restart() {
    let (controller, probe) = connected(SimBehavior {
        lose_blocks: BTreeSet::from([1]),
        ..SimBehavior::default()
    });
    let mut pending = controller.begin_firmware_update(image(4)).unwrap();
    wait_for(|| probe.block_attempts(1) > 0);
    controller.cancel_update();

    let report = pending.wait_timeout(WAIT).unwrap().unwrap();
    assert!(matches!(
        report.outcome,
        UpdateOutcome::Aborted {
            reason: Error::Cancelled,
            ..
        }
    ));

    probe.set_behavior(SimBehavior::default());
    let report = controller.begin_firmware_update(image(4)).unwrap().wait().unwrap();
    assert!(report.outcome.is_success());
}
