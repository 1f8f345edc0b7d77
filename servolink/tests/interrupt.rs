//! The process-wide interrupt checker cancels long-running work.
//!
//! Lives in its own test binary: the checker can only be registered once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use servolink::sim::{SIM_PORT, SimOpener};
use servolink::{CancelToken, Controller, Error, SessionConfig};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[test]
fn test_interrupt_cancels_sleep_and_cycle() {
    servolink::set_interrupt_checker(|| INTERRUPTED.load(Ordering::SeqCst));
    assert!(!servolink::is_interrupted_requested());

    let config = SessionConfig {
        settle_delay: Duration::ZERO,
        ..SessionConfig::default()
    };
    let mut controller = Controller::new(Arc::new(SimOpener::default()), config);
    controller.connect(SIM_PORT, 115_200).unwrap();
    let mut pending = controller
        .start_cycle(1000, Duration::from_millis(20))
        .unwrap();

    std::thread::sleep(Duration::from_millis(100));
    INTERRUPTED.store(true, Ordering::SeqCst);

    let report = pending
        .wait_timeout(Duration::from_secs(10))
        .expect("cycle ignored the interrupt")
        .unwrap();
    assert!(report.cancelled);

    let start = Instant::now();
    assert!(matches!(
        CancelToken::new().sleep(Duration::from_secs(5)),
        Err(Error::Cancelled)
    ));
    assert!(start.elapsed() < Duration::from_secs(1));

    INTERRUPTED.store(false, Ordering::SeqCst);
    assert!(!servolink::is_interrupted_requested());
}
