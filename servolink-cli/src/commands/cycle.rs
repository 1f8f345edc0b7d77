//! Host-driven cycling with live progress.

use {
    crate::{
        Cli, ClassifyExt, CliError, config::Config, open_controller, use_fancy_output,
        was_interrupted,
    },
    anyhow::Result,
    console::style,
    indicatif::{ProgressBar, ProgressStyle},
    log::{debug, info},
    rust_i18n::t,
    servolink::{CycleState, Event},
    std::{sync::mpsc::Receiver, time::Duration},
};

const POLL: Duration = Duration::from_millis(100);

fn cycle_bar(cli: &Cli, total: u32) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(u64::from(total));
    #[allow(clippy::unwrap_used)]
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb
}

/// Apply any queued progress events to the bar.
fn drain_progress(events: &Receiver<Event>, pb: &ProgressBar) -> Option<CycleState> {
    let mut latest = None;
    for event in events.try_iter() {
        if let Event::CycleProgress(state) = event {
            pb.set_position(u64::from(state.current));
            pb.set_message(t!("cycle.step", current = state.current, total = state.total).to_string());
            latest = Some(state);
        }
    }
    latest
}

/// Cycle command implementation.
pub(crate) fn cmd_cycle(cli: &Cli, config: &mut Config, count: u32, interval: Duration) -> Result<()> {
    if count == 0 {
        return Err(CliError::Usage(t!("cycle.zero").to_string()).into());
    }

    let controller = open_controller(cli, config)?;
    let events = controller.subscribe();
    let mut pending = controller.start_cycle(count, interval).classified()?;
    info!("Cycling {count} steps every {}ms", interval.as_millis());

    let pb = cycle_bar(cli, count);
    let mut cancel_sent = false;
    let result = loop {
        if let Some(result) = pending.wait_timeout(POLL) {
            break result;
        }
        if let Some(state) = drain_progress(&events, &pb) {
            debug!("cycle {}/{}", state.current, state.total);
        }
        if was_interrupted() && !cancel_sent {
            pb.set_message(t!("cycle.stopping").to_string());
            controller.cancel_cycle();
            cancel_sent = true;
        }
    };
    drain_progress(&events, &pb);
    pb.finish_and_clear();

    let report = result.classified()?;
    if report.cancelled {
        return Err(CliError::Cancelled(
            t!(
                "cycle.cancelled",
                current = report.state.current,
                total = report.state.total
            )
            .to_string(),
        )
        .into());
    }

    if !cli.quiet {
        eprintln!(
            "{} {}",
            style("✓").green(),
            t!(
                "cycle.done",
                count = report.state.current,
                secs = format!("{:.1}", report.state.elapsed.as_secs_f64())
            )
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_drain_progress_keeps_latest() {
        let (tx, rx) = mpsc::channel();
        for current in 1..=3 {
            tx.send(Event::CycleProgress(CycleState {
                current,
                total: 3,
                elapsed: Duration::ZERO,
            }))
            .unwrap();
        }
        let pb = ProgressBar::hidden();
        let latest = drain_progress(&rx, &pb).unwrap();
        assert_eq!(latest.current, 3);
        assert!(drain_progress(&rx, &pb).is_none());
    }
}
