//! Firmware update command.

use {
    crate::{
        Cli, ClassifyExt, CliError, config::Config, open_controller, read_context,
        use_fancy_output, was_interrupted,
    },
    anyhow::{Context, Result},
    console::style,
    dialoguer::{Confirm, theme::ColorfulTheme},
    indicatif::{ProgressBar, ProgressStyle},
    log::{debug, warn},
    rust_i18n::t,
    servolink::{
        Error, Event, FirmwareImage, FirmwareRisk, Phase, SessionConfig, TransferState,
        UpdateOutcome,
    },
    std::{io::IsTerminal, path::Path, time::Duration},
};

const POLL: Duration = Duration::from_millis(100);

fn phase_label(phase: Phase) -> String {
    match phase {
        Phase::Idle => t!("update.phase.idle"),
        Phase::Negotiating => t!("update.phase.negotiating"),
        Phase::Transferring => t!("update.phase.transferring"),
        Phase::Verifying => t!("update.phase.verifying"),
        Phase::Completed => t!("update.phase.completed"),
        Phase::Aborted => t!("update.phase.aborted"),
    }
    .to_string()
}

fn update_bar(cli: &Cli) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)]
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb
}

fn show_transfer(pb: &ProgressBar, state: &TransferState) {
    pb.set_position(u64::from(state.percent()));
    pb.set_message(format!(
        "{} {}/{}",
        phase_label(state.phase),
        state.acked_blocks,
        state.total_blocks
    ));
}

fn print_summary(firmware: &Path, image: &FirmwareImage) {
    eprintln!(
        "{} {}",
        style("📦").cyan(),
        t!("update.image", path = firmware.display())
    );
    eprintln!(
        "    {}",
        t!(
            "update.image_details",
            size = image.len(),
            blocks = image.block_count(),
            crc = format!("{:08X}", image.crc32())
        )
    );
    if let Some(app) = image.app_descriptor() {
        eprintln!(
            "    {}",
            t!(
                "update.image_app",
                name = app.project_name.as_str(),
                version = app.version.as_str()
            )
        );
    }
}

fn confirm_update(cli: &Cli, yes: bool) -> Result<()> {
    if yes {
        return Ok(());
    }
    if cli.non_interactive || !std::io::stdin().is_terminal() {
        return Err(CliError::Usage(t!("update.needs_yes").to_string()).into());
    }
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(t!("update.confirm").to_string())
        .default(false)
        .interact_opt()
        .map_err(|e| CliError::Usage(e.to_string()))?
        .unwrap_or(false);
    if confirmed {
        Ok(())
    } else {
        Err(CliError::Cancelled(t!("update.declined").to_string()).into())
    }
}

/// Tell the user what an abort means for the device.
fn risk_notice(risk: FirmwareRisk) -> String {
    match risk {
        FirmwareRisk::DeviceUnchanged => t!("update.risk_unchanged").to_string(),
        FirmwareRisk::Uncertain => t!("update.risk_uncertain").to_string(),
    }
}

/// Exit class of an aborted update.
fn abort_error(reason: Error) -> anyhow::Error {
    let message = t!("update.aborted", reason = reason.to_string()).to_string();
    match reason {
        Error::Cancelled => CliError::Cancelled(message).into(),
        e if e.is_connection_error() => CliError::Connection(message).into(),
        _ => CliError::Update(message).into(),
    }
}

/// Update command implementation.
pub(crate) fn cmd_update(
    cli: &Cli,
    config: &mut Config,
    firmware: &Path,
    block_size: Option<u16>,
    yes: bool,
) -> Result<()> {
    let block_size = block_size
        .or(config.update.block_size)
        .unwrap_or(SessionConfig::default().block_size);
    let image = FirmwareImage::from_file(firmware, block_size)
        .with_context(|| read_context(firmware))?;

    if !cli.quiet {
        print_summary(firmware, &image);
    }
    confirm_update(cli, yes)?;

    let controller = open_controller(cli, config)?;
    let events = controller.subscribe();
    let mut pending = controller.begin_firmware_update(image).classified()?;

    let pb = update_bar(cli);
    let mut cancel_sent = false;
    let report = loop {
        if let Some(result) = pending.wait_timeout(POLL) {
            break result.classified()?;
        }
        for event in events.try_iter() {
            match event {
                Event::Firmware(state) => show_transfer(&pb, &state),
                Event::Report(report) => debug!("device: {report:?}"),
                _ => {},
            }
        }
        if was_interrupted() && !cancel_sent {
            pb.set_message(t!("update.stopping").to_string());
            controller.cancel_update();
            cancel_sent = true;
        }
    };
    show_transfer(&pb, &report.transfer);
    pb.finish_and_clear();

    match report.outcome {
        UpdateOutcome::Completed => {
            if !cli.quiet {
                eprintln!(
                    "{} {}",
                    style("✓").green().bold(),
                    t!("update.completed", blocks = report.transfer.acked_blocks)
                );
            }
            Ok(())
        },
        UpdateOutcome::Aborted { reason, risk } => {
            warn!(
                "Update aborted in phase {} after {}/{} blocks",
                report.transfer.phase, report.transfer.acked_blocks, report.transfer.total_blocks
            );
            let notice = risk_notice(risk);
            match risk {
                FirmwareRisk::DeviceUnchanged => eprintln!("{} {notice}", style("ℹ").blue()),
                FirmwareRisk::Uncertain => eprintln!("{} {notice}", style("⚠").yellow().bold()),
            }
            Err(abort_error(reason))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_error_classes() {
        let code = |e: Error| {
            let err = abort_error(e);
            match err.downcast_ref::<CliError>() {
                Some(CliError::Cancelled(_)) => 130,
                Some(CliError::Connection(_)) => 4,
                Some(CliError::Update(_)) => 6,
                _ => 0,
            }
        };
        assert_eq!(code(Error::Cancelled), 130);
        assert_eq!(code(Error::ConnectionLost), 4);
        assert_eq!(code(Error::Timeout("block 3".into())), 6);
        assert_eq!(
            code(Error::Integrity {
                expected: 1,
                actual: None
            }),
            6
        );
    }

    #[test]
    fn test_risk_notices_differ() {
        assert_ne!(
            risk_notice(FirmwareRisk::DeviceUnchanged),
            risk_notice(FirmwareRisk::Uncertain)
        );
    }
}
