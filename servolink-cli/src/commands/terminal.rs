//! Interactive command terminal.
//!
//! Lines typed by the user are sent as commands; device reports are printed
//! as they arrive. A leading `!` sends the rest of the line verbatim.

use {
    crate::{Cli, ClassifyExt, CliError, config::Config, open_controller, was_interrupted},
    anyhow::Result,
    console::style,
    log::debug,
    rust_i18n::t,
    servolink::{Command, ConnectionState, Controller, Event, Report},
    std::{
        io::{self, BufRead, IsTerminal, Write as _},
        sync::mpsc::{self, Receiver, RecvTimeoutError},
        thread,
        time::Duration,
    },
};

const POLL: Duration = Duration::from_millis(50);

/// What a typed line asks for.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Empty,
    Quit,
    Help,
    Send(Command),
}

fn parse_input(line: &str) -> servolink::Result<Input> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Empty);
    }
    if let Some(raw) = line.strip_prefix('!') {
        let command = Command::Raw(raw.trim().to_string());
        command.validate()?;
        return Ok(Input::Send(command));
    }
    match line.to_ascii_lowercase().as_str() {
        "quit" | "exit" | ".q" => Ok(Input::Quit),
        "help" | "?" => Ok(Input::Help),
        _ => line.parse::<Command>().map(Input::Send),
    }
}

fn describe_report(report: &Report) -> String {
    match report {
        Report::Progress { cycle, target: 0 } => t!("terminal.progress_open", cycle = cycle).to_string(),
        Report::Progress { cycle, target } => {
            t!("terminal.progress", cycle = cycle, target = target).to_string()
        },
        Report::Complete { cycles } => t!("terminal.complete", cycles = cycles).to_string(),
        Report::Status { state, position } => match position {
            Some(pos) => format!("{state} @ {pos}°"),
            None => state.clone(),
        },
        Report::OtaProgress(pct) => format!("OTA {pct}%"),
        Report::Log(line) => line.clone(),
    }
}

/// Read stdin on a helper thread so the main loop can keep printing reports.
fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name("terminal-input".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        debug!("stdin reader not started: {e}");
    }
    rx
}

fn prompt(interactive: bool) {
    if interactive {
        eprint!("{} ", style(">").bold());
        io::stderr().flush().ok();
    }
}

fn run_line(controller: &Controller, command: Command) -> Result<()> {
    match controller.command(command) {
        Ok(response) => println!("{} {response}", style("←").cyan()),
        Err(e) if e.is_connection_error() => return Err(e).classified(),
        Err(e) => eprintln!("{} {e}", style("✗").red()),
    }
    Ok(())
}

/// Terminal command implementation.
pub(crate) fn cmd_terminal(cli: &Cli, config: &mut Config) -> Result<()> {
    let controller = open_controller(cli, config)?;
    let events = controller.subscribe();
    let interactive = io::stdin().is_terminal();

    if interactive && !cli.quiet {
        eprintln!("{}", style(t!("terminal.banner")).dim());
    }

    let lines = spawn_stdin_reader();
    prompt(interactive);

    loop {
        if was_interrupted() {
            return Err(CliError::Cancelled(t!("terminal.closed").to_string()).into());
        }

        for event in events.try_iter() {
            match event {
                Event::Report(report) => {
                    println!("{} {}", style("‹").magenta(), describe_report(&report));
                },
                Event::ConnectionChanged {
                    state: ConnectionState::Error,
                    ..
                } => return Err(servolink::Error::ConnectionLost).classified(),
                _ => {},
            }
        }

        match lines.recv_timeout(POLL) {
            Ok(line) => {
                match parse_input(&line) {
                    Ok(Input::Empty) => {},
                    Ok(Input::Quit) => break,
                    Ok(Input::Help) => eprintln!("{}", t!("terminal.help")),
                    Ok(Input::Send(command)) => run_line(&controller, command)?,
                    Err(e) => eprintln!("{} {e}", style("✗").red()),
                }
                prompt(interactive);
            },
            Err(RecvTimeoutError::Timeout) => {},
            // End of input.
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use servolink::Position;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("   ").unwrap(), Input::Empty);
        assert_eq!(parse_input("EXIT").unwrap(), Input::Quit);
        assert_eq!(parse_input("?").unwrap(), Input::Help);
        assert_eq!(
            parse_input("go_extend").unwrap(),
            Input::Send(Command::SetPosition(Position::Extend))
        );
        assert_eq!(
            parse_input("!FACTORY_RESET").unwrap(),
            Input::Send(Command::Raw("FACTORY_RESET".into()))
        );
        assert!(parse_input("!").is_err());
        assert!(parse_input("SET_SPEED:500").is_err());
    }

    #[test]
    fn test_describe_report() {
        assert_eq!(
            describe_report(&Report::Status {
                state: "IDLE".into(),
                position: Some(90)
            }),
            "IDLE @ 90°"
        );
        assert_eq!(describe_report(&Report::Log("boot".into())), "boot");
        assert_eq!(describe_report(&Report::OtaProgress(40)), "OTA 40%");
    }
}
