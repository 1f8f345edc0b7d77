//! Single-command subcommands: ping, send, move, status, version and sync.

use {
    crate::{Cli, ClassifyExt, CliError, config::Config, open_controller},
    anyhow::Result,
    console::style,
    log::debug,
    rust_i18n::t,
    servolink::{Command, Position, Response},
    std::time::Instant,
};

/// Turn `["SET_SPEED", "50"]` into the typed command text `SET_SPEED:50`.
fn join_words(words: &[String]) -> String {
    match words {
        [] => String::new(),
        [single] => single.clone(),
        [name, args @ ..] => format!("{name}:{}", args.join(",")),
    }
}

fn parse_command(words: &[String], raw: bool) -> Result<Command> {
    let text = join_words(words);
    let command = if raw {
        Command::Raw(text)
    } else {
        text.parse::<Command>()
            .map_err(|e| CliError::Usage(e.to_string()))?
    };
    if command.is_firmware() {
        return Err(CliError::Usage(t!("control.firmware_reserved").to_string()).into());
    }
    command
        .validate()
        .map_err(|e| CliError::Usage(e.to_string()))?;
    Ok(command)
}

fn print_reply(cli: &Cli, response: &Response) {
    if cli.quiet {
        println!("{response}");
    } else {
        eprintln!("{} {}", style("←").cyan(), response);
    }
}

/// Ping command implementation.
pub(crate) fn cmd_ping(cli: &Cli, config: &mut Config) -> Result<()> {
    let controller = open_controller(cli, config)?;
    let started = Instant::now();
    let response = controller.command(Command::Ping).classified()?;
    let elapsed = started.elapsed();
    debug!("PING answered with {response}");
    println!(
        "{}",
        t!("control.pong", ms = elapsed.as_millis())
    );
    Ok(())
}

/// Send command implementation.
pub(crate) fn cmd_send(cli: &Cli, config: &mut Config, words: &[String], raw: bool) -> Result<()> {
    let command = parse_command(words, raw)?;
    let controller = open_controller(cli, config)?;
    if !cli.quiet {
        eprintln!("{} {}", style("→").green(), command);
    }
    let response = controller.command(command).classified()?;
    print_reply(cli, &response);
    Ok(())
}

/// Move command implementation.
pub(crate) fn cmd_move(cli: &Cli, config: &mut Config, position: Position) -> Result<()> {
    let controller = open_controller(cli, config)?;
    let command = Command::SetPosition(position);
    controller.command(command.clone()).classified()?;
    if !cli.quiet {
        eprintln!(
            "{} {}",
            style("✓").green(),
            t!("control.moved", command = command)
        );
    }
    Ok(())
}

/// Status command implementation.
pub(crate) fn cmd_status(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let controller = open_controller(cli, config)?;
    let status = controller.command(Command::Status).classified()?;
    let state = status.text("STATE").unwrap_or("UNKNOWN");
    let position = status.int("POS");

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "port": controller.port_name(),
                "state": state,
                "position": position,
                "fields": status.fields,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{}", t!("control.state", state = style(state).bold()));
    if let Some(pos) = position {
        println!("{}", t!("control.position", degrees = pos));
    }
    Ok(())
}

/// Version command implementation.
pub(crate) fn cmd_version(cli: &Cli, config: &mut Config) -> Result<()> {
    let controller = open_controller(cli, config)?;
    let reply = controller.command(Command::GetVersion).classified()?;
    let version = if reply.payload.is_empty() {
        reply.to_string()
    } else {
        reply.payload
    };
    println!("{version}");
    Ok(())
}

/// Sync command implementation.
pub(crate) fn cmd_sync(cli: &Cli, config: &mut Config) -> Result<()> {
    let profile = config.profile.to_profile();
    profile
        .validate()
        .map_err(|e| CliError::Config(e.to_string()))?;

    let controller = open_controller(cli, config)?;
    controller.sync_profile(profile.clone()).classified()?.wait().classified()?;

    if !cli.quiet {
        eprintln!("{} {}", style("✓").green(), t!("control.synced"));
        for command in profile.commands() {
            eprintln!("    {}", style(command).dim());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(v: &[&str]) -> Vec<String> {
        v.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_join_words() {
        assert_eq!(join_words(&words(&["ping"])), "ping");
        assert_eq!(join_words(&words(&["SET_SPEED", "50"])), "SET_SPEED:50");
        assert_eq!(join_words(&words(&["SET_SPEED:50"])), "SET_SPEED:50");
    }

    #[test]
    fn test_parse_command_validates() {
        assert_eq!(
            parse_command(&words(&["set_speed", "50"]), false).unwrap(),
            Command::SetSpeed(50)
        );
        let err = parse_command(&words(&["SET_SPEED", "0"]), false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
        assert!(parse_command(&words(&["FLY"]), false).is_err());
    }

    #[test]
    fn test_parse_command_raw_passthrough() {
        assert_eq!(
            parse_command(&words(&["CUSTOM_THING"]), true).unwrap(),
            Command::Raw("CUSTOM_THING".into())
        );
    }

    #[test]
    fn test_parse_command_raw_firmware_rejected() {
        let err = parse_command(&words(&["OTA_START:100,DEADBEEF,64"]), true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
        assert!(parse_command(&words(&["STATUS#3"]), true).is_err());
    }
}
