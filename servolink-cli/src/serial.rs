//! Interactive selection of the controller port.
//!
//! - Explicit `--port` or the paired port from configuration wins
//! - Otherwise Bluetooth ports and known ESP32 bridges are offered first
//! - Interactive selection via dialoguer, with an offer to remember the choice
//! - Non-interactive mode for scripts and CI

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    rust_i18n::t,
    servolink::{DetectedPort, ScanFilter, TransportKind, device},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Offer every port, not only likely controllers.
    pub list_all_ports: bool,
    /// Non-interactive mode (fail if the choice is ambiguous).
    pub non_interactive: bool,
    /// Force confirmation even for a single likely port.
    pub confirm_port: bool,
}

/// Result of port selection.
pub struct SelectedPort {
    /// The selected port info.
    pub port: DetectedPort,
    /// Whether the port came from `--port` or the configuration.
    pub preset: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    // Selection failures are setup problems: exit code 2.
    CliError::Usage(message.to_string()).into()
}

fn select_non_interactive_port(candidates: Vec<DetectedPort>) -> Result<SelectedPort> {
    let mut candidates = candidates.into_iter();
    match (candidates.next(), candidates.next()) {
        (Some(port), None) => Ok(SelectedPort {
            port,
            preset: false,
        }),
        (Some(_), Some(_)) => Err(usage_err(t!("serial.multiple_ports").as_ref())),
        (None, _) => Err(usage_err(t!("serial.no_ports_available").as_ref())),
    }
}

/// Pick the port to talk to.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name));
    }

    if let Some(port_name) = &config.connection.port {
        debug!("Using paired port from config: {port_name}");
        return Ok(find_port_by_name(port_name));
    }

    let ports = device::detect_ports();
    if ports.is_empty() {
        return Err(usage_err(t!("serial.no_ports_found").as_ref()));
    }

    let likely: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| ScanFilter::Likely.accepts(p))
        .cloned()
        .collect();

    let candidates = if options.list_all_ports || likely.is_empty() {
        ports
    } else {
        likely
    };

    if options.non_interactive {
        return select_non_interactive_port(candidates);
    }

    match candidates.len().cmp(&1) {
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(candidates)
        },
        Ordering::Equal => {
            let Some(port) = candidates.into_iter().next() else {
                return Err(usage_err(t!("serial.no_ports_available").as_ref()));
            };
            if port.is_likely_controller() && !options.confirm_port {
                info!(
                    "Auto-selected port: {} [{}]",
                    port.name,
                    port.transport.name()
                );
                Ok(SelectedPort {
                    port,
                    preset: false,
                })
            } else {
                ensure_interactive_terminal()?;
                confirm_single_port(port)
            }
        },
        Ordering::Less => Err(usage_err(t!("serial.no_ports_available").as_ref())),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(CliError::Usage(t!("serial.interactive_requires_tty").to_string()).into())
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled(t!("serial.selection_cancelled").to_string()).into()
            } else {
                CliError::Usage(t!("serial.prompt_failed").to_string()).into()
            }
        },
    }
}

/// Find a port by name, falling back to a bare entry for unlisted paths.
fn find_port_by_name(name: &str) -> SelectedPort {
    let ports = device::detect_ports();
    let found = ports
        .iter()
        .find(|p| p.name == name)
        .or_else(|| ports.iter().find(|p| p.name.eq_ignore_ascii_case(name)));

    SelectedPort {
        port: found
            .cloned()
            .unwrap_or_else(|| DetectedPort::bare(name, TransportKind::Unknown)),
        preset: true,
    }
}

/// One-line label for a port in the selection menu.
fn port_label(port: &DetectedPort) -> String {
    let name = if port.is_likely_controller() {
        style(&port.name).bold().to_string()
    } else {
        port.name.clone()
    };

    let kind = if port.device.is_known() {
        format!(" [{}]", style(port.device.name()).yellow())
    } else if port.transport == TransportKind::Bluetooth {
        format!(" [{}]", style(port.transport.name()).cyan())
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };

    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();

    format!("{name}{kind}{product}")
}

fn select_port_interactive(mut ports: Vec<DetectedPort>) -> Result<SelectedPort> {
    eprintln!(
        "{} {}",
        style("ℹ").blue(),
        t!("serial.detected_ports", count = ports.len())
    );
    eprintln!("{}", style(t!("serial.likely_ports_hint")).dim());

    ports.sort_by_key(|p| !p.is_likely_controller());

    // Keep labels on one line in narrow terminals.
    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| console::truncate_str(&port_label(p), max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(t!("serial.select_prompt").to_string())
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => {
            let port = ports
                .into_iter()
                .nth(index)
                .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
            Ok(SelectedPort {
                port,
                preset: false,
            })
        },
        None => Err(CliError::Cancelled(t!("serial.selection_cancelled").to_string()).into()),
    }
}

fn confirm_single_port(port: DetectedPort) -> Result<SelectedPort> {
    let product_info = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(
            t!(
                "serial.confirm_use",
                port = port.name.clone(),
                info = product_info
            )
            .to_string(),
        )
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort {
            port,
            preset: false,
        })
    } else {
        Err(CliError::Cancelled(t!("serial.selection_cancelled").to_string()).into())
    }
}

/// Offer to remember a freshly selected port as the paired controller.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    if config.connection.port.as_deref() == Some(port.name.as_str()) {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(t!("serial.remember_prompt").to_string())
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_port(&port.name) {
            error!("Failed to save port configuration: {e}");
        }
    }

    Ok(())
}
