//! servolink CLI - drive servo actuators and update their controller firmware
//! over a Bluetooth serial link.
//!
//! ## Features
//!
//! - Discover paired Bluetooth and USB serial ports
//! - Send single commands and read status
//! - Host-driven cycling with live progress
//! - Firmware updates with per-block retries and CRC verification
//! - Simulated controller (`--simulate`) for trying things without hardware
//! - Shell completion generation
//! - Internationalization (i18n) support

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use rust_i18n::t;
use servolink::sim::{SIM_PORT, SimOpener};
use servolink::{Controller, Position, PortOpener, SessionConfig};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod commands;
mod config;
mod help;
mod serial;

use commands::completions::{cmd_completions, cmd_completions_install};
use commands::control::{cmd_move, cmd_ping, cmd_send, cmd_status, cmd_sync, cmd_version};
use commands::cycle::cmd_cycle;
use commands::info::{cmd_forget_port, cmd_info, cmd_list_ports};
use commands::terminal::cmd_terminal;
use commands::update::cmd_update;
use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

// Initialize i18n with locale files from the locales directory
rust_i18n::i18n!("locales", fallback = "en");

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Failures classified for the process exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad arguments or an ambiguous setup.
    #[error("{0}")]
    Usage(String),
    /// Unreadable or invalid configuration.
    #[error("{0}")]
    Config(String),
    /// Port missing, busy or not answering.
    #[error("{0}")]
    Connection(String),
    /// Missing or malformed acknowledgements.
    #[error("{0}")]
    Device(String),
    /// Firmware update aborted or failed verification.
    #[error("{0}")]
    Update(String),
    /// Stopped by the user.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Config(_) => 3,
            Self::Connection(_) => 4,
            Self::Device(_) => 5,
            Self::Update(_) => 6,
            Self::Cancelled(_) => 130,
        }
    }
}

fn library_exit_code(err: &servolink::Error) -> i32 {
    use servolink::Error;
    match err {
        Error::InvalidCommand(_) => 2,
        Error::Config(_) => 3,
        e if e.is_connection_error() => 4,
        e if e.is_protocol_error() => 5,
        Error::Integrity { .. } => 6,
        Error::Cancelled => 130,
        _ => 1,
    }
}

/// Map an error chain to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(cli) = cause.downcast_ref::<CliError>() {
            return cli.exit_code();
        }
        if let Some(lib) = cause.downcast_ref::<servolink::Error>() {
            return library_exit_code(lib);
        }
    }
    1
}

/// servolink - control servo actuators over Bluetooth serial.
///
/// Environment variables:
///   SERVOLINK_PORT              - Controller serial port
///   SERVOLINK_BAUD              - Baud rate (default: 115200)
///   SERVOLINK_TIMEOUT_MS        - Command acknowledgement timeout
///   SERVOLINK_SIMULATE          - Talk to the built-in simulated controller
///   SERVOLINK_LANG              - Language/locale (en, zh-CN)
///   SERVOLINK_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser, Debug)]
#[command(name = "servolink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port of the controller (selected interactively if not specified).
    #[arg(short, long, global = true, env = "SERVOLINK_PORT")]
    port: Option<String>,

    /// Baud rate (default: 115200).
    #[arg(short, long, global = true, env = "SERVOLINK_BAUD")]
    baud: Option<u32>,

    /// Command acknowledgement timeout in milliseconds.
    #[arg(long, global = true, env = "SERVOLINK_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Use the built-in simulated controller instead of a real port.
    #[arg(long, global = true, env = "SERVOLINK_SIMULATE")]
    simulate: bool,

    /// Language/locale for messages (e.g., en, zh-CN).
    #[arg(long, global = true, env = "SERVOLINK_LANG")]
    lang: Option<String>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "SERVOLINK_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// Offer all ports, not only Bluetooth ports and known bridges.
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Actuator positions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum PositionArg {
    /// Neutral position.
    Home,
    /// Fully extended.
    Extend,
    /// Fully retracted.
    Retract,
}

impl From<PositionArg> for Position {
    fn from(arg: PositionArg) -> Self {
        match arg {
            PositionArg::Home => Position::Home,
            PositionArg::Extend => Position::Extend,
            PositionArg::Retract => Position::Retract,
        }
    }
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Check that the controller answers.
    Ping,

    /// Send one controller command, e.g. `SET_SPEED:50`.
    Send {
        /// Command text; arguments may be separated by ':' or spaces.
        #[arg(required = true, num_args = 1..)]
        command: Vec<String>,

        /// Send the text verbatim, skipping argument checks.
        #[arg(long)]
        raw: bool,
    },

    /// Move the actuator to a position.
    Move {
        /// Target position.
        #[arg(value_enum)]
        position: PositionArg,
    },

    /// Show controller state and position.
    Status {
        /// Output as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Show the controller firmware version.
    Version,

    /// Push the actuator profile from the configuration.
    Sync {
        /// Override the actuator model.
        #[arg(long)]
        actuator_type: Option<u16>,

        /// Override the speed in percent.
        #[arg(long)]
        speed: Option<u8>,

        /// Override the device-driven cycle target.
        #[arg(long)]
        cycles: Option<u32>,
    },

    /// Run host-driven extend/retract cycles.
    Cycle {
        /// Number of position commands to send.
        count: u32,

        /// Pause between steps in milliseconds.
        #[arg(long, default_value = "500")]
        interval_ms: u64,
    },

    /// Update the controller firmware.
    Update {
        /// Firmware image (.bin).
        firmware: PathBuf,

        /// Block payload size in bytes.
        #[arg(long)]
        block_size: Option<u16>,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Show information about a firmware image.
    Info {
        /// Firmware image (.bin).
        firmware: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Interactive command terminal.
    Terminal,

    /// Forget the paired controller port.
    ForgetPort,

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// Get the controller port from CLI args, config or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    if !selected.preset && !cli.non_interactive {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}

/// Effective baud rate: flag, then config, then the controller default.
pub(crate) fn baud_rate(cli: &Cli, config: &Config) -> u32 {
    cli.baud
        .or(config.connection.baud)
        .unwrap_or(servolink::port::DEFAULT_BAUD)
}

/// Session timeouts after config and flags.
pub(crate) fn session_config(cli: &Cli, config: &Config) -> SessionConfig {
    let mut session = SessionConfig::default();
    config.apply_session(&mut session);
    if let Some(ms) = cli.timeout_ms {
        session.ack_timeout = Duration::from_millis(ms);
    }
    if cli.simulate {
        session.settle_delay = Duration::ZERO;
    }
    session
}

fn spinner(cli: &Cli, message: String) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        if !cli.quiet {
            eprintln!("{message}");
        }
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Resolve the port, open it and run the handshake.
pub(crate) fn open_controller(cli: &Cli, config: &mut Config) -> Result<Controller> {
    let session = session_config(cli, config);
    let opener: Arc<dyn PortOpener>;
    let port = if cli.simulate {
        opener = Arc::new(SimOpener::default());
        cli.port.clone().unwrap_or_else(|| SIM_PORT.to_string())
    } else {
        opener = Arc::new(servolink::NativeOpener);
        get_port(cli, config)?
    };
    let baud = baud_rate(cli, config);

    let pb = spinner(cli, t!("common.connecting", port = port.as_str(), baud = baud).to_string());
    let mut controller = Controller::new(opener, session);
    let connected = controller.connect(&port, baud);
    pb.finish_and_clear();

    connected.map_err(|e| CliError::Connection(t!("error.connect", reason = e).to_string()))?;
    if !cli.quiet {
        eprintln!(
            "{} {}",
            style("✓").green(),
            t!("common.connected", port = port.as_str())
        );
    }
    Ok(controller)
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn install_interrupt_handler() {
    let installed = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            // Second Ctrl-C: stop waiting for a graceful shutdown.
            std::process::exit(130);
        }
    });
    if let Err(e) = installed {
        debug!("Ctrl-C handler not installed: {e}");
    }
    servolink::set_interrupt_checker(was_interrupted);
}

fn early_lang(raw_args: &[String]) -> Option<String> {
    let mut lang = None;
    for (i, arg) in raw_args.iter().enumerate() {
        if let Some(val) = arg.strip_prefix("--lang=") {
            lang = Some(val.to_string());
        } else if arg == "--lang" {
            lang = raw_args.get(i + 1).cloned();
        }
    }
    lang
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        if !path.exists() {
            return Err(CliError::Config(
                t!("error.config_missing", path = path.display()).to_string(),
            )
            .into());
        }
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::ListPorts { json } => cmd_list_ports(cli, *json),
        Commands::Ping => cmd_ping(cli, &mut config),
        Commands::Send { command, raw } => cmd_send(cli, &mut config, command, *raw),
        Commands::Move { position } => cmd_move(cli, &mut config, (*position).into()),
        Commands::Status { json } => cmd_status(cli, &mut config, *json),
        Commands::Version => cmd_version(cli, &mut config),
        Commands::Sync {
            actuator_type,
            speed,
            cycles,
        } => {
            if actuator_type.is_some() {
                config.profile.actuator_type = *actuator_type;
            }
            if speed.is_some() {
                config.profile.speed = *speed;
            }
            if cycles.is_some() {
                config.profile.cycles = *cycles;
            }
            cmd_sync(cli, &mut config)
        },
        Commands::Cycle { count, interval_ms } => cmd_cycle(
            cli,
            &mut config,
            *count,
            Duration::from_millis(*interval_ms),
        ),
        Commands::Update {
            firmware,
            block_size,
            yes,
        } => cmd_update(cli, &mut config, firmware, *block_size, *yes),
        Commands::Info { firmware, json } => cmd_info(firmware, *json),
        Commands::Terminal => cmd_terminal(cli, &mut config),
        Commands::ForgetPort => cmd_forget_port(cli, &mut config),
        Commands::Completions { shell, install } => {
            if *install {
                cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(t!("completions.need_shell").to_string())
                })?;
                cmd_completions(shell);
                Ok(())
            }
        },
    }
}

fn main() {
    // Inspect raw args early to support localized --help handling and early --lang
    let raw_args: Vec<String> = env::args().collect();
    let locale = early_lang(&raw_args)
        .or_else(|| env::var("SERVOLINK_LANG").ok())
        .unwrap_or_else(help::detect_locale);
    rust_i18n::set_locale(&locale);

    // NO_COLOR and TTY detection
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let wants_help = raw_args.iter().any(|a| a == "-h" || a == "--help");
    if wants_help || raw_args.len() <= 1 {
        std::process::exit(help::print_localized_help(&raw_args));
    }

    let cli = Cli::parse();
    if let Some(lang) = &cli.lang {
        rust_i18n::set_locale(help::normalize_locale(lang));
    }
    init_logging(&cli);
    debug!(
        "servolink v{} (locale: {locale}, verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );
    install_interrupt_handler();

    if let Err(err) = run(&cli) {
        let code = exit_code_for(&err);
        if code == 130 {
            eprintln!("{} {}", style("⚠").yellow(), t!("error.interrupted"));
        } else {
            eprintln!("{} {err:#}", style(t!("error.prefix")).red().bold());
        }
        std::process::exit(code);
    }
}

/// Attach the exit-code class for a library error returned from a session.
pub(crate) fn classify(err: servolink::Error) -> anyhow::Error {
    let message = err.to_string();
    let class = match library_exit_code(&err) {
        2 => CliError::Usage(message),
        4 => CliError::Connection(message),
        5 => CliError::Device(message),
        6 => CliError::Update(message),
        130 => CliError::Cancelled(message),
        _ => return anyhow::Error::new(err),
    };
    anyhow::Error::new(class)
}

/// Convenience for results coming straight from the library.
pub(crate) trait ClassifyExt<T> {
    fn classified(self) -> Result<T>;
}

impl<T> ClassifyExt<T> for servolink::Result<T> {
    fn classified(self) -> Result<T> {
        self.map_err(classify)
    }
}

/// Context helper used by commands that read files.
pub(crate) fn read_context(path: &std::path::Path) -> String {
    t!("error.read_file", path = path.display()).to_string()
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_move() {
        let cli = Cli::try_parse_from(["servolink", "move", "extend"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Move {
                position: PositionArg::Extend
            }
        ));
        assert_eq!(Position::from(PositionArg::Retract), Position::Retract);
    }

    #[test]
    fn test_cli_parse_send_words() {
        let cli = Cli::try_parse_from(["servolink", "send", "SET_SPEED", "50"]).unwrap();
        match cli.command {
            Commands::Send { command, raw } => {
                assert_eq!(command, vec!["SET_SPEED", "50"]);
                assert!(!raw);
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cli_parse_cycle_default_interval() {
        let cli = Cli::try_parse_from(["servolink", "cycle", "5"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Cycle {
                count: 5,
                interval_ms: 500
            }
        ));
    }

    #[test]
    fn test_cli_parse_update() {
        let cli = Cli::try_parse_from([
            "servolink",
            "update",
            "fw.bin",
            "--block-size",
            "256",
            "-y",
        ])
        .unwrap();
        match cli.command {
            Commands::Update {
                firmware,
                block_size,
                yes,
            } => {
                assert_eq!(firmware, PathBuf::from("fw.bin"));
                assert_eq!(block_size, Some(256));
                assert!(yes);
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cli_global_options() {
        let cli = Cli::try_parse_from([
            "servolink",
            "--port",
            "/dev/rfcomm0",
            "--baud",
            "9600",
            "--timeout-ms",
            "1500",
            "--simulate",
            "-vv",
            "--non-interactive",
            "ping",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/rfcomm0"));
        assert_eq!(cli.baud, Some(9600));
        assert!(cli.simulate);
        assert_eq!(cli.verbose, 2);
        assert!(cli.non_interactive);

        let session = session_config(&cli, &Config::default());
        assert_eq!(session.ack_timeout, Duration::from_millis(1500));
        assert_eq!(session.settle_delay, Duration::ZERO);
    }

    #[test]
    fn test_baud_precedence() {
        let mut config = Config::default();
        let cli = Cli::try_parse_from(["servolink", "ping"]).unwrap();
        assert_eq!(baud_rate(&cli, &config), 115_200);

        config.connection.baud = Some(57_600);
        assert_eq!(baud_rate(&cli, &config), 57_600);

        let cli = Cli::try_parse_from(["servolink", "-b", "9600", "ping"]).unwrap();
        assert_eq!(baud_rate(&cli, &config), 9600);
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["servolink"]).is_err());
    }

    #[test]
    fn test_cli_rejects_unknown_position() {
        assert!(Cli::try_parse_from(["servolink", "move", "sideways"]).is_err());
    }

    #[test]
    fn test_early_lang() {
        let args = |v: &[&str]| v.iter().map(ToString::to_string).collect::<Vec<_>>();
        assert_eq!(
            early_lang(&args(&["servolink", "--lang", "zh-CN", "ping"])).as_deref(),
            Some("zh-CN")
        );
        assert_eq!(
            early_lang(&args(&["servolink", "--lang=en"])).as_deref(),
            Some("en")
        );
        assert_eq!(early_lang(&args(&["servolink", "--lang"])), None);
    }

    #[test]
    fn test_exit_codes() {
        use servolink::Error;
        let code = |e: Error| exit_code_for(&anyhow::Error::new(e));
        assert_eq!(code(Error::Connection("busy".into())), 4);
        assert_eq!(code(Error::ConnectionLost), 4);
        assert_eq!(code(Error::Timeout("ack".into())), 5);
        assert_eq!(code(Error::Rejected("ERR".into())), 5);
        assert_eq!(
            code(Error::Integrity {
                expected: 1,
                actual: Some(2)
            }),
            6
        );
        assert_eq!(code(Error::Cancelled), 130);
        assert_eq!(code(Error::InvalidCommand("x".into())), 2);
        assert_eq!(code(Error::Busy("cycle".into())), 1);

        let wrapped = anyhow::Error::new(CliError::Update("aborted".into())).context("update");
        assert_eq!(exit_code_for(&wrapped), 6);
        assert_eq!(exit_code_for(&classify(Error::Cancelled)), 130);
    }
}
