//! ncpboot CLI - load EBL images into Silicon Labs bootloaders over a serial link.
//!
//! ## Features
//!
//! - Xmodem-CRC upload to standalone and NCP serial bootloaders
//! - BGAPI UART DFU upload
//! - Offline EBL inspection and validation (`info`)
//! - Serial port discovery for kit VCOM, CP210x and FTDI adapters
//! - Shell completion generation
//! - Environment variable and TOML config file support

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use ncpboot::TransferProtocol;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;

use config::{Config, FlowControlSetting};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// CLI-level failures, classified for exit codes.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad or missing arguments.
    #[error("{0}")]
    Usage(String),
    /// Unusable configuration.
    #[error("{0}")]
    Config(String),
    /// Stopped by the user.
    #[error("{0}")]
    Cancelled(String),
}

/// Exit code for a failed run: 130 when cancelled by the user, 1 otherwise.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    let cancelled = err
        .chain()
        .any(|cause| {
            matches!(
                cause.downcast_ref::<CliError>(),
                Some(CliError::Cancelled(_))
            ) || matches!(
                cause.downcast_ref::<ncpboot::Error>(),
                Some(ncpboot::Error::Interrupted)
            )
        });
    if cancelled { 130 } else { 1 }
}

/// ncpboot - serial bootloader client for Silicon Labs EFM32/EFR32 parts.
///
/// Loads LENGTH bytes of IMAGE starting at OFFSET into the device bootloader.
///
/// Environment variables:
///   NCPBOOT_PORT   - Default serial port
///   NCPBOOT_BAUD   - Default baud rate (default: 115200)
#[derive(Parser)]
#[command(name = "ncpboot")]
#[command(author, version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
#[command(subcommand_negates_reqs = true)]
#[command(after_help = "Examples:\n  \
    ncpboot -p /dev/ttyACM0 app.ebl 0 0xFFFFFFFF\n  \
    ncpboot --menu --protocol xmodem app.ebl 0x100 4096\n  \
    ncpboot info --json app.ebl")]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// EBL image file to load.
    #[arg(required = true)]
    image: Option<PathBuf>,

    /// Byte offset into IMAGE (decimal or 0x hex).
    #[arg(required = true, value_parser = parse_number)]
    offset: Option<u32>,

    /// Bytes to send; 0xFFFFFFFF sends through the end of the file.
    #[arg(required = true, value_parser = parse_number)]
    length: Option<u32>,

    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, env = "NCPBOOT_PORT")]
    port: Option<String>,

    /// Baud rate [default: 115200].
    #[arg(short, long, env = "NCPBOOT_BAUD")]
    baud: Option<u32>,

    /// Serial flow control [default: none].
    #[arg(long, value_enum)]
    flow_control: Option<FlowControlSetting>,

    /// Send the first Xmodem block without waiting for the receiver's 'C'.
    #[arg(long)]
    start_immediately: bool,

    /// Drive the standalone bootloader's text menu to start and reboot.
    #[arg(long)]
    menu: bool,

    /// Transfer protocol [default: xmodem].
    #[arg(long, value_enum)]
    protocol: Option<ProtocolArg>,

    /// Xmodem transmissions per block before giving up.
    #[arg(long)]
    retries: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Transfer protocols selectable on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ProtocolArg {
    /// Xmodem-CRC (standalone and NCP bootloaders).
    Xmodem,
    /// BGAPI UART DFU.
    Bgapi,
}

impl From<ProtocolArg> for TransferProtocol {
    fn from(protocol: ProtocolArg) -> Self {
        match protocol {
            ProtocolArg::Xmodem => Self::Xmodem,
            ProtocolArg::Bgapi => Self::Bgapi,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Inspect an EBL image and check it against a simulated flash.
    Info {
        /// EBL image file.
        image: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,

        /// Flash page size of the target.
        #[arg(long, default_value = "0x800", value_parser = parse_number)]
        page_size: u32,

        /// Bootloader size; the application starts here.
        #[arg(long, default_value = "0x4000", value_parser = parse_number)]
        bootloader_size: u32,

        /// Total flash size of the target.
        #[arg(long, default_value = "0x40000", value_parser = parse_number)]
        flash_size: u32,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell to generate completions for.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse a decimal or `0x`-prefixed hexadecimal number (underscores allowed).
fn parse_number(s: &str) -> Result<u32, String> {
    let s: String = s
        .trim()
        .chars()
        .filter(|c| *c != '_')
        .collect();
    let parsed = match s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    parsed.map_err(|e| format!("Invalid number '{s}': {e}"))
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
    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Ctrl-C handler not installed: {e}");
    }
    ncpboot::set_interrupt_checker(was_interrupted);
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            let code = match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            std::process::exit(code);
        },
    };

    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if std::env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    init_logging(&cli);
    debug!(
        "ncpboot v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );
    install_interrupt_handler();

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code_for(&err));
    }
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Some(Commands::Info {
            image,
            json,
            page_size,
            bootloader_size,
            flash_size,
        }) => {
            let geometry = commands::info::Geometry {
                page_size: *page_size,
                bootloader_size: *bootloader_size,
                flash_size: *flash_size,
            };
            commands::info::cmd_info(image, &geometry, *json)
        },
        Some(Commands::ListPorts { json }) => commands::info::cmd_list_ports(*json),
        Some(Commands::Completions { shell }) => {
            commands::completions::cmd_completions(*shell).context("Failed to write completions")
        },
        None => {
            let config = match &cli.config_path {
                Some(path) => Config::load_from_path(path)?,
                None => Config::load(),
            };
            let request = commands::load::LoadRequest::resolve(cli, &config)?;
            commands::load::cmd_load(&request, cli.quiet)
        },
    }
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
    fn test_cli_parse_load() {
        let cli = Cli::try_parse_from(["ncpboot", "app.ebl", "0x100", "4096"]).unwrap();
        assert_eq!(cli.image, Some(PathBuf::from("app.ebl")));
        assert_eq!(cli.offset, Some(0x100));
        assert_eq!(cli.length, Some(4096));
        assert!(cli.command.is_none());
        assert!(cli.protocol.is_none());
        assert!(!cli.menu);
    }

    #[test]
    fn test_cli_parse_load_with_options() {
        let cli = Cli::try_parse_from([
            "ncpboot",
            "-p",
            "/dev/ttyACM0",
            "-b",
            "230400",
            "--flow-control",
            "hardware",
            "--protocol",
            "bgapi",
            "--menu",
            "--start-immediately",
            "--retries",
            "3",
            "app.ebl",
            "0",
            "0xFFFFFFFF",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(cli.baud, Some(230400));
        assert_eq!(cli.flow_control, Some(FlowControlSetting::Hardware));
        assert_eq!(cli.protocol, Some(ProtocolArg::Bgapi));
        assert!(cli.menu);
        assert!(cli.start_immediately);
        assert_eq!(cli.retries, Some(3));
        assert_eq!(cli.length, Some(ncpboot::WHOLE_FILE));
    }

    #[test]
    fn test_cli_missing_length_is_error() {
        assert!(Cli::try_parse_from(["ncpboot", "app.ebl", "0"]).is_err());
        assert!(Cli::try_parse_from(["ncpboot"]).is_err());
    }

    #[test]
    fn test_cli_parse_info() {
        let cli = Cli::try_parse_from(["ncpboot", "info", "--json", "--page-size", "1024", "app.ebl"])
            .unwrap();
        match cli.command {
            Some(Commands::Info {
                image,
                json,
                page_size,
                bootloader_size,
                flash_size,
            }) => {
                assert_eq!(image, PathBuf::from("app.ebl"));
                assert!(json);
                assert_eq!(page_size, 1024);
                assert_eq!(bootloader_size, 0x4000);
                assert_eq!(flash_size, 0x40000);
            },
            _ => panic!("expected info"),
        }
    }

    #[test]
    fn test_cli_parse_list_ports_json() {
        let cli = Cli::try_parse_from(["ncpboot", "list-ports", "--json"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::ListPorts { json: true })
        ));
    }

    #[test]
    fn test_cli_parse_completions() {
        let cli = Cli::try_parse_from(["ncpboot", "completions", "zsh"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Completions { shell: Shell::Zsh })
        ));
    }

    #[test]
    fn test_cli_global_options() {
        let cli = Cli::try_parse_from(["ncpboot", "-vv", "-q", "app.ebl", "0", "10"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.quiet);
    }

    #[test]
    fn test_cli_invalid_protocol() {
        assert!(Cli::try_parse_from(["ncpboot", "--protocol", "ymodem", "a.ebl", "0", "1"]).is_err());
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("0"), Ok(0));
        assert_eq!(parse_number("4096"), Ok(4096));
        assert_eq!(parse_number("0x1000"), Ok(0x1000));
        assert_eq!(parse_number("0XFFFFFFFF"), Ok(0xFFFF_FFFF));
        assert_eq!(parse_number(" 0x00_40_00 "), Ok(0x4000));
        assert!(parse_number("0x1_0000_0000").is_err());
        assert!(parse_number("12ab").is_err());
        assert!(parse_number("").is_err());
    }

    #[test]
    fn test_exit_code_for() {
        let cancelled: anyhow::Error = CliError::Cancelled("stop".into()).into();
        assert_eq!(exit_code_for(&cancelled), 130);

        let interrupted = anyhow::Error::from(ncpboot::Error::Interrupted).context("Bootload failed");
        assert_eq!(exit_code_for(&interrupted), 130);

        let usage: anyhow::Error = CliError::Usage("bad".into()).into();
        assert_eq!(exit_code_for(&usage), 1);
        assert_eq!(exit_code_for(&anyhow::anyhow!("other")), 1);
    }
}
