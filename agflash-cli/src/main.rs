//! agflash CLI - Command-line tool for updating Asset Gateway firmware.
//!
//! ## Features
//!
//! - MCU bootloader/application updates with dependency checks
//! - SMT simulation (factory and TG images staged side by side)
//! - BLE radio and sensor DFU packages
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use {
    agflash::{DeviceMode, NativePortEnumerator, PortEnumerator},
    anyhow::Result,
    clap::{Parser, Subcommand},
    clap_complete::Shell,
    console::style,
    env_logger::Env,
    log::{debug, warn},
    std::{
        env,
        path::PathBuf,
        process::ExitCode,
        sync::atomic::{AtomicBool, Ordering},
    },
};

mod commands;
mod config;
mod serial;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Failures that map to a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or environment (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// The user stopped the operation (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled(_) => 130,
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(cli_err) = cause.downcast_ref::<CliError>() {
            return cli_err.exit_code();
        }
        if let Some(agflash::Error::Interrupted | agflash::Error::Cancelled(_)) =
            cause.downcast_ref::<agflash::Error>()
        {
            return 130;
        }
    }
    if was_interrupted() { 130 } else { 1 }
}

/// agflash - Firmware update tool for Asset Gateway devices.
///
/// Environment variables:
///   AGFLASH_PORT              - Default serial port
///   AGFLASH_BAUD              - Default baud rate (default: 115200)
///   AGFLASH_MODE              - Device mode (FACT or TG_APP)
///   AGFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "agflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "AGFLASH_PORT")]
    port: Option<String>,

    /// Baud rate of the device console [default: 115200].
    #[arg(long, global = true, env = "AGFLASH_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "AGFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Install an MCU bootloader and/or application image.
    #[command(alias = "FW_UPDATE")]
    FwUpdate {
        /// Mode the device is currently running.
        #[arg(short, long, env = "AGFLASH_MODE", value_parser = parse_mode)]
        mode: Option<DeviceMode>,

        /// Firmware images (.bin), at most one bootloader and one application.
        #[arg(short, long = "file", num_args = 1..=2, required = true, value_name = "BIN")]
        files: Vec<PathBuf>,
    },

    /// Stage the factory and TG images on a device in factory mode.
    #[command(alias = "SMT_SIMULATE")]
    SmtSimulate {
        /// Factory and TG application images, in that order.
        #[arg(
            short,
            long,
            num_args = 2,
            required = true,
            value_names = ["FACTORY", "TG_APP"]
        )]
        bin: Vec<PathBuf>,

        /// Expected checksums (hex), in the same order as --bin.
        #[arg(
            short,
            long,
            num_args = 2,
            required = true,
            value_parser = parse_hex_u64,
            value_names = ["FACTORY", "TG_APP"]
        )]
        checksum: Vec<u64>,
    },

    /// Stage a BLE DFU package and start the radio update.
    BleUpdate {
        /// DFU package (.zip).
        #[arg(long)]
        package: PathBuf,

        /// Second package, installed on every other run.
        #[arg(long, value_name = "ZIP")]
        package2: Option<PathBuf>,

        /// Extra runs after the first, alternating with --package2.
        #[arg(short, long, default_value_t = 0, value_name = "N")]
        repeat: u32,

        /// Mode the device is currently running.
        #[arg(short, long, value_parser = parse_mode, default_value = "FACT")]
        mode: DeviceMode,
    },

    /// Stage a sensor firmware package.
    SensorUpdate {
        /// Sensor package (.zip).
        #[arg(long)]
        package: PathBuf,

        /// Start the transfer to the sensor once staged.
        #[arg(long)]
        start_transfer: bool,

        /// Mode the device is currently running.
        #[arg(short, long, value_parser = parse_mode, default_value = "FACT")]
        mode: DeviceMode,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn parse_mode(s: &str) -> Result<DeviceMode, String> {
    s.parse()
}

/// Parse a hexadecimal value (supports 0x prefix and underscores).
fn parse_hex_u64(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    let s: String = s
        .chars()
        .filter(|c| *c != '_')
        .collect();
    u64::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex value: {e}"))
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

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

    debug!(
        "agflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        warn!("Failed to install Ctrl-C handler: {e}");
    }
    agflash::set_interrupt_checker(was_interrupted);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::FwUpdate { mode, files } => {
            let mode = mode
                .or_else(|| {
                    config
                        .update
                        .device_mode()
                })
                .unwrap_or(DeviceMode::TgApp);
            commands::update::cmd_fw_update(cli, &config, mode, files)?;
        },
        Commands::SmtSimulate { bin, checksum } => {
            commands::update::cmd_smt_simulate(cli, &config, bin, checksum)?;
        },
        Commands::BleUpdate {
            package,
            package2,
            repeat,
            mode,
        } => {
            commands::package::cmd_ble_update(
                cli,
                &config,
                *mode,
                package,
                package2.as_deref(),
                *repeat,
            )?;
        },
        Commands::SensorUpdate {
            package,
            start_transfer,
            mode,
        } => {
            commands::package::cmd_sensor_update(
                cli,
                &config,
                *mode,
                package,
                *start_transfer,
            )?;
        },
        Commands::ListPorts { json } => cmd_list_ports(*json),
        Commands::Completions { shell } => commands::completions::cmd_completions(*shell),
    }

    Ok(())
}

/// List ports command implementation.
fn cmd_list_ports(json: bool) {
    let ports = NativePortEnumerator::list_ports().unwrap_or_else(|e| {
        warn!("Failed to enumerate serial ports: {e}");
        Vec::new()
    });

    if json {
        let ports: Vec<serde_json::Value> = ports
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&ports).unwrap_or_default()
        );
        return;
    }

    eprintln!("{}", style("Available serial ports:").bold().underlined());
    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return;
    }
    for port in &ports {
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();
        eprintln!(
            "  {} {}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan()
        );
    }
}
