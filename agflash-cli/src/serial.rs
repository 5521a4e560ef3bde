//! Serial port resolution.
//!
//! The port comes from, in order: `--port`/`AGFLASH_PORT`, the config file,
//! or the ports the system reports. With several candidates the user picks
//! one interactively; non-interactive runs must resolve to exactly one.

use {
    crate::{CliError, config::Config},
    agflash::{NativePortEnumerator, PortEnumerator, PortInfo},
    anyhow::{Context, Result},
    console::style,
    dialoguer::{Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, info},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI or environment.
    pub port: Option<String>,
    /// Non-interactive mode (fail if the choice is ambiguous).
    pub non_interactive: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Resolve the serial port to use.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<String> {
    if let Some(port_name) = &options.port {
        return Ok(port_name.clone());
    }

    if let Some(port_name) = &config
        .connection
        .port
    {
        debug!("Using port from config: {port_name}");
        return Ok(port_name.clone());
    }

    let mut ports = NativePortEnumerator::list_ports().context("Failed to list serial ports")?;
    if ports.is_empty() {
        return Err(usage_err(
            "No serial ports found. Connect the device or pass --port",
        ));
    }
    // USB bridges first; the device console is never a built-in UART.
    ports.sort_by_key(|p| p.vid.is_none());

    if options.non_interactive {
        return select_non_interactive_port(ports);
    }

    match ports
        .len()
        .cmp(&1)
    {
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(ports)
        },
        Ordering::Equal => {
            let port = ports.swap_remove(0);
            info!("Auto-selected port: {}", port.name);
            Ok(port.name)
        },
        Ordering::Less => Err(usage_err("No serial ports available")),
    }
}

fn select_non_interactive_port(mut ports: Vec<PortInfo>) -> Result<String> {
    match ports
        .len()
        .cmp(&1)
    {
        Ordering::Equal => Ok(ports
            .swap_remove(0)
            .name),
        Ordering::Greater => Err(usage_err(
            "Found multiple serial ports; pass --port in non-interactive mode",
        )),
        Ordering::Less => Err(usage_err("No serial ports available")),
    }
}

/// Fail with a usage error unless both stdin and stderr are terminals.
pub fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Interactive prompt requires a terminal; use --port or --non-interactive",
        ))
    }
}

/// Map a dialoguer failure onto the CLI error classes.
pub fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Prompt cancelled".to_string()).into()
            } else {
                usage_err(&format!("Prompt failed: {io_err}"))
            }
        },
    }
}

fn port_label(port: &PortInfo) -> String {
    let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };
    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();
    format!("{}{vid_pid}{product}", port.name)
}

fn select_port_interactive(mut ports: Vec<PortInfo>) -> Result<String> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    let term_width = console::Term::stderr()
        .size()
        .1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| console::truncate_str(&port_label(p), max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the device serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) if index < ports.len() => Ok(ports
            .swap_remove(index)
            .name),
        Some(index) => Err(anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("Port selection cancelled".to_string()).into()),
    }
}
