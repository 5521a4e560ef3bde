//! Command implementations.
//!
//! Each subcommand family lives in its own module; the helpers here are
//! shared by everything that talks to a device.

pub(crate) mod completions;
pub(crate) mod package;
pub(crate) mod update;

use {
    crate::{Cli, CliError, config::Config, serial, use_fancy_output, was_interrupted},
    agflash::{DeviceMode, NativePort, SerialConfig, Updater, port::DEFAULT_BAUD},
    anyhow::{Context, Result},
    console::style,
    indicatif::{ProgressBar, ProgressStyle},
};

pub(crate) fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted by user".to_string()).into())
    } else {
        Ok(())
    }
}

/// Resolve the port and baud rate, open the port and connect.
pub(crate) fn open_session(
    cli: &Cli,
    config: &Config,
    mode: DeviceMode,
) -> Result<Updater<NativePort>> {
    let options = serial::SerialOptions {
        port: cli
            .port
            .clone(),
        non_interactive: cli.non_interactive,
    };
    let port_name = serial::select_serial_port(&options, config)?;
    let baud = cli
        .baud
        .or(config
            .connection
            .baud)
        .unwrap_or(DEFAULT_BAUD);

    if !cli.quiet {
        eprintln!(
            "{} Using {} at {baud} baud (device in {mode} mode)",
            style("🔌").cyan(),
            style(&port_name).green()
        );
    }

    let port = NativePort::open(&SerialConfig::new(&port_name, baud))
        .with_context(|| format!("Failed to open serial port {port_name}"))?;
    ensure_not_interrupted()?;

    let mut updater = Updater::new(port, mode);
    if !cli.quiet && mode == DeviceMode::TgApp {
        eprintln!(
            "{} Waiting for the device to offer an update (power-cycle it if nothing happens)",
            style("⏳").yellow()
        );
    }
    updater
        .connect()
        .context("Failed to connect to the device")?;
    if !cli.quiet {
        eprintln!("{} Connected", style("✓").green());
    }
    Ok(updater)
}

/// Progress bar driven by the library's `(name, sent, total)` callbacks.
pub(crate) struct TransferProgress {
    bar: ProgressBar,
    current: String,
}

impl TransferProgress {
    pub(crate) fn new(quiet: bool) -> Self {
        let bar = if quiet || !use_fancy_output() {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::new(100);
            #[allow(clippy::unwrap_used)] // Static template string
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                    .unwrap()
                    .progress_chars("#>-"),
            );
            bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
            bar
        };
        Self {
            bar,
            current: String::new(),
        }
    }

    pub(crate) fn update(&mut self, name: &str, sent: usize, total: usize) {
        if name != self.current {
            self.current = name.to_string();
            self.bar
                .set_message(format!("Writing {name}"));
        }
        if total > 0 {
            self.bar
                .set_position((sent * 100 / total) as u64);
        }
    }

    pub(crate) fn finish(&self) {
        self.bar
            .finish_with_message("Complete");
    }

    /// Shared handle, for suspending the bar around prompts.
    pub(crate) fn handle(&self) -> ProgressBar {
        self.bar
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_tracks_current_image() {
        let mut progress = TransferProgress::new(true);
        progress.update("lbb_mcu_4011.bin", 0, 1000);
        progress.update("lbb_mcu_4011.bin", 500, 1000);
        assert_eq!(progress.current, "lbb_mcu_4011.bin");
        assert_eq!(
            progress
                .bar
                .position(),
            50
        );

        progress.update("lbb_mcu_bootloader_4011.bin", 0, 0);
        assert_eq!(progress.current, "lbb_mcu_bootloader_4011.bin");
        progress.finish();
    }
}
