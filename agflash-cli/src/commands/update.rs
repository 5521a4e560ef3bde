//! MCU firmware update and SMT simulation commands.

use {
    super::{TransferProgress, ensure_not_interrupted, open_session},
    crate::{Cli, config::Config, serial},
    agflash::{BinaryImage, DeviceMode, UpdateRequest},
    anyhow::{Context, Result},
    console::style,
    dialoguer::{Confirm, theme::ColorfulTheme},
    log::{error, warn},
    std::path::{Path, PathBuf},
};

fn load_image(path: &Path) -> Result<BinaryImage> {
    BinaryImage::from_file(path)
        .with_context(|| format!("Failed to load firmware image {}", path.display()))
}

/// Ask before a bootloader commit. Non-interactive runs always refuse.
fn confirm_bootloader(warning: &str, non_interactive: bool) -> bool {
    eprintln!("{} {warning}", style("⚠").yellow().bold());
    if non_interactive {
        error!("Refusing to commit a bootloader without confirmation in non-interactive mode");
        return false;
    }
    if let Err(e) = serial::ensure_interactive_terminal() {
        error!("{e}");
        return false;
    }

    match Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Install the new bootloader now?")
        .default(false)
        .interact_opt()
    {
        Ok(answer) => answer.unwrap_or(false),
        Err(e) => {
            warn!("Confirmation prompt failed: {e}");
            false
        },
    }
}

/// `fw-update`: install one or two MCU images.
pub(crate) fn cmd_fw_update(
    cli: &Cli,
    config: &Config,
    mode: DeviceMode,
    files: &[PathBuf],
) -> Result<()> {
    let images = files
        .iter()
        .map(|path| load_image(path))
        .collect::<Result<Vec<_>>>()?;

    if !cli.quiet {
        eprintln!("{} Firmware to install:", style("📦").cyan());
        for image in &images {
            eprintln!("    {} {image}", style("•").dim());
        }
    }

    let request = UpdateRequest::from_images(images)?;
    if request
        .bootloader()
        .is_some()
        && !cli.quiet
    {
        eprintln!(
            "{} This update replaces the bootloader",
            style("⚠").yellow()
        );
    }

    let mut updater = open_session(cli, config, mode)?;
    ensure_not_interrupted()?;

    let mut progress = TransferProgress::new(cli.quiet);
    let bar = progress.handle();
    let non_interactive = cli.non_interactive;
    let result = updater.update(
        request,
        &mut |warning| bar.suspend(|| confirm_bootloader(warning, non_interactive)),
        &mut |name, sent, total| progress.update(name, sent, total),
    );

    if let Err(e) = updater.close() {
        warn!("Failed to close port: {e}");
    }
    result?;
    progress.finish();

    if !cli.quiet {
        eprintln!(
            "\n{} Firmware update completed",
            style("🎉").green().bold()
        );
    }
    Ok(())
}

/// `smt-simulate`: stage factory and TG images with expected checksums.
pub(crate) fn cmd_smt_simulate(
    cli: &Cli,
    config: &Config,
    bins: &[PathBuf],
    checksums: &[u64],
) -> Result<()> {
    let images = bins
        .iter()
        .zip(checksums)
        .map(|(path, cks)| load_image(path).map(|image| (image, *cks)))
        .collect::<Result<Vec<_>>>()?;

    if !cli.quiet {
        eprintln!("{} SMT images:", style("📦").cyan());
        for (image, cks) in &images {
            eprintln!(
                "    {} {image} checksum {cks:#x}",
                style("•").dim()
            );
        }
    }

    let mut updater = open_session(cli, config, DeviceMode::Factory)?;
    ensure_not_interrupted()?;

    let mut progress = TransferProgress::new(cli.quiet);
    let result = updater.smt_simulate(images, &mut |name, sent, total| {
        progress.update(name, sent, total);
    });

    if let Err(e) = updater.close() {
        warn!("Failed to close port: {e}");
    }
    result?;
    progress.finish();

    if !cli.quiet {
        eprintln!(
            "\n{} SMT images staged and verified",
            style("🎉").green().bold()
        );
    }
    Ok(())
}
