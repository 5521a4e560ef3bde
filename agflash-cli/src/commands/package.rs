//! BLE radio and sensor package commands.

use {
    super::{TransferProgress, ensure_not_interrupted, open_session},
    crate::{Cli, CliError, config::Config},
    agflash::{BlePackage, DeviceMode, SensorPackage},
    anyhow::{Context, Result},
    console::style,
    log::warn,
    std::path::Path,
};

fn load_ble_package(path: &Path) -> Result<BlePackage> {
    BlePackage::from_file(path)
        .with_context(|| format!("Failed to load BLE package {}", path.display()))
}

fn print_ble_package(path: &Path, package: &BlePackage) {
    eprintln!("{} BLE package {}", style("📦").cyan(), path.display());
    for component in package.components() {
        eprintln!(
            "    {} {} ({} + {} bytes)",
            style("•").dim(),
            component.kind,
            component
                .init_packet
                .len(),
            component
                .firmware
                .len()
        );
    }
}

/// Check the repeat options before touching any file or port.
fn check_repeat(repeat: u32, package2: Option<&Path>) -> Result<()> {
    if repeat > 0 && package2.is_none() {
        return Err(CliError::Usage(
            "--repeat needs --package2 to alternate with".to_string(),
        )
        .into());
    }
    if repeat == 0 && package2.is_some() {
        warn!("--package2 is only used with --repeat");
    }
    Ok(())
}

/// `ble-update`: stage a BLE DFU package and start the radio update,
/// optionally repeating it with a second package in alternation.
pub(crate) fn cmd_ble_update(
    cli: &Cli,
    config: &Config,
    mode: DeviceMode,
    package_path: &Path,
    package2_path: Option<&Path>,
    repeat: u32,
) -> Result<()> {
    check_repeat(repeat, package2_path)?;
    let package = load_ble_package(package_path)?;
    let second = if repeat > 0 {
        package2_path
            .map(load_ble_package)
            .transpose()?
    } else {
        None
    };

    if !cli.quiet {
        print_ble_package(package_path, &package);
        if let (Some(path), Some(second)) = (package2_path, &second) {
            print_ble_package(path, second);
            eprintln!(
                "{} {} runs, alternating packages",
                style("🔁").cyan(),
                repeat + 1
            );
        }
    }

    let mut updater = open_session(cli, config, mode)?;
    ensure_not_interrupted()?;

    let mut progress = TransferProgress::new(cli.quiet);
    let result = updater.update_ble_alternating(
        &package,
        second.as_ref(),
        repeat,
        &mut |name, sent, total| progress.update(name, sent, total),
    );
    if let Err(e) = updater.close() {
        warn!("Failed to close port: {e}");
    }
    let report = result?;
    progress.finish();

    if !cli.quiet {
        let unknown = "unknown";
        eprintln!(
            "\n{} BLE firmware before: {}",
            style("ℹ").cyan(),
            report
                .before
                .as_deref()
                .unwrap_or(unknown)
        );
        for (run, version) in report
            .after
            .iter()
            .enumerate()
        {
            eprintln!(
                "{} BLE firmware after run {}: {}",
                style("ℹ").cyan(),
                run + 1,
                version
                    .as_deref()
                    .unwrap_or(unknown)
            );
        }
        eprintln!(
            "\n{} BLE update complete",
            style("🎉").green().bold()
        );
    }
    Ok(())
}

/// `sensor-update`: stage a sensor package, optionally starting the transfer.
pub(crate) fn cmd_sensor_update(
    cli: &Cli,
    config: &Config,
    mode: DeviceMode,
    package_path: &Path,
    start_transfer: bool,
) -> Result<()> {
    let package = SensorPackage::from_file(package_path)
        .with_context(|| format!("Failed to load sensor package {}", package_path.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} Sensor package {} ({} + {} bytes)",
            style("📦").cyan(),
            package_path.display(),
            package
                .manifest
                .len(),
            package
                .firmware
                .len()
        );
    }

    let mut updater = open_session(cli, config, mode)?;
    ensure_not_interrupted()?;

    let mut progress = TransferProgress::new(cli.quiet);
    let result = updater.update_sensor(&package, start_transfer, &mut |name, sent, total| {
        progress.update(name, sent, total);
    });
    if let Err(e) = updater.close() {
        warn!("Failed to close port: {e}");
    }
    result?;
    progress.finish();

    if !cli.quiet {
        let outcome = if start_transfer {
            "staged and transfer started"
        } else {
            "staged"
        };
        eprintln!(
            "\n{} Sensor firmware {outcome}",
            style("🎉").green().bold()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_requires_second_package() {
        let err = check_repeat(2, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
        assert!(format!("{err}").contains("--package2"));
    }

    #[test]
    fn test_repeat_options_accepted() {
        assert!(check_repeat(0, None).is_ok());
        assert!(check_repeat(3, Some(Path::new("b.zip"))).is_ok());
        assert!(check_repeat(0, Some(Path::new("b.zip"))).is_ok());
    }
}
