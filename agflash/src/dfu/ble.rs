//! BLE radio and sensor DFU packages.
//!
//! Both are staged through the MCU into a dedicated external-flash window,
//! then handed to the radio (`BLE_DFU`) or the sensor (`XFER_SENSOR`).

use {
    crate::{
        dfu::engine::{TransferEngine, TransferProfile},
        error::{Error, Result},
        image::package::{BlePackage, DfuComponentKind, SensorPackage},
        port::Port,
        protocol::{
            checksum::checksum,
            command::{Command, module, verb},
            link::CommandLink,
        },
    },
    log::info,
    serde_json::Value,
    std::time::Duration,
};

/// Init packet and firmware offsets of one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingOffsets {
    /// Offset of the init packet.
    pub init_packet: u32,
    /// Offset of the firmware image.
    pub firmware: u32,
}

/// External-flash window used for BLE radio packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BleLayout {
    /// Raw region id.
    pub exmem_region: u32,
    /// First sector erased before staging.
    pub erase_base: u32,
    /// Number of sectors erased.
    pub erase_sectors: u32,
    /// Bootloader component.
    pub bootloader: StagingOffsets,
    /// SoftDevice component.
    pub softdevice: StagingOffsets,
    /// Application component.
    pub application: StagingOffsets,
}

impl Default for BleLayout {
    fn default() -> Self {
        Self {
            exmem_region: 0xFF01,
            // Starts at the bootloader init packet, not at 0x2A8000.
            erase_base: 0x2A_0000,
            erase_sectors: 352,
            bootloader: StagingOffsets {
                init_packet: 0x2A_0000,
                firmware: 0x2A_0400,
            },
            softdevice: StagingOffsets {
                init_packet: 0x2A_7000,
                firmware: 0x2A_7400,
            },
            application: StagingOffsets {
                init_packet: 0x2C_D000,
                firmware: 0x2C_D400,
            },
        }
    }
}

impl BleLayout {
    /// Offsets of `kind`.
    pub fn offsets(&self, kind: DfuComponentKind) -> StagingOffsets {
        match kind {
            DfuComponentKind::Bootloader => self.bootloader,
            DfuComponentKind::SoftDevice => self.softdevice,
            DfuComponentKind::Application => self.application,
        }
    }
}

/// External-flash window used for sensor packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorLayout {
    /// Raw region id.
    pub exmem_region: u32,
    /// First sector erased before staging.
    pub erase_base: u32,
    /// Number of sectors erased (info sector plus image).
    pub erase_sectors: u32,
    /// Manifest and image offsets.
    pub offsets: StagingOffsets,
}

impl Default for SensorLayout {
    fn default() -> Self {
        Self {
            exmem_region: 0xFF01,
            erase_base: 0x21_0000,
            erase_sectors: 129,
            offsets: StagingOffsets {
                init_packet: 0x21_0000,
                firmware: 0x21_1000,
            },
        }
    }
}

fn dfu_info_command(
    kind: DfuComponentKind,
    init_packet: &[u8],
    firmware: &[u8],
    region: u32,
    offsets: StagingOffsets,
    profile: &TransferProfile,
) -> Command {
    let style = profile.hex_style;
    Command::new(module::FW_UPDATE, verb::WR_BLE_DFU_INFO)
        .arg(kind.tag())
        .arg(init_packet.len())
        .hex(checksum(init_packet), style)
        .hex(u64::from(region), style)
        .hex(u64::from(offsets.init_packet), style)
        .arg(firmware.len())
        .hex(checksum(firmware), style)
        .hex(u64::from(region), style)
        .hex(u64::from(offsets.firmware), style)
}

/// Read the radio's software version (`FW_VER` of `BLE GET_SW_VER`).
pub fn query_ble_version<P: Port>(link: &mut CommandLink<P>, timeout: Duration) -> Result<String> {
    let command = Command::ble_version();
    let reply = link.execute(&command, timeout)?;
    match &reply.msg["FW_VER"] {
        Value::String(version) => Ok(version.clone()),
        Value::Number(version) => Ok(version.to_string()),
        _ => Err(Error::MalformedResponse {
            command: command.to_string(),
            raw: reply
                .msg
                .to_string(),
        }),
    }
}

/// Stage a BLE package and start the radio DFU.
///
/// `progress` receives `(label, bytes_sent, total)` for every file sent.
pub fn update_ble<P: Port>(
    link: &mut CommandLink<P>,
    package: &BlePackage,
    profile: &TransferProfile,
    layout: &BleLayout,
    progress: &mut dyn FnMut(&str, usize, usize),
) -> Result<()> {
    let mut engine = TransferEngine::new(link, profile);
    engine.erase(layout.erase_base, window_len(layout.erase_sectors, profile))?;

    for component in package.components() {
        let offsets = layout.offsets(component.kind);
        info!(
            "Staging {} ({} + {} bytes)",
            component.kind,
            component
                .init_packet
                .len(),
            component
                .firmware
                .len()
        );
        engine.announce_with(&dfu_info_command(
            component.kind,
            &component.init_packet,
            &component.firmware,
            layout.exmem_region,
            offsets,
            profile,
        ))?;

        let init_label = format!("{} init packet", component.kind);
        engine.send_chunks(&component.init_packet, offsets.init_packet, &mut |sent, total| {
            progress(&init_label, sent, total);
        })?;
        let label = component
            .kind
            .to_string();
        engine.send_chunks(&component.firmware, offsets.firmware, &mut |sent, total| {
            progress(&label, sent, total);
        })?;
    }

    info!("Starting BLE DFU; the radio reboots");
    engine.start(verb::BLE_DFU, profile.activation_delay)
}

/// Stage a sensor package and optionally start the sensor transfer.
pub fn update_sensor<P: Port>(
    link: &mut CommandLink<P>,
    package: &SensorPackage,
    profile: &TransferProfile,
    layout: &SensorLayout,
    start_transfer: bool,
    progress: &mut dyn FnMut(&str, usize, usize),
) -> Result<()> {
    let mut engine = TransferEngine::new(link, profile);
    engine.erase(layout.erase_base, window_len(layout.erase_sectors, profile))?;

    engine.announce_with(&dfu_info_command(
        DfuComponentKind::Application,
        &package.manifest,
        &package.firmware,
        layout.exmem_region,
        layout.offsets,
        profile,
    ))?;
    engine.send_chunks(&package.manifest, layout.offsets.init_packet, &mut |sent, total| {
        progress("manifest", sent, total);
    })?;
    engine.send_chunks(&package.firmware, layout.offsets.firmware, &mut |sent, total| {
        progress("sensor", sent, total);
    })?;

    if start_transfer {
        info!("Starting sensor transfer");
        engine.start(verb::XFER_SENSOR, Duration::ZERO)?;
    }
    Ok(())
}

fn window_len(sectors: u32, profile: &TransferProfile) -> usize {
    sectors as usize * profile.sector_size as usize
}
