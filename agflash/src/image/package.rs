//! DFU packages for the BLE radio and the sensor module.
//!
//! Both are zip archives carrying a `manifest.json`. BLE packages follow the
//! nRF layout, one init packet (`.dat`) and one binary per component:
//!
//! ```json
//! { "manifest": { "application": { "dat_file": "app.dat", "bin_file": "app.bin" } } }
//! ```
//!
//! Sensor packages list a single application file; the manifest itself is
//! sent to the device as the init packet:
//!
//! ```json
//! { "files": [ { "file": "sensor.bin", "type": "application", "size": 1234 } ] }
//! ```

use {
    crate::error::{Error, Result},
    log::debug,
    serde::Deserialize,
    std::{
        fmt, fs,
        io::{Cursor, Read},
        path::Path,
    },
    zip::ZipArchive,
};

/// Manifest entry name inside a package.
pub const MANIFEST_NAME: &str = "manifest.json";

/// Largest BLE init packet.
pub const MAX_INIT_PACKET_SIZE: usize = 512;

/// Largest sensor manifest (it occupies one 4 KiB init sector).
pub const MAX_SENSOR_MANIFEST_SIZE: usize = 4 * 1024;

/// Largest sensor application image.
pub const MAX_SENSOR_IMAGE_SIZE: usize = 512 * 1024;

/// Component of a BLE DFU package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuComponentKind {
    /// Radio bootloader.
    Bootloader,
    /// Radio protocol stack.
    SoftDevice,
    /// Radio application.
    Application,
}

impl DfuComponentKind {
    /// Tag used in the announce command.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Bootloader => "BL",
            Self::SoftDevice => "SD",
            Self::Application => "APP",
        }
    }

    /// Largest binary of this component.
    pub fn max_size(self) -> usize {
        match self {
            Self::Bootloader => 24 * 1024,
            Self::SoftDevice => 148 * 1024,
            Self::Application => 864 * 1024,
        }
    }
}

impl fmt::Display for DfuComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bootloader => write!(f, "bootloader"),
            Self::SoftDevice => write!(f, "softdevice"),
            Self::Application => write!(f, "application"),
        }
    }
}

/// Init packet and binary of one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuComponent {
    /// Component kind.
    pub kind: DfuComponentKind,
    /// Init packet (`.dat`).
    pub init_packet: Vec<u8>,
    /// Firmware binary.
    pub firmware: Vec<u8>,
}

/// A validated BLE DFU package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlePackage {
    components: Vec<DfuComponent>,
}

#[derive(Deserialize)]
struct BleManifestRoot {
    manifest: BleManifest,
}

#[derive(Deserialize)]
struct BleManifest {
    bootloader: Option<BleManifestEntry>,
    softdevice: Option<BleManifestEntry>,
    application: Option<BleManifestEntry>,
}

#[derive(Deserialize)]
struct BleManifestEntry {
    dat_file: String,
    bin_file: String,
}

impl BlePackage {
    /// Load a package from a zip file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(&fs::read(path)?)
    }

    /// Load a package from zip bytes.
    pub fn from_bytes(zip_bytes: &[u8]) -> Result<Self> {
        let mut archive = open_archive(zip_bytes)?;
        let manifest = read_entry(&mut archive, MANIFEST_NAME)?;
        let root: BleManifestRoot = serde_json::from_slice(&manifest)
            .map_err(|e| Error::InvalidPackage(format!("{MANIFEST_NAME}: {e}")))?;

        let mut components = Vec::new();
        for (kind, entry) in [
            (DfuComponentKind::Bootloader, root.manifest.bootloader),
            (DfuComponentKind::SoftDevice, root.manifest.softdevice),
            (DfuComponentKind::Application, root.manifest.application),
        ] {
            let Some(entry) = entry else {
                continue;
            };
            let init_packet = read_entry(&mut archive, &entry.dat_file)?;
            let firmware = read_entry(&mut archive, &entry.bin_file)?;

            if init_packet.len() > MAX_INIT_PACKET_SIZE {
                return Err(Error::InvalidPackage(format!(
                    "{kind} init packet is {} bytes, limit is {MAX_INIT_PACKET_SIZE}",
                    init_packet.len()
                )));
            }
            if firmware.len() > kind.max_size() {
                return Err(Error::InvalidPackage(format!(
                    "{kind} binary is {} bytes, limit is {}",
                    firmware.len(),
                    kind.max_size()
                )));
            }
            debug!(
                "BLE package {kind}: init {} bytes, binary {} bytes",
                init_packet.len(),
                firmware.len()
            );
            components.push(DfuComponent {
                kind,
                init_packet,
                firmware,
            });
        }

        if components.is_empty() {
            return Err(Error::InvalidPackage(
                "manifest lists no bootloader, softdevice or application".to_string(),
            ));
        }
        Ok(Self { components })
    }

    /// Components in update order (bootloader, softdevice, application).
    pub fn components(&self) -> &[DfuComponent] {
        &self.components
    }
}

/// A validated sensor DFU package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorPackage {
    /// Raw manifest, sent as the init packet.
    pub manifest: Vec<u8>,
    /// Sensor application image.
    pub firmware: Vec<u8>,
}

#[derive(Deserialize)]
struct SensorManifest {
    files: Vec<SensorManifestFile>,
}

#[derive(Deserialize)]
struct SensorManifestFile {
    file: String,
    #[serde(rename = "type")]
    kind: String,
    size: usize,
}

impl SensorPackage {
    /// Load a package from a zip file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(&fs::read(path)?)
    }

    /// Load a package from zip bytes.
    pub fn from_bytes(zip_bytes: &[u8]) -> Result<Self> {
        let mut archive = open_archive(zip_bytes)?;
        let manifest = read_entry(&mut archive, MANIFEST_NAME)?;
        let parsed: SensorManifest = serde_json::from_slice(&manifest)
            .map_err(|e| Error::InvalidPackage(format!("{MANIFEST_NAME}: {e}")))?;

        let entry = parsed
            .files
            .first()
            .ok_or_else(|| Error::InvalidPackage("manifest lists no files".to_string()))?;
        if entry.kind != "application" {
            return Err(Error::InvalidPackage(format!(
                "unsupported sensor file type {:?}",
                entry.kind
            )));
        }

        let firmware = read_entry(&mut archive, &entry.file)?;
        if firmware.len() != entry.size {
            return Err(Error::InvalidPackage(format!(
                "{} is {} bytes but the manifest declares {}",
                entry.file,
                firmware.len(),
                entry.size
            )));
        }
        if firmware.len() > MAX_SENSOR_IMAGE_SIZE {
            return Err(Error::InvalidPackage(format!(
                "sensor image is {} bytes, limit is {MAX_SENSOR_IMAGE_SIZE}",
                firmware.len()
            )));
        }
        if manifest.len() > MAX_SENSOR_MANIFEST_SIZE {
            return Err(Error::InvalidPackage(format!(
                "manifest is {} bytes, limit is {MAX_SENSOR_MANIFEST_SIZE}",
                manifest.len()
            )));
        }

        Ok(Self { manifest, firmware })
    }
}

fn open_archive(zip_bytes: &[u8]) -> Result<ZipArchive<Cursor<&[u8]>>> {
    ZipArchive::new(Cursor::new(zip_bytes))
        .map_err(|e| Error::InvalidPackage(format!("not a zip archive: {e}")))
}

fn read_entry(archive: &mut ZipArchive<Cursor<&[u8]>>, name: &str) -> Result<Vec<u8>> {
    let mut file = archive
        .by_name(name)
        .map_err(|e| Error::InvalidPackage(format!("{name}: {e}")))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    Ok(data)
}
