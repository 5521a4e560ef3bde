//! MCU firmware images.
//!
//! Images are identified by file name:
//!
//! ```text
//! lbb_mcu[_bootloader|_factory][_NNNN].bin
//! ```
//!
//! No kind suffix means the shipping (TG) application; no version means the
//! legacy release 4005. The version is 4 to 6 decimal digits.

use {
    crate::{
        error::{Error, Result},
        protocol::checksum::checksum_chunked,
    },
    std::{fmt, fs, path::Path},
};

/// Oldest release the update path understands; also the implied version of
/// unversioned file names and of devices that do not report one.
pub const LEGACY_VERSION: u32 = 4005;

/// Highest bootloader version ever issued. Larger values reported by a
/// device are placeholders from early builds.
pub const FINAL_BOOTLOADER_VERSION: u32 = 9000;

/// Space reserved for the bootloader image.
pub const MAX_BOOTLOADER_SIZE: usize = 64 * 1024;

/// Space reserved for each application image.
pub const MAX_APPLICATION_SIZE: usize = 1280 * 1024;

const NAME_PREFIX: &str = "lbb_mcu";
const NAME_SUFFIX: &str = ".bin";

/// Kind of MCU image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageKind {
    /// First-stage bootloader.
    Bootloader,
    /// Factory (manufacturing test) application.
    FactoryApp,
    /// Shipping application (TG app).
    ShipApp,
}

impl ImageKind {
    /// Whether this is one of the two application personalities.
    pub fn is_application(self) -> bool {
        !matches!(self, Self::Bootloader)
    }

    /// Largest image of this kind the device accepts.
    pub fn max_size(self) -> usize {
        match self {
            Self::Bootloader => MAX_BOOTLOADER_SIZE,
            Self::FactoryApp | Self::ShipApp => MAX_APPLICATION_SIZE,
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bootloader => write!(f, "bootloader"),
            Self::FactoryApp => write!(f, "factory"),
            Self::ShipApp => write!(f, "tg_app"),
        }
    }
}

/// A validated firmware image held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryImage {
    kind: ImageKind,
    version: u32,
    name: String,
    data: Vec<u8>,
}

impl BinaryImage {
    /// Load and validate an image file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidImage(format!("{} is not a file", path.display())))?
            .to_string();
        // Reject the name before reading a possibly large file.
        parse_file_name(&name)?;
        let data = fs::read(path)?;
        Self::from_bytes(name, data)
    }

    /// Validate an image given its file name and contents.
    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Result<Self> {
        let name = name.into();
        let (kind, version) = parse_file_name(&name)?;

        if kind == ImageKind::Bootloader && version > FINAL_BOOTLOADER_VERSION {
            return Err(Error::InvalidImage(format!(
                "{name}: bootloader version {version} is above the final bootloader version {FINAL_BOOTLOADER_VERSION}"
            )));
        }
        if data.is_empty() {
            return Err(Error::InvalidImage(format!("{name} is empty")));
        }
        if data.len() > kind.max_size() {
            return Err(Error::InvalidImage(format!(
                "{name}: {} bytes exceeds the {kind} limit of {} bytes",
                data.len(),
                kind.max_size()
            )));
        }

        Ok(Self {
            kind,
            version,
            name,
            data,
        })
    }

    /// Image kind.
    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    /// Release number.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// File name the image was loaded from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Image contents.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.data
            .len()
    }

    /// Always `false`; empty images are rejected on load.
    pub fn is_empty(&self) -> bool {
        self.data
            .is_empty()
    }

    /// Transfer checksum, summed in `chunk_size` pieces.
    pub fn checksum(&self, chunk_size: usize) -> u64 {
        checksum_chunked(&self.data, chunk_size)
    }
}

impl fmt::Display for BinaryImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} v{}, {} bytes)",
            self.name,
            self.kind,
            self.version,
            self.data
                .len()
        )
    }
}

fn parse_file_name(name: &str) -> Result<(ImageKind, u32)> {
    let invalid = || {
        Error::InvalidImage(format!(
            "{name}: expected lbb_mcu[_bootloader|_factory][_<version>].bin"
        ))
    };

    let rest = name
        .strip_suffix(NAME_SUFFIX)
        .and_then(|stem| stem.strip_prefix(NAME_PREFIX))
        .ok_or_else(invalid)?;

    let (kind, rest) = if let Some(rest) = rest.strip_prefix("_bootloader") {
        (ImageKind::Bootloader, rest)
    } else if let Some(rest) = rest.strip_prefix("_factory") {
        (ImageKind::FactoryApp, rest)
    } else {
        (ImageKind::ShipApp, rest)
    };

    if rest.is_empty() {
        return Ok((kind, LEGACY_VERSION));
    }

    let digits = rest
        .strip_prefix('_')
        .filter(|d| (4..=6).contains(&d.len()) && d.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(invalid)?;
    let version: u32 = digits
        .parse()
        .map_err(|_| invalid())?;

    if version < LEGACY_VERSION {
        return Err(Error::InvalidImage(format!(
            "{name}: version {version} predates the update path ({LEGACY_VERSION})"
        )));
    }
    Ok((kind, version))
}
