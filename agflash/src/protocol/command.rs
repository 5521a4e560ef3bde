//! Console command lines.
//!
//! Every request is a single ASCII line `<MODULE> <VERB> [args...]\n`. The
//! module name is also the key under which the device reports the result,
//! so a [`Command`] carries it separately for response decoding.

use std::fmt;

/// Module names understood by the device console.
pub mod module {
    /// Firmware update module.
    pub const FW_UPDATE: &str = "FW_UPDATE";
    /// External QSPI flash.
    pub const QSPI: &str = "QSPI";
    /// External memory manager.
    pub const EXMEM: &str = "EXMEM";
    /// System commands.
    pub const SYS: &str = "SYS";
    /// EEPROM access.
    pub const EEPROM: &str = "EEPROM";
    /// BLE radio.
    pub const BLE: &str = "BLE";
}

/// Verbs used with the modules above.
pub mod verb {
    /// Announce an MCU application image.
    pub const WR_MCU_FW_INFO: &str = "WR_MCU_FW_INFO";
    /// Announce a bootloader image.
    pub const WR_BTL_FW_INFO: &str = "WR_BTL_FW_INFO";
    /// Announce BLE DFU init packet and binary.
    pub const WR_BLE_DFU_INFO: &str = "WR_BLE_DFU_INFO";
    /// Write one firmware chunk.
    pub const WR_FW: &str = "WR_FW";
    /// Commit a staged application image.
    pub const SET_MCU_FW_UPDATE_FLAG: &str = "SET_MCU_FW_UPDATE_FLAG";
    /// Commit a staged bootloader image.
    pub const UPDATE_BTL: &str = "UPDATE_BTL";
    /// Verify a staged application checksum.
    pub const VER_MCU_CHECKSUM: &str = "VER_MCU_CHECKSUM";
    /// Start the BLE radio DFU.
    pub const BLE_DFU: &str = "BLE_DFU";
    /// Start the sensor firmware transfer.
    pub const XFER_SENSOR: &str = "XFER_SENSOR";
    /// Erase one flash sector.
    pub const SEC_ER: &str = "SEC_ER";
    /// Format external memory.
    pub const FORMAT: &str = "FORMAT";
    /// Reboot the device.
    pub const REBOOT: &str = "REBOOT";
    /// Report firmware versions.
    pub const FW_VER: &str = "FW_VER";
    /// Read EEPROM bytes.
    pub const READ: &str = "READ";
    /// Write an EEPROM word.
    pub const WRITE: &str = "WRITE";
    /// Report the BLE radio software version.
    pub const GET_SW_VER: &str = "GET_SW_VER";
}

/// How numeric arguments are printed in hexadecimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HexStyle {
    /// `1f400`
    Bare,
    /// `0x1f400`
    Prefixed,
}

impl HexStyle {
    /// Format `value` in this style.
    pub fn format(self, value: u64) -> String {
        match self {
            Self::Bare => format!("{value:x}"),
            Self::Prefixed => format!("{value:#x}"),
        }
    }
}

/// A console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    module: &'static str,
    verb: &'static str,
    args: Vec<String>,
}

impl Command {
    /// Create a command without arguments.
    pub fn new(module: &'static str, verb: &'static str) -> Self {
        Self {
            module,
            verb,
            args: Vec::new(),
        }
    }

    /// Append a decimal or literal argument.
    #[must_use]
    pub fn arg(mut self, arg: impl fmt::Display) -> Self {
        self.args
            .push(arg.to_string());
        self
    }

    /// Append a hexadecimal argument.
    #[must_use]
    pub fn hex(mut self, value: u64, style: HexStyle) -> Self {
        self.args
            .push(style.format(value));
        self
    }

    /// Module the response is keyed by.
    pub fn module(&self) -> &'static str {
        self.module
    }

    /// Command verb.
    pub fn verb(&self) -> &'static str {
        self.verb
    }

    /// Full line including the terminating newline.
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }

    /// `FW_UPDATE WR_FW <checksum> <offset> <len>`.
    pub fn write_chunk(checksum: u64, offset: u32, len: usize, style: HexStyle) -> Self {
        Self::new(module::FW_UPDATE, verb::WR_FW)
            .hex(checksum, style)
            .hex(u64::from(offset), style)
            .arg(len)
    }

    /// `QSPI SEC_ER <arg> <address>`.
    pub fn sector_erase(erase_arg: u8, address: u32, style: HexStyle) -> Self {
        Self::new(module::QSPI, verb::SEC_ER)
            .arg(erase_arg)
            .hex(u64::from(address), style)
    }

    /// `SYS REBOOT`.
    pub fn reboot() -> Self {
        Self::new(module::SYS, verb::REBOOT)
    }

    /// `SYS FW_VER`.
    pub fn firmware_versions() -> Self {
        Self::new(module::SYS, verb::FW_VER)
    }

    /// `BLE GET_SW_VER`.
    pub fn ble_version() -> Self {
        Self::new(module::BLE, verb::GET_SW_VER)
    }

    /// `EEPROM READ <address> <len>`.
    pub fn eeprom_read(address: u32, len: usize) -> Self {
        Self::new(module::EEPROM, verb::READ)
            .hex(u64::from(address), HexStyle::Bare)
            .arg(len)
    }

    /// `EEPROM WRITE <address> <value>`.
    pub fn eeprom_write(address: u32, value: u32) -> Self {
        Self::new(module::EEPROM, verb::WRITE)
            .hex(u64::from(address), HexStyle::Bare)
            .hex(u64::from(value), HexStyle::Bare)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.module, self.verb)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_format() {
        let cmd = Command::new(module::SYS, verb::REBOOT);
        assert_eq!(cmd.to_line(), "SYS REBOOT\n");
        assert_eq!(cmd.module(), "SYS");
        assert_eq!(cmd.verb(), "REBOOT");
    }

    #[test]
    fn test_write_chunk_bare_hex() {
        let cmd = Command::write_chunk(0x1f4, 0x18000, 16384, HexStyle::Bare);
        assert_eq!(cmd.to_string(), "FW_UPDATE WR_FW 1f4 18000 16384");
    }

    #[test]
    fn test_write_chunk_prefixed_hex() {
        let cmd = Command::write_chunk(500, 0x2cd400, 4096, HexStyle::Prefixed);
        assert_eq!(cmd.to_string(), "FW_UPDATE WR_FW 0x1f4 0x2cd400 4096");
    }

    #[test]
    fn test_sector_erase() {
        assert_eq!(
            Command::sector_erase(2, 0x20000, HexStyle::Bare).to_string(),
            "QSPI SEC_ER 2 20000"
        );
        assert_eq!(
            Command::sector_erase(1, 0x2a0000, HexStyle::Prefixed).to_string(),
            "QSPI SEC_ER 1 0x2a0000"
        );
    }

    #[test]
    fn test_eeprom_commands() {
        assert_eq!(
            Command::eeprom_write(0x2000, 0x1234).to_string(),
            "EEPROM WRITE 2000 1234"
        );
        assert_eq!(
            Command::eeprom_read(0x180, 16).to_string(),
            "EEPROM READ 180 16"
        );
    }

    #[test]
    fn test_ble_version_command() {
        let cmd = Command::ble_version();
        assert_eq!(cmd.to_line(), "BLE GET_SW_VER\n");
        assert_eq!(cmd.module(), "BLE");
    }

    #[test]
    fn test_hex_style_zero() {
        assert_eq!(HexStyle::Bare.format(0), "0");
        assert_eq!(HexStyle::Prefixed.format(0), "0x0");
    }
}
