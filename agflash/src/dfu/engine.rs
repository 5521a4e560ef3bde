//! Chunked firmware transfer engine.
//!
//! One image moves through `Idle → Announced → Erasing → Sending/Retrying →
//! Finalizing → Committed`. Any fatal error leaves the engine in `Failed`.
//!
//! Each chunk is retried in place up to the profile's retry ceiling; the
//! engine never skips a chunk. Link errors (bad echo, I/O) and interruption
//! abort immediately, since retrying over an untrusted link is pointless.

use {
    crate::{
        error::{Error, Result},
        image::BinaryImage,
        port::Port,
        protocol::{
            checksum::checksum,
            command::{Command, HexStyle, module, verb},
            link::CommandLink,
        },
    },
    log::{debug, info, warn},
    std::{fmt, thread, time::Duration},
};

/// EEPROM words reset before every announce so an interrupted transfer is
/// never mistaken for a finished one.
const UPDATE_MARKERS: [(u32, u32); 2] = [(0x0, 0x2234), (0x2000, 0x1234)];

/// Where one image is staged in external memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTarget {
    /// External memory region id.
    pub exmem_region: u32,
    /// Offset of the first chunk.
    pub write_offset: u32,
    /// Address of the first sector to erase.
    pub erase_offset: u32,
    /// Internal flash region the image is installed into on commit.
    pub int_flash_region: u8,
}

/// Protocol constants of one DFU variant.
#[derive(Debug, Clone)]
pub struct TransferProfile {
    /// Bytes per `WR_FW` chunk.
    pub chunk_size: usize,
    /// Retries after the first attempt of a chunk.
    pub max_retries: u32,
    /// External flash sector size.
    pub sector_size: u32,
    /// First argument of `QSPI SEC_ER`.
    pub sector_erase_arg: u8,
    /// Hex formatting of `WR_FW` and announce arguments.
    pub hex_style: HexStyle,
    /// Pause between a `WR_FW` line and its payload.
    pub payload_delay: Duration,
    /// Pause before reading the response of a command that reboots a radio.
    pub activation_delay: Duration,
    /// EEPROM marker writes.
    pub marker_timeout: Duration,
    /// Image announce.
    pub info_timeout: Duration,
    /// One sector erase.
    pub erase_timeout: Duration,
    /// One chunk.
    pub chunk_timeout: Duration,
    /// `SET_MCU_FW_UPDATE_FLAG`.
    pub update_flag_timeout: Duration,
    /// `UPDATE_BTL`.
    pub bootloader_commit_timeout: Duration,
    /// `VER_MCU_CHECKSUM`.
    pub checksum_verify_timeout: Duration,
}

impl TransferProfile {
    /// MCU application and bootloader transfers.
    pub fn mcu() -> Self {
        Self {
            chunk_size: 16 * 1024,
            max_retries: 2,
            sector_size: 64 * 1024,
            sector_erase_arg: 2,
            hex_style: HexStyle::Bare,
            payload_delay: Duration::from_millis(10),
            activation_delay: Duration::ZERO,
            marker_timeout: Duration::from_secs(2),
            info_timeout: Duration::from_secs(1),
            erase_timeout: Duration::from_secs(2),
            chunk_timeout: Duration::from_secs(30),
            update_flag_timeout: Duration::from_secs(3),
            bootloader_commit_timeout: Duration::from_secs(15),
            checksum_verify_timeout: Duration::from_secs(3),
        }
    }

    /// BLE radio and sensor package transfers.
    pub fn ble() -> Self {
        Self {
            chunk_size: 4 * 1024,
            max_retries: 9,
            sector_size: 4 * 1024,
            sector_erase_arg: 1,
            hex_style: HexStyle::Prefixed,
            payload_delay: Duration::from_millis(100),
            activation_delay: Duration::from_secs(15),
            ..Self::mcu()
        }
    }

    /// Attempts made per chunk before giving up.
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Sectors needed to hold `len` bytes.
    pub fn sectors_for(&self, len: usize) -> u32 {
        (len as u32).div_ceil(self.sector_size)
    }
}

/// Engine progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Nothing sent yet.
    Idle,
    /// Image accepted by the device.
    Announced,
    /// Erasing sectors.
    Erasing,
    /// Sending a chunk for the first time.
    Sending {
        /// Zero-based chunk index.
        chunk: usize,
    },
    /// Resending a chunk.
    Retrying {
        /// Zero-based chunk index.
        chunk: usize,
        /// One-based attempt number.
        attempt: u32,
    },
    /// Waiting for the commit command.
    Finalizing,
    /// Commit acknowledged.
    Committed,
    /// Stopped on a fatal error.
    Failed,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Announced => write!(f, "announced"),
            Self::Erasing => write!(f, "erasing"),
            Self::Sending { chunk } => write!(f, "sending chunk {chunk}"),
            Self::Retrying { chunk, attempt } => {
                write!(f, "retrying chunk {chunk} (attempt {attempt})")
            },
            Self::Finalizing => write!(f, "finalizing"),
            Self::Committed => write!(f, "committed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

struct ChunkTransferState {
    offset: u32,
    bytes_remaining: usize,
    retries_this_chunk: u32,
}

impl ChunkTransferState {
    fn advance(&mut self, len: usize) {
        self.offset += len as u32;
        self.bytes_remaining -= len;
        self.retries_this_chunk = 0;
    }
}

/// Drives one image through announce, erase, send and commit.
pub struct TransferEngine<'a, P: Port> {
    link: &'a mut CommandLink<P>,
    profile: &'a TransferProfile,
    state: TransferState,
}

impl<'a, P: Port> TransferEngine<'a, P> {
    /// Create an engine over an established link.
    pub fn new(link: &'a mut CommandLink<P>, profile: &'a TransferProfile) -> Self {
        Self {
            link,
            profile,
            state: TransferState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Announce an MCU image (`WR_MCU_FW_INFO` or `WR_BTL_FW_INFO`).
    pub fn announce(
        &mut self,
        info_verb: &'static str,
        image: &BinaryImage,
        target: &TransferTarget,
    ) -> Result<()> {
        let style = self.profile.hex_style;
        let command = Command::new(module::FW_UPDATE, info_verb)
            .arg(image.len())
            .hex(image.checksum(self.profile.chunk_size), style)
            .hex(u64::from(target.exmem_region), style)
            .hex(u64::from(target.write_offset), style)
            .arg(target.int_flash_region);

        info!(
            "Announcing {image}: region {:#x} offset {:#x} flash region {}",
            target.exmem_region, target.write_offset, target.int_flash_region
        );
        let result = self.clear_update_markers();
        self.track(result)?;
        self.announce_with(&command)
    }

    /// Send a prepared announce command.
    pub fn announce_with(&mut self, command: &Command) -> Result<()> {
        let result = self
            .link
            .execute(command, self.profile.info_timeout);
        self.track(result)?;
        self.state = TransferState::Announced;
        Ok(())
    }

    /// Erase every sector covering `len` bytes from `base`.
    pub fn erase(&mut self, base: u32, len: usize) -> Result<()> {
        self.state = TransferState::Erasing;
        let sectors = self
            .profile
            .sectors_for(len);
        info!("Erasing {sectors} sectors from {base:#x}");

        for index in 0..sectors {
            let address = base + index * self.profile.sector_size;
            let command = Command::sector_erase(self.profile.sector_erase_arg, address, HexStyle::Bare);
            let result = self
                .link
                .execute(&command, self.profile.erase_timeout);
            self.track(result)?;
        }
        Ok(())
    }

    /// Send `data` in chunks starting at `offset`.
    ///
    /// `progress` receives `(bytes_sent, total)` after each chunk.
    pub fn send_chunks(
        &mut self,
        data: &[u8],
        offset: u32,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        let total = data.len();
        let mut cursor = ChunkTransferState {
            offset,
            bytes_remaining: total,
            retries_this_chunk: 0,
        };

        for (index, chunk) in data
            .chunks(self.profile.chunk_size)
            .enumerate()
        {
            let command = Command::write_chunk(
                checksum(chunk),
                cursor.offset,
                chunk.len(),
                self.profile.hex_style,
            );

            loop {
                self.state = if cursor.retries_this_chunk == 0 {
                    TransferState::Sending { chunk: index }
                } else {
                    TransferState::Retrying {
                        chunk: index,
                        attempt: cursor.retries_this_chunk + 1,
                    }
                };

                match self.write_chunk(&command, chunk) {
                    Ok(()) => break,
                    Err(e) if e.is_link_error() || matches!(e, Error::Interrupted) => {
                        self.state = TransferState::Failed;
                        return Err(e);
                    },
                    Err(e) => {
                        cursor.retries_this_chunk += 1;
                        if cursor.retries_this_chunk > self.profile.max_retries {
                            self.state = TransferState::Failed;
                            return Err(Error::ChunkFailed {
                                offset: cursor.offset,
                                attempts: cursor.retries_this_chunk,
                                reason: e.to_string(),
                            });
                        }
                        warn!(
                            "Chunk at {:#x} failed: {e}; retrying ({}/{})",
                            cursor.offset, cursor.retries_this_chunk, self.profile.max_retries
                        );
                    },
                }
            }

            cursor.advance(chunk.len());
            progress(total - cursor.bytes_remaining, total);
        }
        Ok(())
    }

    /// Announce, erase and send an MCU image.
    pub fn transfer(
        &mut self,
        info_verb: &'static str,
        image: &BinaryImage,
        target: &TransferTarget,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        self.announce(info_verb, image, target)?;
        self.erase(target.erase_offset, image.len())?;
        self.send_chunks(image.data(), target.write_offset, progress)
    }

    /// Mark the staged application for installation on next boot.
    pub fn commit_application(&mut self) -> Result<()> {
        self.finalize(verb::SET_MCU_FW_UPDATE_FLAG, self.profile.update_flag_timeout)
    }

    /// Install the staged bootloader.
    pub fn commit_bootloader(&mut self) -> Result<()> {
        self.finalize(verb::UPDATE_BTL, self.profile.bootloader_commit_timeout)
    }

    /// Ask the device to verify the staged application checksum.
    pub fn verify_checksum(&mut self) -> Result<()> {
        self.finalize(verb::VER_MCU_CHECKSUM, self.profile.checksum_verify_timeout)
    }

    /// Reboot the device. No response is awaited.
    pub fn reboot(&mut self) -> Result<()> {
        info!("Rebooting device");
        self.link
            .write_command(&Command::reboot())
    }

    /// Hand the staged images over with `FW_UPDATE <start_verb>`.
    ///
    /// The response is read after `delay`, for commands that reboot a
    /// peripheral before answering.
    pub fn start(&mut self, start_verb: &'static str, delay: Duration) -> Result<()> {
        self.state = TransferState::Finalizing;
        let command = Command::new(module::FW_UPDATE, start_verb);
        let result = self
            .link
            .write_command(&command);
        self.track(result)?;
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let result = self
            .link
            .read_response(module::FW_UPDATE, self.profile.info_timeout)
            .and_then(|response| response.expect_pass(&command.to_string()));
        self.track(result)?;
        self.state = TransferState::Committed;
        Ok(())
    }

    fn finalize(&mut self, finalize_verb: &'static str, timeout: Duration) -> Result<()> {
        self.state = TransferState::Finalizing;
        let command = Command::new(module::FW_UPDATE, finalize_verb);
        let result = self
            .link
            .execute(&command, timeout);
        self.track(result)?;
        self.state = TransferState::Committed;
        Ok(())
    }

    fn write_chunk(&mut self, command: &Command, chunk: &[u8]) -> Result<()> {
        self.link
            .write_command(command)?;
        if !self
            .profile
            .payload_delay
            .is_zero()
        {
            thread::sleep(self.profile.payload_delay);
        }
        self.link
            .write_raw(chunk)?;
        self.link
            .read_response(module::FW_UPDATE, self.profile.chunk_timeout)?
            .expect_pass(&command.to_string())?;
        Ok(())
    }

    fn clear_update_markers(&mut self) -> Result<()> {
        for (address, value) in UPDATE_MARKERS {
            let command = Command::eeprom_write(address, value);
            let response = self
                .link
                .send(&command, self.profile.marker_timeout)?;
            if !response.is_pass() {
                warn!("{command} returned {}", response.label());
            }
        }
        debug!("Update markers cleared");
        Ok(())
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.state = TransferState::Failed;
        }
        result
    }
}
