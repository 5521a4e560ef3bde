//! Device firmware update.
//!
//! - [`gate`]: decides whether and in which order images may be installed
//! - [`engine`]: moves one image into external flash, chunk by chunk
//! - [`device`]: version discovery, handshakes and boot detection
//! - [`updater`]: runs a whole session on top of the above
//! - [`ble`]: BLE radio and sensor packages

pub mod ble;
pub mod device;
pub mod engine;
pub mod gate;
pub mod updater;

pub use {
    device::{DeviceMode, DeviceVersionState, SessionTimeouts},
    engine::TransferProfile,
    updater::{BleUpdateReport, Updater},
};
