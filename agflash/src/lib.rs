//! # agflash
//!
//! A library for updating Asset Gateway (AG) firmware over the device's
//! serial console.
//!
//! This crate provides:
//!
//! - An echo-verified command link with typed JSON responses
//! - The additive checksum used by every transfer command
//! - Firmware image and DFU package loading
//! - The bootloader/application dependency gate that orders updates
//! - A chunked transfer engine with bounded per-chunk retries
//! - The update orchestrator, including reboot and handshake handling
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via `serialport`
//!
//! ## Example
//!
//! ```rust,no_run
//! use agflash::{BinaryImage, DeviceMode, NativePort, SerialConfig, UpdateRequest, Updater};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let images = vec![
//!         BinaryImage::from_file("lbb_mcu_4011.bin")?,
//!         BinaryImage::from_file("lbb_mcu_bootloader_4011.bin")?,
//!     ];
//!     let request = UpdateRequest::from_images(images)?;
//!
//!     let port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 115200))?;
//!     let mut updater = Updater::new(port, DeviceMode::TgApp);
//!     updater.connect()?;
//!     updater.update(
//!         request,
//!         &mut |warning| {
//!             eprintln!("{warning}");
//!             true
//!         },
//!         &mut |name, current, total| println!("{name}: {current}/{total}"),
//!     )?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod dfu;
pub mod error;
pub mod image;
pub mod port;
pub mod protocol;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). It is consulted
/// before every command and every read from the device.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

pub(crate) fn ensure_not_interrupted() -> Result<()> {
    if is_interrupted_requested() {
        Err(Error::Interrupted)
    } else {
        Ok(())
    }
}

#[cfg(test)]
thread_local! {
    static TEST_INTERRUPTED: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Toggle interruption for the calling test thread only.
#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    static INSTALL: std::sync::Once = std::sync::Once::new();

    INSTALL.call_once(|| {
        set_interrupt_checker(|| TEST_INTERRUPTED.with(std::cell::Cell::get));
    });
    TEST_INTERRUPTED.with(|flag| flag.set(value));
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    dfu::{
        BleUpdateReport, DeviceMode, DeviceVersionState, SessionTimeouts, TransferProfile,
        Updater,
        ble::{BleLayout, SensorLayout},
        engine::{TransferEngine, TransferState, TransferTarget},
        gate::{
            DEPENDENCY_TABLE, DependencyRecord, PlanStep, Rejection, SmtPlan, TransferPlan,
            UpdateRequest, plan_smt_simulation, plan_update,
        },
    },
    error::{Error, Result},
    image::{
        BinaryImage, ImageKind,
        package::{BlePackage, DfuComponent, DfuComponentKind, SensorPackage},
    },
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{
        checksum::{Checksum, checksum},
        command::{Command, HexStyle},
        link::CommandLink,
        response::{Reply, Response},
    },
};
