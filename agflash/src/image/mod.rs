//! Firmware inputs: MCU images and DFU packages.

pub mod binary;
pub mod package;

pub use binary::{BinaryImage, ImageKind};
