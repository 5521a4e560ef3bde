//! Error types for agflash.

use {crate::dfu::gate::Rejection, std::io, thiserror::Error};

/// Result type for agflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for agflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The device did not echo a command byte back unchanged.
    #[error("{}", echo_message(*expected, *received))]
    EchoMismatch {
        /// Byte written to the device.
        expected: u8,
        /// Byte read back, if any arrived in time.
        received: Option<u8>,
    },

    /// No complete response arrived in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The device answered with a non-PASS result.
    #[error("{command} rejected by device: {result}{}", errno_suffix(*errno))]
    DeviceRejected {
        /// Command line that was refused.
        command: String,
        /// Result reported by the device (e.g. `FAIL`).
        result: String,
        /// Device error number, when reported.
        errno: Option<i64>,
    },

    /// A response frame arrived but could not be decoded.
    #[error("Malformed response to {command}: {raw:?}")]
    MalformedResponse {
        /// Command line the response belongs to.
        command: String,
        /// Raw captured frame text.
        raw: String,
    },

    /// The requested update was refused before touching the device.
    #[error("Update rejected: {0}")]
    PlanRejected(#[from] Rejection),

    /// A chunk could not be written within the retry ceiling.
    #[error("Chunk at offset {offset:#x} failed after {attempts} attempts: {reason}")]
    ChunkFailed {
        /// External memory offset of the failing chunk.
        offset: u32,
        /// Number of attempts made.
        attempts: u32,
        /// Outcome of the last attempt.
        reason: String,
    },

    /// Handshake with the running application failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Firmware image is unusable.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// DFU package is unusable.
    #[error("Invalid DFU package: {0}")]
    InvalidPackage(String),

    /// The operator declined to continue.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The embedding application requested an interrupt.
    #[error("Interrupted by user")]
    Interrupted,
}

impl Error {
    /// Whether this error means the serial link itself is unreliable.
    pub fn is_link_error(&self) -> bool {
        match self {
            Self::Io(_) | Self::EchoMismatch { .. } => true,
            #[cfg(feature = "native")]
            Self::Serial(_) => true,
            _ => false,
        }
    }
}

fn echo_message(expected: u8, received: Option<u8>) -> String {
    match received {
        Some(byte) => format!(
            "Device is not responding: sent {expected:#04x}, echoed {byte:#04x}"
        ),
        None => format!("Device is not responding: no echo for {expected:#04x}"),
    }
}

fn errno_suffix(errno: Option<i64>) -> String {
    errno.map_or_else(String::new, |errno| format!(" (errno {errno})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_mismatch_message() {
        let err = Error::EchoMismatch {
            expected: b'A',
            received: Some(b'B'),
        };
        assert!(err.to_string().contains("0x41"));
        assert!(err.to_string().contains("0x42"));
        assert!(err.is_link_error());

        let err = Error::EchoMismatch {
            expected: b'\n',
            received: None,
        };
        assert!(err.to_string().contains("no echo"));
    }

    #[test]
    fn test_device_rejected_message() {
        let err = Error::DeviceRejected {
            command: "QSPI SEC_ER 2 10000".to_string(),
            result: "FAIL".to_string(),
            errno: Some(-5),
        };
        assert_eq!(
            err.to_string(),
            "QSPI SEC_ER 2 10000 rejected by device: FAIL (errno -5)"
        );
        assert!(!err.is_link_error());
    }

    #[test]
    fn test_timeout_is_not_link_error() {
        assert!(!Error::Timeout("x".into()).is_link_error());
    }
}
