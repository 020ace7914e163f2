//! Slave Engine Error Types
//!
//! Three layers, each contained at its own scope:
//! - [`FrameError`]: one frame failed checksum/format checks, the frame is dropped
//! - [`TableError`]: a data table refused an access, the dispatcher answers with an exception
//! - [`SlaveError`]: engine-level failures reported to the caller of the server

use thiserror::Error;

use crate::pdu::ExceptionCode;

/// Result type for slave engine operations
pub type Result<T> = std::result::Result<T, SlaveError>;

/// Slave engine errors
#[derive(Debug, Error)]
pub enum SlaveError {
    /// Invalid configuration passed to startup
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    /// Cannot bind the TCP port or open the serial device
    #[error("Transport error: {0}")]
    Transport(String),

    /// Accept/read/write failure on a single session
    #[error("Connection error: {0}")]
    Connection(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Server used in the wrong state (e.g. loop before startup)
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for SlaveError {
    fn from(err: std::io::Error) -> Self {
        SlaveError::Io(err.to_string())
    }
}

impl From<FrameError> for SlaveError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(msg) => SlaveError::Io(msg),
            other => SlaveError::Protocol(other.to_string()),
        }
    }
}

// Helper methods for creating errors
impl SlaveError {
    pub fn illegal_argument(msg: impl Into<String>) -> Self {
        SlaveError::IllegalArgument(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        SlaveError::Transport(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        SlaveError::Connection(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        SlaveError::Protocol(msg.into())
    }

    /// Configuration-time failures end the process; everything else is contained
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SlaveError::IllegalArgument(_) | SlaveError::Transport(_) | SlaveError::Protocol(_)
        )
    }
}

/// Per-frame codec failures
///
/// A frame error never produces a response; the master times out and retries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    #[error("Frame too long: {0} bytes")]
    TooLong(usize),

    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    Crc { expected: u16, actual: u16 },

    #[error("LRC mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    Lrc { expected: u8, actual: u8 },

    #[error("Invalid hex character 0x{0:02X} in ASCII frame")]
    InvalidHex(u8),

    #[error("Odd number of hex digits in ASCII frame: {0}")]
    OddHexLength(usize),

    #[error("Invalid MBAP protocol ID: {0}")]
    InvalidProtocolId(u16),

    #[error("Invalid MBAP length field: {0}")]
    InvalidLength(u16),

    #[error("Frame interrupted by inter-character gap")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::Io(err.to_string())
    }
}

impl FrameError {
    /// MBAP framing errors leave the stream position unknown, the connection must be closed
    pub fn corrupts_stream(&self) -> bool {
        matches!(self, FrameError::InvalidProtocolId(_) | FrameError::InvalidLength(_))
    }
}

/// Data table access failures
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    /// Requested span lies (partly) outside the table capacity
    #[error("reference range out of bounds")]
    OutOfRange,

    /// File number not served by this table
    #[error("unknown file number {0}")]
    UnknownFile(u16),

    /// Backend could not complete the request
    #[error("slave device failure")]
    DeviceFailure,
}

impl From<TableError> for ExceptionCode {
    fn from(err: TableError) -> Self {
        match err {
            TableError::OutOfRange => ExceptionCode::IllegalDataAddress,
            TableError::UnknownFile(_) => ExceptionCode::IllegalDataValue,
            TableError::DeviceFailure => ExceptionCode::SlaveDeviceFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SlaveError::illegal_argument("baud 0").is_fatal());
        assert!(SlaveError::transport("bind failed").is_fatal());
        assert!(!SlaveError::connection("reset by peer").is_fatal());
        assert!(!SlaveError::Io("broken pipe".into()).is_fatal());
    }

    #[test]
    fn test_frame_error_display() {
        let err = FrameError::Crc {
            expected: 0x0A84,
            actual: 0xFFFF,
        };
        assert_eq!(err.to_string(), "CRC mismatch: expected 0x0A84, got 0xFFFF");
    }

    #[test]
    fn test_stream_corruption() {
        assert!(FrameError::InvalidProtocolId(1).corrupts_stream());
        assert!(FrameError::InvalidLength(0).corrupts_stream());
        assert!(!FrameError::Lrc {
            expected: 1,
            actual: 2
        }
        .corrupts_stream());
        assert!(!FrameError::Io("reset by peer".into()).corrupts_stream());
    }

    #[test]
    fn test_table_error_to_exception() {
        assert_eq!(
            ExceptionCode::from(TableError::OutOfRange),
            ExceptionCode::IllegalDataAddress
        );
        assert_eq!(
            ExceptionCode::from(TableError::UnknownFile(7)),
            ExceptionCode::IllegalDataValue
        );
        assert_eq!(
            ExceptionCode::from(TableError::DeviceFailure),
            ExceptionCode::SlaveDeviceFailure
        );
    }
}
