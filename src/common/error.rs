//! Common error types
//!
//! # Design Principles (KISS)
//! - Each layer owns a thiserror enum; `PipelineError` wraps them all
//! - Per-block errors quarantine that block; only run-level errors stop a run
//! - Binaries convert to `anyhow` at the top

use thiserror::Error;

use crate::config::ConfigError;
use crate::rawdata::DecodeError;
use crate::recorder::FileFormatError;
use crate::top::{CalibrationError, UnpackError};

/// Errors crossing component boundaries
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed COPPER block
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Malformed detector payload
    #[error("Unpack error: {0}")]
    Unpack(#[from] UnpackError),

    /// Calibration payload problem
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Raw data file problem
    #[error("File format error: {0}")]
    FileFormat(#[from] FileFormatError),

    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send failed (receiver dropped)
    #[error("Channel send failed: receiver dropped")]
    ChannelSend,

    /// No unpacker registered for a detector
    #[error("No unpacker registered for detector 0x{0:08x}")]
    NoUnpacker(u32),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether the error only concerns the current block
    ///
    /// Block-level errors quarantine the block and the stream continues.
    pub fn is_block_level(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::Unpack(_) | Self::NoUnpacker(_)
        )
    }
}

/// Result type alias using PipelineError
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_from() {
        let err: PipelineError = DecodeError::InvalidSlot(7).into();
        assert!(err.to_string().contains("Decode error"));
        assert!(err.is_block_level());
    }

    #[test]
    fn test_unpack_error_from() {
        let err: PipelineError = UnpackError::BadFooterMagic(0).into();
        assert!(err.to_string().contains("footer"));
        assert!(err.is_block_level());
    }

    #[test]
    fn test_calibration_error_is_run_level() {
        let err: PipelineError = CalibrationError::MissingPayload {
            kind: crate::top::PayloadKind::CommonT0,
            exp: 1,
            run: 2,
        }
        .into();
        assert!(err.to_string().contains("common_t0"));
        assert!(!err.is_block_level());
    }

    #[test]
    fn test_channel_send_error() {
        let err = PipelineError::ChannelSend;
        assert!(err.to_string().contains("Channel send failed"));
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PipelineError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_no_unpacker() {
        let err = PipelineError::NoUnpacker(0x0300_0000);
        assert!(err.to_string().contains("0x03000000"));
    }

    #[test]
    fn test_other_error() {
        let err = PipelineError::other("something went wrong");
        assert!(err.to_string().contains("something went wrong"));
    }
}
