//! Decode errors for COPPER raw-data blocks
//!
//! Every problem found while reading a block is reported as a
//! `DecodeError` for that block only. Callers decide whether to skip,
//! quarantine, or stop.

use thiserror::Error;

/// Errors raised while reading or validating one COPPER block
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Buffer too short: need {needed} words, have {available}")]
    TooShort { needed: usize, available: usize },

    #[error("Declared block length {declared} disagrees with buffer size {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Declared block length {declared} disagrees with FINESSE lengths (expected {expected})")]
    TotalLengthMismatch { declared: usize, expected: usize },

    #[error("COPPER data length {declared} disagrees with channel lengths (expected {expected})")]
    DataLengthMismatch { declared: usize, expected: usize },

    #[error("{what} at word {pos} (+{len}) exceeds buffer of {nwords} words")]
    OutOfBounds {
        what: &'static str,
        pos: usize,
        len: usize,
        nwords: usize,
    },

    #[error("Invalid FINESSE slot {0} (must be 0..=3)")]
    InvalidSlot(usize),

    #[error("Event index {index} out of range ({count} events in buffer)")]
    EventOutOfRange { index: usize, count: usize },

    #[error("FINESSE slot {slot} declares {nwords} words, less than its B2L framing")]
    FinesseTooShort { slot: usize, nwords: usize },

    #[error("FINESSE slot {slot} offset in RawHeader is {stored}, computed {computed}")]
    OffsetMismatch {
        slot: usize,
        stored: usize,
        computed: usize,
    },

    #[error("Bad {what} magic: expected 0x{expected:08x}, found 0x{found:08x}")]
    BadMagic {
        what: &'static str,
        expected: u32,
        found: u32,
    },

    #[error("Driver checksum mismatch: stored 0x{stored:08x}, computed 0x{computed:08x}")]
    DriverChecksum { stored: u32, computed: u32 },

    #[error("RawTrailer XOR checksum mismatch: stored 0x{stored:08x}, computed 0x{computed:08x}")]
    XorChecksum { stored: u32, computed: u32 },

    #[error("FINESSE slot {slot} CRC16 mismatch: stored 0x{stored:04x}, computed 0x{computed:04x}")]
    Crc16 { slot: usize, stored: u16, computed: u16 },

    #[error("No FINESSE slot carries data")]
    NoFinesseData,

    #[error("Block is already in the reduced format")]
    AlreadyReduced,

    #[error("Block is not in the reduced format")]
    NotReduced,
}

impl DecodeError {
    pub(crate) fn out_of_bounds(what: &'static str, pos: usize, len: usize, nwords: usize) -> Self {
        Self::OutOfBounds {
            what,
            pos,
            len,
            nwords,
        }
    }

    pub(crate) fn bad_magic(what: &'static str, expected: u32, found: u32) -> Self {
        Self::BadMagic {
            what,
            expected,
            found,
        }
    }

    /// Whether the error concerns block integrity (checksums, CRC)
    /// rather than structure
    pub fn is_checksum(&self) -> bool {
        matches!(
            self,
            Self::DriverChecksum { .. } | Self::XorChecksum { .. } | Self::Crc16 { .. }
        )
    }
}

/// Result type for raw-data decoding
pub type DecodeResult<T> = Result<T, DecodeError>;
