//! COPPER raw-data blocks
//!
//! Fixed-layout reader, packer, data reduction, checksums and consistency
//! checks for the word-oriented block format produced by the COPPER readout
//! boards.
//!
//! # Design Principles (KISS)
//! - Views borrow `&[u32]`; nothing is copied to read a block
//! - Every offset derived from a length field is bound-checked
//! - A bad block is a `DecodeError` for that block, never a process exit

mod block;
mod check;
mod checksum;
mod copper;
mod error;
pub mod layout;
mod packer;
mod reduce;

pub use block::RawDataBlock;
pub use check::{
    check_b2l_consistency, fill_top_block_raw_header, B2lSummary, SequenceChecker, SequenceIssue,
    TopBlockFill, TopBlockInfo,
};
pub use checksum::{calc_crc16, calc_xor_checksum};
pub use copper::{B2lFeeHeader, CopperBlock, ValidationReport};
pub use error::{DecodeError, DecodeResult};
pub use packer::{pack_detector_buf, refresh_checksums, RawCopperPackerInfo};
pub use reduce::{copy_reduced, copy_reduced_data, reduced_nwords, ReducedBlock};
