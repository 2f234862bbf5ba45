//! Checksums used by the COPPER block format
//!
//! - XOR fold over 32-bit words (driver checksum, RawTrailer checksum)
//! - CRC16 CCITT-FALSE over the B2L FEE header and detector payload

use crc::{Crc, CRC_16_IBM_3740};

/// CRC16 with polynomial 0x1021 and initial value 0xFFFF
const B2L_CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// XOR-fold all words of a contiguous range
#[inline]
pub fn calc_xor_checksum(words: &[u32]) -> u32 {
    words.iter().fold(0, |acc, &w| acc ^ w)
}

/// CRC16 over 32-bit words, each fed most significant byte first
pub fn calc_crc16(words: &[u32]) -> u16 {
    let mut digest = B2L_CRC16.digest();
    for w in words {
        digest.update(&w.to_be_bytes());
    }
    digest.finalize()
}
