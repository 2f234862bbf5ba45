//! Word offsets and constants of the COPPER raw-data block
//!
//! Block structure (32-bit words):
//! ```text
//! ┌──────────────────────────────┐
//! │  RawHeader          12 words │
//! ├──────────────────────────────┤
//! │  COPPER header      13 words │  driver header (7) + FPGA header (6)
//! ├──────────────────────────────┤
//! │  FINESSE A..D       variable │  B2L framing (8) + detector payload
//! ├──────────────────────────────┤
//! │  COPPER trailer      3 words │  FPGA trailer (1) + driver trailer (2)
//! ├──────────────────────────────┤
//! │  RawTrailer          2 words │
//! └──────────────────────────────┘
//! ```

/// Number of FINESSE slots on one COPPER board (A..D)
pub const MAX_FINESSE: usize = 4;

/// Detector prefixes of the node id
pub mod detector {
    pub const SVD: u32 = 0x0100_0000;
    pub const CDC: u32 = 0x0200_0000;
    pub const TOP: u32 = 0x0300_0000;
    pub const ARICH: u32 = 0x0400_0000;
    pub const BECL: u32 = 0x0500_0000;
    pub const EECL: u32 = 0x0600_0000;
    pub const BKLM: u32 = 0x0700_0000;
    pub const EKLM: u32 = 0x0800_0000;
}

/// RawHeader word positions and field masks
pub mod raw_header {
    pub const POS_NWORDS: usize = 0;
    pub const POS_VERSION_HDRNWORDS: usize = 1;
    pub const POS_EXP_RUN_NO: usize = 2;
    pub const POS_EVE_NO: usize = 3;
    pub const POS_TTCTIME_TRGTYPE: usize = 4;
    pub const POS_TTUTIME: usize = 5;
    pub const POS_NODE_ID: usize = 6;
    pub const POS_TRUNC_MASK_DATATYPE: usize = 7;
    pub const POS_OFFSET_1ST_FINESSE: usize = 8;
    pub const POS_OFFSET_2ND_FINESSE: usize = 9;
    pub const POS_OFFSET_3RD_FINESSE: usize = 10;
    pub const POS_OFFSET_4TH_FINESSE: usize = 11;

    pub const RAWHEADER_NWORDS: usize = 12;

    // Version / header size word
    pub const MAGIC_WORD: u32 = 0x7F7F_0000;
    pub const MAGIC_MASK: u32 = 0xFFFF_0000;
    pub const FORMAT_VERSION_MASK: u32 = 0x0000_FF00;
    pub const FORMAT_VERSION_SHIFT: u32 = 8;
    pub const HDR_NWORDS_MASK: u32 = 0x0000_00FF;
    /// Set in the version byte when the block is in the unreduced format
    pub const NOT_REDUCED_FLAG: u32 = 0x80;
    pub const FORMAT_VERSION: u32 = 0x02;

    // Exp / run / subrun word
    pub const EXP_MASK: u32 = 0xFFC0_0000;
    pub const EXP_SHIFT: u32 = 22;
    pub const RUNNO_MASK: u32 = 0x003F_FF00;
    pub const RUNNO_SHIFT: u32 = 8;
    pub const SUBRUNNO_MASK: u32 = 0x0000_00FF;

    // Node id word: detector in the top byte, COPPER number below
    pub const DETECTOR_MASK: u32 = 0xFF00_0000;
    pub const COPPER_NUMBER_MASK: u32 = 0x00FF_FFFF;

    // Trigger time word
    pub const TTCTIME_MASK: u32 = 0x7FF_FFFF;
    pub const TTCTIME_SHIFT: u32 = 4;
    pub const TRGTYPE_MASK: u32 = 0xF;

    // Truncation mask / data type word
    pub const TRUNC_MASK_SHIFT: u32 = 31;
    pub const DATATYPE_MASK: u32 = 0x7FFF_FFFF;

    pub const POS_OFFSET_FINESSE: [usize; super::MAX_FINESSE] = [
        POS_OFFSET_1ST_FINESSE,
        POS_OFFSET_2ND_FINESSE,
        POS_OFFSET_3RD_FINESSE,
        POS_OFFSET_4TH_FINESSE,
    ];
}

/// COPPER header / trailer positions (relative to the end of the RawHeader)
pub mod copper {
    pub const POS_MAGIC_COPPER_1: usize = 0;
    pub const POS_EVE_NUM_COPPER: usize = 1;
    pub const POS_SUBSYSTEM_ID: usize = 2;
    pub const POS_CRATE_ID: usize = 3;
    pub const POS_SLOT_ID: usize = 4;
    pub const POS_MAGIC_COPPER_2: usize = 7;
    pub const POS_DATA_LENGTH: usize = 8;
    pub const POS_CH_A_DATA_LENGTH: usize = 9;
    pub const POS_CH_B_DATA_LENGTH: usize = 10;
    pub const POS_CH_C_DATA_LENGTH: usize = 11;
    pub const POS_CH_D_DATA_LENGTH: usize = 12;

    pub const SIZE_COPPER_DRIVER_HEADER: usize = 7;
    pub const SIZE_COPPER_HEADER: usize = 13;

    // Trailer, relative to its first word
    pub const POS_MAGIC_COPPER_3: usize = 0;
    pub const POS_CHKSUM_COPPER: usize = 1;
    pub const POS_MAGIC_COPPER_4: usize = 2;

    pub const SIZE_COPPER_DRIVER_TRAILER: usize = 2;
    pub const SIZE_COPPER_TRAILER: usize = 3;

    /// Driver header magic
    pub const COPPER_MAGIC_DRV_HEADER: u32 = 0x7FFF_0008;
    /// FPGA header magic
    pub const COPPER_MAGIC_FPGA_HEADER: u32 = 0xFFFF_FAFA;
    /// FPGA trailer magic
    pub const COPPER_MAGIC_FPGA_TRAILER: u32 = 0xFFFF_F5F5;
    /// Driver trailer magic
    pub const COPPER_MAGIC_DRV_TRAILER: u32 = 0x7FFF_0009;

    pub const POS_CH_DATA_LENGTH: [usize; super::MAX_FINESSE] = [
        POS_CH_A_DATA_LENGTH,
        POS_CH_B_DATA_LENGTH,
        POS_CH_C_DATA_LENGTH,
        POS_CH_D_DATA_LENGTH,
    ];

    /// Words counted by POS_DATA_LENGTH besides the channel lengths
    pub const DATA_LENGTH_OVERHEAD: usize = (SIZE_COPPER_HEADER - SIZE_COPPER_DRIVER_HEADER)
        + (SIZE_COPPER_TRAILER - SIZE_COPPER_DRIVER_TRAILER);
}

/// B2Link HSLB / FEE framing inside one FINESSE buffer
pub mod b2l {
    pub const SIZE_B2LHSLB_HEADER: usize = 1;
    pub const SIZE_B2LFEE_HEADER: usize = 5;
    pub const SIZE_B2LFEE_TRAILER: usize = 1;
    pub const SIZE_B2LHSLB_TRAILER: usize = 1;

    /// Framing words wrapped around a detector payload
    pub const SIZE_B2L_FRAMING: usize =
        SIZE_B2LHSLB_HEADER + SIZE_B2LFEE_HEADER + SIZE_B2LFEE_TRAILER + SIZE_B2LHSLB_TRAILER;

    pub const B2LHSLB_HEADER_MAGIC: u32 = 0xFFAA_0000;
    pub const B2LHSLB_TRAILER_MAGIC: u32 = 0xFF55_0000;
    pub const B2LHSLB_MAGIC_MASK: u32 = 0xFFFF_0000;
    pub const B2LHSLB_EVE_MASK: u32 = 0x0000_FFFF;

    // FEE header, relative to its first word
    pub const POS_TT_CTIME_TYPE: usize = 0;
    pub const POS_TT_TAG: usize = 1;
    pub const POS_TT_UTIME: usize = 2;
    pub const POS_EXP_RUN: usize = 3;
    pub const POS_B2L_CTIME: usize = 4;

    // FEE trailer
    pub const POS_CHKSUM_B2LFEE: usize = 0;
    pub const FEE_TRAILER_EVE_SHIFT: u32 = 16;
    pub const FEE_TRAILER_CRC_MASK: u32 = 0x0000_FFFF;
}

/// RawTrailer positions
pub mod raw_trailer {
    pub const POS_CHKSUM: usize = 0;
    pub const POS_TERM_WORD: usize = 1;

    pub const RAWTRAILER_NWORDS: usize = 2;

    pub const MAGIC_WORD_TERM_TRAILER: u32 = 0x7FFF_0005;
}

/// Reduced block format
///
/// The COPPER header and trailer are gone. Each filled slot keeps the HSLB
/// header, the B2L ctime word and the FEE trailer around its payload.
pub mod reduced {
    use super::b2l;

    pub const POS_B2LHSLB_HEADER: usize = 0;
    pub const POS_B2L_CTIME: usize = 1;

    pub const SIZE_SLOT_HEADER: usize = b2l::SIZE_B2LHSLB_HEADER + 1;
    pub const SIZE_SLOT_TRAILER: usize = b2l::SIZE_B2LFEE_TRAILER;
    pub const SIZE_SLOT_FRAMING: usize = SIZE_SLOT_HEADER + SIZE_SLOT_TRAILER;

    /// Words removed from every filled slot
    pub const DROPPED_PER_SLOT: usize = b2l::SIZE_B2L_FRAMING - SIZE_SLOT_FRAMING;

    pub const MIN_BLOCK_NWORDS: usize =
        super::raw_header::RAWHEADER_NWORDS + super::raw_trailer::RAWTRAILER_NWORDS;
}

/// Smallest possible block: no FINESSE data at all
pub const MIN_BLOCK_NWORDS: usize = raw_header::RAWHEADER_NWORDS
    + copper::SIZE_COPPER_HEADER
    + copper::SIZE_COPPER_TRAILER
    + raw_trailer::RAWTRAILER_NWORDS;

/// Pack exp / run / subrun into one header word
#[inline]
pub fn pack_exp_run(exp: u32, run: u32, subrun: u32) -> u32 {
    use raw_header::*;
    ((exp << EXP_SHIFT) & EXP_MASK) | ((run << RUNNO_SHIFT) & RUNNO_MASK) | (subrun & SUBRUNNO_MASK)
}

/// Split an exp / run / subrun word into its fields
#[inline]
pub fn unpack_exp_run(word: u32) -> (u32, u32, u32) {
    use raw_header::*;
    (
        (word & EXP_MASK) >> EXP_SHIFT,
        (word & RUNNO_MASK) >> RUNNO_SHIFT,
        word & SUBRUNNO_MASK,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_block_size() {
        assert_eq!(MIN_BLOCK_NWORDS, 30);
        assert_eq!(b2l::SIZE_B2L_FRAMING, 8);
        assert_eq!(copper::DATA_LENGTH_OVERHEAD, 7);
    }

    #[test]
    fn test_exp_run_packing() {
        let word = pack_exp_run(26, 1234, 7);
        assert_eq!(unpack_exp_run(word), (26, 1234, 7));

        // Fields are truncated to their widths
        let word = pack_exp_run(0x7FF, 0x7FFF, 0x1FF);
        assert_eq!(unpack_exp_run(word), (0x3FF, 0x3FFF, 0xFF));
    }
}
