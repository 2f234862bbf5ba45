//! Zero-copy reader for one COPPER block
//!
//! `CopperBlock` borrows the words of exactly one block and exposes typed
//! accessors for the RawHeader, the COPPER header/trailer, the FINESSE
//! buffers and the RawTrailer. FINESSE offsets are derived from the
//! cumulative channel length fields and bound-checked before any slice is
//! handed out.

use super::checksum::{calc_crc16, calc_xor_checksum};
use super::error::{DecodeError, DecodeResult};
use super::layout::{b2l, copper, raw_header, raw_trailer, unpack_exp_run, MAX_FINESSE, MIN_BLOCK_NWORDS};

/// B2L FEE header fields of one FINESSE slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct B2lFeeHeader {
    /// Trigger timing ctime (27 bits)
    pub tt_ctime: u32,
    /// Trigger type (4 bits)
    pub trigger_type: u32,
    /// Event number sent by the trigger timing distribution
    pub tag: u32,
    /// Unix time
    pub tt_utime: u32,
    /// Exp/run/subrun word, same layout as in the RawHeader
    pub exp_run: u32,
    /// B2L ctime
    pub b2l_ctime: u32,
}

impl B2lFeeHeader {
    /// Parse the 5 FEE header words
    pub fn from_words(words: &[u32]) -> DecodeResult<Self> {
        if words.len() < b2l::SIZE_B2LFEE_HEADER {
            return Err(DecodeError::TooShort {
                needed: b2l::SIZE_B2LFEE_HEADER,
                available: words.len(),
            });
        }
        let ctime_type = words[b2l::POS_TT_CTIME_TYPE];
        Ok(Self {
            tt_ctime: (ctime_type >> raw_header::TTCTIME_SHIFT) & raw_header::TTCTIME_MASK,
            trigger_type: ctime_type & raw_header::TRGTYPE_MASK,
            tag: words[b2l::POS_TT_TAG],
            tt_utime: words[b2l::POS_TT_UTIME],
            exp_run: words[b2l::POS_EXP_RUN],
            b2l_ctime: words[b2l::POS_B2L_CTIME],
        })
    }

    /// (exp, run, subrun)
    pub fn exp_run_subrun(&self) -> (u32, u32, u32) {
        unpack_exp_run(self.exp_run)
    }
}

/// All problems found in one block
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<DecodeError>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// First error, if any
    pub fn first(&self) -> Option<&DecodeError> {
        self.errors.first()
    }

    pub fn into_result(self) -> DecodeResult<()> {
        match self.errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Read-only view over one COPPER block
#[derive(Debug, Clone, Copy)]
pub struct CopperBlock<'a> {
    words: &'a [u32],
}

impl<'a> CopperBlock<'a> {
    /// Wrap exactly one block
    ///
    /// The declared length (`POS_NWORDS`) must equal the buffer length.
    pub fn new(words: &'a [u32]) -> DecodeResult<Self> {
        if words.len() < MIN_BLOCK_NWORDS {
            return Err(DecodeError::TooShort {
                needed: MIN_BLOCK_NWORDS,
                available: words.len(),
            });
        }
        let declared = words[raw_header::POS_NWORDS] as usize;
        if declared != words.len() {
            return Err(DecodeError::LengthMismatch {
                declared,
                actual: words.len(),
            });
        }
        Ok(Self { words })
    }

    /// Underlying words
    pub fn words(&self) -> &'a [u32] {
        self.words
    }

    // ===== RawHeader =====

    pub fn nwords(&self) -> usize {
        self.words.len()
    }

    pub fn header_nwords(&self) -> usize {
        (self.words[raw_header::POS_VERSION_HDRNWORDS] & raw_header::HDR_NWORDS_MASK) as usize
    }

    pub fn format_version(&self) -> u32 {
        (self.words[raw_header::POS_VERSION_HDRNWORDS] & raw_header::FORMAT_VERSION_MASK)
            >> raw_header::FORMAT_VERSION_SHIFT
    }

    /// Whether the not-reduced flag of the version byte is cleared
    pub fn is_reduced(&self) -> bool {
        self.format_version() & raw_header::NOT_REDUCED_FLAG == 0
    }

    pub fn exp_run_subrun_word(&self) -> u32 {
        self.words[raw_header::POS_EXP_RUN_NO]
    }

    pub fn exp_no(&self) -> u32 {
        unpack_exp_run(self.exp_run_subrun_word()).0
    }

    pub fn run_no(&self) -> u32 {
        unpack_exp_run(self.exp_run_subrun_word()).1
    }

    pub fn subrun_no(&self) -> u32 {
        unpack_exp_run(self.exp_run_subrun_word()).2
    }

    pub fn event_number(&self) -> u32 {
        self.words[raw_header::POS_EVE_NO]
    }

    pub fn tt_ctime(&self) -> u32 {
        (self.words[raw_header::POS_TTCTIME_TRGTYPE] >> raw_header::TTCTIME_SHIFT)
            & raw_header::TTCTIME_MASK
    }

    pub fn trigger_type(&self) -> u32 {
        self.words[raw_header::POS_TTCTIME_TRGTYPE] & raw_header::TRGTYPE_MASK
    }

    pub fn tt_utime(&self) -> u32 {
        self.words[raw_header::POS_TTUTIME]
    }

    pub fn node_id(&self) -> u32 {
        self.words[raw_header::POS_NODE_ID]
    }

    /// Detector prefix of the node id (see [`layout::detector`](super::layout::detector))
    pub fn detector_id(&self) -> u32 {
        self.node_id() & raw_header::DETECTOR_MASK
    }

    pub fn data_type(&self) -> u32 {
        self.words[raw_header::POS_TRUNC_MASK_DATATYPE] & raw_header::DATATYPE_MASK
    }

    pub fn truncation_mask(&self) -> u32 {
        self.words[raw_header::POS_TRUNC_MASK_DATATYPE] >> raw_header::TRUNC_MASK_SHIFT
    }

    // ===== COPPER header =====

    fn copper_word(&self, pos: usize) -> u32 {
        self.words[raw_header::RAWHEADER_NWORDS + pos]
    }

    fn copper_trailer_pos(&self) -> usize {
        self.nwords() - raw_trailer::RAWTRAILER_NWORDS - copper::SIZE_COPPER_TRAILER
    }

    pub fn copper_counter(&self) -> u32 {
        self.copper_word(copper::POS_EVE_NUM_COPPER)
    }

    pub fn subsystem_id(&self) -> u32 {
        self.copper_word(copper::POS_SUBSYSTEM_ID)
    }

    pub fn crate_id(&self) -> u32 {
        self.copper_word(copper::POS_CRATE_ID)
    }

    pub fn slot_id(&self) -> u32 {
        self.copper_word(copper::POS_SLOT_ID)
    }

    /// Declared COPPER data length (FPGA header + channels + FPGA trailer)
    pub fn data_length(&self) -> usize {
        self.copper_word(copper::POS_DATA_LENGTH) as usize
    }

    // ===== FINESSE slots =====

    /// Declared length of a FINESSE slot including its B2L framing, 0 if empty
    pub fn finesse_nwords(&self, slot: usize) -> DecodeResult<usize> {
        if slot >= MAX_FINESSE {
            return Err(DecodeError::InvalidSlot(slot));
        }
        Ok(self.copper_word(copper::POS_CH_DATA_LENGTH[slot]) as usize)
    }

    /// Number of detector payload words in a slot (length minus B2L framing)
    pub fn detector_nwords(&self, slot: usize) -> DecodeResult<usize> {
        let nwords = self.finesse_nwords(slot)?;
        if nwords == 0 {
            return Ok(0);
        }
        nwords
            .checked_sub(b2l::SIZE_B2L_FRAMING)
            .ok_or(DecodeError::FinesseTooShort { slot, nwords })
    }

    /// Word offset of a FINESSE slot inside the block
    ///
    /// Slot A starts right after the COPPER header; every following slot
    /// starts where the previous one ends.
    pub fn finesse_offset(&self, slot: usize) -> DecodeResult<usize> {
        if slot >= MAX_FINESSE {
            return Err(DecodeError::InvalidSlot(slot));
        }
        let mut offset = raw_header::RAWHEADER_NWORDS + copper::SIZE_COPPER_HEADER;
        for prev in 0..slot {
            offset += self.finesse_nwords(prev)?;
        }
        let limit = self.copper_trailer_pos();
        if offset > limit {
            return Err(DecodeError::out_of_bounds(
                "FINESSE offset",
                offset,
                0,
                limit,
            ));
        }
        Ok(offset)
    }

    /// Whole FINESSE buffer of a slot (B2L framing included)
    ///
    /// Empty slots yield an empty slice.
    pub fn finesse_buffer(&self, slot: usize) -> DecodeResult<&'a [u32]> {
        let offset = self.finesse_offset(slot)?;
        let len = self.finesse_nwords(slot)?;
        let limit = self.copper_trailer_pos();
        if offset + len > limit {
            return Err(DecodeError::out_of_bounds("FINESSE buffer", offset, len, limit));
        }
        Ok(&self.words[offset..offset + len])
    }

    /// Detector payload of a slot (B2L framing stripped)
    pub fn detector_buffer(&self, slot: usize) -> DecodeResult<&'a [u32]> {
        let buf = self.finesse_buffer(slot)?;
        if buf.is_empty() {
            return Ok(buf);
        }
        let n = self.detector_nwords(slot)?;
        let start = b2l::SIZE_B2LHSLB_HEADER + b2l::SIZE_B2LFEE_HEADER;
        Ok(&buf[start..start + n])
    }

    /// Whether a slot carries data
    pub fn has_finesse(&self, slot: usize) -> bool {
        matches!(self.finesse_nwords(slot), Ok(n) if n > 0)
    }

    /// Slots that carry data
    pub fn filled_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_FINESSE).filter(move |&s| self.has_finesse(s))
    }

    /// FEE header of a slot
    pub fn b2l_fee_header(&self, slot: usize) -> DecodeResult<B2lFeeHeader> {
        let buf = self.finesse_buffer(slot)?;
        if buf.len() < b2l::SIZE_B2L_FRAMING {
            return Err(DecodeError::FinesseTooShort {
                slot,
                nwords: buf.len(),
            });
        }
        B2lFeeHeader::from_words(&buf[b2l::SIZE_B2LHSLB_HEADER..])
    }

    // ===== Magic words and checksums =====

    /// Compare the four COPPER magic words against their constants
    pub fn check_copper_magic(&self) -> bool {
        let trailer = self.copper_trailer_pos();
        self.copper_word(copper::POS_MAGIC_COPPER_1) == copper::COPPER_MAGIC_DRV_HEADER
            && self.copper_word(copper::POS_MAGIC_COPPER_2) == copper::COPPER_MAGIC_FPGA_HEADER
            && self.words[trailer + copper::POS_MAGIC_COPPER_3] == copper::COPPER_MAGIC_FPGA_TRAILER
            && self.words[trailer + copper::POS_MAGIC_COPPER_4] == copper::COPPER_MAGIC_DRV_TRAILER
    }

    /// XOR of the words between the RawHeader and the driver trailer
    pub fn calc_driver_checksum(&self) -> u32 {
        let end = self.nwords() - raw_trailer::RAWTRAILER_NWORDS - copper::SIZE_COPPER_DRIVER_TRAILER;
        calc_xor_checksum(&self.words[raw_header::RAWHEADER_NWORDS..end])
    }

    pub fn driver_checksum(&self) -> u32 {
        self.words[self.copper_trailer_pos() + copper::POS_CHKSUM_COPPER]
    }

    /// XOR of every word before the RawTrailer
    pub fn calc_trailer_checksum(&self) -> u32 {
        calc_xor_checksum(&self.words[..self.nwords() - raw_trailer::RAWTRAILER_NWORDS])
    }

    pub fn trailer_checksum(&self) -> u32 {
        self.words[self.nwords() - raw_trailer::RAWTRAILER_NWORDS + raw_trailer::POS_CHKSUM]
    }

    pub fn trailer_term_word(&self) -> u32 {
        self.words[self.nwords() - raw_trailer::RAWTRAILER_NWORDS + raw_trailer::POS_TERM_WORD]
    }

    /// Stored and recomputed CRC16 of a slot's FEE header + payload
    pub fn b2l_crc16(&self, slot: usize) -> DecodeResult<(u16, u16)> {
        let buf = self.finesse_buffer(slot)?;
        if buf.len() < b2l::SIZE_B2L_FRAMING {
            return Err(DecodeError::FinesseTooShort {
                slot,
                nwords: buf.len(),
            });
        }
        let fee_trailer = buf.len() - b2l::SIZE_B2LHSLB_TRAILER - b2l::SIZE_B2LFEE_TRAILER;
        let stored = (buf[fee_trailer + b2l::POS_CHKSUM_B2LFEE] & b2l::FEE_TRAILER_CRC_MASK) as u16;
        let computed = calc_crc16(&buf[b2l::SIZE_B2LHSLB_HEADER..fee_trailer]);
        Ok((stored, computed))
    }

    /// Run every structural and integrity check and collect the failures
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();
        let errors = &mut report.errors;

        // Total length against the channel lengths
        let mut channel_sum = 0usize;
        for slot in 0..MAX_FINESSE {
            channel_sum += self.copper_word(copper::POS_CH_DATA_LENGTH[slot]) as usize;
        }
        let expected_total = MIN_BLOCK_NWORDS + channel_sum;
        if expected_total != self.nwords() {
            errors.push(DecodeError::TotalLengthMismatch {
                declared: self.nwords(),
                expected: expected_total,
            });
        }
        let expected_data = channel_sum + copper::DATA_LENGTH_OVERHEAD;
        if self.data_length() != expected_data {
            errors.push(DecodeError::DataLengthMismatch {
                declared: self.data_length(),
                expected: expected_data,
            });
        }

        // Magic words
        let trailer = self.copper_trailer_pos();
        let magics = [
            ("driver header", raw_header::RAWHEADER_NWORDS + copper::POS_MAGIC_COPPER_1, copper::COPPER_MAGIC_DRV_HEADER),
            ("FPGA header", raw_header::RAWHEADER_NWORDS + copper::POS_MAGIC_COPPER_2, copper::COPPER_MAGIC_FPGA_HEADER),
            ("FPGA trailer", trailer + copper::POS_MAGIC_COPPER_3, copper::COPPER_MAGIC_FPGA_TRAILER),
            ("driver trailer", trailer + copper::POS_MAGIC_COPPER_4, copper::COPPER_MAGIC_DRV_TRAILER),
        ];
        for (what, pos, expected) in magics {
            if self.words[pos] != expected {
                errors.push(DecodeError::bad_magic(what, expected, self.words[pos]));
            }
        }
        let version_magic = self.words[raw_header::POS_VERSION_HDRNWORDS] & raw_header::MAGIC_MASK;
        if version_magic != raw_header::MAGIC_WORD {
            errors.push(DecodeError::bad_magic(
                "RawHeader",
                raw_header::MAGIC_WORD,
                version_magic,
            ));
        }
        if self.trailer_term_word() != raw_trailer::MAGIC_WORD_TERM_TRAILER {
            errors.push(DecodeError::bad_magic(
                "RawTrailer",
                raw_trailer::MAGIC_WORD_TERM_TRAILER,
                self.trailer_term_word(),
            ));
        }

        // Checksums
        let computed = self.calc_driver_checksum();
        if computed != self.driver_checksum() {
            errors.push(DecodeError::DriverChecksum {
                stored: self.driver_checksum(),
                computed,
            });
        }
        let computed = self.calc_trailer_checksum();
        if computed != self.trailer_checksum() {
            errors.push(DecodeError::XorChecksum {
                stored: self.trailer_checksum(),
                computed,
            });
        }

        // Per-slot framing; skipped when the lengths are already inconsistent
        if expected_total == self.nwords() {
            for slot in 0..MAX_FINESSE {
                if let Err(e) = self.validate_finesse(slot) {
                    errors.push(e);
                }
            }
        }

        report
    }

    fn validate_finesse(&self, slot: usize) -> DecodeResult<()> {
        let buf = self.finesse_buffer(slot)?;
        if buf.is_empty() {
            return Ok(());
        }
        if buf.len() < b2l::SIZE_B2L_FRAMING {
            return Err(DecodeError::FinesseTooShort {
                slot,
                nwords: buf.len(),
            });
        }

        let stored_offset = self.words[raw_header::POS_OFFSET_FINESSE[slot]] as usize;
        let computed_offset = self.finesse_offset(slot)?;
        if stored_offset != computed_offset {
            return Err(DecodeError::OffsetMismatch {
                slot,
                stored: stored_offset,
                computed: computed_offset,
            });
        }

        let hslb_header = buf[0] & b2l::B2LHSLB_MAGIC_MASK;
        if hslb_header != b2l::B2LHSLB_HEADER_MAGIC {
            return Err(DecodeError::bad_magic(
                "HSLB header",
                b2l::B2LHSLB_HEADER_MAGIC,
                hslb_header,
            ));
        }
        let hslb_trailer = buf[buf.len() - 1] & b2l::B2LHSLB_MAGIC_MASK;
        if hslb_trailer != b2l::B2LHSLB_TRAILER_MAGIC {
            return Err(DecodeError::bad_magic(
                "HSLB trailer",
                b2l::B2LHSLB_TRAILER_MAGIC,
                hslb_trailer,
            ));
        }

        let (stored, computed) = self.b2l_crc16(slot)?;
        if stored != computed {
            return Err(DecodeError::Crc16 {
                slot,
                stored,
                computed,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rawdata::packer::{pack_detector_buf, RawCopperPackerInfo};

    fn info() -> RawCopperPackerInfo {
        RawCopperPackerInfo {
            exp_num: 3,
            run_num: 120,
            subrun_num: 1,
            eve_num: 42,
            node_id: 0x0400_0001,
            tt_ctime: 0x123_4567,
            tt_utime: 1_700_000_000,
            b2l_ctime: 0xABCD,
            trg_type: 1,
            truncation_mask: 0,
            type_of_data: 5,
            subsystem_id: 0x04,
            crate_id: 2,
            slot_id: 3,
        }
    }

    fn scenario_block() -> Vec<u32> {
        // Slot A length 10 words: 2 payload words + 8 framing
        let a = [0x1111_1111, 0x2222_2222];
        pack_detector_buf([Some(&a[..]), None, None, None], &info())
    }

    #[test]
    fn test_scenario_single_slot() {
        let words = scenario_block();
        let block = CopperBlock::new(&words).unwrap();

        assert_eq!(block.finesse_nwords(0).unwrap(), 10);
        assert_eq!(block.finesse_nwords(1).unwrap(), 0);
        assert_eq!(block.finesse_nwords(2).unwrap(), 0);
        assert_eq!(block.finesse_nwords(3).unwrap(), 0);
        assert_eq!(
            block.finesse_offset(1).unwrap(),
            block.finesse_offset(0).unwrap() + 10
        );
        assert!(block.check_copper_magic());
        assert!(block.validate().is_ok());
    }

    #[test]
    fn test_header_accessors() {
        let words = scenario_block();
        let block = CopperBlock::new(&words).unwrap();

        assert_eq!(block.exp_no(), 3);
        assert_eq!(block.run_no(), 120);
        assert_eq!(block.subrun_no(), 1);
        assert_eq!(block.event_number(), 42);
        assert_eq!(block.tt_ctime(), 0x123_4567);
        assert_eq!(block.trigger_type(), 1);
        assert_eq!(block.tt_utime(), 1_700_000_000);
        assert_eq!(block.node_id(), 0x0400_0001);
        assert_eq!(block.data_type(), 5);
        assert_eq!(block.truncation_mask(), 0);
        assert_eq!(block.subsystem_id(), 0x04);
        assert_eq!(block.crate_id(), 2);
        assert_eq!(block.slot_id(), 3);
        assert_eq!(block.copper_counter(), 42);
        assert_eq!(block.header_nwords(), raw_header::RAWHEADER_NWORDS);
    }

    #[test]
    fn test_detector_buffer() {
        let words = scenario_block();
        let block = CopperBlock::new(&words).unwrap();
        assert_eq!(block.detector_nwords(0).unwrap(), 2);
        assert_eq!(block.detector_buffer(0).unwrap(), &[0x1111_1111, 0x2222_2222]);
        assert!(block.detector_buffer(1).unwrap().is_empty());
        assert_eq!(block.filled_slots().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_fee_header() {
        let words = scenario_block();
        let block = CopperBlock::new(&words).unwrap();
        let fee = block.b2l_fee_header(0).unwrap();
        assert_eq!(fee.tag, 42);
        assert_eq!(fee.tt_ctime, 0x123_4567);
        assert_eq!(fee.b2l_ctime, 0xABCD);
        assert_eq!(fee.exp_run_subrun(), (3, 120, 1));
        assert!(block.b2l_fee_header(1).is_err());
    }

    #[test]
    fn test_invalid_slot() {
        let words = scenario_block();
        let block = CopperBlock::new(&words).unwrap();
        assert_eq!(block.finesse_nwords(4), Err(DecodeError::InvalidSlot(4)));
        assert_eq!(block.finesse_buffer(7), Err(DecodeError::InvalidSlot(7)));
    }

    #[test]
    fn test_each_magic_corruption_detected() {
        let words = scenario_block();
        let nwords = words.len();
        let trailer = nwords - 2 - 3;
        let positions = [12, 12 + 7, trailer, trailer + 2];
        for pos in positions {
            let mut bad = words.clone();
            bad[pos] ^= 0x1;
            let block = CopperBlock::new(&bad).unwrap();
            assert!(!block.check_copper_magic(), "corruption at {} not seen", pos);
        }
    }

    #[test]
    fn test_declared_length_mismatch() {
        let mut words = scenario_block();
        words.push(0);
        assert!(matches!(
            CopperBlock::new(&words),
            Err(DecodeError::LengthMismatch { .. })
        ));

        let words = scenario_block();
        assert!(matches!(
            CopperBlock::new(&words[..words.len() - 1]),
            Err(DecodeError::LengthMismatch { .. })
        ));
        assert!(matches!(
            CopperBlock::new(&words[..10]),
            Err(DecodeError::TooShort { .. })
        ));
    }

    #[test]
    fn test_oversized_channel_length_is_bounded() {
        let mut words = scenario_block();
        // Slot A claims far more words than the block holds
        words[12 + copper::POS_CH_A_DATA_LENGTH] = 10_000;
        let block = CopperBlock::new(&words).unwrap();
        assert!(matches!(
            block.finesse_buffer(0),
            Err(DecodeError::OutOfBounds { .. })
        ));
        assert!(matches!(
            block.finesse_offset(1),
            Err(DecodeError::OutOfBounds { .. })
        ));
        let report = block.validate();
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, DecodeError::TotalLengthMismatch { .. })));
    }

    #[test]
    fn test_checksum_errors_reported() {
        let mut words = scenario_block();
        let payload = 12 + 13 + 6;
        words[payload] ^= 0x8000_0000;
        let block = CopperBlock::new(&words).unwrap();
        let report = block.validate();
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, DecodeError::DriverChecksum { .. })));
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, DecodeError::XorChecksum { .. })));
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, DecodeError::Crc16 { slot: 0, .. })));
    }
}
