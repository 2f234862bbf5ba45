//! Data reduction of COPPER blocks
//!
//! Reduction keeps the RawHeader and RawTrailer, drops the COPPER header
//! and trailer, and strips the B2L framing of every filled slot down to
//! three words:
//! ```text
//! ┌──────────────────────────────┐
//! │  RawHeader          12 words │  length, offsets rewritten, flag cleared
//! ├──────────────────────────────┤
//! │  slot A..D          variable │  HSLB header, B2L ctime, payload, FEE trailer
//! ├──────────────────────────────┤
//! │  RawTrailer          2 words │  XOR checksum recomputed
//! └──────────────────────────────┘
//! ```

use super::block::RawDataBlock;
use super::checksum::calc_xor_checksum;
use super::copper::{CopperBlock, ValidationReport};
use super::error::{DecodeError, DecodeResult};
use super::layout::{b2l, raw_header, raw_trailer, reduced, MAX_FINESSE};

/// Length of a block after reduction
pub fn reduced_nwords(block: &CopperBlock) -> DecodeResult<usize> {
    if block.is_reduced() {
        return Err(DecodeError::AlreadyReduced);
    }
    let mut nwords = reduced::MIN_BLOCK_NWORDS;
    for slot in 0..MAX_FINESSE {
        let n = block.finesse_nwords(slot)?;
        if n == 0 {
            continue;
        }
        if n < b2l::SIZE_B2L_FRAMING {
            return Err(DecodeError::FinesseTooShort { slot, nwords: n });
        }
        nwords += n - reduced::DROPPED_PER_SLOT;
    }
    Ok(nwords)
}

/// Append the reduced form of one block to `out`
///
/// Returns the number of words appended. On error nothing is appended.
pub fn copy_reduced(block: &CopperBlock, out: &mut Vec<u32>) -> DecodeResult<usize> {
    let nwords = reduced_nwords(block)?;

    let mut slots: [&[u32]; MAX_FINESSE] = Default::default();
    for (slot, buf) in slots.iter_mut().enumerate() {
        *buf = block.finesse_buffer(slot)?;
        if !buf.is_empty() {
            check_hslb_magic(buf)?;
        }
    }

    let words = block.words();
    let start = out.len();
    out.reserve(nwords);
    out.extend_from_slice(&words[..raw_header::RAWHEADER_NWORDS]);

    let mut offsets = [0usize; MAX_FINESSE];
    for (slot, buf) in slots.iter().enumerate() {
        offsets[slot] = out.len() - start;
        if buf.is_empty() {
            continue;
        }
        let fee_trailer = buf.len() - b2l::SIZE_B2LHSLB_TRAILER - b2l::SIZE_B2LFEE_TRAILER;
        out.push(buf[0]);
        out.extend_from_slice(&buf[b2l::SIZE_B2LHSLB_HEADER + b2l::POS_B2L_CTIME..fee_trailer]);
        out.push(buf[fee_trailer + b2l::POS_CHKSUM_B2LFEE]);
    }
    out.extend_from_slice(&words[words.len() - raw_trailer::RAWTRAILER_NWORDS..]);

    let dst = &mut out[start..];
    debug_assert_eq!(dst.len(), nwords);
    dst[raw_header::POS_NWORDS] = nwords as u32;
    dst[raw_header::POS_VERSION_HDRNWORDS] &=
        !(raw_header::NOT_REDUCED_FLAG << raw_header::FORMAT_VERSION_SHIFT);
    for (slot, offset) in offsets.iter().enumerate() {
        dst[raw_header::POS_OFFSET_FINESSE[slot]] = *offset as u32;
    }
    let trl = nwords - raw_trailer::RAWTRAILER_NWORDS;
    dst[trl + raw_trailer::POS_CHKSUM] = calc_xor_checksum(&dst[..trl]);

    Ok(nwords)
}

/// Reduce every block of a multi-event buffer into `out`
///
/// Blocks that are already reduced are copied unchanged. Returns the number
/// of words appended. On error `out` is left as it was.
pub fn copy_reduced_data(data: &RawDataBlock, out: &mut Vec<u32>) -> DecodeResult<usize> {
    let start = out.len();
    for n in 0..data.num_events() {
        let result = data.block(n).and_then(|block| {
            if block.is_reduced() {
                out.extend_from_slice(block.words());
                Ok(block.nwords())
            } else {
                copy_reduced(&block, out)
            }
        });
        if let Err(e) = result {
            out.truncate(start);
            return Err(e);
        }
    }
    Ok(out.len() - start)
}

fn check_hslb_magic(buf: &[u32]) -> DecodeResult<()> {
    let header = buf[0] & b2l::B2LHSLB_MAGIC_MASK;
    if header != b2l::B2LHSLB_HEADER_MAGIC {
        return Err(DecodeError::bad_magic("HSLB header", b2l::B2LHSLB_HEADER_MAGIC, header));
    }
    let trailer = buf[buf.len() - 1] & b2l::B2LHSLB_MAGIC_MASK;
    if trailer != b2l::B2LHSLB_TRAILER_MAGIC {
        return Err(DecodeError::bad_magic("HSLB trailer", b2l::B2LHSLB_TRAILER_MAGIC, trailer));
    }
    Ok(())
}

/// Read-only view over one reduced block
///
/// Slot boundaries come from the RawHeader offsets: a slot ends where the
/// next one starts, the last one at the RawTrailer.
#[derive(Debug, Clone, Copy)]
pub struct ReducedBlock<'a> {
    words: &'a [u32],
}

impl<'a> ReducedBlock<'a> {
    pub fn new(words: &'a [u32]) -> DecodeResult<Self> {
        if words.len() < reduced::MIN_BLOCK_NWORDS {
            return Err(DecodeError::TooShort {
                needed: reduced::MIN_BLOCK_NWORDS,
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
        let version = (words[raw_header::POS_VERSION_HDRNWORDS] & raw_header::FORMAT_VERSION_MASK)
            >> raw_header::FORMAT_VERSION_SHIFT;
        if version & raw_header::NOT_REDUCED_FLAG != 0 {
            return Err(DecodeError::NotReduced);
        }
        Ok(Self { words })
    }

    pub fn words(&self) -> &'a [u32] {
        self.words
    }

    pub fn nwords(&self) -> usize {
        self.words.len()
    }

    pub fn exp_run_subrun_word(&self) -> u32 {
        self.words[raw_header::POS_EXP_RUN_NO]
    }

    pub fn event_number(&self) -> u32 {
        self.words[raw_header::POS_EVE_NO]
    }

    pub fn node_id(&self) -> u32 {
        self.words[raw_header::POS_NODE_ID]
    }

    fn trailer_pos(&self) -> usize {
        self.nwords() - raw_trailer::RAWTRAILER_NWORDS
    }

    /// Offset of a slot as stored in the RawHeader
    pub fn finesse_offset(&self, slot: usize) -> DecodeResult<usize> {
        if slot >= MAX_FINESSE {
            return Err(DecodeError::InvalidSlot(slot));
        }
        Ok(self.words[raw_header::POS_OFFSET_FINESSE[slot]] as usize)
    }

    /// Length of a slot including its three framing words, 0 when empty
    pub fn finesse_nwords(&self, slot: usize) -> DecodeResult<usize> {
        let offset = self.finesse_offset(slot)?;
        let end = if slot + 1 < MAX_FINESSE {
            self.finesse_offset(slot + 1)?
        } else {
            self.trailer_pos()
        };
        if offset < raw_header::RAWHEADER_NWORDS || end < offset || end > self.trailer_pos() {
            return Err(DecodeError::out_of_bounds(
                "reduced slot",
                offset,
                end.saturating_sub(offset),
                self.trailer_pos(),
            ));
        }
        let nwords = end - offset;
        if nwords != 0 && nwords < reduced::SIZE_SLOT_FRAMING {
            return Err(DecodeError::FinesseTooShort { slot, nwords });
        }
        Ok(nwords)
    }

    pub fn finesse_buffer(&self, slot: usize) -> DecodeResult<&'a [u32]> {
        let nwords = self.finesse_nwords(slot)?;
        let offset = self.finesse_offset(slot)?;
        Ok(&self.words[offset..offset + nwords])
    }

    pub fn has_finesse(&self, slot: usize) -> bool {
        matches!(self.finesse_nwords(slot), Ok(n) if n > 0)
    }

    /// Detector payload of a slot
    pub fn detector_buffer(&self, slot: usize) -> DecodeResult<&'a [u32]> {
        let buf = self.finesse_buffer(slot)?;
        if buf.is_empty() {
            return Ok(buf);
        }
        Ok(&buf[reduced::SIZE_SLOT_HEADER..buf.len() - reduced::SIZE_SLOT_TRAILER])
    }

    pub fn b2l_ctime(&self, slot: usize) -> DecodeResult<Option<u32>> {
        let buf = self.finesse_buffer(slot)?;
        Ok(buf.get(reduced::POS_B2L_CTIME).copied())
    }

    /// CRC16 carried over from the FEE trailer
    pub fn b2l_crc16(&self, slot: usize) -> DecodeResult<Option<u16>> {
        let buf = self.finesse_buffer(slot)?;
        Ok(buf.last().map(|w| (w & b2l::FEE_TRAILER_CRC_MASK) as u16))
    }

    pub fn calc_trailer_checksum(&self) -> u32 {
        calc_xor_checksum(&self.words[..self.trailer_pos()])
    }

    pub fn trailer_checksum(&self) -> u32 {
        self.words[self.trailer_pos() + raw_trailer::POS_CHKSUM]
    }

    /// Offsets, slot framing, RawTrailer checksum and terminator
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        match self.finesse_offset(0) {
            Ok(first) if first != raw_header::RAWHEADER_NWORDS => {
                report.errors.push(DecodeError::OffsetMismatch {
                    slot: 0,
                    stored: first,
                    computed: raw_header::RAWHEADER_NWORDS,
                });
            }
            Ok(_) => {}
            Err(e) => report.errors.push(e),
        }
        for slot in 0..MAX_FINESSE {
            match self.finesse_buffer(slot) {
                Ok(buf) if !buf.is_empty() => {
                    let magic = buf[reduced::POS_B2LHSLB_HEADER] & b2l::B2LHSLB_MAGIC_MASK;
                    if magic != b2l::B2LHSLB_HEADER_MAGIC {
                        report.errors.push(DecodeError::bad_magic(
                            "HSLB header",
                            b2l::B2LHSLB_HEADER_MAGIC,
                            magic,
                        ));
                    }
                }
                Ok(_) => {}
                Err(e) => report.errors.push(e),
            }
        }

        let stored = self.trailer_checksum();
        let computed = self.calc_trailer_checksum();
        if stored != computed {
            report.errors.push(DecodeError::XorChecksum { stored, computed });
        }
        let term = self.words[self.trailer_pos() + raw_trailer::POS_TERM_WORD];
        if term != raw_trailer::MAGIC_WORD_TERM_TRAILER {
            report.errors.push(DecodeError::bad_magic(
                "RawTrailer terminator",
                raw_trailer::MAGIC_WORD_TERM_TRAILER,
                term,
            ));
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rawdata::layout::copper;
    use crate::rawdata::packer::{pack_detector_buf, refresh_checksums, RawCopperPackerInfo};

    fn info(eve_num: u32) -> RawCopperPackerInfo {
        RawCopperPackerInfo {
            exp_num: 7,
            run_num: 120,
            subrun_num: 1,
            eve_num,
            node_id: 0x0300_0005,
            tt_ctime: 4321,
            tt_utime: 1_700_000_000,
            b2l_ctime: 0xABCD,
            trg_type: 1,
            ..Default::default()
        }
    }

    fn payloads() -> [Vec<u32>; MAX_FINESSE] {
        [
            (0..6).collect(),
            (100..104).collect(),
            Vec::new(),
            (200..230).collect(),
        ]
    }

    fn packed(eve_num: u32) -> Vec<u32> {
        let p = payloads();
        pack_detector_buf(
            [Some(&p[0][..]), Some(&p[1][..]), Some(&p[2][..]), Some(&p[3][..])],
            &info(eve_num),
        )
    }

    #[test]
    fn test_reduced_block_layout() {
        let words = packed(42);
        let block = CopperBlock::new(&words).unwrap();
        assert!(!block.is_reduced());

        let p = payloads();
        let expected: usize = reduced::MIN_BLOCK_NWORDS
            + p.iter()
                .filter(|d| !d.is_empty())
                .map(|d| d.len() + reduced::SIZE_SLOT_FRAMING)
                .sum::<usize>();
        assert_eq!(reduced_nwords(&block).unwrap(), expected);
        assert_eq!(
            expected,
            words.len()
                - copper::SIZE_COPPER_HEADER
                - copper::SIZE_COPPER_TRAILER
                - 3 * reduced::DROPPED_PER_SLOT
        );

        // Appends after whatever is already in the output
        let mut out = vec![0xDEAD_BEEF];
        assert_eq!(copy_reduced(&block, &mut out).unwrap(), expected);
        assert_eq!(out.len(), 1 + expected);
        assert_eq!(out[0], 0xDEAD_BEEF);

        let reduced = ReducedBlock::new(&out[1..]).unwrap();
        assert!(reduced.validate().is_ok(), "{:?}", reduced.validate());
        assert_eq!(reduced.trailer_checksum(), reduced.calc_trailer_checksum());
        assert_eq!(reduced.event_number(), 42);
        assert_eq!(reduced.exp_run_subrun_word(), block.exp_run_subrun_word());
        assert_eq!(reduced.node_id(), block.node_id());

        let a = raw_header::RAWHEADER_NWORDS;
        let b = a + p[0].len() + reduced::SIZE_SLOT_FRAMING;
        let c = b + p[1].len() + reduced::SIZE_SLOT_FRAMING;
        assert_eq!(reduced.finesse_offset(0).unwrap(), a);
        assert_eq!(reduced.finesse_offset(1).unwrap(), b);
        assert_eq!(reduced.finesse_offset(2).unwrap(), c);
        // Empty slot C sits where slot D begins
        assert_eq!(reduced.finesse_offset(3).unwrap(), c);
        assert!(!reduced.has_finesse(2));

        for slot in 0..MAX_FINESSE {
            assert_eq!(
                reduced.detector_buffer(slot).unwrap(),
                block.detector_buffer(slot).unwrap(),
                "slot {slot}"
            );
        }
        assert_eq!(reduced.b2l_ctime(0).unwrap(), Some(0xABCD));
        assert_eq!(reduced.b2l_ctime(2).unwrap(), None);
        let (stored, _) = block.b2l_crc16(3).unwrap();
        assert_eq!(reduced.b2l_crc16(3).unwrap(), Some(stored));
    }

    #[test]
    fn test_reduced_flag_is_cleared() {
        let words = packed(1);
        let block = CopperBlock::new(&words).unwrap();
        let mut out = Vec::new();
        copy_reduced(&block, &mut out).unwrap();

        let version_word = out[raw_header::POS_VERSION_HDRNWORDS];
        assert_eq!(
            version_word,
            words[raw_header::POS_VERSION_HDRNWORDS]
                & !(raw_header::NOT_REDUCED_FLAG << raw_header::FORMAT_VERSION_SHIFT)
        );

        // The reduced block is long enough to wrap as a COPPER block, which
        // then reports itself as reduced and refuses a second reduction
        let again = CopperBlock::new(&out).unwrap();
        assert!(again.is_reduced());
        assert_eq!(reduced_nwords(&again), Err(DecodeError::AlreadyReduced));

        assert!(matches!(
            ReducedBlock::new(&words),
            Err(DecodeError::NotReduced)
        ));
    }

    #[test]
    fn test_bad_hslb_magic_leaves_output_untouched() {
        let mut words = packed(3);
        let block = CopperBlock::new(&words).unwrap();
        let offset = block.finesse_offset(1).unwrap();
        let len = block.finesse_nwords(1).unwrap();
        words[offset + len - 1] = 0x1234_0000;
        refresh_checksums(&mut words);

        let block = CopperBlock::new(&words).unwrap();
        let mut out = vec![1, 2, 3];
        let err = copy_reduced(&block, &mut out).unwrap_err();
        assert!(matches!(err, DecodeError::BadMagic { what: "HSLB trailer", .. }));
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn test_reduced_checksum_detects_corruption() {
        let words = packed(9);
        let mut out = Vec::new();
        copy_reduced(&CopperBlock::new(&words).unwrap(), &mut out).unwrap();
        out[raw_header::RAWHEADER_NWORDS + 4] ^= 0x10;

        let reduced = ReducedBlock::new(&out).unwrap();
        let report = reduced.validate();
        assert!(matches!(report.first(), Some(DecodeError::XorChecksum { .. })));
    }

    #[test]
    fn test_copy_reduced_data_multi_event() {
        let mut buffer = packed(10);
        buffer.extend(packed(11));
        let data = RawDataBlock::scan(&buffer).unwrap();
        assert_eq!(data.num_events(), 2);

        let mut out = Vec::new();
        let total = copy_reduced_data(&data, &mut out).unwrap();
        assert_eq!(total, out.len());

        let first_len = out[raw_header::POS_NWORDS] as usize;
        let first = ReducedBlock::new(&out[..first_len]).unwrap();
        let second = ReducedBlock::new(&out[first_len..]).unwrap();
        assert_eq!(first.event_number(), 10);
        assert_eq!(second.event_number(), 11);
        assert!(second.validate().is_ok());

        // Reduced input passes through unchanged
        let again = RawDataBlock::scan(&out).unwrap();
        let mut copy = Vec::new();
        copy_reduced_data(&again, &mut copy).unwrap();
        assert_eq!(copy, out);
    }
}
