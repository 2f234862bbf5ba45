//! Build complete COPPER blocks from detector payloads
//!
//! Used by the emulator and by tests. The produced block satisfies every
//! check in `CopperBlock::validate`.

use serde::{Deserialize, Serialize};

use super::checksum::{calc_crc16, calc_xor_checksum};
use super::layout::{b2l, copper, pack_exp_run, raw_header, raw_trailer, MAX_FINESSE, MIN_BLOCK_NWORDS};

/// Field values written into a packed block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCopperPackerInfo {
    pub exp_num: u32,
    pub run_num: u32,
    pub subrun_num: u32,
    pub eve_num: u32,
    pub node_id: u32,
    pub tt_ctime: u32,
    pub tt_utime: u32,
    pub b2l_ctime: u32,
    pub trg_type: u32,
    pub truncation_mask: u32,
    pub type_of_data: u32,
    pub subsystem_id: u32,
    pub crate_id: u32,
    pub slot_id: u32,
}

impl RawCopperPackerInfo {
    fn ctime_trgtype(&self) -> u32 {
        ((self.tt_ctime & raw_header::TTCTIME_MASK) << raw_header::TTCTIME_SHIFT)
            | (self.trg_type & raw_header::TRGTYPE_MASK)
    }

    fn exp_run(&self) -> u32 {
        pack_exp_run(self.exp_num, self.run_num, self.subrun_num)
    }
}

/// Pack up to four detector payloads into one COPPER block
///
/// `None` or an empty payload leaves the slot empty (length field 0).
pub fn pack_detector_buf(
    detector: [Option<&[u32]>; MAX_FINESSE],
    info: &RawCopperPackerInfo,
) -> Vec<u32> {
    let finesse_len: Vec<usize> = detector
        .iter()
        .map(|d| match d {
            Some(p) if !p.is_empty() => p.len() + b2l::SIZE_B2L_FRAMING,
            _ => 0,
        })
        .collect();
    let channel_sum: usize = finesse_len.iter().sum();
    let nwords = MIN_BLOCK_NWORDS + channel_sum;

    let mut buf = Vec::with_capacity(nwords);

    // RawHeader
    let version = raw_header::NOT_REDUCED_FLAG | raw_header::FORMAT_VERSION;
    buf.push(nwords as u32);
    buf.push(
        raw_header::MAGIC_WORD
            | (version << raw_header::FORMAT_VERSION_SHIFT)
            | raw_header::RAWHEADER_NWORDS as u32,
    );
    buf.push(info.exp_run());
    buf.push(info.eve_num);
    buf.push(info.ctime_trgtype());
    buf.push(info.tt_utime);
    buf.push(info.node_id);
    buf.push(
        (info.truncation_mask << raw_header::TRUNC_MASK_SHIFT)
            | (info.type_of_data & raw_header::DATATYPE_MASK),
    );
    let mut offset = raw_header::RAWHEADER_NWORDS + copper::SIZE_COPPER_HEADER;
    for len in &finesse_len {
        buf.push(offset as u32);
        offset += len;
    }

    // COPPER header
    buf.push(copper::COPPER_MAGIC_DRV_HEADER);
    buf.push(info.eve_num);
    buf.push(info.subsystem_id);
    buf.push(info.crate_id);
    buf.push(info.slot_id);
    buf.push(0);
    buf.push(0);
    buf.push(copper::COPPER_MAGIC_FPGA_HEADER);
    buf.push((channel_sum + copper::DATA_LENGTH_OVERHEAD) as u32);
    for len in &finesse_len {
        buf.push(*len as u32);
    }

    // FINESSE buffers
    let eve16 = info.eve_num & b2l::B2LHSLB_EVE_MASK;
    for payload in detector.iter().flatten().filter(|p| !p.is_empty()) {
        buf.push(b2l::B2LHSLB_HEADER_MAGIC | eve16);
        let fee_start = buf.len();
        buf.push(info.ctime_trgtype());
        buf.push(info.eve_num);
        buf.push(info.tt_utime);
        buf.push(info.exp_run());
        buf.push(info.b2l_ctime);
        buf.extend_from_slice(payload);
        let crc = calc_crc16(&buf[fee_start..]) as u32;
        buf.push((eve16 << b2l::FEE_TRAILER_EVE_SHIFT) | crc);
        buf.push(b2l::B2LHSLB_TRAILER_MAGIC);
    }

    // COPPER trailer
    buf.push(copper::COPPER_MAGIC_FPGA_TRAILER);
    let driver_chksum = calc_xor_checksum(&buf[raw_header::RAWHEADER_NWORDS..]);
    buf.push(driver_chksum);
    buf.push(copper::COPPER_MAGIC_DRV_TRAILER);

    // RawTrailer
    let xor = calc_xor_checksum(&buf);
    buf.push(xor);
    buf.push(raw_trailer::MAGIC_WORD_TERM_TRAILER);

    debug_assert_eq!(buf.len(), nwords);
    buf
}

/// Recompute both block checksums after the block was modified in place
pub fn refresh_checksums(words: &mut [u32]) {
    let n = words.len();
    if n < MIN_BLOCK_NWORDS {
        return;
    }
    let drv_end = n - raw_trailer::RAWTRAILER_NWORDS - copper::SIZE_COPPER_DRIVER_TRAILER;
    words[drv_end] = calc_xor_checksum(&words[raw_header::RAWHEADER_NWORDS..drv_end]);
    let trl = n - raw_trailer::RAWTRAILER_NWORDS;
    words[trl + raw_trailer::POS_CHKSUM] = calc_xor_checksum(&words[..trl]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rawdata::CopperBlock;

    fn info() -> RawCopperPackerInfo {
        RawCopperPackerInfo {
            exp_num: 12,
            run_num: 3456,
            subrun_num: 2,
            eve_num: 77,
            node_id: 0x0401_0002,
            tt_ctime: 99,
            tt_utime: 1_600_000_000,
            b2l_ctime: 1234,
            trg_type: 3,
            truncation_mask: 1,
            type_of_data: 2,
            subsystem_id: 4,
            crate_id: 1,
            slot_id: 8,
        }
    }

    #[test]
    fn test_roundtrip_all_slots() {
        let a: Vec<u32> = (0..5).collect();
        let b: Vec<u32> = (100..103).collect();
        let c: Vec<u32> = vec![];
        let d: Vec<u32> = (200..220).collect();
        let words = pack_detector_buf([Some(&a[..]), Some(&b[..]), Some(&c[..]), Some(&d[..])], &info());
        let block = CopperBlock::new(&words).unwrap();

        assert!(block.validate().is_ok(), "{:?}", block.validate());
        assert_eq!(block.detector_buffer(0).unwrap(), &a[..]);
        assert_eq!(block.detector_buffer(1).unwrap(), &b[..]);
        assert!(block.detector_buffer(2).unwrap().is_empty());
        assert_eq!(block.detector_buffer(3).unwrap(), &d[..]);
        assert_eq!(block.truncation_mask(), 1);
        assert_eq!(block.data_type(), 2);
        assert_eq!(block.trigger_type(), 3);
    }

    #[test]
    fn test_offsets_chain() {
        let a: Vec<u32> = vec![1; 7];
        let b: Vec<u32> = vec![2; 3];
        let c: Vec<u32> = vec![3; 11];
        let d: Vec<u32> = vec![4; 1];
        let words = pack_detector_buf([Some(&a[..]), Some(&b[..]), Some(&c[..]), Some(&d[..])], &info());
        let block = CopperBlock::new(&words).unwrap();
        for slot in 1..4 {
            assert_eq!(
                block.finesse_offset(slot).unwrap(),
                block.finesse_offset(slot - 1).unwrap() + block.finesse_nwords(slot - 1).unwrap()
            );
        }
    }

    #[test]
    fn test_length_sum_matches_declared() {
        let a: Vec<u32> = vec![9; 13];
        let c: Vec<u32> = vec![8; 4];
        let words = pack_detector_buf([Some(&a[..]), None, Some(&c[..]), None], &info());
        let block = CopperBlock::new(&words).unwrap();
        let sum: usize = (0..4).map(|s| block.finesse_nwords(s).unwrap()).sum();
        assert_eq!(sum + MIN_BLOCK_NWORDS, block.nwords());
        assert_eq!(sum + copper::DATA_LENGTH_OVERHEAD, block.data_length());
    }

    #[test]
    fn test_empty_block() {
        let words = pack_detector_buf([None, None, None, None], &info());
        assert_eq!(words.len(), MIN_BLOCK_NWORDS);
        let block = CopperBlock::new(&words).unwrap();
        assert!(block.check_copper_magic());
        assert!(block.validate().is_ok());
        assert_eq!(block.filled_slots().count(), 0);
    }

    #[test]
    fn test_refresh_checksums() {
        let a: Vec<u32> = vec![5; 4];
        let mut words = pack_detector_buf([Some(&a[..]), None, None, None], &info());
        words[raw_header::POS_NODE_ID] = 0xCAFE;
        assert!(!CopperBlock::new(&words).unwrap().validate().is_ok());
        refresh_checksums(&mut words);
        assert!(CopperBlock::new(&words).unwrap().validate().is_ok());
    }
}
