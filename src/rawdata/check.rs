//! Event consistency and sequence checks
//!
//! The checks compare the RawHeader with the B2L FEE headers of every
//! filled FINESSE slot and follow the event/run sequence from block to
//! block. Violations are returned as `SequenceIssue` values; nothing here
//! aborts the stream.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::checksum::calc_xor_checksum;
use super::copper::{B2lFeeHeader, CopperBlock};
use super::error::{DecodeError, DecodeResult};
use super::layout::{raw_header, raw_trailer, unpack_exp_run, MAX_FINESSE};

/// A consistency problem in one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceIssue {
    /// RawHeader event number differs from the B2L tag of a slot
    HeaderTagMismatch { slot: usize, header: u32, tag: u32 },
    /// B2L tag of a slot differs from the first filled slot
    SlotTagMismatch { slot: usize, expected: u32, found: u32 },
    /// B2L trigger ctime differs between slots
    CtimeMismatch { slot: usize, expected: u32, found: u32 },
    /// B2L unix time differs between slots
    UtimeMismatch { slot: usize, expected: u32, found: u32 },
    /// B2L exp/run word differs between slots
    ExpRunMismatch { slot: usize, expected: u32, found: u32 },
    /// Event number did not increment by one inside a run
    EventGap { exp_run: u32, prev: u32, current: u32 },
    /// COPPER counter did not increment by one inside a run
    CounterGap { prev: u32, current: u32 },
    /// First event of a new run is not event 0
    RunStartNonZero { exp_run: u32, event: u32 },
}

impl std::fmt::Display for SequenceIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HeaderTagMismatch { slot, header, tag } => {
                write!(f, "slot {}: RawHeader event {} != B2L tag {}", slot, header, tag)
            }
            Self::SlotTagMismatch { slot, expected, found } => {
                write!(f, "slot {}: B2L tag {} != {}", slot, found, expected)
            }
            Self::CtimeMismatch { slot, expected, found } => {
                write!(f, "slot {}: ctime 0x{:x} != 0x{:x}", slot, found, expected)
            }
            Self::UtimeMismatch { slot, expected, found } => {
                write!(f, "slot {}: utime {} != {}", slot, found, expected)
            }
            Self::ExpRunMismatch { slot, expected, found } => {
                write!(f, "slot {}: exp/run 0x{:08x} != 0x{:08x}", slot, found, expected)
            }
            Self::EventGap { exp_run, prev, current } => {
                let (exp, run, sub) = unpack_exp_run(*exp_run);
                write!(
                    f,
                    "exp {} run {}.{}: event {} follows {}",
                    exp, run, sub, current, prev
                )
            }
            Self::CounterGap { prev, current } => {
                write!(f, "COPPER counter {} follows {}", current, prev)
            }
            Self::RunStartNonZero { exp_run, event } => {
                let (exp, run, sub) = unpack_exp_run(*exp_run);
                write!(f, "exp {} run {}.{} starts at event {}", exp, run, sub, event)
            }
        }
    }
}

/// B2L fields agreed on by every filled slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct B2lSummary {
    pub event_number: u32,
    pub exp_run: u32,
    pub tt_ctime: u32,
    pub trigger_type: u32,
    pub tt_utime: u32,
}

/// Compare the FEE headers of all filled slots against the first one
pub fn check_b2l_consistency(
    block: &CopperBlock<'_>,
    issues: &mut Vec<SequenceIssue>,
) -> DecodeResult<B2lSummary> {
    let mut first: Option<B2lFeeHeader> = None;
    for slot in 0..MAX_FINESSE {
        if !block.has_finesse(slot) {
            continue;
        }
        let fee = block.b2l_fee_header(slot)?;
        let Some(reference) = first else {
            first = Some(fee);
            continue;
        };
        if fee.tag != reference.tag {
            issues.push(SequenceIssue::SlotTagMismatch {
                slot,
                expected: reference.tag,
                found: fee.tag,
            });
        }
        if fee.tt_ctime != reference.tt_ctime {
            issues.push(SequenceIssue::CtimeMismatch {
                slot,
                expected: reference.tt_ctime,
                found: fee.tt_ctime,
            });
        }
        if fee.tt_utime != reference.tt_utime {
            issues.push(SequenceIssue::UtimeMismatch {
                slot,
                expected: reference.tt_utime,
                found: fee.tt_utime,
            });
        }
        if fee.exp_run != reference.exp_run {
            issues.push(SequenceIssue::ExpRunMismatch {
                slot,
                expected: reference.exp_run,
                found: fee.exp_run,
            });
        }
    }

    let fee = first.ok_or(DecodeError::NoFinesseData)?;
    Ok(B2lSummary {
        event_number: fee.tag,
        exp_run: fee.exp_run,
        tt_ctime: fee.tt_ctime,
        trigger_type: fee.trigger_type,
        tt_utime: fee.tt_utime,
    })
}

#[derive(Debug, Clone, Copy)]
struct PrevEvent {
    exp_run: u32,
    event: u32,
    copper_counter: u32,
}

/// Tracks the previous event to detect sequence gaps
///
/// Only meaningful when blocks are fed in stream order.
#[derive(Debug, Clone)]
pub struct SequenceChecker {
    prev: Option<PrevEvent>,
    /// Whether a new run must start at event 0
    pub require_run_start_zero: bool,
}

impl SequenceChecker {
    pub fn new() -> Self {
        Self {
            prev: None,
            require_run_start_zero: true,
        }
    }

    /// Forget the previous event (e.g. at run boundaries driven by the caller)
    pub fn reset(&mut self) {
        self.prev = None;
    }

    /// Follow the sequence with one event and report gaps
    pub fn advance(
        &mut self,
        exp_run: u32,
        event: u32,
        copper_counter: u32,
        issues: &mut Vec<SequenceIssue>,
    ) {
        match self.prev {
            Some(prev) if prev.exp_run == exp_run => {
                if event != prev.event.wrapping_add(1) {
                    issues.push(SequenceIssue::EventGap {
                        exp_run,
                        prev: prev.event,
                        current: event,
                    });
                }
                if copper_counter != prev.copper_counter.wrapping_add(1) {
                    issues.push(SequenceIssue::CounterGap {
                        prev: prev.copper_counter,
                        current: copper_counter,
                    });
                }
            }
            Some(prev) => {
                let (exp, run, sub) = unpack_exp_run(exp_run);
                let (prev_exp, prev_run, _) = unpack_exp_run(prev.exp_run);
                // A subrun change inside the same run keeps counting events
                let new_run = (exp, run) != (prev_exp, prev_run);
                debug!(exp, run, subrun = sub, new_run, "Exp/run/subrun changed");
                if new_run && self.require_run_start_zero && event != 0 {
                    issues.push(SequenceIssue::RunStartNonZero { exp_run, event });
                }
            }
            None => {}
        }
        self.prev = Some(PrevEvent {
            exp_run,
            event,
            copper_counter,
        });
    }

    /// Check a block whose RawHeader is already filled
    pub fn check(&mut self, block: &CopperBlock<'_>) -> DecodeResult<Vec<SequenceIssue>> {
        let mut issues = Vec::new();
        check_b2l_consistency(block, &mut issues)?;

        let header_event = block.event_number();
        for slot in block.filled_slots() {
            let tag = block.b2l_fee_header(slot)?.tag;
            if tag != header_event {
                issues.push(SequenceIssue::HeaderTagMismatch {
                    slot,
                    header: header_event,
                    tag,
                });
            }
        }

        self.advance(
            block.exp_run_subrun_word(),
            header_event,
            block.copper_counter(),
            &mut issues,
        );
        Ok(issues)
    }
}

impl Default for SequenceChecker {
    fn default() -> Self {
        Self::new()
    }
}

/// Values written into the first block of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopBlockInfo {
    pub node_id: u32,
    pub data_type: u32,
    pub truncation_mask: u32,
}

/// Outcome of filling a RawHeader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopBlockFill {
    /// Validated event number written into the header
    pub event_number: u32,
    /// Validated exp/run/subrun word written into the header
    pub exp_run: u32,
    pub issues: Vec<SequenceIssue>,
}

/// Fill the RawHeader of the first block in `words`
///
/// Event number, exp/run and trigger time are taken from the B2L FEE
/// headers after checking that all slots agree; node id, data type and
/// truncation mask come from `info`. The header is modified in place and
/// the RawTrailer XOR checksum is recomputed over the filled header.
pub fn fill_top_block_raw_header(
    words: &mut [u32],
    info: &TopBlockInfo,
    checker: &mut SequenceChecker,
) -> DecodeResult<TopBlockFill> {
    let Some(&first_len) = words.get(raw_header::POS_NWORDS) else {
        return Err(DecodeError::TooShort {
            needed: 1,
            available: 0,
        });
    };
    let nwords = first_len as usize;
    if nwords > words.len() {
        return Err(DecodeError::out_of_bounds("block", 0, nwords, words.len()));
    }

    let mut issues = Vec::new();
    let (summary, copper_counter) = {
        let block = CopperBlock::new(&words[..nwords])?;
        (check_b2l_consistency(&block, &mut issues)?, block.copper_counter())
    };

    checker.advance(summary.exp_run, summary.event_number, copper_counter, &mut issues);
    for issue in &issues {
        warn!(event = summary.event_number, %issue, "Inconsistent top block");
    }

    let header = &mut words[..raw_header::RAWHEADER_NWORDS];
    header[raw_header::POS_NODE_ID] = info.node_id;
    header[raw_header::POS_TRUNC_MASK_DATATYPE] = (info.truncation_mask
        << raw_header::TRUNC_MASK_SHIFT)
        | (info.data_type & raw_header::DATATYPE_MASK);
    header[raw_header::POS_EXP_RUN_NO] = summary.exp_run;
    header[raw_header::POS_EVE_NO] = summary.event_number;
    header[raw_header::POS_TTCTIME_TRGTYPE] = (summary.tt_ctime << raw_header::TTCTIME_SHIFT)
        | (summary.trigger_type & raw_header::TRGTYPE_MASK);
    header[raw_header::POS_TTUTIME] = summary.tt_utime;

    let trailer = nwords - raw_trailer::RAWTRAILER_NWORDS;
    words[trailer + raw_trailer::POS_CHKSUM] = calc_xor_checksum(&words[..trailer]);

    Ok(TopBlockFill {
        event_number: summary.event_number,
        exp_run: summary.exp_run,
        issues,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rawdata::layout::pack_exp_run;
    use crate::rawdata::packer::{pack_detector_buf, RawCopperPackerInfo};

    fn block_words(run: u32, eve: u32) -> Vec<u32> {
        subrun_block_words(run, 0, eve)
    }

    fn subrun_block_words(run: u32, subrun: u32, eve: u32) -> Vec<u32> {
        let a = [1u32, 2, 3];
        let b = [4u32, 5];
        let info = RawCopperPackerInfo {
            exp_num: 5,
            run_num: run,
            subrun_num: subrun,
            eve_num: eve,
            tt_ctime: 1000 + eve,
            tt_utime: 1_650_000_000,
            ..Default::default()
        };
        pack_detector_buf([Some(&a[..]), Some(&b[..]), None, None], &info)
    }

    #[test]
    fn test_consecutive_events_clean() {
        let mut checker = SequenceChecker::new();
        for eve in 0..5 {
            let words = block_words(1, eve);
            let block = CopperBlock::new(&words).unwrap();
            assert!(checker.check(&block).unwrap().is_empty());
        }
    }

    #[test]
    fn test_event_gap_detected() {
        let mut checker = SequenceChecker::new();
        let w0 = block_words(1, 10);
        let w1 = block_words(1, 12);
        checker.check(&CopperBlock::new(&w0).unwrap()).unwrap();
        let issues = checker.check(&CopperBlock::new(&w1).unwrap()).unwrap();
        assert!(issues.contains(&SequenceIssue::EventGap {
            exp_run: pack_exp_run(5, 1, 0),
            prev: 10,
            current: 12
        }));
        assert!(issues.contains(&SequenceIssue::CounterGap {
            prev: 10,
            current: 12
        }));
    }

    #[test]
    fn test_new_run_must_start_at_zero() {
        let mut checker = SequenceChecker::new();
        let w0 = block_words(1, 99);
        let w1 = block_words(2, 3);
        let w2 = block_words(3, 0);
        checker.check(&CopperBlock::new(&w0).unwrap()).unwrap();
        let issues = checker.check(&CopperBlock::new(&w1).unwrap()).unwrap();
        assert_eq!(
            issues,
            vec![SequenceIssue::RunStartNonZero {
                exp_run: pack_exp_run(5, 2, 0),
                event: 3
            }]
        );
        let issues = checker.check(&CopperBlock::new(&w2).unwrap()).unwrap();
        assert!(issues.is_empty());
    }

    #[test]
    fn test_subrun_change_continues_event_count() {
        let mut checker = SequenceChecker::new();
        let w0 = subrun_block_words(1, 0, 5);
        let w1 = subrun_block_words(1, 1, 6);
        checker.check(&CopperBlock::new(&w0).unwrap()).unwrap();
        let issues = checker.check(&CopperBlock::new(&w1).unwrap()).unwrap();
        assert!(issues.is_empty(), "{:?}", issues);

        // A new run number still has to start at event 0
        let w2 = subrun_block_words(2, 1, 7);
        let issues = checker.check(&CopperBlock::new(&w2).unwrap()).unwrap();
        assert_eq!(
            issues,
            vec![SequenceIssue::RunStartNonZero {
                exp_run: pack_exp_run(5, 2, 1),
                event: 7
            }]
        );
    }

    #[test]
    fn test_slot_tag_mismatch() {
        let mut words = block_words(1, 0);
        let block = CopperBlock::new(&words).unwrap();
        let slot_b = block.finesse_offset(1).unwrap();
        // Tag of slot B (HSLB header + TT_TAG)
        words[slot_b + 1 + 1] = 7;
        let block = CopperBlock::new(&words).unwrap();
        let issues = SequenceChecker::new().check(&block).unwrap();
        assert!(issues.contains(&SequenceIssue::SlotTagMismatch {
            slot: 1,
            expected: 0,
            found: 7
        }));
        assert!(issues.contains(&SequenceIssue::HeaderTagMismatch {
            slot: 1,
            header: 0,
            tag: 7
        }));
    }

    #[test]
    fn test_fill_top_block_raw_header() {
        let mut words = block_words(4, 0);
        // Wipe the fields that the fill step owns
        for pos in [
            raw_header::POS_EXP_RUN_NO,
            raw_header::POS_EVE_NO,
            raw_header::POS_NODE_ID,
            raw_header::POS_TRUNC_MASK_DATATYPE,
        ] {
            words[pos] = 0;
        }
        let mut second = block_words(4, 1);
        let len0 = words.len();
        words.append(&mut second);

        let info = TopBlockInfo {
            node_id: 0x0400_0007,
            data_type: 3,
            truncation_mask: 1,
        };
        let mut checker = SequenceChecker::new();
        let fill = fill_top_block_raw_header(&mut words, &info, &mut checker).unwrap();
        assert_eq!(fill.event_number, 0);
        assert!(fill.issues.is_empty());

        let block = CopperBlock::new(&words[..len0]).unwrap();
        assert!(block.validate().is_ok());
        assert_eq!(block.node_id(), 0x0400_0007);
        assert_eq!(block.data_type(), 3);
        assert_eq!(block.truncation_mask(), 1);
        assert_eq!(block.run_no(), 4);
        assert_eq!(block.exp_no(), 5);
        assert_eq!(block.event_number(), 0);
        assert_eq!(block.tt_ctime(), 1000);

        // Second block untouched
        let second = CopperBlock::new(&words[len0..]).unwrap();
        assert_eq!(second.event_number(), 1);
    }

    #[test]
    fn test_fill_without_finesse_data() {
        let info = RawCopperPackerInfo::default();
        let mut words = pack_detector_buf([None, None, None, None], &info);
        let result = fill_top_block_raw_header(
            &mut words,
            &TopBlockInfo {
                node_id: 1,
                data_type: 0,
                truncation_mask: 0,
            },
            &mut SequenceChecker::new(),
        );
        assert_eq!(result, Err(DecodeError::NoFinesseData));
    }
}
