//! Per-event output of the unpackers

use serde::Serialize;

use crate::rawdata::CopperBlock;
use crate::top::{RawDigit, RawWaveform, SlowData, TopDigit, UnpackError};

/// Unpack problem in one FINESSE slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotIssue {
    pub node_id: u32,
    pub slot: usize,
    pub error: UnpackError,
}

/// Everything unpacked from one COPPER block
#[derive(Debug, Clone, Default)]
pub struct EventStore {
    pub exp_number: u32,
    pub run_number: u32,
    pub subrun_number: u32,
    pub event_number: u32,
    pub node_id: u32,

    pub top_raw_digits: Vec<RawDigit>,
    pub top_waveforms: Vec<RawWaveform>,
    pub top_slow_data: Vec<SlowData>,
    pub top_digits: Vec<TopDigit>,

    /// Non-fatal unpack problems
    pub issues: Vec<SlotIssue>,
}

impl EventStore {
    /// Empty store stamped with the identity of `block`
    pub fn for_block(block: &CopperBlock<'_>) -> Self {
        Self {
            exp_number: block.exp_no(),
            run_number: block.run_no(),
            subrun_number: block.subrun_no(),
            event_number: block.event_number(),
            node_id: block.node_id(),
            ..Default::default()
        }
    }

    pub fn add_issue(&mut self, slot: usize, error: UnpackError) {
        self.issues.push(SlotIssue {
            node_id: self.node_id,
            slot,
            error,
        });
    }

    pub fn summary(&self) -> EventSummary {
        EventSummary {
            event_number: self.event_number,
            raw_digits: self.top_raw_digits.len(),
            digits: self.top_digits.len(),
            waveforms: self.top_waveforms.len(),
            issues: self.issues.len(),
        }
    }
}

/// Counts for one event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventSummary {
    pub event_number: u32,
    pub raw_digits: usize,
    pub digits: usize,
    pub waveforms: usize,
    pub issues: usize,
}
