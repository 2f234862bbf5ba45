//! TOP detector unpacker
//!
//! Decodes every filled FINESSE slot of a TOP COPPER block with the
//! production debug decoder and, when a converter is attached, turns the raw
//! digits into calibrated digits. Slot-level problems are recorded on the
//! event and never stop the other slots.

use std::sync::Arc;

use tracing::{debug, warn};

use super::converter::RawDigitConverter;
use super::mapping::FrontEndMap;
use super::prod_debug::{constants, ProdDebugConfig, ProdDebugDecoder, UnpackError};
use crate::common::PipelineResult;
use crate::event::EventStore;
use crate::rawdata::layout::{detector, raw_header};
use crate::rawdata::CopperBlock;
use crate::registry::DetectorUnpacker;

/// Unpacker for TOP blocks
#[derive(Debug, Clone)]
pub struct TopUnpacker {
    decoder: ProdDebugDecoder,
    map: Arc<FrontEndMap>,
    converter: Option<RawDigitConverter>,
    detector_id: u32,
}

impl TopUnpacker {
    pub fn new(config: ProdDebugConfig, map: Arc<FrontEndMap>) -> Self {
        Self {
            decoder: ProdDebugDecoder::new(config),
            map,
            converter: None,
            detector_id: detector::TOP,
        }
    }

    /// Register under a different detector prefix
    pub fn with_detector_id(mut self, detector_id: u32) -> Self {
        self.detector_id = detector_id & raw_header::DETECTOR_MASK;
        self
    }

    /// Also convert raw digits into calibrated digits
    pub fn with_converter(mut self, converter: RawDigitConverter) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn converter(&self) -> Option<&RawDigitConverter> {
        self.converter.as_ref()
    }

    fn unpack_slot(&self, slot: usize, buffer: &[u32], event: &mut EventStore) {
        match ProdDebugDecoder::data_format(buffer) {
            Some(constants::PRODUCTION_DEBUG_FORMAT) => {}
            Some(format) => {
                event.add_issue(slot, UnpackError::UnknownFormat(format));
                return;
            }
            None => {
                event.add_issue(
                    slot,
                    UnpackError::BufferTooShort {
                        needed: 1,
                        available: 0,
                    },
                );
                return;
            }
        }

        let decoded = match self.decoder.decode(buffer) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    event = event.event_number,
                    node = format_args!("0x{:08x}", event.node_id),
                    slot,
                    error = %e,
                    "TOP slot not decoded"
                );
                event.add_issue(slot, e);
                return;
            }
        };
        for w in decoded.warnings {
            debug!(event = event.event_number, slot, warning = %w, "TOP unpack warning");
            event.add_issue(slot, w);
        }

        let scrod = decoded.header.scrod_id;
        if let Some(converter) = &self.converter {
            match self.map.get(scrod) {
                Some(mapping) => event
                    .top_digits
                    .extend(decoded.digits.iter().map(|raw| converter.convert(raw, mapping))),
                None => event.add_issue(slot, UnpackError::NoFrontEndMap(scrod)),
            }
        }

        event.top_raw_digits.extend(decoded.digits);
        event.top_waveforms.extend(decoded.waveforms);
        event.top_slow_data.extend(decoded.slow_data);
    }
}

impl DetectorUnpacker for TopUnpacker {
    fn name(&self) -> &'static str {
        "TOP"
    }

    fn detector_id(&self) -> u32 {
        self.detector_id
    }

    fn begin_run(&mut self, exp: u32, run: u32) -> PipelineResult<()> {
        if let Some(converter) = self.converter.as_mut() {
            converter.begin_run(exp as i32, run as i32)?;
        }
        Ok(())
    }

    fn unpack(&self, block: &CopperBlock<'_>, event: &mut EventStore) -> PipelineResult<()> {
        for slot in block.filled_slots() {
            let buffer = block.detector_buffer(slot)?;
            self.unpack_slot(slot, buffer, event);
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn DetectorUnpacker> {
        Box::new(self.clone())
    }
}
