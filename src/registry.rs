//! Detector unpacker registry
//!
//! Maps the detector prefix of a block's node id to the unpacker that
//! understands its FINESSE payloads.

use std::collections::BTreeMap;

use crate::common::{PipelineError, PipelineResult};
use crate::event::EventStore;
use crate::rawdata::CopperBlock;

/// Unpacker for the payloads of one detector
///
/// Run hooks default to doing nothing so an unpacker only overrides what it
/// needs.
pub trait DetectorUnpacker: Send + Sync {
    /// Name for logging
    fn name(&self) -> &'static str;

    /// Detector prefix handled (see `rawdata::layout::detector`)
    fn detector_id(&self) -> u32;

    /// Called at every run boundary before the first block of the run
    ///
    /// An error aborts the run.
    fn begin_run(&mut self, _exp: u32, _run: u32) -> PipelineResult<()> {
        Ok(())
    }

    /// Unpack one validated block into `event`
    ///
    /// An error quarantines the block.
    fn unpack(&self, block: &CopperBlock<'_>, event: &mut EventStore) -> PipelineResult<()>;

    /// Called after the last block of a run
    fn end_run(&mut self) {}

    /// Copy for another worker
    fn clone_box(&self) -> Box<dyn DetectorUnpacker>;
}

/// Unpackers keyed by detector prefix
#[derive(Default)]
pub struct UnpackerRegistry {
    unpackers: BTreeMap<u32, Box<dyn DetectorUnpacker>>,
}

impl Clone for UnpackerRegistry {
    fn clone(&self) -> Self {
        let unpackers = self
            .unpackers
            .iter()
            .map(|(id, u)| (*id, u.clone_box()))
            .collect();
        Self { unpackers }
    }
}

impl std::fmt::Debug for UnpackerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.unpackers.iter().map(|(id, u)| (format!("0x{:08x}", id), u.name())))
            .finish()
    }
}

impl UnpackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an unpacker, replacing any previous one for its detector
    pub fn register(&mut self, unpacker: Box<dyn DetectorUnpacker>) -> &mut Self {
        self.unpackers.insert(unpacker.detector_id(), unpacker);
        self
    }

    pub fn get(&self, detector_id: u32) -> Option<&dyn DetectorUnpacker> {
        self.unpackers.get(&detector_id).map(|u| u.as_ref())
    }

    pub fn len(&self) -> usize {
        self.unpackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unpackers.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.unpackers.values().map(|u| u.name()).collect()
    }

    pub fn begin_run(&mut self, exp: u32, run: u32) -> PipelineResult<()> {
        for unpacker in self.unpackers.values_mut() {
            unpacker.begin_run(exp, run)?;
        }
        Ok(())
    }

    pub fn end_run(&mut self) {
        for unpacker in self.unpackers.values_mut() {
            unpacker.end_run();
        }
    }

    /// Unpack a block with the unpacker registered for its detector
    pub fn unpack(&self, block: &CopperBlock<'_>) -> PipelineResult<EventStore> {
        let detector = block.detector_id();
        let unpacker = self
            .unpackers
            .get(&detector)
            .ok_or(PipelineError::NoUnpacker(detector))?;
        let mut event = EventStore::for_block(block);
        unpacker.unpack(block, &mut event)?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rawdata::layout::detector;
    use crate::rawdata::{pack_detector_buf, RawCopperPackerInfo};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Clone)]
    struct CountingUnpacker {
        runs: Arc<AtomicU32>,
    }

    impl DetectorUnpacker for CountingUnpacker {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn detector_id(&self) -> u32 {
            detector::CDC
        }

        fn begin_run(&mut self, _exp: u32, _run: u32) -> PipelineResult<()> {
            self.runs.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn unpack(&self, block: &CopperBlock<'_>, event: &mut EventStore) -> PipelineResult<()> {
            event.subrun_number = block.filled_slots().count() as u32;
            Ok(())
        }

        fn clone_box(&self) -> Box<dyn DetectorUnpacker> {
            Box::new(self.clone())
        }
    }

    fn block(node_id: u32) -> Vec<u32> {
        let payload = [1u32, 2, 3];
        let info = RawCopperPackerInfo {
            node_id,
            eve_num: 9,
            ..Default::default()
        };
        pack_detector_buf([Some(&payload[..]), Some(&payload[..]), None, None], &info)
    }

    #[test]
    fn test_dispatch_by_detector() {
        let runs = Arc::new(AtomicU32::new(0));
        let mut registry = UnpackerRegistry::new();
        registry.register(Box::new(CountingUnpacker { runs: runs.clone() }));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), vec!["counting"]);

        let words = block(detector::CDC | 0x12);
        let b = CopperBlock::new(&words).unwrap();
        let event = registry.unpack(&b).unwrap();
        assert_eq!(event.event_number, 9);
        assert_eq!(event.subrun_number, 2);

        let mut copy = registry.clone();
        copy.begin_run(1, 1).unwrap();
        registry.begin_run(1, 1).unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_unknown_detector() {
        let registry = UnpackerRegistry::new();
        let words = block(detector::ARICH);
        let b = CopperBlock::new(&words).unwrap();
        let err = registry.unpack(&b).unwrap_err();
        assert!(matches!(err, PipelineError::NoUnpacker(d) if d == detector::ARICH));
    }
}
