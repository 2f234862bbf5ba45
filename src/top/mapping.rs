//! Front-end and channel mapping for the TOP counter
//!
//! Each of the 16 modules is read out by four boardstacks, one SCROD each.
//! A SCROD delivers 128 channels (4 carriers × 4 ASICs × 8 channels).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const NUM_MODULES: u8 = 16;
pub const BOARDSTACKS_PER_MODULE: u8 = 4;
pub const CHANNELS_PER_SCROD: u32 = 128;
pub const CHANNELS_PER_MODULE: u32 = 512;
pub const CHANNELS_PER_ASIC: u32 = 8;
pub const PIXEL_COLUMNS: u32 = 64;
pub const PIXEL_ROWS: u32 = 8;

/// Location of one SCROD in the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontEndMapping {
    pub scrod_id: u16,
    /// Module (slot) id, 1-based
    pub module_id: u8,
    /// Boardstack within the module, 0..3
    pub boardstack: u8,
}

/// SCROD id → (module, boardstack)
#[derive(Debug, Clone, Default)]
pub struct FrontEndMap {
    by_scrod: HashMap<u16, FrontEndMapping>,
}

impl FrontEndMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map with consecutive SCROD ids: SCROD `s` (1-based) sits in module
    /// `(s - 1) / 4 + 1`, boardstack `(s - 1) % 4`
    pub fn default_layout() -> Self {
        let scrods = NUM_MODULES as u16 * BOARDSTACKS_PER_MODULE as u16;
        let entries = (1..=scrods).map(|s| FrontEndMapping {
            scrod_id: s,
            module_id: ((s - 1) / BOARDSTACKS_PER_MODULE as u16 + 1) as u8,
            boardstack: ((s - 1) % BOARDSTACKS_PER_MODULE as u16) as u8,
        });
        Self::from_entries(entries)
    }

    pub fn from_entries(entries: impl IntoIterator<Item = FrontEndMapping>) -> Self {
        let by_scrod = entries.into_iter().map(|m| (m.scrod_id, m)).collect();
        Self { by_scrod }
    }

    pub fn get(&self, scrod_id: u16) -> Option<&FrontEndMapping> {
        self.by_scrod.get(&scrod_id)
    }

    pub fn len(&self) -> usize {
        self.by_scrod.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_scrod.is_empty()
    }
}

/// Channel within a module (0..511)
pub fn module_channel(boardstack: u8, carrier: u8, asic: u8, asic_channel: u8) -> u32 {
    boardstack as u32 * CHANNELS_PER_SCROD
        + carrier as u32 * 32
        + asic as u32 * CHANNELS_PER_ASIC
        + asic_channel as u32
}

/// ASIC number within a module (0..63)
pub fn module_asic(channel: u32) -> u32 {
    channel / CHANNELS_PER_ASIC
}

/// Pixel id (1..512) of a module channel
///
/// Boardstack `b` covers columns `16 b .. 16 b + 15`; within a boardstack
/// channels fill rows of 16 columns.
pub fn pixel_id(channel: u32) -> u32 {
    let boardstack = channel / CHANNELS_PER_SCROD;
    let local = channel % CHANNELS_PER_SCROD;
    let row = local / 16;
    let col = boardstack * 16 + local % 16;
    row * PIXEL_COLUMNS + col + 1
}

/// Inverse of [`pixel_id`]
pub fn channel_of_pixel(pixel: u32) -> Option<u32> {
    if pixel == 0 || pixel > PIXEL_COLUMNS * PIXEL_ROWS {
        return None;
    }
    let p = pixel - 1;
    let row = p / PIXEL_COLUMNS;
    let col = p % PIXEL_COLUMNS;
    Some((col / 16) * CHANNELS_PER_SCROD + row * 16 + col % 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let map = FrontEndMap::default_layout();
        assert_eq!(map.len(), 64);
        let m = map.get(1).unwrap();
        assert_eq!((m.module_id, m.boardstack), (1, 0));
        let m = map.get(8).unwrap();
        assert_eq!((m.module_id, m.boardstack), (2, 3));
        let m = map.get(64).unwrap();
        assert_eq!((m.module_id, m.boardstack), (16, 3));
        assert!(map.get(0).is_none());
        assert!(map.get(65).is_none());
    }

    #[test]
    fn test_module_channel() {
        assert_eq!(module_channel(0, 0, 0, 0), 0);
        assert_eq!(module_channel(1, 2, 3, 4), 128 + 64 + 24 + 4);
        assert_eq!(module_channel(3, 3, 3, 7), 511);
        assert_eq!(module_asic(511), 63);
    }

    #[test]
    fn test_pixel_mapping_is_bijective() {
        let mut seen = vec![false; 513];
        for ch in 0..CHANNELS_PER_MODULE {
            let p = pixel_id(ch);
            assert!((1..=512).contains(&p));
            assert!(!seen[p as usize], "pixel {} mapped twice", p);
            seen[p as usize] = true;
            assert_eq!(channel_of_pixel(p), Some(ch));
        }
        assert_eq!(channel_of_pixel(0), None);
        assert_eq!(channel_of_pixel(513), None);
    }

    #[test]
    fn test_pixel_columns() {
        assert_eq!(pixel_id(0), 1);
        assert_eq!(pixel_id(15), 16);
        assert_eq!(pixel_id(16), 65);
        assert_eq!(pixel_id(128), 17);
        assert_eq!(pixel_id(511), 512);
    }
}
