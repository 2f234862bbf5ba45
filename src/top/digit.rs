//! Calibrated TOP hits

use serde::{Deserialize, Serialize};

/// Calibration status bits of a [`TopDigit`]
pub mod status {
    pub const TIME_BASE: u16 = 0x01;
    pub const CHANNEL_T0: u16 = 0x02;
    pub const MODULE_T0: u16 = 0x04;
    pub const COMMON_T0: u16 = 0x08;
    pub const ASIC_SHIFT: u16 = 0x10;
    pub const TIME_WALK: u16 = 0x20;

    pub const FULLY_CALIBRATED: u16 =
        TIME_BASE | CHANNEL_T0 | MODULE_T0 | COMMON_T0 | ASIC_SHIFT | TIME_WALK;
}

/// Hit classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HitQuality {
    #[default]
    Good,
    Junk,
    CalPulse,
}

/// One calibrated hit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopDigit {
    pub module_id: u8,
    /// Channel within the module (0..511)
    pub channel: u32,
    /// Pixel within the module (1..512)
    pub pixel_id: u32,
    /// Calibrated time in ns
    pub time: f64,
    pub time_error: f64,
    /// Leading edge in samples, relative to the reference window
    pub raw_time: f64,
    pub pulse_height: i16,
    /// FWHM in ns
    pub pulse_width: f64,
    pub integral: u16,
    pub first_window: u16,
    pub quality: HitQuality,
    pub status: u16,
}

impl TopDigit {
    pub fn has_status(&self, bits: u16) -> bool {
        self.status & bits == bits
    }

    pub fn add_status(&mut self, bits: u16) {
        self.status |= bits;
    }

    pub fn is_calibrated(&self) -> bool {
        self.has_status(status::FULLY_CALIBRATED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_bits() {
        let mut d = TopDigit::default();
        assert!(!d.has_status(status::TIME_BASE));
        d.add_status(status::TIME_BASE | status::CHANNEL_T0);
        assert!(d.has_status(status::TIME_BASE));
        assert!(d.has_status(status::CHANNEL_T0));
        assert!(!d.has_status(status::TIME_BASE | status::MODULE_T0));
        assert!(!d.is_calibrated());
        d.add_status(status::FULLY_CALIBRATED);
        assert!(d.is_calibrated());
        assert_eq!(status::FULLY_CALIBRATED, 0x3F);
    }
}
