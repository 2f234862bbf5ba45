//! Raw TOP hits as delivered by the front-end feature extraction

use serde::{Deserialize, Serialize};

/// Samples per ASIC storage window
pub const WINDOW_SIZE: u32 = 64;

/// Error flags set by the unpacker
pub mod error_flags {
    pub const HEAD_MAGIC: u16 = 0x01;
    pub const TAIL_MAGIC: u16 = 0x02;
    pub const HIT_MAGIC: u16 = 0x04;
    pub const HIT_CHECKSUM: u16 = 0x08;
}

/// One feature-extracted hit
///
/// Times are in samples; values are ADC counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDigit {
    pub scrod_id: u16,
    pub carrier: u8,
    pub asic: u8,
    pub asic_channel: u8,
    pub asic_window: u16,
    pub last_write_addr: u16,
    pub tfine: u8,
    pub sample_rise: u8,
    pub dsamp_peak: u8,
    pub dsamp_fall: u8,
    pub value_peak: i16,
    pub value_rise0: i16,
    pub value_rise1: i16,
    pub value_fall0: i16,
    pub value_fall1: i16,
    pub integral: u16,
    pub revo9_counter: u16,
    pub phase: u8,
    pub error_flags: u16,
    /// Whether the hit came with a waveform segment
    pub has_waveform: bool,
}

impl RawDigit {
    /// Channel number within the SCROD (0..127)
    pub fn scrod_channel(&self) -> u32 {
        self.carrier as u32 * 32 + self.asic as u32 * 8 + self.asic_channel as u32
    }

    pub fn sample_fall(&self) -> i32 {
        self.sample_rise as i32 + self.dsamp_peak as i32 + self.dsamp_fall as i32
    }

    pub fn sample_peak(&self) -> i32 {
        self.sample_rise as i32 + self.dsamp_peak as i32
    }

    fn cfd_level(&self) -> f64 {
        self.value_peak as f64 / 2.0
    }

    /// Leading edge time in samples at half of the peak value
    pub fn cfd_leading_time(&self) -> f64 {
        let dy = self.value_rise1 as f64 - self.value_rise0 as f64;
        if dy == 0.0 {
            return self.sample_rise as f64;
        }
        self.sample_rise as f64 + (self.cfd_level() - self.value_rise0 as f64) / dy
    }

    /// Falling edge time in samples at half of the peak value
    pub fn cfd_falling_time(&self) -> f64 {
        let dy = self.value_fall1 as f64 - self.value_fall0 as f64;
        if dy == 0.0 {
            return self.sample_fall() as f64;
        }
        self.sample_fall() as f64 + (self.cfd_level() - self.value_fall0 as f64) / dy
    }

    /// Leading edge time error in samples for the given pedestal RMS
    pub fn cfd_leading_time_error(&self, rms_noise: f64) -> f64 {
        self.time_error_coefficient(self.value_rise0 as f64, self.value_rise1 as f64) * rms_noise
    }

    /// Falling edge time error in samples for the given pedestal RMS
    pub fn cfd_falling_time_error(&self, rms_noise: f64) -> f64 {
        self.time_error_coefficient(self.value_fall0 as f64, self.value_fall1 as f64) * rms_noise
    }

    fn time_error_coefficient(&self, y1: f64, y2: f64) -> f64 {
        let dy = y2 - y1;
        if dy == 0.0 {
            return 0.0;
        }
        let ym = self.cfd_level();
        let a1 = 1.0 / dy;
        let a2 = (ym - y2) / (dy * dy);
        let a3 = (y1 - ym) / (dy * dy);
        (a1 * a1 / 4.0 + a2 * a2 + a3 * a3).sqrt()
    }

    /// Pulse width (FWHM) in samples
    pub fn fwhm(&self) -> f64 {
        self.cfd_falling_time() - self.cfd_leading_time()
    }

    /// Whether the feature-extracted values bracket the half-peak level
    pub fn is_fe_valid(&self) -> bool {
        let level = self.cfd_level();
        if self.value_peak <= 0 {
            return false;
        }
        if self.value_rise0 >= self.value_rise1 {
            return false;
        }
        if level < self.value_rise0 as f64 || level > self.value_rise1 as f64 {
            return false;
        }
        if self.value_fall0 <= self.value_fall1 {
            return false;
        }
        if level > self.value_fall0 as f64 || level < self.value_fall1 as f64 {
            return false;
        }
        true
    }

    /// Whether the pulse runs past the last window before the storage wraps
    pub fn is_at_window_discontinuity(&self, storage_depth: u32) -> bool {
        if storage_depth == 0 {
            return false;
        }
        let last_sample = self.sample_fall() + 1;
        if last_sample < WINDOW_SIZE as i32 {
            return false;
        }
        self.asic_window as u32 % storage_depth == storage_depth - 1
    }

    pub fn is_ok(&self) -> bool {
        self.error_flags == 0
    }
}
