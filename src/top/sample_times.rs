//! Sample-to-time conversion for the IRSX ASIC
//!
//! The ASIC samples in blocks of 256 (four 64-sample windows), which span two
//! periods of the synchronisation clock. A time axis of 257 points gives the
//! time of every sample within one such block; the last point is the block
//! length.

use serde::{Deserialize, Serialize};

use super::calibration::CalibrationError;
use super::raw_digit::WINDOW_SIZE;

pub const NUM_SAMPLES: usize = 256;
/// Default synchronisation clock period in ns
pub const SYNC_TIME_BASE: f64 = 47.163878;

/// Time axis of one 256-sample block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleTimes {
    time_axis: Vec<f64>,
    calibrated: bool,
}

impl Default for SampleTimes {
    fn default() -> Self {
        Self::equidistant(SYNC_TIME_BASE)
    }
}

impl SampleTimes {
    /// Equidistant axis: 256 samples over `2 * sync_time_base`
    pub fn equidistant(sync_time_base: f64) -> Self {
        let step = 2.0 * sync_time_base / NUM_SAMPLES as f64;
        let time_axis = (0..=NUM_SAMPLES).map(|i| i as f64 * step).collect();
        Self {
            time_axis,
            calibrated: false,
        }
    }

    /// Calibrated axis; needs 257 strictly increasing points starting at 0
    pub fn calibrated(time_axis: Vec<f64>) -> Result<Self, CalibrationError> {
        if time_axis.len() != NUM_SAMPLES + 1 {
            return Err(CalibrationError::InvalidSampleTimes(format!(
                "expected {} points, got {}",
                NUM_SAMPLES + 1,
                time_axis.len()
            )));
        }
        if let Some(i) = time_axis.iter().position(|t| !t.is_finite()) {
            return Err(CalibrationError::InvalidSampleTimes(format!(
                "non-finite value {} at sample {}",
                time_axis[i], i
            )));
        }
        if time_axis[0] != 0.0 {
            return Err(CalibrationError::InvalidSampleTimes(format!(
                "axis starts at {} instead of 0",
                time_axis[0]
            )));
        }
        if let Some(i) = time_axis.windows(2).position(|w| w[1] <= w[0]) {
            return Err(CalibrationError::InvalidSampleTimes(format!(
                "axis not increasing at sample {}",
                i
            )));
        }
        Ok(Self {
            time_axis,
            calibrated: true,
        })
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    pub fn time_axis(&self) -> &[f64] {
        &self.time_axis
    }

    /// Length of one 256-sample block
    pub fn time_range(&self) -> f64 {
        self.time_axis[NUM_SAMPLES]
    }

    /// Split a sample position (relative to `window`) into block number,
    /// sample within the block and fraction
    fn locate(window: u32, sample: f64) -> (i64, usize, f64) {
        let floor = sample.floor();
        let frac = sample - floor;
        let n = floor as i64 + (window % 4) as i64 * WINDOW_SIZE as i64;
        let block = n.div_euclid(NUM_SAMPLES as i64);
        let k = n.rem_euclid(NUM_SAMPLES as i64) as usize;
        (block, k, frac)
    }

    /// Time of `sample` counted from the start of the 256-sample block that
    /// contains `window`
    pub fn full_time(&self, window: u32, sample: f64) -> f64 {
        let (block, k, frac) = Self::locate(window, sample);
        let t0 = self.time_axis[k];
        let t1 = self.time_axis[k + 1];
        block as f64 * self.time_range() + t0 + (t1 - t0) * frac
    }

    /// Time of `sample` relative to the first sample of `window`
    pub fn time(&self, window: u32, sample: f64) -> f64 {
        self.full_time(window, sample) - self.full_time(window, 0.0)
    }

    /// Time difference between two samples measured from the same window
    pub fn delta_time(&self, window: u32, sample2: f64, sample1: f64) -> f64 {
        self.full_time(window, sample2) - self.full_time(window, sample1)
    }

    /// Width of the sample bin containing `sample`
    pub fn time_bin(&self, window: u32, sample: f64) -> f64 {
        let (_, k, _) = Self::locate(window, sample);
        self.time_axis[k + 1] - self.time_axis[k]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_equidistant_axis() {
        let st = SampleTimes::default();
        assert_eq!(st.time_axis().len(), 257);
        assert!((st.time_range() - 2.0 * SYNC_TIME_BASE).abs() < EPS);
        let bin = 2.0 * SYNC_TIME_BASE / 256.0;
        assert!((st.time(0, 1.0) - bin).abs() < EPS);
        assert!((st.time(0, 10.5) - 10.5 * bin).abs() < EPS);
        assert!((st.time_bin(3, 100.0) - bin).abs() < EPS);
    }

    #[test]
    fn test_time_is_window_relative() {
        let st = SampleTimes::default();
        // Equidistant: the window inside the block does not matter
        for w in 0..8 {
            assert!((st.time(w, 20.0) - st.time(0, 20.0)).abs() < EPS);
        }
    }

    #[test]
    fn test_negative_and_wrapping_samples() {
        let st = SampleTimes::default();
        let bin = st.time_bin(0, 0.0);
        assert!((st.time(0, -1.0) + bin).abs() < EPS);
        // Window 3, sample 70 crosses into the next block
        assert!((st.time(3, 70.0) - 70.0 * bin).abs() < EPS);
        assert!((st.delta_time(1, 30.0, 10.0) - 20.0 * bin).abs() < EPS);
    }

    #[test]
    fn test_calibrated_axis() {
        let mut axis: Vec<f64> = (0..=256).map(|i| i as f64 * 0.4).collect();
        // Stretch sample 64 (first sample of window 1)
        for t in axis.iter_mut().skip(65) {
            *t += 0.2;
        }
        let st = SampleTimes::calibrated(axis).unwrap();
        assert!(st.is_calibrated());
        assert!((st.time_bin(1, 0.0) - 0.6).abs() < EPS);
        assert!((st.time(1, 1.0) - 0.6).abs() < EPS);
        assert!((st.full_time(0, 64.5) - (25.6 + 0.3)).abs() < EPS);
    }

    #[test]
    fn test_invalid_calibrated_axis() {
        assert!(SampleTimes::calibrated(vec![0.0; 10]).is_err());
        let mut axis: Vec<f64> = (0..=256).map(|i| i as f64).collect();
        axis[100] = 98.0;
        let err = SampleTimes::calibrated(axis).unwrap_err();
        assert!(err.to_string().contains("not increasing"));
    }

    #[test]
    fn test_non_finite_axis_rejected() {
        let base: Vec<f64> = (0..=256).map(|i| i as f64).collect();
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let mut axis = base.clone();
            axis[37] = bad;
            let err = SampleTimes::calibrated(axis).unwrap_err();
            assert!(err.to_string().contains("non-finite"), "{}", err);
        }
        let mut axis = base;
        axis[256] = f64::INFINITY;
        assert!(SampleTimes::calibrated(axis).is_err());
    }
}
