//! Raw digit to calibrated digit conversion
//!
//! Stages, in order:
//! 1. sample → time with the channel's sample times (calibrated or equidistant)
//! 2. window unwrapping relative to the reference window of the event
//! 3. time-walk correction
//! 4. channel T0, ASIC shift, module T0, common T0
//! 5. hit quality
//!
//! A stage without a payload for the channel is skipped and its status bit
//! stays clear. The time error is accumulated as a variance and
//! square-rooted once at the end.
//!
//! # Design Principles (KISS)
//! - Payloads are resolved once per run in [`RawDigitConverter::begin_run`]
//! - `convert` is pure and never fails
//! - Workers clone the converter; the resolved payloads are shared via `Arc`

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::calibration::{
    CalibrationError, CalibrationPolicy, CalibrationSet, PayloadIds, SharedConditions,
};
use super::digit::{status, HitQuality, TopDigit};
use super::mapping::{module_asic, module_channel, pixel_id, FrontEndMapping};
use super::raw_digit::{RawDigit, WINDOW_SIZE};
use super::sample_times::{SampleTimes, SYNC_TIME_BASE};

/// Converter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Number of analog storage windows per channel
    pub storage_depth: u32,
    /// Windows between the write pointer and the trigger
    pub lookback_windows: u32,
    /// Shift the reference window by `window_shifts[revo9 % 6]`
    pub use_phase_correction: bool,
    pub window_shifts: [i32; 6],
    /// Subtracted from every time (ns)
    pub time_offset: f64,
    /// Synchronisation clock period for the equidistant time base (ns)
    pub sync_time_base: f64,
    /// Pedestal RMS in ADC counts
    pub pedestal_rms: f64,
    /// Accepted pulse width range (ns)
    pub min_pulse_width: f64,
    pub max_pulse_width: f64,
    /// Minimum width × height (ns × ADC); 0 disables
    pub min_width_height: f64,
    pub cal_pulse: CalPulseConfig,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            storage_depth: 508,
            lookback_windows: 28,
            use_phase_correction: true,
            window_shifts: [0; 6],
            time_offset: 0.0,
            sync_time_base: SYNC_TIME_BASE,
            pedestal_rms: 9.7,
            min_pulse_width: 0.3,
            max_pulse_width: 10.0,
            min_width_height: 0.0,
            cal_pulse: CalPulseConfig::default(),
        }
    }
}

/// Calibration pulse selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalPulseConfig {
    /// ASIC channel carrying the calibration pulse; `None` disables
    pub asic_channel: Option<u8>,
    pub min_time: f64,
    pub max_time: f64,
    pub min_height: i16,
    pub max_height: i16,
    pub min_width: f64,
    pub max_width: f64,
}

impl Default for CalPulseConfig {
    fn default() -> Self {
        Self {
            asic_channel: None,
            min_time: -f64::INFINITY,
            max_time: f64::INFINITY,
            min_height: 300,
            max_height: 900,
            min_width: 0.8,
            max_width: 3.0,
        }
    }
}

impl CalPulseConfig {
    fn matches(&self, raw: &RawDigit, time: f64, width: f64) -> bool {
        let Some(channel) = self.asic_channel else {
            return false;
        };
        raw.asic_channel == channel
            && (self.min_time..=self.max_time).contains(&time)
            && (self.min_height..=self.max_height).contains(&raw.value_peak)
            && (self.min_width..=self.max_width).contains(&width)
    }
}

/// Converts [`RawDigit`]s into calibrated [`TopDigit`]s
#[derive(Debug, Clone)]
pub struct RawDigitConverter {
    config: ConverterConfig,
    policy: CalibrationPolicy,
    conditions: SharedConditions,
    calibration: Arc<CalibrationSet>,
    default_times: SampleTimes,
    run: Option<(i32, i32)>,
}

impl RawDigitConverter {
    pub fn new(
        config: ConverterConfig,
        policy: CalibrationPolicy,
        conditions: SharedConditions,
    ) -> Self {
        let default_times = SampleTimes::equidistant(config.sync_time_base);
        Self {
            config,
            policy,
            conditions,
            calibration: Arc::new(CalibrationSet::default()),
            default_times,
            run: None,
        }
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    pub fn calibration(&self) -> &CalibrationSet {
        &self.calibration
    }

    pub fn current_run(&self) -> Option<(i32, i32)> {
        self.run
    }

    /// Refresh payloads for a new run
    ///
    /// Returns `Ok(true)` when the payload set changed. A missing `Required`
    /// payload is an error and leaves the converter without a run.
    pub fn begin_run(&mut self, exp: i32, run: i32) -> Result<bool, CalibrationError> {
        let store = self.conditions.read();
        let ids: PayloadIds = store.payload_ids(&self.policy, exp, run);
        if self.run.is_some() && ids == *self.calibration.ids() {
            debug!(exp, run, "Calibration unchanged");
            self.run = Some((exp, run));
            return Ok(false);
        }

        self.run = None;
        let set = store.resolve(&self.policy, exp, run)?;
        info!(
            exp,
            run,
            sample_times = set.sample_times.is_some(),
            time_walk = set.time_walk.is_some(),
            channel_t0 = set.channel_t0.is_some(),
            asic_shift = set.asic_shift.is_some(),
            module_t0 = set.module_t0.is_some(),
            common_t0 = set.common_t0.is_some(),
            "Calibration loaded"
        );
        self.calibration = Arc::new(set);
        self.run = Some((exp, run));
        Ok(true)
    }

    /// Reference window of the event the digit belongs to
    pub fn reference_window(&self, raw: &RawDigit) -> u32 {
        let depth = self.config.storage_depth as i64;
        if depth == 0 {
            return 0;
        }
        let shift = if self.config.use_phase_correction {
            self.config.window_shifts[raw.revo9_counter as usize % 6] as i64
        } else {
            0
        };
        let window = raw.last_write_addr as i64 - self.config.lookback_windows as i64 + shift;
        window.rem_euclid(depth) as u32
    }

    /// Signed distance from the reference window to the hit window,
    /// taking the shortest way around the storage ring
    pub fn window_delta(&self, ref_window: u32, asic_window: u32) -> i32 {
        let depth = self.config.storage_depth as i32;
        let mut delta = asic_window as i32 - ref_window as i32;
        if depth == 0 {
            return delta;
        }
        if delta > depth / 2 {
            delta -= depth;
        } else if delta < -depth / 2 {
            delta += depth;
        }
        delta
    }

    fn sample_times(&self, raw: &RawDigit, digit: &mut TopDigit) -> &SampleTimes {
        let calibrated = self
            .calibration
            .sample_times
            .as_ref()
            .and_then(|t| t.get(&(raw.scrod_id, raw.scrod_channel())));
        match calibrated {
            Some(st) => {
                digit.add_status(status::TIME_BASE);
                st
            }
            None => &self.default_times,
        }
    }

    /// Convert one digit of a mapped SCROD
    pub fn convert(&self, raw: &RawDigit, mapping: &FrontEndMapping) -> TopDigit {
        let channel = module_channel(mapping.boardstack, raw.carrier, raw.asic, raw.asic_channel);
        let mut digit = TopDigit {
            module_id: mapping.module_id,
            channel,
            pixel_id: pixel_id(channel),
            pulse_height: raw.value_peak,
            integral: raw.integral,
            ..Default::default()
        };

        // Time base and window unwrapping
        let st = self.sample_times(raw, &mut digit);
        let window = raw.asic_window as u32;
        let ref_window = self.reference_window(raw);
        let delta = self.window_delta(ref_window, window);
        let leading = raw.cfd_leading_time();
        let raw_time = leading + (delta * WINDOW_SIZE as i32) as f64;

        let mut time = st.time(ref_window, raw_time) - self.config.time_offset;
        let width = st.delta_time(window, raw.cfd_falling_time(), leading);
        let bin = st.time_bin(window, leading);
        let sigma = raw.cfd_leading_time_error(self.config.pedestal_rms) * bin;
        let mut variance = sigma * sigma;

        let cal = &self.calibration;
        let height = raw.value_peak as f64;

        if let Some(tw) = &cal.time_walk {
            time -= tw.correction(height);
            variance += tw.sigma_sq(height);
            digit.add_status(status::TIME_WALK);
        }
        let module = mapping.module_id;
        if let Some(t0) = cal.channel_t0.as_ref().and_then(|t| t.get(&(module, channel))) {
            time -= t0.t0;
            variance += t0.error * t0.error;
            digit.add_status(status::CHANNEL_T0);
        }
        let asic = module_asic(channel);
        if let Some(shift) = cal.asic_shift.as_ref().and_then(|t| t.get(&(module, asic))) {
            time -= shift;
            digit.add_status(status::ASIC_SHIFT);
        }
        if let Some(t0) = cal.module_t0.as_ref().and_then(|t| t.get(&module)) {
            time -= t0.t0;
            variance += t0.error * t0.error;
            digit.add_status(status::MODULE_T0);
        }
        if let Some(t0) = &cal.common_t0 {
            time -= t0.t0;
            variance += t0.error * t0.error;
            digit.add_status(status::COMMON_T0);
        }

        digit.time = time;
        digit.time_error = variance.max(0.0).sqrt();
        digit.raw_time = raw_time;
        digit.pulse_width = width;
        digit.first_window = ref_window as u16;
        digit.quality = self.quality(raw, time, width);
        digit
    }

    /// Classify a hit
    pub fn quality(&self, raw: &RawDigit, time: f64, width: f64) -> HitQuality {
        let c = &self.config;
        if !raw.is_fe_valid() || raw.is_at_window_discontinuity(c.storage_depth) {
            return HitQuality::Junk;
        }
        if width < c.min_pulse_width || width > c.max_pulse_width {
            return HitQuality::Junk;
        }
        if width * (raw.value_peak as f64) < c.min_width_height {
            return HitQuality::Junk;
        }
        if c.cal_pulse.matches(raw, time, width) {
            return HitQuality::CalPulse;
        }
        HitQuality::Good
    }
}
