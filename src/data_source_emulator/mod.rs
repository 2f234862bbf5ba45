//! Emulator data source - generates synthetic TOP COPPER blocks
//!
//! Each event is one COPPER block carrying up to four SCROD buffers in the
//! production debug format. Hit amplitudes follow a Gaussian peak on a
//! uniform background; a configurable fraction of hits carries a waveform.
//! Corruption knobs produce bad hit checksums and broken B2L CRCs so that
//! downstream error handling can be exercised.

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::rawdata::layout::{b2l, detector, raw_header, MAX_FINESSE};
use crate::rawdata::{pack_detector_buf, refresh_checksums, RawCopperPackerInfo};
use crate::recorder::{FileFooter, FileFormatError, FileHeader, RawFileWriter};
use crate::top::mapping::CHANNELS_PER_ASIC;
use crate::top::{encode_prod_debug, ProdDebugHeader, RawDigit, RawWaveform};

/// Windows behind the write pointer where emulated hits land
const HIT_WINDOW_SPREAD: u32 = 4;
const WAVEFORM_SAMPLES: usize = 64;

/// Emulator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub exp_number: u32,
    pub run_number: u32,
    /// Events to generate
    pub num_events: u64,
    /// Events per run; 0 keeps everything in one run
    pub events_per_run: u64,
    /// COPPER node id (detector prefix + copper number)
    pub node_id: u32,
    /// SCROD id per FINESSE slot (at most four)
    pub scrod_ids: Vec<u16>,
    /// Mean number of hits per SCROD and event (Poisson-like)
    pub mean_hits: f64,
    /// Gaussian peak of the hit amplitude (ADC counts)
    pub amplitude_mean: f64,
    pub amplitude_sigma: f64,
    /// Fraction of hits drawn from a uniform 50..2000 background
    pub background_ratio: f64,
    /// Fraction of hits carrying a waveform segment
    pub waveform_fraction: f64,
    /// Fraction of hits whose checksum is broken after encoding
    pub bad_hit_fraction: f64,
    /// Fraction of blocks whose first payload word is flipped (B2L CRC error)
    pub corrupt_block_fraction: f64,
    /// Leave the RawHeader event fields empty as before the readout PC
    /// fills them
    pub pre_raw: bool,
    /// Storage depth used to place hit windows
    pub storage_depth: u32,
    pub lookback_windows: u32,
    /// RNG seed; `None` seeds from entropy
    pub seed: Option<u64>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            exp_number: 1,
            run_number: 1,
            num_events: 1000,
            events_per_run: 0,
            node_id: detector::TOP | 0x01,
            scrod_ids: vec![1, 2, 3, 4],
            mean_hits: 4.0,
            amplitude_mean: 400.0,
            amplitude_sigma: 60.0,
            background_ratio: 0.2,
            waveform_fraction: 0.05,
            bad_hit_fraction: 0.0,
            corrupt_block_fraction: 0.0,
            pre_raw: false,
            storage_depth: 508,
            lookback_windows: 28,
            seed: None,
        }
    }
}

/// Emulator errors
#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("File error: {0}")]
    File(#[from] FileFormatError),

    #[error("Invalid emulator configuration: {0}")]
    InvalidConfig(String),
}

/// Synthetic TOP COPPER block generator
pub struct Emulator {
    config: EmulatorConfig,
    rng: StdRng,
    amplitude: Normal<f64>,
    run_number: u32,
    event_number: u32,
    generated: u64,
    start_utime: u32,
}

impl Emulator {
    pub fn new(config: EmulatorConfig) -> Result<Self, EmulatorError> {
        if config.scrod_ids.is_empty() || config.scrod_ids.len() > MAX_FINESSE {
            return Err(EmulatorError::InvalidConfig(format!(
                "scrod_ids must hold 1..={} entries, got {}",
                MAX_FINESSE,
                config.scrod_ids.len()
            )));
        }
        if config.storage_depth == 0 {
            return Err(EmulatorError::InvalidConfig(
                "storage_depth must be positive".to_string(),
            ));
        }
        let amplitude = Normal::new(config.amplitude_mean, config.amplitude_sigma.max(0.0))
            .map_err(|e| EmulatorError::InvalidConfig(format!("amplitude: {}", e)))?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            run_number: config.run_number,
            rng,
            amplitude,
            event_number: 0,
            generated: 0,
            start_utime: chrono::Utc::now().timestamp() as u32,
            config,
        })
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    /// Events generated so far
    pub fn generated(&self) -> u64 {
        self.generated
    }

    pub fn is_done(&self) -> bool {
        self.generated >= self.config.num_events
    }

    /// Generate the next COPPER block
    pub fn next_block(&mut self) -> Vec<u32> {
        if self.config.events_per_run > 0
            && self.generated > 0
            && self.generated % self.config.events_per_run == 0
        {
            self.run_number += 1;
            self.event_number = 0;
            info!(run = self.run_number, "Emulator starting new run");
        }

        let event = self.event_number;
        let revo9 = (event.wrapping_mul(7) % 5120) as u16;
        let payloads: Vec<Vec<u32>> = self
            .config
            .scrod_ids
            .clone()
            .into_iter()
            .map(|scrod| self.scrod_buffer(scrod, event, revo9))
            .collect();

        let mut slots: [Option<&[u32]>; MAX_FINESSE] = [None; MAX_FINESSE];
        for (slot, payload) in slots.iter_mut().zip(&payloads) {
            *slot = Some(payload.as_slice());
        }

        let info = RawCopperPackerInfo {
            exp_num: self.config.exp_number,
            run_num: self.run_number,
            eve_num: event,
            node_id: self.config.node_id,
            tt_ctime: (event.wrapping_mul(1280)) & raw_header::TTCTIME_MASK,
            tt_utime: self.start_utime + (self.generated / 1000) as u32,
            b2l_ctime: event,
            trg_type: 1,
            ..Default::default()
        };
        let mut words = pack_detector_buf(slots, &info);

        if self.config.pre_raw {
            for pos in [
                raw_header::POS_EXP_RUN_NO,
                raw_header::POS_EVE_NO,
                raw_header::POS_TTCTIME_TRGTYPE,
                raw_header::POS_TTUTIME,
                raw_header::POS_NODE_ID,
                raw_header::POS_TRUNC_MASK_DATATYPE,
            ] {
                words[pos] = 0;
            }
            refresh_checksums(&mut words);
        }

        if self.rng.gen_bool(self.config.corrupt_block_fraction.clamp(0.0, 1.0)) {
            // First payload word of slot 0, behind the B2L headers
            let start = words[raw_header::POS_OFFSET_1ST_FINESSE] as usize
                + b2l::SIZE_B2LHSLB_HEADER
                + b2l::SIZE_B2LFEE_HEADER;
            if let Some(w) = words.get_mut(start) {
                *w ^= 0x0000_0100;
            }
            refresh_checksums(&mut words);
            debug!(event, "Corrupted block payload");
        }

        self.event_number = self.event_number.wrapping_add(1);
        self.generated += 1;
        words
    }

    fn scrod_buffer(&mut self, scrod_id: u16, event: u32, revo9: u16) -> Vec<u32> {
        let header = ProdDebugHeader {
            scrod_id,
            phase: (revo9 % 9) as u8,
            ctime: (event & 0x7FF) as u16,
            revo9_counter: revo9,
            asic_mask: 0xFFFF,
            event_number_byte: (event & 0xFF) as u8,
            ..Default::default()
        };

        let n_hits = self.hit_count();
        let mut digits = Vec::with_capacity(n_hits);
        let mut waveforms = Vec::new();
        for _ in 0..n_hits {
            let mut digit = self.random_hit(scrod_id, revo9);
            if self.rng.gen_bool(self.config.waveform_fraction.clamp(0.0, 1.0)) {
                digit.has_waveform = true;
                waveforms.push(self.waveform_for(&digit, event));
            }
            digits.push(digit);
        }

        let mut buf = encode_prod_debug(&header, &digits, &waveforms, None);
        let bad = self.config.bad_hit_fraction.clamp(0.0, 1.0);
        for i in 0..digits.len() {
            if self.rng.gen_bool(bad) {
                // Integral half of hit word 1
                buf[4 + i * 5 + 1] ^= 0x0000_0001;
            }
        }
        buf
    }

    /// Binomial draw with the configured mean, capped by the channel count
    fn hit_count(&mut self) -> usize {
        let trials = 16usize;
        let p = (self.config.mean_hits / trials as f64).clamp(0.0, 1.0);
        (0..trials).filter(|_| self.rng.gen_bool(p)).count()
    }

    fn random_hit(&mut self, scrod_id: u16, revo9: u16) -> RawDigit {
        let depth = self.config.storage_depth;
        let reference = (depth + depth - self.config.lookback_windows % depth) % depth;
        let window = (reference + self.rng.gen_range(0..HIT_WINDOW_SPREAD)) % depth;

        let peak = if self.rng.gen_bool(self.config.background_ratio.clamp(0.0, 1.0)) {
            self.rng.gen_range(50.0..2000.0)
        } else {
            self.amplitude.sample(&mut self.rng).clamp(50.0, 4000.0)
        };
        let rise0 = peak * self.rng.gen_range(0.15..0.45);
        let rise1 = peak * self.rng.gen_range(0.55..0.85);
        let fall0 = peak * self.rng.gen_range(0.55..0.85);
        let fall1 = peak * self.rng.gen_range(0.15..0.45);
        let dsamp_peak = self.rng.gen_range(1..4u8);
        let dsamp_fall = self.rng.gen_range(1..5u8);

        RawDigit {
            scrod_id,
            carrier: self.rng.gen_range(0..4),
            asic: self.rng.gen_range(0..4),
            asic_channel: self.rng.gen_range(0..CHANNELS_PER_ASIC as u8),
            asic_window: window as u16,
            tfine: self.rng.gen_range(0..16),
            sample_rise: self.rng.gen_range(0..48),
            dsamp_peak,
            dsamp_fall,
            value_peak: peak as i16,
            value_rise0: rise0 as i16,
            value_rise1: rise1 as i16,
            value_fall0: fall0 as i16,
            value_fall1: fall1 as i16,
            integral: (peak * (dsamp_peak + dsamp_fall) as f64 * 1.5).min(65535.0) as u16,
            revo9_counter: revo9,
            ..Default::default()
        }
    }

    fn waveform_for(&mut self, digit: &RawDigit, event: u32) -> RawWaveform {
        let peak_at = digit.sample_rise as f64 + digit.dsamp_peak as f64;
        let width = (digit.dsamp_peak + digit.dsamp_fall) as f64 / 2.0;
        let samples = (0..WAVEFORM_SAMPLES)
            .map(|i| {
                let x = (i as f64 - peak_at) / width.max(1.0);
                let noise: f64 = self.rng.gen_range(-5.0..5.0);
                (digit.value_peak as f64 * (-0.5 * x * x).exp() + noise) as i16
            })
            .collect();
        RawWaveform {
            scrod_id: digit.scrod_id,
            carrier: digit.carrier,
            asic: digit.asic,
            asic_channel: digit.asic_channel,
            n_windows: 1,
            start_sample: 0,
            logic_window: digit.asic_window,
            physical_window: digit.asic_window,
            carrier_event_number: (event & 0x7F) as u8,
            samples,
        }
    }

    /// Write all remaining events to a raw data file
    pub fn write_file<P: AsRef<Path>>(&mut self, path: P) -> Result<FileFooter, EmulatorError> {
        let mut header = FileHeader::new(self.config.exp_number, self.run_number, 0);
        header.node_ids = vec![self.config.node_id];
        header.comment = "emulated TOP data".to_string();
        let mut writer = RawFileWriter::create(path, &header)?;
        while !self.is_done() {
            let block = self.next_block();
            writer.write_block(&block)?;
        }
        Ok(writer.finish()?)
    }
}

impl Iterator for Emulator {
    type Item = Vec<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_done() {
            return None;
        }
        Some(self.next_block())
    }
}
