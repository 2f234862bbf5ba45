//! Decoder for the TOP production-firmware debug format
//!
//! Decodes the 32-bit word buffer of one SCROD (one FINESSE slot):
//! a 4-word event header, feature-extracted hits, an event footer and an
//! optional list of waveform segments terminated by the word "last".

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::raw_digit::RawDigit;

/// Production debug constants (32-bit words)
pub mod constants {
    /// `word0 >> 16` for the production debug format (type 0x04, version 0x02)
    pub const PRODUCTION_DEBUG_FORMAT: u32 = 0x0402;
    pub const DATA_FORMAT_SHIFT: u32 = 16;

    pub const HEADER_WORDS: usize = 4;
    pub const FOOTER_WORDS: usize = 1;
    pub const HIT_CORE_WORDS: usize = 5;

    // Header word 0: type(8)/version(8)/0xA(4)/scrodID(12)
    pub const EVT_TYPE_SHIFT: u32 = 24;
    pub const EVT_VERSION_SHIFT: u32 = 16;
    pub const EVT_VERSION_MASK: u32 = 0xFF;
    pub const EVT_MAGIC_SHIFT: u32 = 12;
    pub const EVT_MAGIC_MASK: u32 = 0xF;
    pub const EVT_MAGIC: u32 = 0xA;
    pub const SCROD_MASK: u32 = 0xFFF;

    // Header word 1: extra(3)/numWordsBonus(13)/phase(4)/numWordsCore(12)
    pub const EXTRA_SHIFT: u32 = 29;
    pub const BONUS_SHIFT: u32 = 16;
    pub const BONUS_MASK: u32 = 0x1FFF;
    pub const PHASE_SHIFT: u32 = 12;
    pub const PHASE_MASK: u32 = 0xF;
    pub const CORE_MASK: u32 = 0xFFF;

    // Header word 2: skipHit(1)/reserved(4)/ctime(11)/revo9counter(16)
    pub const SKIP_HIT_SHIFT: u32 = 29;
    pub const CTIME_SHIFT: u32 = 16;
    pub const CTIME_MASK: u32 = 0x7FF;
    pub const REVO9_MASK: u32 = 0xFFFF;

    // Header word 3: asicMask(16)/queueDepth(8)/eventNumberByte(8)
    pub const ASIC_MASK_SHIFT: u32 = 16;
    pub const QUEUE_DEPTH_SHIFT: u32 = 8;
    pub const BYTE_MASK: u32 = 0xFF;

    // Hit word 0: carrier(2)/asic(2)/channel(3)/window(9)/0xB(4)/tFine(4)/
    //             hasWaveform(1)/isOnHeap(1)/heapWindow(6)
    pub const CARRIER_SHIFT: u32 = 30;
    pub const ASIC_SHIFT: u32 = 28;
    pub const TWO_BIT_MASK: u32 = 0x3;
    pub const CHANNEL_SHIFT: u32 = 25;
    pub const CHANNEL_MASK: u32 = 0x7;
    pub const WINDOW_SHIFT: u32 = 16;
    pub const WINDOW_MASK: u32 = 0x1FF;
    pub const HIT_MAGIC_SHIFT: u32 = 12;
    pub const HIT_MAGIC: u32 = 0xB;
    pub const TFINE_SHIFT: u32 = 8;
    pub const NIBBLE_MASK: u32 = 0xF;
    pub const HAS_WAVEFORM_SHIFT: u32 = 7;
    pub const ON_HEAP_SHIFT: u32 = 6;
    pub const HEAP_WINDOW_MASK: u32 = 0x3F;

    // Hit words 1-3: 13-bit values in both halves
    pub const VALUE_HI_SHIFT: u32 = 16;
    pub const VALUE_MASK: u32 = 0x1FFF;
    pub const INTEGRAL_MASK: u32 = 0xFFFF;

    // Hit word 4: sampleRise(8)/dSampPeak(4)/dSampFall(4)/checksum(16)
    pub const SAMPLE_RISE_SHIFT: u32 = 24;
    pub const DSAMP_PEAK_SHIFT: u32 = 20;
    pub const DSAMP_FALL_SHIFT: u32 = 16;
    pub const HIT_CHECKSUM_MASK: u32 = 0xFFFF;

    // Footer: sdType(8)/sdData(12)/0x5(3)/nHits(9)
    pub const SD_TYPE_SHIFT: u32 = 24;
    pub const SD_DATA_SHIFT: u32 = 12;
    pub const SD_DATA_MASK: u32 = 0xFFF;
    pub const FOOTER_MAGIC_SHIFT: u32 = 9;
    pub const FOOTER_MAGIC_MASK: u32 = 0x7;
    pub const FOOTER_MAGIC: u32 = 0x5;
    pub const NHITS_MASK: u32 = 0x1FF;

    /// "last" in ASCII, terminates the waveform section
    pub const WAVEFORM_END_WORD: u32 = 0x6c61_7374;

    // Waveform word 0: nSamples(16)/0(5)/nWindows(3)/0(1)/carrier(2)/asic(2)/channel(3)
    pub const WF_NSAMPLES_SHIFT: u32 = 16;
    pub const WF_NWINDOWS_SHIFT: u32 = 8;
    pub const WF_NWINDOWS_MASK: u32 = 0x7;
    pub const WF_CARRIER_SHIFT: u32 = 5;
    pub const WF_ASIC_SHIFT: u32 = 3;

    // Waveform word 1: 0(1)/startSample(6)/logicWindow(9)/eventNumber(7)/physWindow(9)
    pub const WF_START_SAMPLE_SHIFT: u32 = 25;
    pub const WF_START_SAMPLE_MASK: u32 = 0x3F;
    pub const WF_LOGIC_WINDOW_SHIFT: u32 = 16;
    pub const WF_EVENT_SHIFT: u32 = 9;
    pub const WF_EVENT_MASK: u32 = 0x7F;

    pub const SAMPLE_MASK_RAW: u32 = 0xFFF;
}

use constants as c;

/// Unpack errors for one SCROD buffer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnpackError {
    #[error("Buffer too short: need {needed} words, have {available}")]
    BufferTooShort { needed: usize, available: usize },

    #[error("Unknown data format 0x{0:04x}")]
    UnknownFormat(u32),

    #[error("Event header magic mismatch: expected 0xA, found 0x{0:x}")]
    BadHeaderMagic(u32),

    #[error("Core length {core} out of range for buffer of {available} words")]
    CoreLengthOutOfRange { core: usize, available: usize },

    #[error("Hit {index}: header magic mismatch, found 0x{found:x}")]
    BadHitMagic { index: usize, found: u32 },

    #[error("Hit {index}: checksum invalid")]
    HitChecksum { index: usize },

    #[error("Event footer magic mismatch: expected 0x5, found 0x{0:x}")]
    BadFooterMagic(u32),

    #[error("Footer declares {declared} hits, found {found}")]
    HitCountMismatch { declared: usize, found: usize },

    #[error("Waveform segment truncated: need {needed} words, have {available}")]
    WaveformTruncated { needed: usize, available: usize },

    #[error("Expected {expected} waveforms, parsed {parsed}")]
    WaveformCountMismatch { expected: usize, parsed: usize },

    #[error("No front-end map for SCROD {0}")]
    NoFrontEndMap(u16),
}

impl UnpackError {
    /// Short name of the error kind, used as a counter key
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BufferTooShort { .. } => "buffer_too_short",
            Self::UnknownFormat(_) => "unknown_format",
            Self::BadHeaderMagic(_) => "bad_header_magic",
            Self::CoreLengthOutOfRange { .. } => "core_length",
            Self::BadHitMagic { .. } => "bad_hit_magic",
            Self::HitChecksum { .. } => "hit_checksum",
            Self::BadFooterMagic(_) => "bad_footer_magic",
            Self::HitCountMismatch { .. } => "hit_count_mismatch",
            Self::WaveformTruncated { .. } => "waveform_truncated",
            Self::WaveformCountMismatch { .. } => "waveform_count_mismatch",
            Self::NoFrontEndMap(_) => "no_front_end_map",
        }
    }
}

/// Decoded event header
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProdDebugHeader {
    pub event_type: u8,
    pub version: u8,
    pub scrod_id: u16,
    pub extra_words: u8,
    pub bonus_words: u16,
    pub phase: u8,
    pub core_words: u16,
    pub skip_hit: bool,
    pub ctime: u16,
    pub revo9_counter: u16,
    pub asic_mask: u16,
    pub queue_depth: u8,
    pub event_number_byte: u8,
}

/// Slow-control value carried in the event footer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlowData {
    pub scrod_id: u16,
    pub sd_type: u8,
    pub sd_data: u16,
}

/// One waveform segment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawWaveform {
    pub scrod_id: u16,
    pub carrier: u8,
    pub asic: u8,
    pub asic_channel: u8,
    pub n_windows: u8,
    pub start_sample: u8,
    pub logic_window: u16,
    pub physical_window: u16,
    pub carrier_event_number: u8,
    pub samples: Vec<i16>,
}

impl RawWaveform {
    pub fn scrod_channel(&self) -> u32 {
        self.carrier as u32 * 32 + self.asic as u32 * 8 + self.asic_channel as u32
    }
}

/// Everything decoded from one buffer
#[derive(Debug, Clone, Default)]
pub struct ProdDebugEvent {
    pub header: ProdDebugHeader,
    pub digits: Vec<RawDigit>,
    pub waveforms: Vec<RawWaveform>,
    pub slow_data: Option<SlowData>,
    /// Problems that did not stop decoding (skipped hits, count mismatches)
    pub warnings: Vec<UnpackError>,
    /// Words after the waveform terminator
    pub unused_words: usize,
}

/// Decoder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProdDebugConfig {
    /// Waveform samples are pedestal subtracted (signed 16 bit)
    pub pedestal_subtracted: bool,
    /// Log every word at debug level
    pub dump_enabled: bool,
}

impl Default for ProdDebugConfig {
    fn default() -> Self {
        Self {
            pedestal_subtracted: true,
            dump_enabled: false,
        }
    }
}

/// Sequential word reader with bounds checks
struct WordCursor<'a> {
    words: &'a [u32],
    index: usize,
}

impl<'a> WordCursor<'a> {
    fn new(words: &'a [u32]) -> Self {
        Self { words, index: 0 }
    }

    fn remaining(&self) -> usize {
        self.words.len() - self.index
    }

    fn peek(&self) -> Option<u32> {
        self.words.get(self.index).copied()
    }

    fn take(&mut self) -> Result<u32, UnpackError> {
        let word = self.words.get(self.index).copied().ok_or(UnpackError::BufferTooShort {
            needed: self.index + 1,
            available: self.words.len(),
        })?;
        self.index += 1;
        Ok(word)
    }
}

/// Sum of the two 16-bit halves
#[inline]
fn sum_shorts(word: u32) -> u32 {
    (word >> 16) + (word & 0xFFFF)
}

/// Fold carries back into 16 bits
#[inline]
fn fold16(mut sum: u32) -> u32 {
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum
}

/// Checksum value that makes the folded sum of a hit equal 0xFFFF
pub fn hit_checksum(core: &[u32; c::HIT_CORE_WORDS]) -> u16 {
    let mut sum = 0u32;
    for w in &core[..c::HIT_CORE_WORDS - 1] {
        sum += sum_shorts(*w);
    }
    sum += core[c::HIT_CORE_WORDS - 1] >> 16;
    (0xFFFF - fold16(sum)) as u16
}

/// Production debug format decoder
#[derive(Debug, Clone)]
pub struct ProdDebugDecoder {
    config: ProdDebugConfig,
}

impl ProdDebugDecoder {
    pub fn new(config: ProdDebugConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(ProdDebugConfig::default())
    }

    /// Data format of a buffer (`word0 >> 16`)
    pub fn data_format(buffer: &[u32]) -> Option<u32> {
        buffer.first().map(|w| w >> c::DATA_FORMAT_SHIFT)
    }

    /// Decode one SCROD buffer
    pub fn decode(&self, buffer: &[u32]) -> Result<ProdDebugEvent, UnpackError> {
        if buffer.len() < c::HEADER_WORDS + c::FOOTER_WORDS {
            return Err(UnpackError::BufferTooShort {
                needed: c::HEADER_WORDS + c::FOOTER_WORDS,
                available: buffer.len(),
            });
        }
        if self.config.dump_enabled {
            for (i, w) in buffer.iter().enumerate() {
                debug!(index = i, word = format_args!("0x{:08x}", w), "ProdDebug word");
            }
        }

        let mut cursor = WordCursor::new(buffer);
        let header = self.decode_header(&mut cursor)?;
        let core = header.core_words as usize;
        if core < c::HEADER_WORDS + c::FOOTER_WORDS || core > buffer.len() {
            return Err(UnpackError::CoreLengthOutOfRange {
                core,
                available: buffer.len(),
            });
        }

        let mut event = ProdDebugEvent {
            header,
            ..Default::default()
        };

        // Hits occupy everything between header and footer
        let hit_words = c::HIT_CORE_WORDS + event.header.extra_words as usize;
        let footer_index = core - c::FOOTER_WORDS;
        let mut hit_index = 0;
        let mut hits_seen = 0;
        while cursor.index + hit_words <= footer_index {
            hits_seen += 1;
            match self.decode_hit(&mut cursor, &event.header, hit_index)? {
                Some(digit) => event.digits.push(digit),
                None => event.warnings.push(UnpackError::HitChecksum { index: hit_index }),
            }
            hit_index += 1;
        }
        cursor.index = footer_index;

        let footer = cursor.take()?;
        let footer_magic = (footer >> c::FOOTER_MAGIC_SHIFT) & c::FOOTER_MAGIC_MASK;
        if footer_magic != c::FOOTER_MAGIC {
            return Err(UnpackError::BadFooterMagic(footer_magic));
        }
        let sd_type = (footer >> c::SD_TYPE_SHIFT) as u8;
        if sd_type != 0 {
            event.slow_data = Some(SlowData {
                scrod_id: event.header.scrod_id,
                sd_type,
                sd_data: ((footer >> c::SD_DATA_SHIFT) & c::SD_DATA_MASK) as u16,
            });
        }
        let declared = (footer & c::NHITS_MASK) as usize;
        if declared != hits_seen {
            event.warnings.push(UnpackError::HitCountMismatch {
                declared,
                found: hits_seen,
            });
        }

        self.decode_waveforms(&mut cursor, &mut event)?;
        Ok(event)
    }

    fn decode_header(&self, cursor: &mut WordCursor<'_>) -> Result<ProdDebugHeader, UnpackError> {
        let w0 = cursor.take()?;
        let magic = (w0 >> c::EVT_MAGIC_SHIFT) & c::EVT_MAGIC_MASK;
        if magic != c::EVT_MAGIC {
            return Err(UnpackError::BadHeaderMagic(magic));
        }
        let w1 = cursor.take()?;
        let w2 = cursor.take()?;
        let w3 = cursor.take()?;

        Ok(ProdDebugHeader {
            event_type: (w0 >> c::EVT_TYPE_SHIFT) as u8,
            version: ((w0 >> c::EVT_VERSION_SHIFT) & c::EVT_VERSION_MASK) as u8,
            scrod_id: (w0 & c::SCROD_MASK) as u16,
            extra_words: (w1 >> c::EXTRA_SHIFT) as u8,
            bonus_words: ((w1 >> c::BONUS_SHIFT) & c::BONUS_MASK) as u16,
            phase: ((w1 >> c::PHASE_SHIFT) & c::PHASE_MASK) as u8,
            core_words: (w1 & c::CORE_MASK) as u16,
            skip_hit: (w2 >> c::SKIP_HIT_SHIFT) & 0x1 != 0,
            ctime: ((w2 >> c::CTIME_SHIFT) & c::CTIME_MASK) as u16,
            revo9_counter: (w2 & c::REVO9_MASK) as u16,
            asic_mask: (w3 >> c::ASIC_MASK_SHIFT) as u16,
            queue_depth: ((w3 >> c::QUEUE_DEPTH_SHIFT) & c::BYTE_MASK) as u8,
            event_number_byte: (w3 & c::BYTE_MASK) as u8,
        })
    }

    /// Decode one hit; `None` when its checksum fails
    fn decode_hit(
        &self,
        cursor: &mut WordCursor<'_>,
        header: &ProdDebugHeader,
        index: usize,
    ) -> Result<Option<RawDigit>, UnpackError> {
        let mut core = [0u32; c::HIT_CORE_WORDS];
        for w in core.iter_mut() {
            *w = cursor.take()?;
        }
        for _ in 0..header.extra_words {
            cursor.take()?;
        }

        let w0 = core[0];
        let magic = (w0 >> c::HIT_MAGIC_SHIFT) & c::NIBBLE_MASK;
        if magic != c::HIT_MAGIC {
            return Err(UnpackError::BadHitMagic { index, found: magic });
        }

        let sum: u32 = core.iter().map(|w| sum_shorts(*w)).sum();
        if fold16(sum) != 0xFFFF {
            debug!(scrod = header.scrod_id, hit = index, "Hit checksum invalid");
            return Ok(None);
        }

        let value_hi = |w: u32| ((w >> c::VALUE_HI_SHIFT) & c::VALUE_MASK) as i16;
        let value_lo = |w: u32| (w & c::VALUE_MASK) as i16;

        Ok(Some(RawDigit {
            scrod_id: header.scrod_id,
            carrier: ((w0 >> c::CARRIER_SHIFT) & c::TWO_BIT_MASK) as u8,
            asic: ((w0 >> c::ASIC_SHIFT) & c::TWO_BIT_MASK) as u8,
            asic_channel: ((w0 >> c::CHANNEL_SHIFT) & c::CHANNEL_MASK) as u8,
            asic_window: ((w0 >> c::WINDOW_SHIFT) & c::WINDOW_MASK) as u16,
            last_write_addr: 0,
            tfine: ((w0 >> c::TFINE_SHIFT) & c::NIBBLE_MASK) as u8,
            has_waveform: (w0 >> c::HAS_WAVEFORM_SHIFT) & 0x1 != 0,
            value_peak: value_hi(core[1]),
            integral: (core[1] & c::INTEGRAL_MASK) as u16,
            value_rise0: value_hi(core[2]),
            value_rise1: value_lo(core[2]),
            value_fall0: value_hi(core[3]),
            value_fall1: value_lo(core[3]),
            sample_rise: (core[4] >> c::SAMPLE_RISE_SHIFT) as u8,
            dsamp_peak: ((core[4] >> c::DSAMP_PEAK_SHIFT) & c::NIBBLE_MASK) as u8,
            dsamp_fall: ((core[4] >> c::DSAMP_FALL_SHIFT) & c::NIBBLE_MASK) as u8,
            revo9_counter: header.revo9_counter,
            phase: header.phase,
            error_flags: 0,
        }))
    }

    fn decode_waveforms(
        &self,
        cursor: &mut WordCursor<'_>,
        event: &mut ProdDebugEvent,
    ) -> Result<(), UnpackError> {
        let expected = event.digits.iter().filter(|d| d.has_waveform).count();

        while let Some(word) = cursor.peek() {
            if word == c::WAVEFORM_END_WORD {
                cursor.take()?;
                break;
            }
            let w0 = cursor.take()?;
            let w1 = cursor.take()?;
            let n_samples = (w0 >> c::WF_NSAMPLES_SHIFT) as usize;
            let n_words = n_samples.div_ceil(2);
            if cursor.remaining() < n_words {
                return Err(UnpackError::WaveformTruncated {
                    needed: n_words,
                    available: cursor.remaining(),
                });
            }

            let mut samples = Vec::with_capacity(n_words * 2);
            for _ in 0..n_words {
                let w = cursor.take()?;
                let (first, last) = if self.config.pedestal_subtracted {
                    ((w & 0xFFFF) as u16 as i16, (w >> 16) as u16 as i16)
                } else {
                    (
                        (w & c::SAMPLE_MASK_RAW) as i16,
                        ((w >> 16) & c::SAMPLE_MASK_RAW) as i16,
                    )
                };
                samples.push(first);
                samples.push(last);
            }
            samples.truncate(n_samples);

            event.waveforms.push(RawWaveform {
                scrod_id: event.header.scrod_id,
                carrier: ((w0 >> c::WF_CARRIER_SHIFT) & c::TWO_BIT_MASK) as u8,
                asic: ((w0 >> c::WF_ASIC_SHIFT) & c::TWO_BIT_MASK) as u8,
                asic_channel: (w0 & c::CHANNEL_MASK) as u8,
                n_windows: ((w0 >> c::WF_NWINDOWS_SHIFT) & c::WF_NWINDOWS_MASK) as u8,
                start_sample: ((w1 >> c::WF_START_SAMPLE_SHIFT) & c::WF_START_SAMPLE_MASK) as u8,
                logic_window: ((w1 >> c::WF_LOGIC_WINDOW_SHIFT) & c::WINDOW_MASK) as u16,
                physical_window: (w1 & c::WINDOW_MASK) as u16,
                carrier_event_number: ((w1 >> c::WF_EVENT_SHIFT) & c::WF_EVENT_MASK) as u8,
                samples,
            });
        }

        if expected != event.waveforms.len() {
            event.warnings.push(UnpackError::WaveformCountMismatch {
                expected,
                parsed: event.waveforms.len(),
            });
        }
        event.unused_words = cursor.remaining();
        Ok(())
    }
}

/// Encode hits and waveforms in the production debug format
///
/// Type, version, core and bonus word counts are filled in here; the rest
/// of `header` is written as given.
pub fn encode_prod_debug(
    header: &ProdDebugHeader,
    digits: &[RawDigit],
    waveforms: &[RawWaveform],
    slow_data: Option<SlowData>,
) -> Vec<u32> {
    let extra = header.extra_words as usize;
    let core_words = c::HEADER_WORDS + digits.len() * (c::HIT_CORE_WORDS + extra) + c::FOOTER_WORDS;
    let mut buf = Vec::with_capacity(core_words + 1);

    let version_word = c::PRODUCTION_DEBUG_FORMAT;
    buf.push(
        (version_word << c::DATA_FORMAT_SHIFT)
            | (c::EVT_MAGIC << c::EVT_MAGIC_SHIFT)
            | (header.scrod_id as u32 & c::SCROD_MASK),
    );
    let bonus: usize = waveforms.iter().map(|w| 2 + w.samples.len().div_ceil(2)).sum::<usize>() + 1;
    buf.push(
        ((header.extra_words as u32) << c::EXTRA_SHIFT)
            | ((bonus as u32 & c::BONUS_MASK) << c::BONUS_SHIFT)
            | ((header.phase as u32 & c::PHASE_MASK) << c::PHASE_SHIFT)
            | (core_words as u32 & c::CORE_MASK),
    );
    buf.push(
        ((header.skip_hit as u32) << c::SKIP_HIT_SHIFT)
            | ((header.ctime as u32 & c::CTIME_MASK) << c::CTIME_SHIFT)
            | header.revo9_counter as u32,
    );
    buf.push(
        ((header.asic_mask as u32) << c::ASIC_MASK_SHIFT)
            | ((header.queue_depth as u32) << c::QUEUE_DEPTH_SHIFT)
            | header.event_number_byte as u32,
    );

    let value = |v: i16| v as u16 as u32 & c::VALUE_MASK;
    for d in digits {
        let mut core = [0u32; c::HIT_CORE_WORDS];
        core[0] = ((d.carrier as u32 & c::TWO_BIT_MASK) << c::CARRIER_SHIFT)
            | ((d.asic as u32 & c::TWO_BIT_MASK) << c::ASIC_SHIFT)
            | ((d.asic_channel as u32 & c::CHANNEL_MASK) << c::CHANNEL_SHIFT)
            | ((d.asic_window as u32 & c::WINDOW_MASK) << c::WINDOW_SHIFT)
            | (c::HIT_MAGIC << c::HIT_MAGIC_SHIFT)
            | ((d.tfine as u32 & c::NIBBLE_MASK) << c::TFINE_SHIFT)
            | ((d.has_waveform as u32) << c::HAS_WAVEFORM_SHIFT);
        core[1] = (value(d.value_peak) << c::VALUE_HI_SHIFT) | d.integral as u32;
        core[2] = (value(d.value_rise0) << c::VALUE_HI_SHIFT) | value(d.value_rise1);
        core[3] = (value(d.value_fall0) << c::VALUE_HI_SHIFT) | value(d.value_fall1);
        core[4] = ((d.sample_rise as u32) << c::SAMPLE_RISE_SHIFT)
            | ((d.dsamp_peak as u32 & c::NIBBLE_MASK) << c::DSAMP_PEAK_SHIFT)
            | ((d.dsamp_fall as u32 & c::NIBBLE_MASK) << c::DSAMP_FALL_SHIFT);
        core[4] |= hit_checksum(&core) as u32;
        buf.extend_from_slice(&core);
        buf.extend(std::iter::repeat(0).take(extra));
    }

    let (sd_type, sd_data) = slow_data.map_or((0, 0), |s| (s.sd_type as u32, s.sd_data as u32));
    buf.push(
        (sd_type << c::SD_TYPE_SHIFT)
            | ((sd_data & c::SD_DATA_MASK) << c::SD_DATA_SHIFT)
            | (c::FOOTER_MAGIC << c::FOOTER_MAGIC_SHIFT)
            | (digits.len() as u32 & c::NHITS_MASK),
    );

    for wf in waveforms {
        buf.push(
            ((wf.samples.len() as u32) << c::WF_NSAMPLES_SHIFT)
                | ((wf.n_windows as u32 & c::WF_NWINDOWS_MASK) << c::WF_NWINDOWS_SHIFT)
                | ((wf.carrier as u32 & c::TWO_BIT_MASK) << c::WF_CARRIER_SHIFT)
                | ((wf.asic as u32 & c::TWO_BIT_MASK) << c::WF_ASIC_SHIFT)
                | (wf.asic_channel as u32 & c::CHANNEL_MASK),
        );
        buf.push(
            ((wf.start_sample as u32 & c::WF_START_SAMPLE_MASK) << c::WF_START_SAMPLE_SHIFT)
                | ((wf.logic_window as u32 & c::WINDOW_MASK) << c::WF_LOGIC_WINDOW_SHIFT)
                | ((wf.carrier_event_number as u32 & c::WF_EVENT_MASK) << c::WF_EVENT_SHIFT)
                | (wf.physical_window as u32 & c::WINDOW_MASK),
        );
        for pair in wf.samples.chunks(2) {
            let first = pair[0] as u16 as u32;
            let last = pair.get(1).map_or(0, |s| *s as u16 as u32);
            buf.push((last << 16) | first);
        }
    }
    buf.push(c::WAVEFORM_END_WORD);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::top::raw_digit::tests::sample_digit;

    fn header() -> ProdDebugHeader {
        ProdDebugHeader {
            scrod_id: 17,
            phase: 3,
            ctime: 0x123,
            revo9_counter: 4321,
            asic_mask: 0xFFFF,
            queue_depth: 2,
            event_number_byte: 9,
            ..Default::default()
        }
    }

    fn hit(channel: u8, window: u16) -> RawDigit {
        RawDigit {
            scrod_id: 17,
            asic_channel: channel,
            asic_window: window,
            revo9_counter: 4321,
            phase: 3,
            ..sample_digit()
        }
    }

    #[test]
    fn test_decode_hits() {
        let digits = vec![hit(1, 10), hit(5, 200)];
        let buf = encode_prod_debug(&header(), &digits, &[], None);
        assert_eq!(
            ProdDebugDecoder::data_format(&buf),
            Some(constants::PRODUCTION_DEBUG_FORMAT)
        );

        let event = ProdDebugDecoder::with_defaults().decode(&buf).unwrap();
        assert_eq!(event.header.scrod_id, 17);
        assert_eq!(event.header.phase, 3);
        assert_eq!(event.header.ctime, 0x123);
        assert_eq!(event.header.revo9_counter, 4321);
        assert_eq!(event.header.event_number_byte, 9);
        assert_eq!(event.digits.len(), 2);
        assert!(event.warnings.is_empty(), "{:?}", event.warnings);
        assert_eq!(event.digits[0].asic_channel, 1);
        assert_eq!(event.digits[1].asic_window, 200);
        assert_eq!(event.digits[0].value_peak, 400);
        assert_eq!(event.digits[0].integral, 2000);
        assert_eq!(event.digits[0].sample_rise, 10);
        assert_eq!(event.digits[0].dsamp_fall, 2);
        assert_eq!(event.unused_words, 0);
    }

    #[test]
    fn test_hit_checksum_folds_to_ffff() {
        let digits = vec![hit(2, 33)];
        let buf = encode_prod_debug(&header(), &digits, &[], None);
        let core = &buf[4..9];
        let sum: u32 = core.iter().map(|w| sum_shorts(*w)).sum();
        assert_eq!(fold16(sum), 0xFFFF);
    }

    #[test]
    fn test_corrupted_hit_is_skipped() {
        let digits = vec![hit(1, 10), hit(2, 11), hit(3, 12)];
        let mut buf = encode_prod_debug(&header(), &digits, &[], None);
        // Flip a bit in the integral of the second hit
        buf[4 + 5 + 1] ^= 0x0000_0100;
        let event = ProdDebugDecoder::with_defaults().decode(&buf).unwrap();
        assert_eq!(event.digits.len(), 2);
        assert_eq!(event.digits[0].asic_channel, 1);
        assert_eq!(event.digits[1].asic_channel, 3);
        assert_eq!(event.warnings, vec![UnpackError::HitChecksum { index: 1 }]);
    }

    #[test]
    fn test_bad_header_magic() {
        let mut buf = encode_prod_debug(&header(), &[hit(0, 0)], &[], None);
        buf[0] &= !(0xF << 12);
        assert_eq!(
            ProdDebugDecoder::with_defaults().decode(&buf).unwrap_err(),
            UnpackError::BadHeaderMagic(0)
        );
    }

    #[test]
    fn test_bad_hit_magic_stops_decoding() {
        let mut buf = encode_prod_debug(&header(), &[hit(0, 0)], &[], None);
        buf[4] &= !(0xF << 12);
        assert!(matches!(
            ProdDebugDecoder::with_defaults().decode(&buf),
            Err(UnpackError::BadHitMagic { index: 0, .. })
        ));
    }

    #[test]
    fn test_bad_footer_magic() {
        let mut buf = encode_prod_debug(&header(), &[hit(0, 0)], &[], None);
        buf[9] &= !(0x7 << 9);
        assert_eq!(
            ProdDebugDecoder::with_defaults().decode(&buf).unwrap_err(),
            UnpackError::BadFooterMagic(0)
        );
    }

    #[test]
    fn test_core_length_out_of_range() {
        let mut buf = encode_prod_debug(&header(), &[hit(0, 0)], &[], None);
        buf[1] = (buf[1] & !0xFFF) | 0xFFF;
        assert!(matches!(
            ProdDebugDecoder::with_defaults().decode(&buf),
            Err(UnpackError::CoreLengthOutOfRange { core: 0xFFF, .. })
        ));
    }

    #[test]
    fn test_slow_data_and_extra_words() {
        let mut h = header();
        h.extra_words = 2;
        let slow = SlowData {
            scrod_id: 17,
            sd_type: 3,
            sd_data: 0xABC,
        };
        let buf = encode_prod_debug(&h, &[hit(4, 1), hit(6, 2)], &[], Some(slow));
        let event = ProdDebugDecoder::with_defaults().decode(&buf).unwrap();
        assert_eq!(event.digits.len(), 2);
        assert_eq!(event.digits[1].asic_channel, 6);
        assert_eq!(event.slow_data, Some(slow));
    }

    #[test]
    fn test_waveforms() {
        let mut d = hit(3, 40);
        d.has_waveform = true;
        let wf = RawWaveform {
            scrod_id: 17,
            asic_channel: 3,
            n_windows: 1,
            start_sample: 5,
            logic_window: 40,
            physical_window: 41,
            carrier_event_number: 9,
            samples: (0..32).map(|i| (i as i16) * 10 - 50).collect(),
            ..Default::default()
        };
        let buf = encode_prod_debug(&header(), &[d], std::slice::from_ref(&wf), None);
        let event = ProdDebugDecoder::with_defaults().decode(&buf).unwrap();
        assert_eq!(event.waveforms.len(), 1);
        assert_eq!(event.waveforms[0], wf);
        assert!(event.warnings.is_empty());
    }

    #[test]
    fn test_missing_waveform_warns() {
        let mut d = hit(3, 40);
        d.has_waveform = true;
        let buf = encode_prod_debug(&header(), &[d], &[], None);
        let event = ProdDebugDecoder::with_defaults().decode(&buf).unwrap();
        assert_eq!(
            event.warnings,
            vec![UnpackError::WaveformCountMismatch {
                expected: 1,
                parsed: 0
            }]
        );
    }

    #[test]
    fn test_truncated_waveform() {
        let wf = RawWaveform {
            samples: vec![1; 32],
            ..Default::default()
        };
        let buf = encode_prod_debug(&header(), &[], std::slice::from_ref(&wf), None);
        // Drop end word and the last samples
        let cut = &buf[..buf.len() - 6];
        assert!(matches!(
            ProdDebugDecoder::with_defaults().decode(cut),
            Err(UnpackError::WaveformTruncated { .. })
        ));
    }
}
