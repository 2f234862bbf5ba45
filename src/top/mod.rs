//! TOP (time-of-propagation counter) raw data and time calibration
//!
//! - [`prod_debug`]: decoder for the production debug format of one SCROD
//! - [`mapping`]: SCROD → module/boardstack and channel/pixel numbering
//! - [`sample_times`]: sample → time conversion
//! - [`calibration`]: calibration payloads, intervals of validity, policy
//! - [`converter`]: raw digit → calibrated digit
//! - [`unpacker`]: [`DetectorUnpacker`](crate::registry::DetectorUnpacker) for TOP blocks

pub mod calibration;
pub mod converter;
pub mod digit;
pub mod mapping;
pub mod prod_debug;
pub mod raw_digit;
pub mod sample_times;
pub mod unpacker;

pub use calibration::{
    CalibrationError, CalibrationMode, CalibrationPolicy, CalibrationSet, ConditionsStore,
    IntervalOfValidity, PayloadData, PayloadKind, PayloadRecord, SharedConditions,
};
pub use converter::{CalPulseConfig, ConverterConfig, RawDigitConverter};
pub use digit::{status, HitQuality, TopDigit};
pub use mapping::{FrontEndMap, FrontEndMapping};
pub use prod_debug::{
    encode_prod_debug, ProdDebugConfig, ProdDebugDecoder, ProdDebugEvent, ProdDebugHeader,
    RawWaveform, SlowData, UnpackError,
};
pub use raw_digit::RawDigit;
pub use sample_times::SampleTimes;
pub use unpacker::TopUnpacker;
