//! Calibration payloads and their intervals of validity
//!
//! Payloads are loaded from a JSON conditions file into a [`ConditionsStore`].
//! At the start of each run the converter resolves the payloads valid for
//! that run into a typed [`CalibrationSet`].
//!
//! # Policy
//! Each stage has a [`CalibrationMode`]:
//! - `Off`: stage never applied, payload not looked up
//! - `Optional`: payload used when present, otherwise the stage is skipped
//! - `Required`: a missing payload aborts the run
//!
//! # JSON format
//! ```json
//! { "payloads": [
//!   { "iov": { "exp_low": 0, "run_low": 0, "exp_high": -1, "run_high": -1 },
//!     "kind": "common_t0", "t0": 1.5, "error": 0.01 }
//! ] }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use super::sample_times::SampleTimes;

/// Calibration errors
#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("Required payload {kind} missing for exp {exp} run {run}")]
    MissingPayload {
        kind: PayloadKind,
        exp: i32,
        run: i32,
    },

    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: PayloadKind, reason: String },

    #[error("Invalid sample times: {0}")]
    InvalidSampleTimes(String),

    #[error("Failed to read conditions file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse conditions JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl CalibrationError {
    pub fn invalid(kind: PayloadKind, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            kind,
            reason: reason.into(),
        }
    }

    /// Whether this error must abort the run
    pub fn is_missing_required(&self) -> bool {
        matches!(self, Self::MissingPayload { .. })
    }
}

/// How a calibration stage treats a missing payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationMode {
    Off,
    #[default]
    Optional,
    Required,
}

/// Payload types, one per calibration stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    SampleTimes,
    TimeWalk,
    ChannelT0,
    AsicShift,
    ModuleT0,
    CommonT0,
}

impl PayloadKind {
    pub const ALL: [PayloadKind; 6] = [
        PayloadKind::SampleTimes,
        PayloadKind::TimeWalk,
        PayloadKind::ChannelT0,
        PayloadKind::AsicShift,
        PayloadKind::ModuleT0,
        PayloadKind::CommonT0,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PayloadKind::SampleTimes => "sample_times",
            PayloadKind::TimeWalk => "time_walk",
            PayloadKind::ChannelT0 => "channel_t0",
            PayloadKind::AsicShift => "asic_shift",
            PayloadKind::ModuleT0 => "module_t0",
            PayloadKind::CommonT0 => "common_t0",
        };
        write!(f, "{}", name)
    }
}

/// Mode per calibration stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationPolicy {
    pub sample_times: CalibrationMode,
    pub time_walk: CalibrationMode,
    pub channel_t0: CalibrationMode,
    pub asic_shift: CalibrationMode,
    pub module_t0: CalibrationMode,
    pub common_t0: CalibrationMode,
}

impl CalibrationPolicy {
    pub fn mode(&self, kind: PayloadKind) -> CalibrationMode {
        match kind {
            PayloadKind::SampleTimes => self.sample_times,
            PayloadKind::TimeWalk => self.time_walk,
            PayloadKind::ChannelT0 => self.channel_t0,
            PayloadKind::AsicShift => self.asic_shift,
            PayloadKind::ModuleT0 => self.module_t0,
            PayloadKind::CommonT0 => self.common_t0,
        }
    }

    /// Every stage set to `mode`
    pub fn all(mode: CalibrationMode) -> Self {
        Self {
            sample_times: mode,
            time_walk: mode,
            channel_t0: mode,
            asic_shift: mode,
            module_t0: mode,
            common_t0: mode,
        }
    }
}

// =============================================================================
// Interval of validity
// =============================================================================

/// Experiment/run range; `-1` leaves a bound open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalOfValidity {
    pub exp_low: i32,
    pub run_low: i32,
    pub exp_high: i32,
    pub run_high: i32,
}

impl IntervalOfValidity {
    /// Valid for everything
    pub fn always() -> Self {
        Self {
            exp_low: -1,
            run_low: -1,
            exp_high: -1,
            run_high: -1,
        }
    }

    /// Valid for a single experiment/run
    pub fn single_run(exp: i32, run: i32) -> Self {
        Self {
            exp_low: exp,
            run_low: run,
            exp_high: exp,
            run_high: run,
        }
    }

    pub fn contains(&self, exp: i32, run: i32) -> bool {
        if self.exp_low >= 0 {
            if exp < self.exp_low {
                return false;
            }
            if exp == self.exp_low && self.run_low >= 0 && run < self.run_low {
                return false;
            }
        }
        if self.exp_high >= 0 {
            if exp > self.exp_high {
                return false;
            }
            if exp == self.exp_high && self.run_high >= 0 && run > self.run_high {
                return false;
            }
        }
        true
    }
}

// =============================================================================
// Raw payload records (JSON)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleTimesEntry {
    pub scrod_id: u16,
    /// Channel within the SCROD (0..127)
    pub channel: u32,
    pub time_axis: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelT0Entry {
    pub module_id: u8,
    pub channel: u32,
    pub t0: f64,
    #[serde(default)]
    pub error: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsicShiftEntry {
    pub module_id: u8,
    pub asic: u32,
    pub shift: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleT0Entry {
    pub module_id: u8,
    pub t0: f64,
    #[serde(default)]
    pub error: f64,
}

/// Payload content, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadData {
    SampleTimes {
        entries: Vec<SampleTimesEntry>,
    },
    TimeWalk {
        coefficients: Vec<f64>,
        #[serde(default)]
        noise: f64,
        #[serde(default)]
        quadratic: f64,
    },
    ChannelT0 {
        entries: Vec<ChannelT0Entry>,
    },
    AsicShift {
        entries: Vec<AsicShiftEntry>,
    },
    ModuleT0 {
        entries: Vec<ModuleT0Entry>,
    },
    CommonT0 {
        t0: f64,
        #[serde(default)]
        error: f64,
    },
}

impl PayloadData {
    pub fn kind(&self) -> PayloadKind {
        match self {
            PayloadData::SampleTimes { .. } => PayloadKind::SampleTimes,
            PayloadData::TimeWalk { .. } => PayloadKind::TimeWalk,
            PayloadData::ChannelT0 { .. } => PayloadKind::ChannelT0,
            PayloadData::AsicShift { .. } => PayloadKind::AsicShift,
            PayloadData::ModuleT0 { .. } => PayloadKind::ModuleT0,
            PayloadData::CommonT0 { .. } => PayloadKind::CommonT0,
        }
    }
}

/// One payload with its interval of validity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadRecord {
    pub iov: IntervalOfValidity,
    #[serde(flatten)]
    pub data: PayloadData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConditionsFile {
    #[serde(default)]
    payloads: Vec<PayloadRecord>,
}

// =============================================================================
// Conditions store
// =============================================================================

#[derive(Debug, Clone)]
struct StoredPayload {
    id: u64,
    record: PayloadRecord,
}

/// Ids of the payloads selected for a run, one slot per [`PayloadKind`]
pub type PayloadIds = [Option<u64>; 6];

/// All known payloads
///
/// When several payloads of the same kind are valid for a run, the one
/// added last wins.
#[derive(Debug, Default)]
pub struct ConditionsStore {
    payloads: Vec<StoredPayload>,
    next_id: u64,
}

/// Store shared between workers; written only between runs
pub type SharedConditions = Arc<RwLock<ConditionsStore>>;

impl ConditionsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON conditions file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CalibrationError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let store = Self::from_json(&content)?;
        info!(
            path = %path.as_ref().display(),
            payloads = store.len(),
            "Loaded conditions"
        );
        Ok(store)
    }

    pub fn from_json(content: &str) -> Result<Self, CalibrationError> {
        let file: ConditionsFile = serde_json::from_str(content)?;
        let mut store = Self::new();
        for record in file.payloads {
            store.add(record);
        }
        Ok(store)
    }

    pub fn into_shared(self) -> SharedConditions {
        Arc::new(RwLock::new(self))
    }

    /// Add a payload, returning its id
    pub fn add(&mut self, record: PayloadRecord) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.payloads.push(StoredPayload { id, record });
        id
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    fn find(&self, kind: PayloadKind, exp: i32, run: i32) -> Option<&StoredPayload> {
        self.payloads
            .iter()
            .rev()
            .find(|p| p.record.data.kind() == kind && p.record.iov.contains(exp, run))
    }

    /// Ids of the payloads a run would use under `policy`
    pub fn payload_ids(&self, policy: &CalibrationPolicy, exp: i32, run: i32) -> PayloadIds {
        let mut ids = [None; 6];
        for kind in PayloadKind::ALL {
            if policy.mode(kind) != CalibrationMode::Off {
                ids[kind.index()] = self.find(kind, exp, run).map(|p| p.id);
            }
        }
        ids
    }

    /// Resolve the typed calibration for one run
    pub fn resolve(
        &self,
        policy: &CalibrationPolicy,
        exp: i32,
        run: i32,
    ) -> Result<CalibrationSet, CalibrationError> {
        let mut set = CalibrationSet::default();
        for kind in PayloadKind::ALL {
            let mode = policy.mode(kind);
            if mode == CalibrationMode::Off {
                continue;
            }
            let Some(stored) = self.find(kind, exp, run) else {
                if mode == CalibrationMode::Required {
                    return Err(CalibrationError::MissingPayload { kind, exp, run });
                }
                warn!(payload = %kind, exp, run, "Optional payload missing, stage skipped");
                continue;
            };
            set.ids[kind.index()] = Some(stored.id);
            set.install(&stored.record.data)?;
        }
        Ok(set)
    }
}

// =============================================================================
// Typed calibration tables
// =============================================================================

/// Offset with its uncertainty (ns)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct T0Value {
    pub t0: f64,
    pub error: f64,
}

/// Time-walk model: correction polynomial and resolution terms
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TimeWalk {
    pub coefficients: Vec<f64>,
    pub noise: f64,
    pub quadratic: f64,
}

impl TimeWalk {
    /// Time walk at pulse height `height`
    pub fn correction(&self, height: f64) -> f64 {
        self.coefficients.iter().rev().fold(0.0, |acc, p| acc * height + p)
    }

    /// Variance contribution at pulse height `height`
    pub fn sigma_sq(&self, height: f64) -> f64 {
        if height <= 0.0 {
            return 0.0;
        }
        let noise = self.noise / height;
        let quad = self.quadratic * height * height;
        noise * noise + quad * quad
    }
}

/// Typed payloads valid for one run
#[derive(Debug, Clone, Default)]
pub struct CalibrationSet {
    pub sample_times: Option<HashMap<(u16, u32), SampleTimes>>,
    pub time_walk: Option<TimeWalk>,
    pub channel_t0: Option<HashMap<(u8, u32), T0Value>>,
    pub asic_shift: Option<HashMap<(u8, u32), f64>>,
    pub module_t0: Option<HashMap<u8, T0Value>>,
    pub common_t0: Option<T0Value>,
    ids: PayloadIds,
}

impl CalibrationSet {
    pub fn ids(&self) -> &PayloadIds {
        &self.ids
    }

    fn install(&mut self, data: &PayloadData) -> Result<(), CalibrationError> {
        match data {
            PayloadData::SampleTimes { entries } => {
                let mut table = HashMap::with_capacity(entries.len());
                for e in entries {
                    let st = SampleTimes::calibrated(e.time_axis.clone()).map_err(|err| {
                        CalibrationError::invalid(
                            PayloadKind::SampleTimes,
                            format!("scrod {} channel {}: {}", e.scrod_id, e.channel, err),
                        )
                    })?;
                    table.insert((e.scrod_id, e.channel), st);
                }
                self.sample_times = Some(table);
            }
            PayloadData::TimeWalk {
                coefficients,
                noise,
                quadratic,
            } => {
                self.time_walk = Some(TimeWalk {
                    coefficients: coefficients.clone(),
                    noise: *noise,
                    quadratic: *quadratic,
                });
            }
            PayloadData::ChannelT0 { entries } => {
                let table = entries
                    .iter()
                    .map(|e| {
                        check_t0(PayloadKind::ChannelT0, e.t0, e.error)
                            .map(|v| ((e.module_id, e.channel), v))
                    })
                    .collect::<Result<_, _>>()?;
                self.channel_t0 = Some(table);
            }
            PayloadData::AsicShift { entries } => {
                let table = entries
                    .iter()
                    .map(|e| ((e.module_id, e.asic), e.shift))
                    .collect();
                self.asic_shift = Some(table);
            }
            PayloadData::ModuleT0 { entries } => {
                let table = entries
                    .iter()
                    .map(|e| {
                        check_t0(PayloadKind::ModuleT0, e.t0, e.error).map(|v| (e.module_id, v))
                    })
                    .collect::<Result<_, _>>()?;
                self.module_t0 = Some(table);
            }
            PayloadData::CommonT0 { t0, error } => {
                self.common_t0 = Some(check_t0(PayloadKind::CommonT0, *t0, *error)?);
            }
        }
        Ok(())
    }
}

fn check_t0(kind: PayloadKind, t0: f64, error: f64) -> Result<T0Value, CalibrationError> {
    if !t0.is_finite() || !error.is_finite() || error < 0.0 {
        return Err(CalibrationError::invalid(
            kind,
            format!("bad value t0={} error={}", t0, error),
        ));
    }
    Ok(T0Value { t0, error })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONDITIONS: &str = r#"{
        "payloads": [
            { "iov": { "exp_low": 1, "run_low": 0, "exp_high": 1, "run_high": -1 },
              "kind": "common_t0", "t0": 1.5, "error": 0.1 },
            { "iov": { "exp_low": 1, "run_low": 10, "exp_high": 1, "run_high": 20 },
              "kind": "common_t0", "t0": 2.5 },
            { "iov": { "exp_low": -1, "run_low": -1, "exp_high": -1, "run_high": -1 },
              "kind": "channel_t0",
              "entries": [ { "module_id": 1, "channel": 5, "t0": 0.3, "error": 0.02 } ] },
            { "iov": { "exp_low": -1, "run_low": -1, "exp_high": -1, "run_high": -1 },
              "kind": "time_walk", "coefficients": [0.1, -0.001], "noise": 2.0, "quadratic": 0.0 }
        ]
    }"#;

    #[test]
    fn test_iov_contains() {
        let iov = IntervalOfValidity {
            exp_low: 1,
            run_low: 10,
            exp_high: 2,
            run_high: 5,
        };
        assert!(!iov.contains(1, 9));
        assert!(iov.contains(1, 10));
        assert!(iov.contains(1, 5000));
        assert!(iov.contains(2, 5));
        assert!(!iov.contains(2, 6));
        assert!(!iov.contains(3, 0));
        assert!(IntervalOfValidity::always().contains(42, 42));
        assert!(IntervalOfValidity::single_run(3, 7).contains(3, 7));
        assert!(!IntervalOfValidity::single_run(3, 7).contains(3, 8));
    }

    #[test]
    fn test_parse_and_resolve() {
        let store = ConditionsStore::from_json(CONDITIONS).unwrap();
        assert_eq!(store.len(), 4);

        let set = store.resolve(&CalibrationPolicy::default(), 1, 3).unwrap();
        assert_eq!(set.common_t0, Some(T0Value { t0: 1.5, error: 0.1 }));
        let ch = set.channel_t0.as_ref().unwrap();
        assert_eq!(ch.get(&(1, 5)).unwrap().t0, 0.3);
        assert!(set.module_t0.is_none());
        assert!(set.sample_times.is_none());

        // Later, narrower payload wins inside its range
        let set = store.resolve(&CalibrationPolicy::default(), 1, 15).unwrap();
        assert_eq!(set.common_t0.unwrap().t0, 2.5);
    }

    #[test]
    fn test_required_payload_missing() {
        let store = ConditionsStore::from_json(CONDITIONS).unwrap();
        let policy = CalibrationPolicy {
            module_t0: CalibrationMode::Required,
            ..Default::default()
        };
        let err = store.resolve(&policy, 1, 3).unwrap_err();
        assert!(err.is_missing_required());
        assert!(err.to_string().contains("module_t0"));
    }

    #[test]
    fn test_off_skips_lookup() {
        let store = ConditionsStore::from_json(CONDITIONS).unwrap();
        let policy = CalibrationPolicy::all(CalibrationMode::Off);
        let set = store.resolve(&policy, 1, 3).unwrap();
        assert!(set.common_t0.is_none());
        assert_eq!(store.payload_ids(&policy, 1, 3), [None; 6]);
    }

    #[test]
    fn test_payload_ids_track_changes() {
        let store = ConditionsStore::from_json(CONDITIONS).unwrap();
        let policy = CalibrationPolicy::default();
        let a = store.payload_ids(&policy, 1, 3);
        let b = store.payload_ids(&policy, 1, 4);
        let c = store.payload_ids(&policy, 1, 15);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let set = store.resolve(&policy, 1, 3).unwrap();
        assert_eq!(set.ids(), &a);
    }

    #[test]
    fn test_invalid_sample_times_payload() {
        let mut store = ConditionsStore::new();
        store.add(PayloadRecord {
            iov: IntervalOfValidity::always(),
            data: PayloadData::SampleTimes {
                entries: vec![SampleTimesEntry {
                    scrod_id: 1,
                    channel: 0,
                    time_axis: vec![0.0, 1.0],
                }],
            },
        });
        let err = store
            .resolve(&CalibrationPolicy::default(), 0, 0)
            .unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidPayload { .. }));
    }

    #[test]
    fn test_time_walk_model() {
        let tw = TimeWalk {
            coefficients: vec![1.0, 2.0, 3.0],
            noise: 4.0,
            quadratic: 0.5,
        };
        assert!((tw.correction(2.0) - (1.0 + 4.0 + 12.0)).abs() < 1e-12);
        assert!((tw.sigma_sq(2.0) - (4.0 + 4.0)).abs() < 1e-12);
        assert_eq!(tw.sigma_sq(0.0), 0.0);
    }

    #[test]
    fn test_bad_json() {
        let err = ConditionsStore::from_json("{ not json").unwrap_err();
        assert!(matches!(err, CalibrationError::Json(_)));
    }
}
