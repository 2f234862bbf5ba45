//! Worker-replicated unpacking run
//!
//! ```text
//! reader (blocking) ──► worker 0..N ──► collector
//!   sequence checks       validate        counts, quarantine file,
//!   RawHeader filling     begin_run       optional event sink
//!                         unpack
//! ```
//!
//! # Design Principles (KISS)
//! - Each block is processed start-to-finish by one worker
//! - Workers own a clone of the registry; payloads are shared via `Arc`
//! - Ordered checks (sequence, RawHeader filling) stay in the reader
//! - A bad block is quarantined; a failed `begin_run` aborts the run

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::common::{
    AtomicCounters, CounterSnapshot, PipelineError, PipelineResult, ShutdownReceiver,
};
use crate::config::{Config, PipelineConfig};
use crate::event::EventStore;
use crate::rawdata::layout::raw_header;
use crate::rawdata::{
    fill_top_block_raw_header, CopperBlock, SequenceChecker, SequenceIssue, TopBlockInfo,
};
use crate::recorder::{FileFormatError, FileHeader, RawFileWriter};
use crate::registry::UnpackerRegistry;
use crate::top::{HitQuality, RawDigitConverter, SharedConditions, TopUnpacker};

/// Quarantined blocks listed individually in the summary
const MAX_QUARANTINE_RECORDS: usize = 1000;

/// Registry with the TOP unpacker configured from `config`
pub fn build_registry(config: &Config, conditions: SharedConditions) -> UnpackerRegistry {
    let map = Arc::new(config.unpacker.front_end_map());
    let mut top = TopUnpacker::new(config.unpacker.prod_debug.clone(), map)
        .with_detector_id(config.unpacker.top_detector_id);
    if config.unpacker.convert {
        top = top.with_converter(RawDigitConverter::new(
            config.converter.clone(),
            config.calibration.policy.clone(),
            conditions,
        ));
    }
    let mut registry = UnpackerRegistry::new();
    registry.register(Box::new(top));
    registry
}

// =============================================================================
// Messages
// =============================================================================

/// Block set aside instead of being unpacked
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuarantineRecord {
    /// Index of the block in the input stream
    pub index: u64,
    pub event_number: u32,
    pub node_id: u32,
    pub reason: String,
}

struct WorkItem {
    index: u64,
    words: Vec<u32>,
}

enum Collect {
    Event(EventStore),
    Quarantine {
        record: QuarantineRecord,
        words: Vec<u32>,
    },
    Sequence(Vec<SequenceIssue>),
}

fn quarantine(index: u64, words: Vec<u32>, reason: &PipelineError) -> Collect {
    // RawHeader fields are read directly; the block may not parse
    let event_number = words.get(raw_header::POS_EVE_NO).copied();
    let node_id = words.get(raw_header::POS_NODE_ID).copied();
    Collect::Quarantine {
        record: QuarantineRecord {
            index,
            event_number: event_number.unwrap_or_default(),
            node_id: node_id.unwrap_or_default(),
            reason: reason.to_string(),
        },
        words,
    }
}

// =============================================================================
// Summary
// =============================================================================

/// Outcome of one pipeline run
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineSummary {
    pub counters: CounterSnapshot,
    /// (exp, run) in order of first appearance
    pub runs: Vec<(u32, u32)>,
    pub digits_good: u64,
    pub digits_junk: u64,
    pub digits_cal_pulse: u64,
    /// Digits with every calibration stage applied
    pub digits_fully_calibrated: u64,
    /// Unpack issues by kind
    pub issue_counts: BTreeMap<String, u64>,
    /// First sequence issues, formatted
    pub sequence_issues: Vec<String>,
    pub quarantined: Vec<QuarantineRecord>,
    /// Why reading stopped early, if it did
    pub read_error: Option<String>,
    pub elapsed_secs: f64,
}

impl PipelineSummary {
    pub fn total_digits(&self) -> u64 {
        self.digits_good + self.digits_junk + self.digits_cal_pulse
    }

    fn record_event(&mut self, event: &EventStore) {
        let run = (event.exp_number, event.run_number);
        if !self.runs.contains(&run) {
            self.runs.push(run);
        }
        for digit in &event.top_digits {
            match digit.quality {
                HitQuality::Good => self.digits_good += 1,
                HitQuality::Junk => self.digits_junk += 1,
                HitQuality::CalPulse => self.digits_cal_pulse += 1,
            }
            if digit.is_calibrated() {
                self.digits_fully_calibrated += 1;
            }
        }
        for issue in &event.issues {
            *self
                .issue_counts
                .entry(issue.error.kind().to_string())
                .or_default() += 1;
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Reader → workers → collector over a stream of COPPER blocks
pub struct Pipeline {
    config: PipelineConfig,
    registry: UnpackerRegistry,
    counters: Arc<AtomicCounters>,
    event_sink: Option<mpsc::Sender<EventStore>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, registry: UnpackerRegistry) -> Self {
        Self {
            config,
            registry,
            counters: Arc::new(AtomicCounters::new()),
            event_sink: None,
        }
    }

    /// Forward every unpacked event to `sink`
    pub fn with_event_sink(mut self, sink: mpsc::Sender<EventStore>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Live counters, updated while the pipeline runs
    pub fn counters(&self) -> Arc<AtomicCounters> {
        self.counters.clone()
    }

    /// Process every block of `blocks`
    ///
    /// Returns the summary once the input is exhausted or shutdown is
    /// signalled. A run-level error (missing required calibration) stops
    /// reading and is returned after the workers have drained.
    pub async fn run<I>(
        self,
        blocks: I,
        shutdown: ShutdownReceiver,
    ) -> PipelineResult<PipelineSummary>
    where
        I: IntoIterator<Item = Result<Vec<u32>, FileFormatError>> + Send + 'static,
        I::IntoIter: Send + 'static,
    {
        let started = Instant::now();
        let Pipeline {
            config,
            registry,
            counters,
            event_sink,
        } = self;
        let workers = config.workers.max(1);
        let queue_size = config.queue_size.max(1);

        info!(
            workers,
            queue_size,
            unpackers = ?registry.names(),
            "Pipeline starting"
        );

        let (collect_tx, collect_rx) = mpsc::channel::<Collect>(queue_size);

        let mut senders = Vec::with_capacity(workers);
        let mut worker_handles: Vec<JoinHandle<PipelineResult<()>>> = Vec::with_capacity(workers);
        for id in 0..workers {
            let (tx, rx) = mpsc::channel::<WorkItem>(queue_size);
            senders.push(tx);
            let registry = registry.clone();
            let collect_tx = collect_tx.clone();
            let counters = counters.clone();
            worker_handles.push(tokio::spawn(async move {
                worker_task(id, rx, registry, collect_tx, counters).await
            }));
        }

        let collector_handle = {
            let counters = counters.clone();
            let quarantine_file = config.quarantine_file.clone();
            let progress_interval = config.progress_interval;
            tokio::spawn(async move {
                collector_task(collect_rx, quarantine_file, progress_interval, counters, event_sink)
                    .await
            })
        };

        let reader_handle = {
            let counters = counters.clone();
            let config = config.clone();
            let blocks = blocks.into_iter();
            tokio::task::spawn_blocking(move || {
                reader_task(blocks, senders, collect_tx, &config, &counters, shutdown)
            })
        };

        let read_error = reader_handle
            .await
            .map_err(|e| PipelineError::other(format!("Reader task failed: {}", e)))?;

        let mut run_error = None;
        for (id, joined) in join_all(worker_handles).await.into_iter().enumerate() {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(worker = id, error = %e, "Worker aborted");
                    run_error.get_or_insert(e);
                }
                Err(e) => {
                    run_error.get_or_insert(PipelineError::other(format!(
                        "Worker {} failed: {}",
                        id, e
                    )));
                }
            }
        }

        let mut summary = collector_handle
            .await
            .map_err(|e| PipelineError::other(format!("Collector task failed: {}", e)))??;

        if let Some(e) = run_error {
            return Err(e);
        }

        summary.counters = counters.snapshot();
        summary.read_error = read_error;
        summary.elapsed_secs = started.elapsed().as_secs_f64();
        info!(
            blocks = summary.counters.blocks_received,
            processed = summary.counters.blocks_processed,
            quarantined = summary.counters.blocks_quarantined,
            digits = summary.total_digits(),
            elapsed_secs = summary.elapsed_secs,
            "Pipeline finished"
        );
        Ok(summary)
    }
}

/// Reader stage: ordered checks, then round-robin to the workers
///
/// Returns the read error that ended the stream early, if any.
fn reader_task<I>(
    blocks: I,
    senders: Vec<mpsc::Sender<WorkItem>>,
    collect_tx: mpsc::Sender<Collect>,
    config: &PipelineConfig,
    counters: &AtomicCounters,
    mut shutdown: ShutdownReceiver,
) -> Option<String>
where
    I: Iterator<Item = Result<Vec<u32>, FileFormatError>>,
{
    let mut checker = SequenceChecker::new();
    let fill_info = TopBlockInfo {
        node_id: config.node_id,
        data_type: config.data_type,
        truncation_mask: 0,
    };

    for (index, item) in blocks.enumerate() {
        let index = index as u64;
        match shutdown.try_recv() {
            Ok(()) | Err(broadcast::error::TryRecvError::Lagged(_)) => {
                info!(blocks = index, "Reader stopping on shutdown");
                break;
            }
            Err(_) => {}
        }

        let mut words = match item {
            Ok(words) => words,
            Err(e) => {
                warn!(index, error = %e, "Input stream ended early");
                return Some(e.to_string());
            }
        };
        counters.inc_received(words.len() as u64 * 4);

        let issues = if config.fill_raw_header {
            match fill_top_block_raw_header(&mut words, &fill_info, &mut checker) {
                Ok(fill) => fill.issues,
                Err(e) => {
                    counters.inc_quarantined();
                    let msg = quarantine(index, words, &PipelineError::Decode(e));
                    if collect_tx.blocking_send(msg).is_err() {
                        break;
                    }
                    continue;
                }
            }
        } else {
            match CopperBlock::new(&words).map(|b| checker.check(&b)) {
                Ok(Ok(issues)) => issues,
                // Structural problems are reported by the worker's validation
                Ok(Err(e)) | Err(e) => {
                    debug!(index, error = %e, "Sequence check skipped");
                    Vec::new()
                }
            }
        };
        if !issues.is_empty() {
            for issue in &issues {
                warn!(index, %issue, "Sequence issue");
            }
            counters.add_sequence_issues(issues.len() as u64);
            if collect_tx.blocking_send(Collect::Sequence(issues)).is_err() {
                break;
            }
        }

        let worker = (index % senders.len() as u64) as usize;
        if senders[worker].blocking_send(WorkItem { index, words }).is_err() {
            warn!(worker, "Worker gone, reader stopping");
            break;
        }
    }
    None
}

/// Validate, refresh calibration at run boundaries, unpack
fn process_block(
    registry: &mut UnpackerRegistry,
    current_run: &mut Option<(u32, u32)>,
    words: &[u32],
) -> PipelineResult<EventStore> {
    let block = CopperBlock::new(words)?;
    block.validate().into_result()?;

    let run = (block.exp_no(), block.run_no());
    if *current_run != Some(run) {
        if current_run.is_some() {
            registry.end_run();
        }
        info!(exp = run.0, run = run.1, "Begin run");
        // Cleared first so a failed begin_run is retried on the next block
        *current_run = None;
        registry.begin_run(run.0, run.1)?;
        *current_run = Some(run);
    }

    registry.unpack(&block)
}

async fn worker_task(
    id: usize,
    mut rx: mpsc::Receiver<WorkItem>,
    mut registry: UnpackerRegistry,
    collect_tx: mpsc::Sender<Collect>,
    counters: Arc<AtomicCounters>,
) -> PipelineResult<()> {
    let mut current_run = None;
    while let Some(WorkItem { index, words }) = rx.recv().await {
        let msg = match process_block(&mut registry, &mut current_run, &words) {
            Ok(event) => {
                counters.inc_processed();
                counters.add_event(
                    event.top_raw_digits.len() as u64,
                    event.top_digits.len() as u64,
                    event.issues.len() as u64,
                );
                Collect::Event(event)
            }
            Err(e) if e.is_block_level() => {
                debug!(worker = id, index, error = %e, "Block quarantined");
                counters.inc_quarantined();
                quarantine(index, words, &e)
            }
            Err(e) => return Err(e),
        };
        if collect_tx.send(msg).await.is_err() {
            return Err(PipelineError::ChannelSend);
        }
    }
    if current_run.is_some() {
        registry.end_run();
    }
    debug!(worker = id, "Worker finished");
    Ok(())
}

async fn collector_task(
    mut rx: mpsc::Receiver<Collect>,
    quarantine_file: Option<PathBuf>,
    progress_interval: u64,
    counters: Arc<AtomicCounters>,
    mut event_sink: Option<mpsc::Sender<EventStore>>,
) -> PipelineResult<PipelineSummary> {
    let mut summary = PipelineSummary::default();
    let mut quarantine_writer: Option<RawFileWriter> = None;
    let mut seen = 0u64;
    let mut last = (Instant::now(), counters.snapshot());

    while let Some(msg) = rx.recv().await {
        match msg {
            Collect::Event(event) => {
                summary.record_event(&event);
                seen += 1;
                if let Some(sink) = &event_sink {
                    if sink.send(event).await.is_err() {
                        debug!("Event sink closed");
                        event_sink = None;
                    }
                }
            }
            Collect::Quarantine { record, words } => {
                warn!(
                    index = record.index,
                    event = record.event_number,
                    reason = %record.reason,
                    "Block quarantined"
                );
                seen += 1;
                if let Some(path) = &quarantine_file {
                    if quarantine_writer.is_none() {
                        let mut header = FileHeader::new(0, 0, 0);
                        header.comment = "quarantined blocks".to_string();
                        quarantine_writer = Some(RawFileWriter::create(path, &header)?);
                    }
                    if let Some(writer) = quarantine_writer.as_mut() {
                        writer.write_block(&words)?;
                    }
                }
                if summary.quarantined.len() < MAX_QUARANTINE_RECORDS {
                    summary.quarantined.push(record);
                }
            }
            Collect::Sequence(issues) => {
                let room = MAX_QUARANTINE_RECORDS.saturating_sub(summary.sequence_issues.len());
                summary
                    .sequence_issues
                    .extend(issues.iter().take(room).map(|i| i.to_string()));
            }
        }

        if progress_interval > 0 && seen > 0 && seen % progress_interval == 0 {
            let now = (Instant::now(), counters.snapshot());
            let rate = now.1.rate_from(&last.1, now.0.duration_since(last.0).as_secs_f64());
            info!(
                blocks = now.1.blocks_processed,
                quarantined = now.1.blocks_quarantined,
                rate = %rate.format_blocks_rate(),
                throughput = %rate.format_bytes_rate(),
                "Progress"
            );
            last = now;
        }
    }

    if let Some(writer) = quarantine_writer {
        let footer = writer.finish()?;
        info!(blocks = footer.total_blocks, "Quarantine file closed");
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_source_emulator::{Emulator, EmulatorConfig};
    use crate::recorder::open_raw_file;
    use crate::top::{CalibrationMode, CalibrationPolicy, ConditionsStore};

    fn blocks(config: EmulatorConfig) -> Vec<Result<Vec<u32>, FileFormatError>> {
        Emulator::new(config).unwrap().map(Ok).collect()
    }

    fn emulator_config(num_events: u64) -> EmulatorConfig {
        EmulatorConfig {
            num_events,
            seed: Some(7),
            ..Default::default()
        }
    }

    fn pipeline(config: &Config) -> Pipeline {
        let registry = build_registry(config, ConditionsStore::new().into_shared());
        Pipeline::new(config.pipeline.clone(), registry)
    }

    #[tokio::test]
    async fn test_clean_stream() {
        let config = Config::default();
        let (_tx, rx) = broadcast::channel(1);
        let summary = pipeline(&config)
            .run(blocks(emulator_config(50)), rx)
            .await
            .unwrap();

        assert_eq!(summary.counters.blocks_received, 50);
        assert_eq!(summary.counters.blocks_processed, 50);
        assert_eq!(summary.counters.blocks_quarantined, 0);
        assert_eq!(summary.counters.sequence_issues, 0);
        assert_eq!(summary.runs, vec![(1, 1)]);
        assert_eq!(summary.total_digits(), summary.counters.digits);
        assert_eq!(summary.counters.raw_hits, summary.counters.digits);
        assert!(summary.counters.digits > 0);
        assert!(summary.issue_counts.is_empty(), "{:?}", summary.issue_counts);
    }

    #[tokio::test]
    async fn test_corrupt_blocks_are_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let quarantine_path = dir.path().join("quarantine.b2raw");
        let mut config = Config::default();
        config.pipeline.workers = 3;
        config.pipeline.quarantine_file = Some(quarantine_path.clone());

        let mut input = blocks(emulator_config(30));
        // Break the RawTrailer magic of two blocks
        for i in [4usize, 17] {
            let words = input[i].as_mut().unwrap();
            let n = words.len();
            words[n - 1] = 0;
        }

        let (_tx, rx) = broadcast::channel(1);
        let summary = pipeline(&config).run(input, rx).await.unwrap();
        assert_eq!(summary.counters.blocks_processed, 28);
        assert_eq!(summary.counters.blocks_quarantined, 2);
        let mut indices: Vec<u64> = summary.quarantined.iter().map(|q| q.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![4, 17]);
        assert!(summary.quarantined[0].reason.contains("Decode error"));

        let mut reader = open_raw_file(&quarantine_path).unwrap();
        let result = reader.validate();
        assert!(result.is_valid, "{:?}", result.errors);
        assert_eq!(result.footer.map(|f| f.total_blocks), Some(2));
    }

    #[tokio::test]
    async fn test_required_calibration_aborts_run() {
        let mut config = Config::default();
        config.calibration.policy = CalibrationPolicy {
            common_t0: CalibrationMode::Required,
            ..Default::default()
        };
        let (_tx, rx) = broadcast::channel(1);
        let err = pipeline(&config)
            .run(blocks(emulator_config(10)), rx)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Calibration(_)));
    }

    #[tokio::test]
    async fn test_sequence_gap_is_reported() {
        let config = Config::default();
        let mut input = blocks(emulator_config(10));
        input.remove(5);
        let (_tx, rx) = broadcast::channel(1);
        let summary = pipeline(&config).run(input, rx).await.unwrap();
        assert_eq!(summary.counters.blocks_processed, 9);
        assert!(summary.counters.sequence_issues >= 1);
        assert!(summary
            .sequence_issues
            .iter()
            .any(|s| s.contains("event 6 follows 4")));
    }

    #[tokio::test]
    async fn test_fill_raw_header() {
        let mut config = Config::default();
        config.pipeline.fill_raw_header = true;
        let emu = EmulatorConfig {
            pre_raw: true,
            ..emulator_config(12)
        };
        let (sink_tx, mut sink_rx) = mpsc::channel(64);
        let (_tx, rx) = broadcast::channel(1);
        let summary = pipeline(&config)
            .with_event_sink(sink_tx)
            .run(blocks(emu), rx)
            .await
            .unwrap();
        assert_eq!(summary.counters.blocks_processed, 12);
        assert_eq!(summary.counters.sequence_issues, 0);

        let mut events = Vec::new();
        while let Some(event) = sink_rx.recv().await {
            events.push(event.event_number);
        }
        events.sort_unstable();
        assert_eq!(events, (0..12).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_run_change_and_shutdown() {
        let config = Config::default();
        let emu = EmulatorConfig {
            events_per_run: 5,
            ..emulator_config(15)
        };
        let (_tx, rx) = broadcast::channel(1);
        let summary = pipeline(&config).run(blocks(emu), rx).await.unwrap();
        let mut runs = summary.runs.clone();
        runs.sort_unstable();
        assert_eq!(runs, vec![(1, 1), (1, 2), (1, 3)]);

        // Shutdown before the first block: nothing is read
        let (tx, rx) = broadcast::channel(1);
        tx.send(()).unwrap();
        let summary = pipeline(&config)
            .run(blocks(emulator_config(15)), rx)
            .await
            .unwrap();
        assert_eq!(summary.counters.blocks_received, 0);
    }

    #[tokio::test]
    async fn test_truncated_input_stops_reading() {
        let config = Config::default();
        let mut input = blocks(emulator_config(6));
        input.insert(3, Err(FileFormatError::TooShort));
        let (_tx, rx) = broadcast::channel(1);
        let summary = pipeline(&config).run(input, rx).await.unwrap();
        assert_eq!(summary.counters.blocks_received, 3);
        assert!(summary.read_error.is_some());
    }
}
