//! Background loading manager.
//!
//! `start()` validates the file, plans chunks from filesystem metadata, then
//! hands the operation to a dedicated control thread and returns a
//! `LoadHandle` immediately. The control thread drives the worker pool,
//! aggregates progress, and delivers the final `LoadOutcome` over a channel.
//!
//! State machine per operation:
//!
//! ```text
//! Pending -> Running -> { Completed | Cancelled | Failed }
//! Pending -> Cancelled            (cancelled before the control thread ran)
//! ```
//!
//! Each operation is shared with its control thread, so a load keeps running
//! after the `BackgroundLoader` that started it is dropped. Only the handle
//! (or `cancel_all`) stops it.
//!
//! Partial data beats no data for large files: if some chunks fail the
//! operation still completes with the surviving records plus an error list.
//! Only when every chunk fails is it `Failed`.

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError, bounded};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::System;
use thiserror::Error;
use uuid::Uuid;

use super::cancel::{CancellationToken, panic_message};
use super::chunker::{ChunkPlanner, ChunkingError, FileChunk, MAX_WORKERS, recommended_workers};
use super::progress::{LoadStage, ProgressAggregator};
use super::source::FileSource;
use super::traits::{ChunkParser, ProgressSink};
use super::workers::{ChunkParseError, ThreadCoordinator};
use crate::config::LoaderSettings;

/// Unique id of a load operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId(Uuid);

impl OperationId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LoadStatus {
    Pending = 0,
    Running = 1,
    Completed = 2,
    Cancelled = 3,
    Failed = 4,
}

impl LoadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoadStatus::Completed | LoadStatus::Cancelled | LoadStatus::Failed)
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LoadStatus::Pending,
            1 => LoadStatus::Running,
            2 => LoadStatus::Completed,
            3 => LoadStatus::Cancelled,
            _ => LoadStatus::Failed,
        }
    }
}

/// Operation-level errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// Fatal: the operation never started
    #[error("cannot load {}: {reason}", path.display())]
    FileAccess { path: PathBuf, reason: String },
    #[error(transparent)]
    Chunking(#[from] ChunkingError),
    #[error("all {} chunks failed to parse", errors.len())]
    AllChunksFailed { errors: Vec<ChunkParseError> },
    #[error("failed to spawn loader thread: {0}")]
    Spawn(String),
    #[error("loader thread aborted: {0}")]
    Internal(String),
}

/// Successfully (possibly partially) loaded model
#[derive(Debug, Clone)]
pub struct LoadedModel<R> {
    /// Records of all successful chunks, in file order
    pub records: Vec<R>,
    /// Chunks that failed, sorted by chunk id
    pub chunk_errors: Vec<ChunkParseError>,
    pub chunk_count: usize,
    /// Bytes covered by the chunk plan
    pub bytes: u64,
    pub elapsed: Duration,
}

impl<R> LoadedModel<R> {
    /// Some chunks failed; records are incomplete
    pub fn is_partial(&self) -> bool {
        !self.chunk_errors.is_empty()
    }

    pub fn failed_chunk_ids(&self) -> Vec<u32> {
        self.chunk_errors.iter().map(|e| e.chunk_id).collect()
    }
}

/// Summary of a cancelled load
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CancelledLoad {
    /// Progress at the moment cancellation was observed
    pub progress: f64,
    pub chunks_completed: usize,
    pub chunks_abandoned: usize,
}

/// Terminal result of a load
#[derive(Debug)]
pub enum LoadOutcome<R> {
    Completed(LoadedModel<R>),
    Cancelled(CancelledLoad),
    Failed(LoadError),
}

impl<R> LoadOutcome<R> {
    pub fn status(&self) -> LoadStatus {
        match self {
            LoadOutcome::Completed(_) => LoadStatus::Completed,
            LoadOutcome::Cancelled(_) => LoadStatus::Cancelled,
            LoadOutcome::Failed(_) => LoadStatus::Failed,
        }
    }

    pub fn model(self) -> Option<LoadedModel<R>> {
        match self {
            LoadOutcome::Completed(model) => Some(model),
            _ => None,
        }
    }
}

/// Parameters of one load
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub path: PathBuf,
    pub record_size: u32,
    /// Fixed header bytes skipped before the first record
    pub data_offset: u64,
    /// Explicit pool size (skips auto sizing)
    pub workers: Option<usize>,
    pub progress_step: Option<f64>,
    pub target_chunk_size: Option<u64>,
}

impl LoadRequest {
    pub fn new(path: impl Into<PathBuf>, record_size: u32) -> Self {
        Self {
            path: path.into(),
            record_size,
            data_offset: 0,
            workers: None,
            progress_step: None,
            target_chunk_size: None,
        }
    }

    pub fn with_data_offset(mut self, offset: u64) -> Self {
        self.data_offset = offset;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_progress_step(mut self, step: f64) -> Self {
        self.progress_step = Some(step);
        self
    }

    pub fn with_target_chunk_size(mut self, bytes: u64) -> Self {
        self.target_chunk_size = Some(bytes);
        self
    }
}

/// Shared state of one in-flight load
#[derive(Debug)]
struct LoadOperation {
    id: OperationId,
    file_path: PathBuf,
    status: AtomicU8,
    /// f64 bits of the aggregated progress
    progress: AtomicU64,
    chunks: Vec<FileChunk>,
    worker_count: usize,
    token: CancellationToken,
}

impl LoadOperation {
    fn status(&self) -> LoadStatus {
        LoadStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: LoadStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Relaxed))
    }

    fn set_progress(&self, value: f64) {
        self.progress.store(value.to_bits(), Ordering::Relaxed);
    }
}

type ActiveOps = Arc<Mutex<HashMap<OperationId, Arc<LoadOperation>>>>;

/// Caller-side handle of a load.
///
/// # Example
/// ```no_run
/// # use meshvault::core::loader::{BackgroundLoader, LoadOutcome};
/// # use meshvault::entities::stl::StlParser;
/// let loader = BackgroundLoader::default();
/// let handle = loader
///     .start_with(StlParser::request("model.stl"), StlParser, |p: f64, msg: &str| {
///         println!("{:5.1}% {}", p * 100.0, msg);
///     })
///     .unwrap();
///
/// match handle.wait() {
///     LoadOutcome::Completed(model) => println!("{} triangles", model.records.len()),
///     LoadOutcome::Cancelled(_) => println!("cancelled"),
///     LoadOutcome::Failed(e) => eprintln!("{}", e),
/// }
/// ```
pub struct LoadHandle<R> {
    op: Arc<LoadOperation>,
    outcome: Receiver<LoadOutcome<R>>,
    taken: AtomicBool,
}

impl<R> fmt::Debug for LoadHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadHandle")
            .field("id", &self.op.id)
            .field("status", &self.status())
            .field("progress", &self.progress())
            .finish()
    }
}

impl<R> LoadHandle<R> {
    pub fn id(&self) -> OperationId {
        self.op.id
    }

    pub fn path(&self) -> &Path {
        &self.op.file_path
    }

    pub fn status(&self) -> LoadStatus {
        self.op.status()
    }

    /// Last aggregated progress (`0.0..=1.0`)
    pub fn progress(&self) -> f64 {
        self.op.progress()
    }

    pub fn chunks(&self) -> &[FileChunk] {
        &self.op.chunks
    }

    pub fn worker_count(&self) -> usize {
        self.op.worker_count
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// Request cancellation. No-op once the operation is terminal.
    ///
    /// Status becomes `Cancelled` only after every worker has observed it.
    pub fn cancel(&self) -> bool {
        if self.is_finished() {
            return false;
        }
        let first = self.op.token.cancel();
        if first {
            info!("Load {} cancellation requested", self.op.id);
        }
        first
    }

    /// Block until the load reaches a terminal state.
    pub fn wait(self) -> LoadOutcome<R> {
        if self.taken.load(Ordering::Acquire) {
            return LoadOutcome::Failed(LoadError::Internal("outcome already taken".into()));
        }
        match self.outcome.recv() {
            Ok(outcome) => outcome,
            Err(_) => thread_lost(),
        }
    }

    /// Non-blocking poll. Returns the outcome once; `None` before and after.
    pub fn try_wait(&self) -> Option<LoadOutcome<R>> {
        if self.taken.load(Ordering::Acquire) {
            return None;
        }
        let outcome = match self.outcome.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => thread_lost(),
        };
        self.taken.store(true, Ordering::Release);
        Some(outcome)
    }

    /// Wait up to `timeout`. Callers impose deadlines by cancelling after `None`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<LoadOutcome<R>> {
        if self.taken.load(Ordering::Acquire) {
            return None;
        }
        let outcome = match self.outcome.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => return None,
            Err(RecvTimeoutError::Disconnected) => thread_lost(),
        };
        self.taken.store(true, Ordering::Release);
        Some(outcome)
    }
}

fn thread_lost<R>() -> LoadOutcome<R> {
    LoadOutcome::Failed(LoadError::Internal("loader thread exited without a result".into()))
}

/// Public orchestration API for background loads.
pub struct BackgroundLoader {
    settings: LoaderSettings,
    active: ActiveOps,
}

impl Default for BackgroundLoader {
    fn default() -> Self {
        Self::new(LoaderSettings::default())
    }
}

impl fmt::Debug for BackgroundLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundLoader")
            .field("settings", &self.settings)
            .field("active", &self.active_count())
            .finish()
    }
}

impl BackgroundLoader {
    pub fn new(settings: LoaderSettings) -> Self {
        Self {
            settings: settings.sanitized(),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &LoaderSettings {
        &self.settings
    }

    /// Start loading `path` as fixed-size records of `record_size` bytes.
    pub fn start<R, P, S>(
        &self,
        path: impl AsRef<Path>,
        record_size: u32,
        parser: P,
        sink: S,
    ) -> Result<LoadHandle<R>, LoadError>
    where
        R: Send + 'static,
        P: ChunkParser<R> + 'static,
        S: ProgressSink + 'static,
    {
        self.start_with(LoadRequest::new(path.as_ref(), record_size), parser, sink)
    }

    /// Start a load described by `request`.
    ///
    /// Fails immediately with `FileAccess` if the path is missing, not a
    /// regular file, unreadable, or empty; the operation never enters
    /// `Running` in that case.
    pub fn start_with<R, P, S>(
        &self,
        request: LoadRequest,
        parser: P,
        sink: S,
    ) -> Result<LoadHandle<R>, LoadError>
    where
        R: Send + 'static,
        P: ChunkParser<R> + 'static,
        S: ProgressSink + 'static,
    {
        let file_size = validate_file(&request.path)?;

        let mut planner =
            ChunkPlanner::new(request.record_size).with_data_offset(request.data_offset);
        if let Some(target) = request.target_chunk_size {
            planner = planner.with_target_chunk_size(target);
        }

        let explicit_workers = request.workers.or(self.settings.workers);
        let planned_workers = explicit_workers
            .unwrap_or_else(|| {
                recommended_workers(file_size, num_cpus::get(), self.settings.cpu_fraction)
            })
            .clamp(1, MAX_WORKERS);

        let chunks = planner.plan(file_size, planned_workers as u32)?;
        if chunks.is_empty() {
            return Err(LoadError::FileAccess {
                path: request.path.clone(),
                reason: format!("no record data after {}-byte header", request.data_offset),
            });
        }

        let largest_chunk = chunks.iter().map(|c| c.size).max().unwrap_or(0);
        let worker_count = match explicit_workers {
            Some(_) => planned_workers,
            None => planned_workers.min(memory_worker_cap(
                available_memory(),
                self.settings.memory_fraction,
                largest_chunk,
            )),
        }
        .min(chunks.len());

        let op = Arc::new(LoadOperation {
            id: OperationId::new(),
            file_path: request.path.clone(),
            status: AtomicU8::new(LoadStatus::Pending as u8),
            progress: AtomicU64::new(0f64.to_bits()),
            chunks,
            worker_count,
            token: CancellationToken::new(),
        });

        let job = LoadJob {
            op: Arc::clone(&op),
            source: FileSource::new(&request.path),
            record_size: request.record_size,
            step: request.progress_step.unwrap_or(self.settings.progress_step),
            read_block_size: self.settings.read_block_size,
        };

        info!(
            "Load {} queued: {} ({} bytes, {} chunks, {} workers)",
            op.id,
            op.file_path.display(),
            file_size,
            op.chunks.len(),
            worker_count
        );

        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(op.id, Arc::clone(&op));

        let (tx, rx) = bounded::<LoadOutcome<R>>(1);
        let active = Arc::clone(&self.active);
        let sink: Box<dyn ProgressSink> = Box::new(sink);

        let spawn = thread::Builder::new()
            .name(format!("meshvault-load-{}", &op.id.to_string()[..8]))
            .spawn(move || {
                let op = Arc::clone(&job.op);
                let run = panic::catch_unwind(AssertUnwindSafe(|| job.run(&parser, sink)));
                let outcome = match run {
                    Ok(outcome) => outcome,
                    Err(payload) => {
                        let msg = panic_message(payload.as_ref());
                        error!("Load {} control thread panicked: {}", op.id, msg);
                        LoadOutcome::Failed(LoadError::Internal(msg))
                    }
                };
                op.set_status(outcome.status());
                active.lock().unwrap_or_else(|e| e.into_inner()).remove(&op.id);
                let _ = tx.send(outcome);
            });

        if let Err(e) = spawn {
            self.active.lock().unwrap_or_else(|e| e.into_inner()).remove(&op.id);
            return Err(LoadError::Spawn(e.to_string()));
        }

        Ok(LoadHandle {
            op,
            outcome: rx,
            taken: AtomicBool::new(false),
        })
    }

    /// Cancel `handle`'s load. Safe to call repeatedly or after completion.
    pub fn cancel<R>(&self, handle: &LoadHandle<R>) -> bool {
        handle.cancel()
    }

    pub fn status<R>(&self, handle: &LoadHandle<R>) -> LoadStatus {
        handle.status()
    }

    /// Cancel every in-flight load
    pub fn cancel_all(&self) {
        let ops: Vec<_> = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for op in ops {
            if !op.status().is_terminal() && op.token.cancel() {
                debug!("Load {} cancelled (cancel_all)", op.id);
            }
        }
    }

    /// Number of loads not yet terminal
    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Everything the control thread needs
struct LoadJob {
    op: Arc<LoadOperation>,
    source: FileSource,
    record_size: u32,
    step: f64,
    read_block_size: u64,
}

impl LoadJob {
    fn run<R, P>(self, parser: &P, sink: Box<dyn ProgressSink>) -> LoadOutcome<R>
    where
        R: Send,
        P: ChunkParser<R> + ?Sized,
    {
        let op = &self.op;
        let start = Instant::now();
        let total_bytes: u64 = op.chunks.iter().map(|c| c.size).sum();
        let mut progress = ProgressAggregator::new(op.chunks.len(), total_bytes, self.step, sink);

        if op.token.is_cancelled() {
            info!("Load {} cancelled before start", op.id);
            return LoadOutcome::Cancelled(CancelledLoad {
                progress: 0.0,
                chunks_completed: 0,
                chunks_abandoned: op.chunks.len(),
            });
        }

        op.set_status(LoadStatus::Running);
        info!("Load {} running: {}", op.id, op.file_path.display());

        progress.complete_stage(LoadStage::ChunkDistribution);
        op.set_progress(progress.overall_progress());

        let coordinator = ThreadCoordinator::new(op.worker_count)
            .with_record_size(self.record_size)
            .with_read_block_size(self.read_block_size);

        let report = coordinator.coordinate(&self.source, &op.chunks, parser, &op.token, |event| {
            if op.token.is_cancelled() {
                progress.freeze();
                return;
            }
            progress.handle(&event);
            op.set_progress(progress.overall_progress());
        });

        if op.token.is_cancelled() {
            return self.cancelled(&mut progress, report.completed_count(), report.abandoned.len());
        }

        progress.complete_stage(LoadStage::FileReading);
        progress.complete_stage(LoadStage::RecordParsing);
        op.set_progress(progress.overall_progress());

        let chunk_count = op.chunks.len();
        let errors: Vec<ChunkParseError> = report.errors().cloned().collect();
        if errors.len() == chunk_count {
            warn!("Load {} failed: all {} chunks failed", op.id, chunk_count);
            return LoadOutcome::Failed(LoadError::AllChunksFailed { errors });
        }

        // Aggregation: concatenate in chunk order
        let record_total: usize = report.results.iter().map(|r| r.records.len()).sum();
        let mut records = Vec::with_capacity(record_total);
        let result_count = report.results.len();
        for (i, result) in report.results.into_iter().enumerate() {
            if result.is_ok() {
                records.extend(result.records);
            }
            let fraction = (i + 1) as f64 / result_count as f64;
            progress.report_stage(LoadStage::ResultAggregation, fraction);
        }
        progress.complete_stage(LoadStage::ResultAggregation);
        op.set_progress(progress.overall_progress());

        if op.token.is_cancelled() {
            return self.cancelled(&mut progress, chunk_count - errors.len(), 0);
        }

        // Validation: every planned chunk is accounted for
        let accounted = result_count + report.abandoned.len();
        if accounted != chunk_count {
            return LoadOutcome::Failed(LoadError::Internal(format!(
                "{} of {} chunks unaccounted for",
                chunk_count - accounted,
                chunk_count
            )));
        }
        for err in &errors {
            warn!("Load {}: {}", op.id, err);
        }
        progress.complete_stage(LoadStage::FinalValidation);
        op.set_progress(progress.overall_progress());

        let elapsed = start.elapsed();
        info!(
            "Load {} completed in {:.2}s: {} records, {}/{} chunks failed",
            op.id,
            elapsed.as_secs_f64(),
            records.len(),
            errors.len(),
            chunk_count
        );

        LoadOutcome::Completed(LoadedModel {
            records,
            chunk_errors: errors,
            chunk_count,
            bytes: total_bytes,
            elapsed,
        })
    }

    fn cancelled<R>(
        &self,
        progress: &mut ProgressAggregator,
        chunks_completed: usize,
        chunks_abandoned: usize,
    ) -> LoadOutcome<R> {
        progress.freeze();
        let at = progress.overall_progress();
        self.op.set_progress(at);
        info!(
            "Load {} cancelled at {:.1}% ({} chunks done, {} abandoned)",
            self.op.id,
            at * 100.0,
            chunks_completed,
            chunks_abandoned
        );
        LoadOutcome::Cancelled(CancelledLoad {
            progress: at,
            chunks_completed,
            chunks_abandoned,
        })
    }
}

/// Size of a loadable file, from metadata only.
fn validate_file(path: &Path) -> Result<u64, LoadError> {
    let access = |reason: String| LoadError::FileAccess {
        path: path.to_path_buf(),
        reason,
    };

    let meta = fs::metadata(path).map_err(|e| access(e.to_string()))?;
    if !meta.is_file() {
        return Err(access("not a regular file".into()));
    }
    if meta.len() == 0 {
        return Err(access("file is empty".into()));
    }
    fs::File::open(path).map_err(|e| access(e.to_string()))?;
    Ok(meta.len())
}

/// Workers allowed so that each can hold one chunk buffer in `fraction` of
/// available memory.
pub fn memory_worker_cap(available_bytes: u64, fraction: f64, chunk_bytes: u64) -> usize {
    if chunk_bytes == 0 || available_bytes == 0 {
        return MAX_WORKERS;
    }
    let budget = (available_bytes as f64 * fraction.clamp(0.0, 1.0)) as u64;
    ((budget / chunk_bytes) as usize).clamp(1, MAX_WORKERS)
}

fn available_memory() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.available_memory()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::NullSink;
    use crate::core::workers::ParseContext;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use tempfile::NamedTempFile;

    const RECORD: u32 = 10;

    /// Writes `chunks` chunks of 10 MiB (minimum chunk size) each
    fn temp_file(chunks: u64) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let block = vec![0xABu8; 1024 * 1024];
        for _ in 0..chunks * 10 {
            file.write_all(&block).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn request(file: &NamedTempFile) -> LoadRequest {
        LoadRequest::new(file.path(), RECORD)
            .with_target_chunk_size(crate::core::chunker::MIN_CHUNK_SIZE)
            .with_workers(2)
    }

    /// One record (chunk id) per chunk; fails listed chunks
    struct TestParser {
        fail: Vec<u32>,
    }

    impl ChunkParser<u32> for TestParser {
        fn parse(
            &self,
            bytes: &[u8],
            chunk: &FileChunk,
            ctx: &ParseContext<'_>,
        ) -> Result<Vec<u32>, ChunkParseError> {
            if self.fail.contains(&chunk.id) {
                return Err(ChunkParseError::malformed(chunk.id, "corrupt triangle"));
            }
            assert!(bytes.iter().all(|&b| b == 0xAB));
            ctx.report(0.5);
            Ok(vec![chunk.id])
        }
    }

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<f64>>>,
    }

    impl ProgressSink for Recorder {
        fn on_progress(&mut self, progress: f64, _message: &str) {
            self.calls.lock().unwrap().push(progress);
        }
    }

    #[test]
    fn test_missing_file_rejected() {
        let loader = BackgroundLoader::default();
        let err = loader
            .start("/nonexistent/model.stl", 50, TestParser { fail: vec![] }, NullSink)
            .unwrap_err();
        assert!(matches!(err, LoadError::FileAccess { .. }));
        assert_eq!(loader.active_count(), 0);
    }

    #[test]
    fn test_directory_and_empty_rejected() {
        let loader = BackgroundLoader::default();
        let dir = tempfile::tempdir().unwrap();
        let err = loader.start(dir.path(), 50, TestParser { fail: vec![] }, NullSink).unwrap_err();
        assert!(
            matches!(err, LoadError::FileAccess { ref reason, .. } if reason.contains("regular"))
        );

        let empty = NamedTempFile::new().unwrap();
        let err = loader
            .start(empty.path(), 50, TestParser { fail: vec![] }, NullSink)
            .unwrap_err();
        assert!(
            matches!(err, LoadError::FileAccess { ref reason, .. } if reason.contains("empty"))
        );
    }

    #[test]
    fn test_invalid_record_size() {
        let file = temp_file(1);
        let loader = BackgroundLoader::default();
        let err = loader.start(file.path(), 0, TestParser { fail: vec![] }, NullSink).unwrap_err();
        assert!(matches!(err, LoadError::Chunking(ChunkingError::InvalidRecordSize { .. })));
    }

    /// Test: Happy path
    /// Validates: Completed, records in chunk order, progress reaches 1.0 monotonically
    /// and the per-request step limits notifications
    #[test]
    fn test_load_completes() {
        let file = temp_file(5);
        let loader = BackgroundLoader::default();
        let recorder = Recorder::default();

        let handle = loader
            .start_with(
                request(&file).with_progress_step(0.1),
                TestParser { fail: vec![] },
                recorder.clone(),
            )
            .unwrap();
        assert_eq!(handle.chunks().len(), 5);

        let outcome = handle.wait();
        let model = match outcome {
            LoadOutcome::Completed(model) => model,
            other => panic!("unexpected outcome: {:?}", other.status()),
        };
        assert_eq!(model.records, vec![0, 1, 2, 3, 4]);
        assert!(!model.is_partial());
        assert_eq!(model.bytes, 50 * 1024 * 1024);

        let calls = recorder.calls.lock().unwrap();
        assert_eq!(*calls.last().unwrap(), 1.0);
        assert!(calls.windows(2).all(|w| w[1] >= w[0]));
        assert!(calls.len() <= 11);
        assert_eq!(loader.active_count(), 0);
    }

    /// Test: Scenario - one of five chunks fails
    /// Validates: Completed with exactly that chunk in the error list
    #[test]
    fn test_partial_failure_completes() {
        let file = temp_file(5);
        let loader = BackgroundLoader::default();
        let handle = loader
            .start_with(request(&file), TestParser { fail: vec![3] }, NullSink)
            .unwrap();

        match handle.wait() {
            LoadOutcome::Completed(model) => {
                assert!(model.is_partial());
                assert_eq!(model.failed_chunk_ids(), vec![3]);
                assert_eq!(model.records, vec![0, 1, 2, 4]);
            }
            other => panic!("unexpected outcome: {:?}", other.status()),
        }
    }

    /// Test: Scenario - all five chunks fail
    #[test]
    fn test_all_chunks_failed() {
        let file = temp_file(5);
        let loader = BackgroundLoader::default();
        let handle = loader
            .start_with(request(&file), TestParser { fail: vec![0, 1, 2, 3, 4] }, NullSink)
            .unwrap();
        let op = Arc::clone(&handle.op);

        match handle.wait() {
            LoadOutcome::Failed(LoadError::AllChunksFailed { errors }) => {
                assert_eq!(errors.len(), 5);
            }
            other => panic!("unexpected outcome: {:?}", other.status()),
        }
        assert_eq!(op.status(), LoadStatus::Failed);
    }

    /// Completes chunks 0 and 1, blocks every other chunk until cancelled
    struct GatedParser {
        done: Arc<AtomicUsize>,
    }

    impl ChunkParser<u32> for GatedParser {
        fn parse(
            &self,
            _bytes: &[u8],
            chunk: &FileChunk,
            ctx: &ParseContext<'_>,
        ) -> Result<Vec<u32>, ChunkParseError> {
            if chunk.id < 2 {
                self.done.fetch_add(1, Ordering::SeqCst);
                return Ok(vec![chunk.id]);
            }
            while !ctx.is_cancelled() {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(Vec::new())
        }
    }

    /// Test: Scenario - cancel after 2 of 5 chunks
    /// Validates: Cancelled, progress frozen below 1.0, no callbacks after terminal
    #[test]
    fn test_cancel_mid_load() {
        let file = temp_file(5);
        let loader = BackgroundLoader::default();
        let recorder = Recorder::default();
        let done = Arc::new(AtomicUsize::new(0));

        let handle = loader
            .start_with(
                request(&file).with_workers(3),
                GatedParser { done: Arc::clone(&done) },
                recorder.clone(),
            )
            .unwrap();

        while done.load(Ordering::SeqCst) < 2 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(loader.cancel(&handle));
        assert!(!loader.cancel(&handle));

        let op = Arc::clone(&handle.op);
        let outcome = handle.wait();
        let cancelled = match outcome {
            LoadOutcome::Cancelled(c) => c,
            other => panic!("unexpected outcome: {:?}", other.status()),
        };
        assert_eq!(op.status(), LoadStatus::Cancelled);
        assert!(cancelled.progress < 1.0);
        assert!(cancelled.chunks_abandoned >= 3);

        let calls_at_end = recorder.calls.lock().unwrap().len();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(recorder.calls.lock().unwrap().len(), calls_at_end);
        assert!(recorder.calls.lock().unwrap().iter().all(|&p| p < 1.0));
        assert_eq!(loader.active_count(), 0);
    }

    /// Holds every chunk until `open` is set (or the load is cancelled)
    struct HeldParser {
        open: Arc<AtomicBool>,
    }

    impl ChunkParser<u32> for HeldParser {
        fn parse(
            &self,
            _bytes: &[u8],
            chunk: &FileChunk,
            ctx: &ParseContext<'_>,
        ) -> Result<Vec<u32>, ChunkParseError> {
            while !self.open.load(Ordering::SeqCst) {
                if ctx.is_cancelled() {
                    return Ok(Vec::new());
                }
                thread::sleep(Duration::from_millis(1));
            }
            Ok(vec![chunk.id])
        }
    }

    /// Test: Loader dropped while a load is in flight
    /// Validates: the handle still resolves to Completed, nothing is cancelled
    #[test]
    fn test_load_outlives_loader() {
        let file = temp_file(2);
        let open = Arc::new(AtomicBool::new(false));

        let handle = {
            let loader = BackgroundLoader::default();
            loader
                .start_with(request(&file), HeldParser { open: Arc::clone(&open) }, NullSink)
                .unwrap()
        };
        assert!(!handle.is_finished());
        open.store(true, Ordering::SeqCst);

        match handle.wait() {
            LoadOutcome::Completed(model) => assert_eq!(model.records, vec![0, 1]),
            other => panic!("unexpected outcome: {:?}", other.status()),
        }
    }

    #[test]
    fn test_cancel_all() {
        let file = temp_file(2);
        let loader = BackgroundLoader::default();
        let open = Arc::new(AtomicBool::new(false));
        let handle = loader
            .start_with(request(&file), HeldParser { open }, NullSink)
            .unwrap();
        assert_eq!(loader.active_count(), 1);

        loader.cancel_all();
        assert_eq!(handle.wait().status(), LoadStatus::Cancelled);
        assert_eq!(loader.active_count(), 0);
    }

    #[test]
    fn test_cancel_after_completion_is_noop() {
        let file = temp_file(1);
        let loader = BackgroundLoader::default();
        let handle = loader
            .start_with(request(&file), TestParser { fail: vec![] }, NullSink)
            .unwrap();

        let outcome = loop {
            if let Some(outcome) = handle.wait_timeout(Duration::from_millis(10)) {
                break outcome;
            }
        };
        assert_eq!(outcome.status(), LoadStatus::Completed);
        assert!(!loader.cancel(&handle));
        assert!(!handle.cancel());
        assert_eq!(loader.status(&handle), LoadStatus::Completed);
        assert!(handle.try_wait().is_none());
    }

    #[test]
    fn test_header_offset_request() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 84]).unwrap();
        file.write_all(&vec![0xABu8; 10 * 1000]).unwrap();
        file.flush().unwrap();

        let loader = BackgroundLoader::default();
        let handle = loader
            .start_with(
                LoadRequest::new(file.path(), RECORD).with_data_offset(84),
                TestParser { fail: vec![] },
                NullSink,
            )
            .unwrap();
        assert_eq!(handle.chunks()[0].start_offset, 84);
        assert_eq!(handle.wait().status(), LoadStatus::Completed);

        let header_only = {
            let mut f = NamedTempFile::new().unwrap();
            f.write_all(&[0u8; 84]).unwrap();
            f
        };
        let err = loader
            .start_with(
                LoadRequest::new(header_only.path(), RECORD).with_data_offset(84),
                TestParser { fail: vec![] },
                NullSink,
            )
            .unwrap_err();
        assert!(matches!(err, LoadError::FileAccess { .. }));
    }

    #[test]
    fn test_memory_worker_cap() {
        const MB: u64 = 1024 * 1024;
        assert_eq!(memory_worker_cap(0, 0.5, 100 * MB), MAX_WORKERS);
        assert_eq!(memory_worker_cap(1000 * MB, 0.5, 100 * MB), 5);
        assert_eq!(memory_worker_cap(50 * MB, 0.5, 200 * MB), 1);
        assert_eq!(memory_worker_cap(u64::MAX / 2, 0.9, MB), MAX_WORKERS);
    }

    #[test]
    fn test_status_terminal() {
        assert!(!LoadStatus::Pending.is_terminal());
        assert!(!LoadStatus::Running.is_terminal());
        for s in [LoadStatus::Completed, LoadStatus::Cancelled, LoadStatus::Failed] {
            assert!(s.is_terminal());
            assert_eq!(LoadStatus::from_u8(s as u8), s);
        }
    }
}
