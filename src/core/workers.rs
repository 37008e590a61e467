//! Bounded worker pool for parallel chunk parsing.
//!
//! All chunks of a load are pushed to one shared `Injector` up front; a
//! fixed number of scoped worker threads steal from it until it is empty.
//! Workers never touch the progress aggregator directly - they stream
//! `ProgressEvent`s over a channel to the calling (control) thread, which is
//! the only thread that handles them.
//!
//! Cancellation is cooperative: workers check the token before each chunk,
//! between read blocks, and parsers poll it through `ParseContext`.

use crossbeam::deque::{Injector, Steal};
use crossbeam_channel::{Sender, unbounded};
use log::{error, trace, warn};
use std::cell::Cell;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread;
use thiserror::Error;

use super::cancel::{CancellationToken, panic_message};
use super::chunker::FileChunk;
use super::source::ChunkSource;
use super::traits::ChunkParser;

/// Default read block: cancellation is checked once per block
pub const DEFAULT_READ_BLOCK: u64 = 4 * 1024 * 1024;

/// Minimum parse-progress delta a `ParseContext` forwards
const CHUNK_PROGRESS_STEP: f64 = 0.01;

/// Why a chunk failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseErrorKind {
    /// Record content is invalid
    Malformed,
    /// Chunk ended in the middle of a record or structure
    Truncated,
    /// Reading the chunk bytes failed
    Io,
    /// Parser panicked
    Panicked,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParseErrorKind::Malformed => "malformed",
            ParseErrorKind::Truncated => "truncated",
            ParseErrorKind::Io => "io",
            ParseErrorKind::Panicked => "panicked",
        };
        f.write_str(s)
    }
}

/// Per-chunk failure. Non-fatal: the load continues with other chunks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("chunk {chunk_id}: {kind}: {message}")]
pub struct ChunkParseError {
    pub chunk_id: u32,
    pub kind: ParseErrorKind,
    pub message: String,
}

impl ChunkParseError {
    pub fn new(chunk_id: u32, kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self {
            chunk_id,
            kind,
            message: message.into(),
        }
    }

    pub fn malformed(chunk_id: u32, message: impl Into<String>) -> Self {
        Self::new(chunk_id, ParseErrorKind::Malformed, message)
    }

    pub fn truncated(chunk_id: u32, message: impl Into<String>) -> Self {
        Self::new(chunk_id, ParseErrorKind::Truncated, message)
    }

    fn io(chunk_id: u32, err: &io::Error) -> Self {
        Self::new(chunk_id, ParseErrorKind::Io, err.to_string())
    }
}

/// Result of one chunk: either all records or an error, never both.
#[derive(Debug, Clone)]
pub struct ChunkResult<R> {
    pub chunk_id: u32,
    pub records: Vec<R>,
    pub error: Option<ChunkParseError>,
}

impl<R> ChunkResult<R> {
    fn ok(chunk_id: u32, records: Vec<R>) -> Self {
        Self {
            chunk_id,
            records,
            error: None,
        }
    }

    fn failed(error: ChunkParseError) -> Self {
        Self {
            chunk_id: error.chunk_id,
            records: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Final state of a chunk as seen by the control thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Completed,
    Failed,
    /// Worker observed cancellation; not an error
    Abandoned,
}

/// Events streamed from workers to the control thread
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// `bytes` more bytes of `chunk_id` were read from the source
    BytesRead { chunk_id: u32, bytes: u64 },
    /// Parser-reported fraction of `chunk_id` in `[0, 1]`
    ChunkProgress { chunk_id: u32, fraction: f64 },
    ChunkFinished { chunk_id: u32, status: ChunkStatus },
}

/// Per-call context handed to `ChunkParser::parse`.
pub struct ParseContext<'a> {
    chunk_id: u32,
    token: &'a CancellationToken,
    events: &'a Sender<ProgressEvent>,
    observed_cancel: Cell<bool>,
    last_reported: Cell<f64>,
}

impl<'a> ParseContext<'a> {
    fn new(chunk_id: u32, token: &'a CancellationToken, events: &'a Sender<ProgressEvent>) -> Self {
        Self {
            chunk_id,
            token,
            events,
            observed_cancel: Cell::new(false),
            last_reported: Cell::new(0.0),
        }
    }

    pub fn chunk_id(&self) -> u32 {
        self.chunk_id
    }

    /// Cancellation checkpoint. Once this returns `true` the chunk is
    /// abandoned whatever the parser returns.
    pub fn is_cancelled(&self) -> bool {
        let cancelled = self.token.is_cancelled();
        if cancelled {
            self.observed_cancel.set(true);
        }
        cancelled
    }

    /// Report parse progress of this chunk (`0.0..=1.0`).
    ///
    /// Deltas below 1% are coalesced so fast parsers don't flood the channel.
    pub fn report(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        let last = self.last_reported.get();
        if fraction >= 1.0 || fraction - last >= CHUNK_PROGRESS_STEP {
            self.last_reported.set(fraction);
            let _ = self.events.send(ProgressEvent::ChunkProgress {
                chunk_id: self.chunk_id,
                fraction,
            });
        }
    }

    fn observed_cancel(&self) -> bool {
        self.observed_cancel.get()
    }
}

/// What `coordinate` hands back once every chunk is settled
#[derive(Debug)]
pub struct CoordinationReport<R> {
    /// Completed and failed chunks, sorted by chunk id
    pub results: Vec<ChunkResult<R>>,
    /// Chunks abandoned due to cancellation, sorted
    pub abandoned: Vec<u32>,
}

impl<R> CoordinationReport<R> {
    pub fn errors(&self) -> impl Iterator<Item = &ChunkParseError> {
        self.results.iter().filter_map(|r| r.error.as_ref())
    }

    pub fn completed_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.len() - self.completed_count()
    }
}

/// Runs chunk parsing on a bounded pool of scoped threads.
///
/// # Example
/// ```ignore
/// let coordinator = ThreadCoordinator::new(4);
/// let report = coordinator.coordinate(&source, &chunks, &parser, &token, |event| {
///     aggregator.handle(&event);
/// });
/// ```
#[derive(Debug, Clone)]
pub struct ThreadCoordinator {
    worker_count: usize,
    read_block_size: u64,
    record_size: u32,
}

impl ThreadCoordinator {
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count: worker_count.max(1),
            read_block_size: DEFAULT_READ_BLOCK,
            record_size: 1,
        }
    }

    /// Read block size; rounded down to whole records at read time.
    pub fn with_read_block_size(mut self, bytes: u64) -> Self {
        self.read_block_size = bytes.max(1);
        self
    }

    /// Record size used to align read blocks.
    pub fn with_record_size(mut self, record_size: u32) -> Self {
        self.record_size = record_size.max(1);
        self
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    fn block_size(&self) -> u64 {
        let record = self.record_size as u64;
        (self.read_block_size / record * record).max(record)
    }

    /// Parse `chunks` in parallel and block until every chunk has completed,
    /// failed, or been abandoned.
    ///
    /// `on_event` runs on the calling thread only.
    pub fn coordinate<R, S, P, F>(
        &self,
        source: &S,
        chunks: &[FileChunk],
        parser: &P,
        token: &CancellationToken,
        mut on_event: F,
    ) -> CoordinationReport<R>
    where
        R: Send,
        S: ChunkSource,
        P: ChunkParser<R> + ?Sized,
        F: FnMut(ProgressEvent),
    {
        let queue: Injector<FileChunk> = Injector::new();
        for chunk in chunks {
            queue.push(*chunk);
        }

        let results: Mutex<Vec<ChunkResult<R>>> = Mutex::new(Vec::with_capacity(chunks.len()));
        let abandoned: Mutex<Vec<u32>> = Mutex::new(Vec::new());
        let pool_size = self.worker_count.min(chunks.len()).max(1);
        let block_size = self.block_size();

        thread::scope(|scope| {
            let (tx, rx) = unbounded::<ProgressEvent>();
            let mut spawned = 0usize;

            for worker_id in 0..pool_size {
                let tx = tx.clone();
                let ctx = WorkerCtx {
                    worker_id,
                    queue: &queue,
                    source,
                    parser,
                    token,
                    results: &results,
                    abandoned: &abandoned,
                    block_size,
                };
                let spawn = thread::Builder::new()
                    .name(format!("meshvault-worker-{}", worker_id))
                    .spawn_scoped(scope, move || ctx.run(&tx));
                match spawn {
                    Ok(_) => spawned += 1,
                    Err(e) => error!("Failed to spawn worker {}: {}", worker_id, e),
                }
            }

            if spawned == 0 {
                warn!("No worker threads available, parsing on control thread");
                let ctx = WorkerCtx {
                    worker_id: 0,
                    queue: &queue,
                    source,
                    parser,
                    token,
                    results: &results,
                    abandoned: &abandoned,
                    block_size,
                };
                ctx.run(&tx);
            }

            // Workers hold the remaining senders; the loop ends when all exit
            drop(tx);
            for event in rx.iter() {
                on_event(event);
            }
        });

        let mut results = results.into_inner().unwrap_or_else(|e| e.into_inner());
        results.sort_by_key(|r| r.chunk_id);
        let mut abandoned = abandoned.into_inner().unwrap_or_else(|e| e.into_inner());
        abandoned.sort_unstable();

        trace!(
            "Coordination done: {} results, {} abandoned",
            results.len(),
            abandoned.len()
        );

        CoordinationReport { results, abandoned }
    }
}

/// Borrowed state for one worker thread
struct WorkerCtx<'a, R, S: ?Sized, P: ?Sized> {
    worker_id: usize,
    queue: &'a Injector<FileChunk>,
    source: &'a S,
    parser: &'a P,
    token: &'a CancellationToken,
    results: &'a Mutex<Vec<ChunkResult<R>>>,
    abandoned: &'a Mutex<Vec<u32>>,
    block_size: u64,
}

impl<R, S, P> WorkerCtx<'_, R, S, P>
where
    S: ChunkSource + ?Sized,
    P: ChunkParser<R> + ?Sized,
{
    fn run(&self, tx: &Sender<ProgressEvent>) {
        trace!("Worker {} started", self.worker_id);
        let mut reader: Option<S::Reader> = None;

        loop {
            let chunk = match self.queue.steal() {
                Steal::Success(chunk) => chunk,
                Steal::Retry => continue,
                Steal::Empty => break,
            };

            let status = self.process(chunk, &mut reader, tx);
            let _ = tx.send(ProgressEvent::ChunkFinished {
                chunk_id: chunk.id,
                status,
            });
        }

        trace!("Worker {} stopped", self.worker_id);
    }

    fn process(
        &self,
        chunk: FileChunk,
        reader: &mut Option<S::Reader>,
        tx: &Sender<ProgressEvent>,
    ) -> ChunkStatus {
        if self.token.is_cancelled() {
            return self.abandon(chunk.id);
        }

        let bytes = match self.read_chunk(chunk, reader, tx) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return self.abandon(chunk.id),
            Err(e) => {
                warn!("Worker {}: chunk {} read failed: {}", self.worker_id, chunk.id, e);
                // Reader may be mid-way through a broken stream; reopen next time
                *reader = None;
                return self.finish(ChunkResult::failed(ChunkParseError::io(chunk.id, &e)));
            }
        };

        let ctx = ParseContext::new(chunk.id, self.token, tx);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.parser.parse(&bytes, &chunk, &ctx)
        }));

        if ctx.observed_cancel() {
            return self.abandon(chunk.id);
        }

        match outcome {
            Ok(Ok(records)) => {
                ctx.report(1.0);
                self.finish(ChunkResult::ok(chunk.id, records))
            }
            Ok(Err(mut err)) => {
                err.chunk_id = chunk.id;
                warn!("Worker {}: {}", self.worker_id, err);
                self.finish(ChunkResult::failed(err))
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!("Worker {}: parser panicked on chunk {}: {}", self.worker_id, chunk.id, msg);
                self.finish(ChunkResult::failed(ChunkParseError::new(
                    chunk.id,
                    ParseErrorKind::Panicked,
                    msg,
                )))
            }
        }
    }

    /// Read chunk bytes block by block. `Ok(None)` means cancelled mid-read.
    fn read_chunk(
        &self,
        chunk: FileChunk,
        reader: &mut Option<S::Reader>,
        tx: &Sender<ProgressEvent>,
    ) -> io::Result<Option<Vec<u8>>> {
        if reader.is_none() {
            *reader = Some(self.source.open()?);
        }
        let Some(r) = reader.as_mut() else {
            return Err(io::Error::other("chunk reader unavailable"));
        };
        r.seek(SeekFrom::Start(chunk.start_offset))?;

        let size = usize::try_from(chunk.size)
            .map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "chunk too large for memory")
            })?;
        let mut buf = vec![0u8; size];
        let mut filled = 0usize;

        while filled < size {
            if self.token.is_cancelled() {
                return Ok(None);
            }
            let block = (self.block_size as usize).min(size - filled);
            r.read_exact(&mut buf[filled..filled + block])?;
            filled += block;
            let _ = tx.send(ProgressEvent::BytesRead {
                chunk_id: chunk.id,
                bytes: block as u64,
            });
        }

        Ok(Some(buf))
    }

    fn finish(&self, result: ChunkResult<R>) -> ChunkStatus {
        let status = if result.is_ok() {
            ChunkStatus::Completed
        } else {
            ChunkStatus::Failed
        };
        self.results.lock().unwrap_or_else(|e| e.into_inner()).push(result);
        status
    }

    fn abandon(&self, chunk_id: u32) -> ChunkStatus {
        trace!("Worker {}: chunk {} abandoned (cancelled)", self.worker_id, chunk_id);
        self.abandoned.lock().unwrap_or_else(|e| e.into_inner()).push(chunk_id);
        ChunkStatus::Abandoned
    }
}
