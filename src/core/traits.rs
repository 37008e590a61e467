//! Abstract traits for external collaborators.
//!
//! Format parsers, UI progress displays and the windowing layer live outside
//! the core. These traits are the only things `core` knows about them.

use super::chunker::FileChunk;
use super::workers::{ChunkParseError, ParseContext};

/// Format-specific parser for one chunk of fixed-size records.
///
/// Called concurrently from worker threads for different chunks of the same
/// file. Long-running parsers should poll `ctx.is_cancelled()` and return
/// early when it flips; `ctx.report()` feeds per-chunk progress.
pub trait ChunkParser<R>: Send + Sync {
    fn parse(
        &self,
        bytes: &[u8],
        chunk: &FileChunk,
        ctx: &ParseContext<'_>,
    ) -> Result<Vec<R>, ChunkParseError>;
}

/// Closure parsers: `|bytes, chunk, ctx| -> Result<Vec<R>, ChunkParseError>`
impl<R, F> ChunkParser<R> for F
where
    F: Fn(&[u8], &FileChunk, &ParseContext<'_>) -> Result<Vec<R>, ChunkParseError> + Send + Sync,
{
    fn parse(
        &self,
        bytes: &[u8],
        chunk: &FileChunk,
        ctx: &ParseContext<'_>,
    ) -> Result<Vec<R>, ChunkParseError> {
        self(bytes, chunk, ctx)
    }
}

/// Single progress interface every layer reports through.
///
/// `progress` is in `[0, 1]`. Invoked from one control thread only, never
/// concurrently.
pub trait ProgressSink: Send {
    fn on_progress(&mut self, progress: f64, message: &str);
}

impl<F> ProgressSink for F
where
    F: FnMut(f64, &str) + Send,
{
    fn on_progress(&mut self, progress: f64, message: &str) {
        self(progress, message)
    }
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_progress(&mut self, _progress: f64, _message: &str) {}
}

/// Windowing/graphics layer seen from cleanup.
pub trait GraphicsContext {
    /// Whether graphics calls against this context are still safe.
    fn is_valid(&self) -> bool;
}
