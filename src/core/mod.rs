//! Core engine modules - chunking, workers, progress, loading, teardown
//!
//! These modules form the loading and cleanup engine, independent of any
//! file format or viewer.

pub mod cancel;
pub mod chunker;
pub mod cleanup;
pub mod loader;
pub mod progress;
pub mod source;
pub mod tracker;
pub mod traits;
pub mod workers;

// Re-exports for convenience
pub use cancel::CancellationToken;
pub use chunker::{ChunkPlanner, ChunkingError, FileChunk, create_chunks};
pub use cleanup::{CleanupCoordinator, CleanupError, CleanupPhase, CleanupReport};
pub use loader::{
    BackgroundLoader, LoadError, LoadHandle, LoadOutcome, LoadRequest, LoadStatus, LoadedModel,
};
pub use progress::{LoadStage, ProgressAggregator};
pub use source::{ChunkSource, FileSource, MemorySource};
pub use tracker::{ResourceId, ResourceKind, ResourceTracker};
pub use traits::{ChunkParser, GraphicsContext, NullSink, ProgressSink};
pub use workers::{ChunkParseError, ParseContext, ThreadCoordinator};
