//! meshvault - background loading of large binary model files and phased
//! teardown of graphics resources.
//!
//! Re-exports all modules for use by binary targets.

// Core engine (chunking, workers, progress, loader, cleanup)
pub mod core;

// Model records and format parsers
pub mod entities;

// App modules
pub mod cli;
pub mod config;
pub mod progress_bar;

// Re-export commonly used types from core
pub use self::core::cancel::CancellationToken;
pub use self::core::cleanup::{CleanupCoordinator, CleanupPhase, CleanupReport};
pub use self::core::loader::{BackgroundLoader, LoadHandle, LoadOutcome, LoadRequest, LoadStatus};
pub use self::core::tracker::{ResourceKind, ResourceTracker};
pub use self::core::traits::{ChunkParser, GraphicsContext, ProgressSink};

// Re-export entities
pub use entities::{MeshBounds, StlParser, Triangle, ViewerSession};
