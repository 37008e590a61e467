//! Viewer session: owns the graphics resources of one open model view.
//!
//! Resources go into the session's tracker as they are created. Higher-level
//! objects (actors, renderer, window binding, interactor) are attached to
//! their cleanup phase. `dispose()` must be called on the graphics thread
//! before the session is dropped.

use log::error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::cleanup::{CleanupCoordinator, CleanupError, CleanupPhase, CleanupReport};
use crate::core::tracker::{ResourceId, ResourceKind, ResourceTracker};
use crate::core::traits::GraphicsContext;

/// Context validity flag shared with the windowing layer.
///
/// The window owner calls `invalidate()` when the context is destroyed
/// (window closed, device lost).
#[derive(Debug, Clone)]
pub struct SharedContextFlag(Arc<AtomicBool>);

impl Default for SharedContextFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedContextFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn invalidate(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl GraphicsContext for SharedContextFlag {
    fn is_valid(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct ViewerSession<C: GraphicsContext> {
    context: C,
    tracker: ResourceTracker,
    cleanup: CleanupCoordinator,
}

impl<C: GraphicsContext> ViewerSession<C> {
    /// Create a session on the thread that owns `context`.
    pub fn new(context: C) -> Self {
        Self {
            context,
            tracker: ResourceTracker::new(),
            cleanup: CleanupCoordinator::new(),
        }
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    /// Track a low-level resource (buffer, texture, shader, mapper).
    pub fn track<F>(&self, kind: ResourceKind, priority: u8, release: F) -> ResourceId
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.tracker.register(release, kind, priority)
    }

    /// Attach a higher-level object to its cleanup phase.
    pub fn attach<F>(
        &mut self,
        phase: CleanupPhase,
        kind: ResourceKind,
        priority: u8,
        release: F,
    ) -> Result<(), CleanupError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.cleanup.attach(phase, kind, priority, release)
    }

    pub fn is_disposed(&self) -> bool {
        self.cleanup.is_clean()
    }

    /// Release everything. Safe to call more than once.
    pub fn dispose(&mut self) -> Result<CleanupReport, CleanupError> {
        let context = &self.context;
        self.cleanup.run(&self.tracker, || context.is_valid())
    }
}

impl<C: GraphicsContext> Drop for ViewerSession<C> {
    fn drop(&mut self) {
        // Graphics calls are unsafe here: the thread and context are unknown
        let pending = !self.tracker.is_empty() || self.cleanup.attached_len() > 0;
        if !self.cleanup.is_clean() && pending {
            error!(
                "ViewerSession dropped without calling dispose() ({} tracked, {} attached)",
                self.tracker.len(),
                self.cleanup.attached_len()
            );
        }
    }
}
