//! Registry of graphics-context-bound resource handles.
//!
//! **Why**: GPU objects (buffers, textures, actors, window bindings) can't be
//! freed by `Drop` - the context that owns them may already be gone, and the
//! calls must happen on the context thread. The tracker records which
//! resources exist and invokes each release hook exactly once, highest
//! priority first.
//!
//! **Used by**: ViewerSession (owner), CleanupCoordinator (ResourceCleanup phase)

use indexmap::IndexMap;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use super::cancel::panic_message;

/// Release hook supplied at registration time.
///
/// Must be a no-op (not an error) if the underlying object is already gone.
pub type ReleaseHook = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// Unique id of a tracked resource (monotonic per tracker)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res#{}", self.0)
    }
}

/// Kind of graphics-bound object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Buffer,
    Texture,
    Shader,
    Mapper,
    Actor,
    Renderer,
    RenderWindowBinding,
    Interactor,
    Other,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Buffer => "buffer",
            ResourceKind::Texture => "texture",
            ResourceKind::Shader => "shader",
            ResourceKind::Mapper => "mapper",
            ResourceKind::Actor => "actor",
            ResourceKind::Renderer => "renderer",
            ResourceKind::RenderWindowBinding => "render-window-binding",
            ResourceKind::Interactor => "interactor",
            ResourceKind::Other => "other",
        };
        f.write_str(name)
    }
}

struct TrackedResource {
    kind: ResourceKind,
    priority: u8,
    hook: ReleaseHook,
}

/// Resource that was released (or discarded) successfully
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedResource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub priority: u8,
}

/// Resource whose release hook failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseFailure {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub error: String,
}

/// Outcome of `release_all()` / `discard_all()`
#[derive(Debug, Clone, Default)]
pub struct ReleaseReport {
    /// Hooks invoked successfully, in release order
    pub released: Vec<ReleasedResource>,
    /// Hooks that returned an error or panicked
    pub failures: Vec<ReleaseFailure>,
    /// Handles dropped without invoking their hook (context lost)
    pub discarded: Vec<ReleasedResource>,
}

impl ReleaseReport {
    pub fn is_empty(&self) -> bool {
        self.released.is_empty() && self.failures.is_empty() && self.discarded.is_empty()
    }

    /// Number of hooks actually invoked (success or failure)
    pub fn invoked(&self) -> usize {
        self.released.len() + self.failures.len()
    }
}

/// Registry of resources awaiting ordered release.
///
/// Only the thread owning the graphics context should call `release_all()`;
/// loader workers never touch the tracker.
pub struct ResourceTracker {
    entries: Mutex<IndexMap<ResourceId, TrackedResource>>,
    next_id: AtomicU64,
}

impl Default for ResourceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTracker").field("len", &self.len()).finish()
    }
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a resource. Higher `priority` is released first.
    pub fn register<F>(&self, handle: F, kind: ResourceKind, priority: u8) -> ResourceId
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let id = ResourceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            TrackedResource {
                kind,
                priority,
                hook: Box::new(handle),
            },
        );
        trace!("Registered {} ({}, priority {})", id, kind, priority);
        id
    }

    /// Forget a resource without invoking its hook (freed elsewhere).
    ///
    /// Returns `false` if the id isn't registered.
    pub fn unregister(&self, id: ResourceId) -> bool {
        let removed = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .shift_remove(&id)
            .is_some();
        if removed {
            trace!("Unregistered {}", id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of registered resources of `kind`
    pub fn count_kind(&self, kind: ResourceKind) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|r| r.kind == kind)
            .count()
    }

    /// Release every registered resource.
    ///
    /// Order: priority descending, registration order within equal priority.
    /// A failing hook is recorded and iteration continues. The registry is
    /// empty afterwards; calling again returns an empty report.
    pub fn release_all(&self) -> ReleaseReport {
        let drained = self.drain_ordered();
        let mut report = ReleaseReport::default();

        for (id, res) in drained {
            let outcome = panic::catch_unwind(AssertUnwindSafe(res.hook));
            match outcome {
                Ok(Ok(())) => {
                    trace!("Released {} ({})", id, res.kind);
                    report.released.push(ReleasedResource {
                        id,
                        kind: res.kind,
                        priority: res.priority,
                    });
                }
                Ok(Err(e)) => {
                    warn!("Release of {} ({}) failed: {:#}", id, res.kind, e);
                    report.failures.push(ReleaseFailure {
                        id,
                        kind: res.kind,
                        error: format!("{:#}", e),
                    });
                }
                Err(payload) => {
                    let msg = panic_message(payload.as_ref());
                    warn!("Release of {} ({}) panicked: {}", id, res.kind, msg);
                    report.failures.push(ReleaseFailure {
                        id,
                        kind: res.kind,
                        error: format!("panic: {}", msg),
                    });
                }
            }
        }

        if !report.is_empty() {
            debug!(
                "release_all: {} released, {} failed",
                report.released.len(),
                report.failures.len()
            );
        }
        report
    }

    /// Drop every handle without invoking it.
    ///
    /// CPU-side bookkeeping only: used when the graphics context is already
    /// destroyed and release calls would hit a dead context.
    pub fn discard_all(&self) -> ReleaseReport {
        let drained = self.drain_ordered();
        let mut report = ReleaseReport::default();
        for (id, res) in drained {
            report.discarded.push(ReleasedResource {
                id,
                kind: res.kind,
                priority: res.priority,
            });
            drop(res.hook);
        }
        if !report.discarded.is_empty() {
            debug!("discard_all: {} handles dropped without release", report.discarded.len());
        }
        report
    }

    fn drain_ordered(&self) -> Vec<(ResourceId, TrackedResource)> {
        let mut drained: Vec<_> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.drain(..).collect()
        };
        // Stable sort keeps registration order for equal priorities
        drained.sort_by(|a, b| b.1.priority.cmp(&a.1.priority));
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    /// Test: priorities [5, 1, 5]
    /// Validates: both priority-5 resources (registration order) before priority 1
    #[test]
    fn test_release_order_priority_then_registration() {
        let tracker = ResourceTracker::new();
        let log = recorder();

        for (name, prio) in [("a", 5u8), ("b", 1), ("c", 5)] {
            let log = Arc::clone(&log);
            tracker.register(
                move || {
                    log.lock().unwrap().push(name);
                    Ok(())
                },
                ResourceKind::Buffer,
                prio,
            );
        }

        let report = tracker.release_all();
        assert_eq!(*log.lock().unwrap(), vec!["a", "c", "b"]);
        assert_eq!(report.released.len(), 3);
        assert_eq!(report.released[0].priority, 5);
        assert_eq!(report.released[2].priority, 1);
        assert!(tracker.is_empty());
    }

    /// Test: One failing hook doesn't leak the rest
    #[test]
    fn test_partial_failure_continues() {
        let tracker = ResourceTracker::new();
        let log = recorder();

        let l = Arc::clone(&log);
        tracker.register(
            move || {
                l.lock().unwrap().push("first");
                Ok(())
            },
            ResourceKind::Texture,
            9,
        );
        let bad = tracker.register(|| anyhow::bail!("context busy"), ResourceKind::Shader, 8);
        tracker.register(|| panic!("driver crash"), ResourceKind::Mapper, 7);
        let l = Arc::clone(&log);
        tracker.register(
            move || {
                l.lock().unwrap().push("last");
                Ok(())
            },
            ResourceKind::Buffer,
            1,
        );

        let report = tracker.release_all();
        assert_eq!(*log.lock().unwrap(), vec!["first", "last"]);
        assert_eq!(report.released.len(), 2);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].id, bad);
        assert!(report.failures[0].error.contains("context busy"));
        assert!(report.failures[1].error.contains("driver crash"));
        assert_eq!(report.invoked(), 4);
    }

    #[test]
    fn test_second_release_is_empty() {
        let tracker = ResourceTracker::new();
        tracker.register(|| Ok(()), ResourceKind::Actor, 3);
        assert_eq!(tracker.release_all().released.len(), 1);

        let again = tracker.release_all();
        assert!(again.is_empty());
    }

    #[test]
    fn test_discard_invokes_nothing() {
        let tracker = ResourceTracker::new();
        let log = recorder();
        let l = Arc::clone(&log);
        tracker.register(move || { l.lock().unwrap().push("x"); Ok(()) }, ResourceKind::Texture, 2);
        tracker.register(|| Ok(()), ResourceKind::Renderer, 4);

        let report = tracker.discard_all();
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(report.invoked(), 0);
        assert_eq!(report.discarded.len(), 2);
        assert_eq!(report.discarded[0].kind, ResourceKind::Renderer);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_unregister() {
        let tracker = ResourceTracker::new();
        let id = tracker.register(|| panic!("must not be called"), ResourceKind::Other, 1);
        tracker.register(|| Ok(()), ResourceKind::Other, 1);
        assert_eq!(tracker.count_kind(ResourceKind::Other), 2);

        assert!(tracker.unregister(id));
        assert!(!tracker.unregister(id));

        let report = tracker.release_all();
        assert_eq!(report.released.len(), 1);
        assert!(report.failures.is_empty());
    }
}
