//! Phased teardown of graphics-bound resources.
//!
//! Runs a strict state machine over `CleanupPhase`:
//!
//! ```text
//! PreCleanup -> ContextValidation -> ResourceCleanup -> ActorCleanup
//!   -> RendererCleanup -> WindowCleanup -> InteractorCleanup
//!   -> FinalCleanup -> PostCleanup
//! ```
//!
//! The context check is evaluated once, at `ContextValidation`. If the
//! context is already gone, every later phase takes a degraded path that
//! only drops CPU-side bookkeeping. A lost context at shutdown is normal, so
//! it is recorded in the report, never raised.
//!
//! Must run on the thread that owns the graphics context.

use log::{debug, info, warn};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use thiserror::Error;

use super::cancel::panic_message;
use super::tracker::{ReleaseHook, ReleaseReport, ResourceKind, ResourceTracker};

/// Ordered cleanup phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CleanupPhase {
    PreCleanup,
    ContextValidation,
    ResourceCleanup,
    ActorCleanup,
    RendererCleanup,
    WindowCleanup,
    InteractorCleanup,
    FinalCleanup,
    PostCleanup,
}

impl CleanupPhase {
    pub const ALL: [CleanupPhase; 9] = [
        CleanupPhase::PreCleanup,
        CleanupPhase::ContextValidation,
        CleanupPhase::ResourceCleanup,
        CleanupPhase::ActorCleanup,
        CleanupPhase::RendererCleanup,
        CleanupPhase::WindowCleanup,
        CleanupPhase::InteractorCleanup,
        CleanupPhase::FinalCleanup,
        CleanupPhase::PostCleanup,
    ];

    /// Following phase, `None` after `PostCleanup`
    pub fn next(self) -> Option<CleanupPhase> {
        let idx = self as usize;
        Self::ALL.get(idx + 1).copied()
    }

    /// Phases that hold higher-level objects attached via `attach()`
    pub fn accepts_attachments(self) -> bool {
        matches!(
            self,
            CleanupPhase::ActorCleanup
                | CleanupPhase::RendererCleanup
                | CleanupPhase::WindowCleanup
                | CleanupPhase::InteractorCleanup
        )
    }

    /// Phases that issue graphics-context calls when the context is valid
    pub fn touches_context(self) -> bool {
        self == CleanupPhase::ResourceCleanup
            || self == CleanupPhase::FinalCleanup
            || self.accepts_attachments()
    }
}

impl fmt::Display for CleanupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a phase was executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseAction {
    /// Graphics calls issued normally
    Full,
    /// Context lost: handles dropped without graphics calls
    Degraded,
    /// Phase never touches the context
    Bookkeeping,
}

/// One failed release during cleanup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    pub phase: CleanupPhase,
    pub kind: ResourceKind,
    pub error: String,
}

/// Noteworthy conditions that are not failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupNote {
    /// Context was already destroyed when cleanup started
    ContextLost,
    /// Resources were registered while cleanup was running
    LateRegistrations(usize),
}

/// Per-phase record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRecord {
    pub phase: CleanupPhase,
    pub action: PhaseAction,
    pub released: usize,
    pub discarded: usize,
    pub failed: usize,
}

/// Outcome of one `run()`
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    /// Second run after `PostCleanup`: nothing was done
    pub already_clean: bool,
    pub degraded: bool,
    pub phases: Vec<PhaseRecord>,
    pub failures: Vec<CleanupFailure>,
    pub notes: Vec<CleanupNote>,
    pub elapsed: Duration,
}

impl CleanupReport {
    fn already_clean() -> Self {
        Self {
            already_clean: true,
            ..Self::default()
        }
    }

    /// Release hooks actually invoked (success or failure)
    pub fn invoked(&self) -> usize {
        self.phases.iter().map(|p| p.released + p.failed).sum()
    }

    pub fn released(&self) -> usize {
        self.phases.iter().map(|p| p.released).sum()
    }

    pub fn discarded(&self) -> usize {
        self.phases.iter().map(|p| p.discarded).sum()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CleanupError {
    #[error("cleanup must run on the graphics thread ({owner:?}), called from {caller:?}")]
    WrongThread { owner: ThreadId, caller: ThreadId },
    #[error("phase {0} does not hold attached objects")]
    InvalidAttachPhase(CleanupPhase),
    #[error("cleanup already finished")]
    AlreadyClean,
}

struct Attached {
    phase: CleanupPhase,
    kind: ResourceKind,
    priority: u8,
    hook: ReleaseHook,
}

/// Single cleanup authority for one viewer.
///
/// # Example
/// ```
/// # use meshvault::core::cleanup::CleanupCoordinator;
/// # use meshvault::core::tracker::{ResourceKind, ResourceTracker};
/// let tracker = ResourceTracker::new();
/// tracker.register(|| Ok(()), ResourceKind::Buffer, 1);
///
/// let mut cleanup = CleanupCoordinator::new();
/// let report = cleanup.run(&tracker, || true).unwrap();
/// assert_eq!(report.released(), 1);
///
/// let again = cleanup.run(&tracker, || true).unwrap();
/// assert!(again.already_clean);
/// ```
pub struct CleanupCoordinator {
    phase: CleanupPhase,
    owner: ThreadId,
    attached: Vec<Attached>,
}

impl Default for CleanupCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CleanupCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupCoordinator")
            .field("phase", &self.phase)
            .field("attached", &self.attached.len())
            .finish()
    }
}

impl CleanupCoordinator {
    /// Create a coordinator owned by the calling (graphics) thread.
    pub fn new() -> Self {
        Self {
            phase: CleanupPhase::PreCleanup,
            owner: thread::current().id(),
            attached: Vec::new(),
        }
    }

    pub fn phase(&self) -> CleanupPhase {
        self.phase
    }

    pub fn is_clean(&self) -> bool {
        self.phase == CleanupPhase::PostCleanup
    }

    /// Number of attached higher-level objects still awaiting cleanup
    pub fn attached_len(&self) -> usize {
        self.attached.len()
    }

    /// Attach a higher-level object (actor, renderer, window binding,
    /// interactor) to be released during `phase`.
    ///
    /// Within a phase, higher `priority` goes first; ties keep attach order.
    pub fn attach<F>(
        &mut self,
        phase: CleanupPhase,
        kind: ResourceKind,
        priority: u8,
        hook: F,
    ) -> Result<(), CleanupError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        if self.is_clean() {
            return Err(CleanupError::AlreadyClean);
        }
        if !phase.accepts_attachments() {
            return Err(CleanupError::InvalidAttachPhase(phase));
        }
        self.attached.push(Attached {
            phase,
            kind,
            priority,
            hook: Box::new(hook),
        });
        Ok(())
    }

    /// Run all phases.
    ///
    /// `context_is_valid` is evaluated once, at `ContextValidation`. A second
    /// call after completion returns an `already_clean` report and touches
    /// nothing.
    pub fn run<V>(
        &mut self,
        tracker: &ResourceTracker,
        context_is_valid: V,
    ) -> Result<CleanupReport, CleanupError>
    where
        V: FnOnce() -> bool,
    {
        let caller = thread::current().id();
        if caller != self.owner {
            return Err(CleanupError::WrongThread {
                owner: self.owner,
                caller,
            });
        }
        if self.is_clean() {
            debug!("Cleanup already finished, nothing to do");
            return Ok(CleanupReport::already_clean());
        }

        let start = Instant::now();
        let mut report = CleanupReport::default();
        let mut check = Some(context_is_valid);
        let mut context_valid = true;

        loop {
            let phase = self.phase;
            let record = match phase {
                CleanupPhase::PreCleanup => {
                    debug!(
                        "Cleanup starting: {} tracked, {} attached",
                        tracker.len(),
                        self.attached.len()
                    );
                    bookkeeping(phase)
                }
                CleanupPhase::ContextValidation => {
                    context_valid = check.take().is_some_and(|f| f());
                    if !context_valid {
                        warn!("Graphics context lost before cleanup, using degraded path");
                        report.degraded = true;
                        report.notes.push(CleanupNote::ContextLost);
                    }
                    bookkeeping(phase)
                }
                CleanupPhase::ResourceCleanup => {
                    let released = if context_valid {
                        tracker.release_all()
                    } else {
                        tracker.discard_all()
                    };
                    absorb(phase, context_valid, released, &mut report)
                }
                CleanupPhase::ActorCleanup
                | CleanupPhase::RendererCleanup
                | CleanupPhase::WindowCleanup
                | CleanupPhase::InteractorCleanup => {
                    self.release_attached(phase, context_valid, &mut report)
                }
                CleanupPhase::FinalCleanup => {
                    // Anything registered while we were running
                    let late = tracker.len();
                    if late > 0 {
                        warn!("{} resources registered during cleanup", late);
                        report.notes.push(CleanupNote::LateRegistrations(late));
                    }
                    let released = if context_valid {
                        tracker.release_all()
                    } else {
                        tracker.discard_all()
                    };
                    absorb(phase, context_valid, released, &mut report)
                }
                CleanupPhase::PostCleanup => {
                    report.elapsed = start.elapsed();
                    bookkeeping(phase)
                }
            };
            report.phases.push(record);

            match phase.next() {
                Some(next) => {
                    debug!("Cleanup phase {} -> {}", phase, next);
                    self.phase = next;
                }
                None => break,
            }
        }

        info!(
            "Cleanup finished in {:.1}ms: {} released, {} discarded, {} failed{}",
            report.elapsed.as_secs_f64() * 1000.0,
            report.released(),
            report.discarded(),
            report.failures.len(),
            if report.degraded { " (degraded: context lost)" } else { "" }
        );
        Ok(report)
    }

    fn release_attached(
        &mut self,
        phase: CleanupPhase,
        context_valid: bool,
        report: &mut CleanupReport,
    ) -> PhaseRecord {
        let (mut current, rest): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.attached).into_iter().partition(|a| a.phase == phase);
        self.attached = rest;
        // Stable: attach order within equal priority
        current.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut record = PhaseRecord {
            phase,
            action: if context_valid { PhaseAction::Full } else { PhaseAction::Degraded },
            released: 0,
            discarded: 0,
            failed: 0,
        };

        for obj in current {
            if !context_valid {
                record.discarded += 1;
                continue;
            }
            let error = match panic::catch_unwind(AssertUnwindSafe(obj.hook)) {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{:#}", e)),
                Err(payload) => Some(format!("panic: {}", panic_message(payload.as_ref()))),
            };
            match error {
                None => record.released += 1,
                Some(error) => {
                    warn!("Cleanup {}: {} release failed: {}", phase, obj.kind, error);
                    record.failed += 1;
                    report.failures.push(CleanupFailure {
                        phase,
                        kind: obj.kind,
                        error,
                    });
                }
            }
        }
        record
    }
}

fn bookkeeping(phase: CleanupPhase) -> PhaseRecord {
    PhaseRecord {
        phase,
        action: PhaseAction::Bookkeeping,
        released: 0,
        discarded: 0,
        failed: 0,
    }
}

fn absorb(
    phase: CleanupPhase,
    context_valid: bool,
    released: ReleaseReport,
    report: &mut CleanupReport,
) -> PhaseRecord {
    for failure in &released.failures {
        warn!(
            "Cleanup {}: {} ({}) release failed: {}",
            phase, failure.kind, failure.id, failure.error
        );
        report.failures.push(CleanupFailure {
            phase,
            kind: failure.kind,
            error: failure.error.clone(),
        });
    }
    PhaseRecord {
        phase,
        action: if context_valid { PhaseAction::Full } else { PhaseAction::Degraded },
        released: released.released.len(),
        discarded: released.discarded.len(),
        failed: released.failures.len(),
    }
}
