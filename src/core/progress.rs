//! Progress aggregation across load stages and chunks.
//!
//! Overall progress is a weighted sum of fixed stages:
//!
//! | stage              | weight |
//! |--------------------|--------|
//! | file reading       | 10%    |
//! | chunk distribution | 5%     |
//! | record parsing     | 70%    |
//! | result aggregation | 10%    |
//! | final validation   | 5%     |
//!
//! Record parsing is the mean of all per-chunk fractions, so the value is
//! independent of which worker finishes first. Notifications are pushed to a
//! `ProgressSink` only when progress advances by at least `step`.

use log::trace;

use super::traits::ProgressSink;
use super::workers::{ChunkStatus, ProgressEvent};

/// Default minimum delta between notifications
pub const DEFAULT_PROGRESS_STEP: f64 = 0.01;

/// Largest value reported while any stage is incomplete
const BELOW_COMPLETE: f64 = 1.0 - 1e-9;

/// Conceptual stage of a load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadStage {
    FileReading,
    ChunkDistribution,
    RecordParsing,
    ResultAggregation,
    FinalValidation,
}

impl LoadStage {
    pub const ALL: [LoadStage; 5] = [
        LoadStage::FileReading,
        LoadStage::ChunkDistribution,
        LoadStage::RecordParsing,
        LoadStage::ResultAggregation,
        LoadStage::FinalValidation,
    ];

    pub fn weight(self) -> f64 {
        match self {
            LoadStage::FileReading => 0.10,
            LoadStage::ChunkDistribution => 0.05,
            LoadStage::RecordParsing => 0.70,
            LoadStage::ResultAggregation => 0.10,
            LoadStage::FinalValidation => 0.05,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            LoadStage::FileReading => "Reading file",
            LoadStage::ChunkDistribution => "Distributing chunks",
            LoadStage::RecordParsing => "Parsing records",
            LoadStage::ResultAggregation => "Aggregating results",
            LoadStage::FinalValidation => "Validating model",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Combines chunk and stage progress into one monotonic value.
pub struct ProgressAggregator {
    /// Per-chunk parse fraction, indexed by chunk id
    chunks: Vec<f64>,
    chunks_finished: usize,
    /// Explicit stage fractions (RecordParsing slot unused)
    stages: [f64; 5],
    total_bytes: u64,
    bytes_read: u64,
    step: f64,
    overall: f64,
    last_notified: f64,
    frozen: bool,
    sink: Box<dyn ProgressSink>,
}

impl ProgressAggregator {
    /// # Arguments
    ///
    /// * `chunk_count` - Number of chunks (ids `0..chunk_count`)
    /// * `total_bytes` - Bytes the FileReading stage expects
    /// * `step` - Minimum progress delta between notifications (clamped to 0.001..=0.1)
    /// * `sink` - Receiver of notifications
    pub fn new(
        chunk_count: usize,
        total_bytes: u64,
        step: f64,
        sink: Box<dyn ProgressSink>,
    ) -> Self {
        Self {
            chunks: vec![0.0; chunk_count],
            chunks_finished: 0,
            stages: [0.0; 5],
            total_bytes,
            bytes_read: 0,
            step: step.clamp(0.001, 0.1),
            overall: 0.0,
            last_notified: 0.0,
            frozen: false,
            sink,
        }
    }

    /// Record parse progress for one chunk. Fractions never move backwards.
    pub fn report_chunk_progress(&mut self, chunk_id: u32, fraction: f64) {
        let Some(slot) = self.chunks.get_mut(chunk_id as usize) else {
            trace!("Progress for unknown chunk {} ignored", chunk_id);
            return;
        };
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        if fraction > *slot {
            *slot = fraction;
            self.update();
        }
    }

    /// Record bytes read for the FileReading stage.
    pub fn report_bytes_read(&mut self, bytes: u64) {
        self.bytes_read = self.bytes_read.saturating_add(bytes);
        if self.total_bytes > 0 {
            let fraction = self.bytes_read as f64 / self.total_bytes as f64;
            self.set_stage(LoadStage::FileReading, fraction);
        }
    }

    /// Set an explicit stage fraction. RecordParsing is derived from chunks
    /// and can only be completed via `complete_stage`.
    pub fn report_stage(&mut self, stage: LoadStage, fraction: f64) {
        if stage == LoadStage::RecordParsing {
            trace!("RecordParsing is derived from chunk progress; explicit value ignored");
            return;
        }
        self.set_stage(stage, fraction);
    }

    pub fn complete_stage(&mut self, stage: LoadStage) {
        if stage == LoadStage::RecordParsing {
            let mut changed = false;
            for slot in &mut self.chunks {
                if *slot < 1.0 {
                    *slot = 1.0;
                    changed = true;
                }
            }
            if changed {
                self.update();
            }
        } else {
            self.set_stage(stage, 1.0);
        }
    }

    /// Route a worker event.
    pub fn handle(&mut self, event: &ProgressEvent) {
        match *event {
            ProgressEvent::BytesRead { bytes, .. } => self.report_bytes_read(bytes),
            ProgressEvent::ChunkProgress { chunk_id, fraction } => {
                self.report_chunk_progress(chunk_id, fraction)
            }
            ProgressEvent::ChunkFinished { chunk_id, status } => match status {
                // A failed chunk is finished work too; abandoned ones stay put
                ChunkStatus::Completed | ChunkStatus::Failed => {
                    self.chunks_finished += 1;
                    self.report_chunk_progress(chunk_id, 1.0);
                }
                ChunkStatus::Abandoned => {}
            },
        }
    }

    /// Current aggregated progress in `[0, 1]`
    pub fn overall_progress(&self) -> f64 {
        self.overall
    }

    pub fn stage_fraction(&self, stage: LoadStage) -> f64 {
        match stage {
            LoadStage::RecordParsing => self.parsing_fraction(),
            other => self.stages[other.index()],
        }
    }

    pub fn is_complete(&self) -> bool {
        LoadStage::ALL.iter().all(|&s| self.stage_fraction(s) >= 1.0)
    }

    /// Stop all further notifications (cancellation observed).
    pub fn freeze(&mut self) {
        if !self.frozen {
            trace!("Progress frozen at {:.3}", self.overall);
        }
        self.frozen = true;
    }

    fn set_stage(&mut self, stage: LoadStage, fraction: f64) {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        let slot = &mut self.stages[stage.index()];
        if fraction > *slot {
            *slot = fraction;
            self.update();
        }
    }

    fn parsing_fraction(&self) -> f64 {
        if self.chunks.is_empty() {
            return 1.0;
        }
        self.chunks.iter().sum::<f64>() / self.chunks.len() as f64
    }

    fn computed(&self) -> f64 {
        if self.is_complete() {
            return 1.0;
        }
        let sum: f64 = LoadStage::ALL
            .iter()
            .map(|&s| s.weight() * self.stage_fraction(s))
            .sum();
        sum.min(BELOW_COMPLETE)
    }

    fn update(&mut self) {
        if self.frozen {
            return;
        }
        let value = self.computed();
        if value > self.overall {
            self.overall = value;
        }

        let reached_end = self.overall >= 1.0 && self.last_notified < 1.0;
        if reached_end || self.overall - self.last_notified >= self.step {
            self.last_notified = self.overall;
            let message = self.message();
            self.sink.on_progress(self.overall, &message);
        }
    }

    fn message(&self) -> String {
        let active = LoadStage::ALL
            .iter()
            .copied()
            .find(|&s| self.stage_fraction(s) < 1.0);
        match active {
            None => "Done".to_string(),
            Some(LoadStage::RecordParsing) => format!(
                "{} ({}/{} chunks)",
                LoadStage::RecordParsing.label(),
                self.chunks_finished,
                self.chunks.len()
            ),
            // Reading and parsing overlap; make sure parsing is visible
            Some(LoadStage::FileReading)
                if self.stage_fraction(LoadStage::ChunkDistribution) >= 1.0 =>
            {
                format!(
                    "{} ({}/{} chunks parsed)",
                    LoadStage::FileReading.label(),
                    self.chunks_finished,
                    self.chunks.len()
                )
            }
            Some(stage) => stage.label().to_string(),
        }
    }
}
