//! File chunking for parallel parsing.
//!
//! Splits a byte range of a model file into contiguous, record-aligned chunks.
//! Chunk count scales with worker count and file-size tier: small files get
//! 2 chunks per worker, multi-gigabyte files get 8, so slow chunks at the tail
//! don't leave most cores idle.
//!
//! **Used by**: BackgroundLoader (planning), ThreadCoordinator (work items)

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// Smallest chunk a planner will produce (except the final remainder chunk)
pub const MIN_CHUNK_SIZE: u64 = 10 * MIB;
/// Largest chunk a planner will produce
pub const MAX_CHUNK_SIZE: u64 = 200 * MIB;

/// Hard cap on pool size regardless of core count
pub const MAX_WORKERS: usize = 16;

/// Contiguous byte range of the input file parsed independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileChunk {
    pub id: u32,
    pub start_offset: u64,
    pub size: u64,
}

impl FileChunk {
    /// Offset one past the last byte of this chunk
    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.size
    }
}

/// Chunk planning errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkingError {
    #[error("invalid record size {record_size} (must be 1..={max} bytes)")]
    InvalidRecordSize { record_size: u32, max: u64 },
    #[error("data offset {offset} is beyond end of file ({file_size} bytes)")]
    OffsetBeyondEnd { offset: u64, file_size: u64 },
}

/// Chunks per worker for a given byte-range length.
///
/// - `< 200 MiB`: 2
/// - `200 MiB .. 1 GiB`: 4
/// - `1 GiB .. 2 GiB`: 6
/// - `>= 2 GiB`: 8
pub fn chunk_multiplier(range_len: u64) -> u64 {
    if range_len < 200 * MIB {
        2
    } else if range_len < GIB {
        4
    } else if range_len < 2 * GIB {
        6
    } else {
        8
    }
}

/// Recommended pool size for a file.
///
/// Starts from `cpu_fraction` of the cores (0.75 leaves a quarter for the UI
/// thread), then caps by file-size tier: small files don't benefit from a
/// wide pool and pay for it in context switches.
pub fn recommended_workers(file_size: u64, cores: usize, cpu_fraction: f64) -> usize {
    let base = ((cores as f64 * cpu_fraction.clamp(0.05, 1.0)) as usize).max(1);
    let tier_cap = if file_size < 200 * MIB {
        4
    } else if file_size < GIB {
        8
    } else {
        MAX_WORKERS
    };
    base.min(tier_cap).clamp(1, MAX_WORKERS)
}

/// Split `file_size` bytes into chunks for `worker_count` workers.
pub fn create_chunks(
    file_size: u64,
    worker_count: u32,
    record_size: u32,
) -> Result<Vec<FileChunk>, ChunkingError> {
    ChunkPlanner::new(record_size).plan(file_size, worker_count)
}

/// Split `file_size` bytes using an explicit target chunk size.
///
/// The target is still clamped to `[MIN_CHUNK_SIZE, MAX_CHUNK_SIZE]` and
/// aligned down to `record_size`.
pub fn create_chunks_with_target(
    file_size: u64,
    target_chunk_size: u64,
    record_size: u32,
) -> Result<Vec<FileChunk>, ChunkingError> {
    ChunkPlanner::new(record_size)
        .with_target_chunk_size(target_chunk_size)
        .plan(file_size, 1)
}

/// Configurable chunk planner.
///
/// `data_offset` skips a fixed file header (e.g. the 84-byte binary STL
/// header): chunks cover `[data_offset, file_size)` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlanner {
    record_size: u32,
    data_offset: u64,
    target_chunk_size: Option<u64>,
}

impl ChunkPlanner {
    pub fn new(record_size: u32) -> Self {
        Self {
            record_size,
            data_offset: 0,
            target_chunk_size: None,
        }
    }

    pub fn with_data_offset(mut self, offset: u64) -> Self {
        self.data_offset = offset;
        self
    }

    pub fn with_target_chunk_size(mut self, target: u64) -> Self {
        self.target_chunk_size = Some(target);
        self
    }

    /// Chunk size the planner would use for a range of `range_len` bytes.
    pub fn chunk_size_for(&self, range_len: u64, worker_count: u32) -> Result<u64, ChunkingError> {
        self.validate_record_size()?;
        let target = self.target_chunk_size.unwrap_or_else(|| {
            let count = worker_count.max(1) as u64 * chunk_multiplier(range_len);
            range_len.div_ceil(count)
        });
        let clamped = target.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        let record = self.record_size as u64;
        // record_size <= MIN_CHUNK_SIZE, so this never rounds to zero
        Ok(clamped / record * record)
    }

    /// Plan chunks for a file of `file_size` bytes.
    pub fn plan(&self, file_size: u64, worker_count: u32) -> Result<Vec<FileChunk>, ChunkingError> {
        self.validate_record_size()?;
        if self.data_offset > file_size {
            return Err(ChunkingError::OffsetBeyondEnd {
                offset: self.data_offset,
                file_size,
            });
        }

        let range_len = file_size - self.data_offset;
        if range_len == 0 {
            return Ok(Vec::new());
        }

        let chunk_size = self.chunk_size_for(range_len, worker_count)?;
        let mut chunks = Vec::with_capacity(range_len.div_ceil(chunk_size) as usize);
        let mut offset = self.data_offset;
        let mut id = 0u32;

        while offset < file_size {
            let size = chunk_size.min(file_size - offset);
            chunks.push(FileChunk {
                id,
                start_offset: offset,
                size,
            });
            offset += size;
            id += 1;
        }

        debug!(
            "Chunk plan: {} bytes (offset {}) -> {} chunks of {} bytes (record={}, workers={})",
            range_len,
            self.data_offset,
            chunks.len(),
            chunk_size,
            self.record_size,
            worker_count
        );

        Ok(chunks)
    }

    fn validate_record_size(&self) -> Result<(), ChunkingError> {
        if self.record_size == 0 || self.record_size as u64 > MIN_CHUNK_SIZE {
            return Err(ChunkingError::InvalidRecordSize {
                record_size: self.record_size,
                max: MIN_CHUNK_SIZE,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_valid_plan(chunks: &[FileChunk], start: u64, file_size: u64, record_size: u32) {
        let mut expected_offset = start;
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.id as usize, i);
            assert_eq!(chunk.start_offset, expected_offset, "chunks must be contiguous");
            assert!(chunk.size > 0);
            if i + 1 < chunks.len() {
                assert_eq!(chunk.size % record_size as u64, 0, "chunk {} splits a record", i);
            }
            expected_offset = chunk.end_offset();
        }
        assert_eq!(expected_offset, file_size, "chunk sizes must sum to the range");
    }

    /// Test: Plans cover the file exactly for a grid of sizes and pool widths
    /// Validates: contiguous, non-overlapping, aligned, exact sum
    #[test]
    fn test_plan_invariants() {
        let sizes = [
            1,
            49,
            50,
            5 * MIB + 7,
            MIN_CHUNK_SIZE,
            150 * MIB + 13,
            237 * MIB,
            700 * MIB + 3,
            1536 * MIB,
            3 * GIB + 11,
        ];
        for &file_size in &sizes {
            for workers in [1u32, 2, 3, 8, 16] {
                for record in [1u32, 50, 4096] {
                    let chunks = create_chunks(file_size, workers, record).unwrap();
                    assert_valid_plan(&chunks, 0, file_size, record);
                    for c in &chunks {
                        assert!(c.size <= MAX_CHUNK_SIZE);
                    }
                }
            }
        }
    }

    /// Test: 237 MiB with 50-byte records and a 50 MiB target
    /// Validates: 4 full aligned chunks plus a smaller remainder chunk
    #[test]
    fn test_scenario_237mb() {
        let file_size = 237 * MIB;
        let chunks = create_chunks_with_target(file_size, 50 * MIB, 50).unwrap();

        assert_eq!(chunks.len(), 5);
        for c in &chunks[..4] {
            assert_eq!(c.size, 50 * MIB);
            assert_eq!(c.size % 50, 0);
        }
        assert!(chunks[4].size < 50 * MIB);
        assert_eq!(chunks.iter().map(|c| c.size).sum::<u64>(), file_size);
    }

    #[test]
    fn test_invalid_record_size() {
        assert!(matches!(
            create_chunks(1000, 4, 0),
            Err(ChunkingError::InvalidRecordSize { record_size: 0, .. })
        ));
        let too_big = (MIN_CHUNK_SIZE + 1) as u32;
        assert!(matches!(
            create_chunks(1000, 4, too_big),
            Err(ChunkingError::InvalidRecordSize { .. })
        ));
        // Exactly the minimum chunk size is allowed
        assert!(create_chunks(1000, 4, MIN_CHUNK_SIZE as u32).is_ok());
    }

    #[test]
    fn test_small_file_single_chunk() {
        let chunks = create_chunks(4 * MIB, 8, 50).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].size, 4 * MIB);
    }

    #[test]
    fn test_empty_range() {
        assert!(create_chunks(0, 4, 50).unwrap().is_empty());
        let planner = ChunkPlanner::new(50).with_data_offset(84);
        assert!(planner.plan(84, 4).unwrap().is_empty());
    }

    /// Test: Header offset is excluded from chunks
    /// Validates: first chunk starts after header, records stay aligned
    #[test]
    fn test_data_offset() {
        let file_size = 84 + 50 * 600_000;
        let planner = ChunkPlanner::new(50)
            .with_data_offset(84)
            .with_target_chunk_size(MIN_CHUNK_SIZE);
        let chunks = planner.plan(file_size, 4).unwrap();

        assert_eq!(chunks[0].start_offset, 84);
        assert_valid_plan(&chunks, 84, file_size, 50);
        // Payload is a whole number of records, so the tail is aligned too
        assert!(chunks.iter().all(|c| c.size % 50 == 0));

        assert!(matches!(
            ChunkPlanner::new(50).with_data_offset(100).plan(99, 1),
            Err(ChunkingError::OffsetBeyondEnd { offset: 100, file_size: 99 })
        ));
    }

    #[test]
    fn test_tier_multipliers() {
        assert_eq!(chunk_multiplier(100 * MIB), 2);
        assert_eq!(chunk_multiplier(500 * MIB), 4);
        assert_eq!(chunk_multiplier(1536 * MIB), 6);
        assert_eq!(chunk_multiplier(4 * GIB), 8);

        // More chunks per worker for bigger files
        let small = create_chunks(150 * MIB, 2, 50).unwrap().len();
        let large = create_chunks(3 * GIB, 2, 50).unwrap().len();
        assert!(large > small);
    }

    #[test]
    fn test_recommended_workers() {
        assert_eq!(recommended_workers(10 * MIB, 1, 0.75), 1);
        assert_eq!(recommended_workers(10 * MIB, 32, 0.75), 4);
        assert_eq!(recommended_workers(500 * MIB, 32, 0.75), 8);
        assert_eq!(recommended_workers(4 * GIB, 64, 1.0), MAX_WORKERS);
        assert_eq!(recommended_workers(4 * GIB, 8, 0.75), 6);
    }
}
