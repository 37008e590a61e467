//! Binary STL reader
//!
//! Layout (little-endian):
//!
//! ```text
//! [80 bytes description][u32 triangle count]
//! repeated: [f32 x3 normal][f32 x9 vertices][u16 attribute]   (50 bytes)
//! ```
//!
//! Records are fixed-size, so the file splits into aligned chunks that
//! parse independently.

use anyhow::{Context, Result, bail};
use log::debug;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use super::mesh::Triangle;
use crate::core::chunker::FileChunk;
use crate::core::loader::LoadRequest;
use crate::core::traits::ChunkParser;
use crate::core::workers::{ChunkParseError, ParseContext};

pub const STL_DESCRIPTION_LEN: usize = 80;
pub const STL_HEADER_LEN: u64 = 84;
pub const STL_RECORD_SIZE: u32 = 50;

/// Records parsed between cancellation checks
const CHECK_INTERVAL: usize = 4096;

/// Parsed 84-byte header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StlHeader {
    pub description: String,
    pub triangle_count: u32,
}

impl StlHeader {
    /// File size implied by `triangle_count`
    pub fn expected_file_size(&self) -> u64 {
        STL_HEADER_LEN + self.triangle_count as u64 * STL_RECORD_SIZE as u64
    }

    /// ASCII STL starts with "solid" and its size won't match the count.
    pub fn looks_ascii(&self, file_size: u64) -> bool {
        self.description.trim_start().starts_with("solid") && self.expected_file_size() != file_size
    }
}

/// Read and check the header of `path`.
pub fn read_header(path: &Path) -> Result<StlHeader> {
    let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let file_size = file
        .metadata()
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();
    if file_size < STL_HEADER_LEN {
        bail!("{}: too small for an STL header ({} bytes)", path.display(), file_size);
    }

    let mut buf = [0u8; STL_HEADER_LEN as usize];
    file.read_exact(&mut buf)
        .with_context(|| format!("Failed to read STL header: {}", path.display()))?;

    let description = String::from_utf8_lossy(&buf[..STL_DESCRIPTION_LEN])
        .trim_end_matches('\0')
        .trim_end()
        .to_string();
    let triangle_count = u32::from_le_bytes([buf[80], buf[81], buf[82], buf[83]]);
    let header = StlHeader {
        description,
        triangle_count,
    };

    if header.looks_ascii(file_size) {
        bail!("{}: ASCII STL is not supported", path.display());
    }
    if header.expected_file_size() != file_size {
        debug!(
            "{}: header declares {} triangles ({} bytes), file has {} bytes",
            path.display(),
            triangle_count,
            header.expected_file_size(),
            file_size
        );
    }
    Ok(header)
}

/// Chunk parser for binary STL triangle records
#[derive(Debug, Default, Clone, Copy)]
pub struct StlParser;

impl StlParser {
    /// Load request for a binary STL file (header skipped)
    pub fn request(path: impl Into<PathBuf>) -> LoadRequest {
        LoadRequest::new(path, STL_RECORD_SIZE).with_data_offset(STL_HEADER_LEN)
    }
}

impl ChunkParser<Triangle> for StlParser {
    fn parse(
        &self,
        bytes: &[u8],
        chunk: &FileChunk,
        ctx: &ParseContext<'_>,
    ) -> Result<Vec<Triangle>, ChunkParseError> {
        let record = STL_RECORD_SIZE as usize;
        let records = bytes.chunks_exact(record);
        let trailing = records.remainder().len();
        if trailing > 0 {
            // Truncated file: last partial record is dropped
            debug!("Chunk {}: ignoring {} trailing bytes", chunk.id, trailing);
        }

        let total = bytes.len() / record;
        let mut out = Vec::with_capacity(total);
        for (i, rec) in records.enumerate() {
            if i % CHECK_INTERVAL == 0 && i > 0 {
                if ctx.is_cancelled() {
                    return Ok(out);
                }
                ctx.report(i as f64 / total as f64);
            }

            let tri = decode_record(rec);
            if !tri.is_finite() {
                return Err(ChunkParseError::malformed(
                    chunk.id,
                    format!(
                        "non-finite coordinate in triangle at offset {}",
                        chunk.start_offset + (i * record) as u64
                    ),
                ));
            }
            out.push(tri);
        }
        ctx.report(1.0);
        Ok(out)
    }
}

fn read_f32(rec: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([rec[offset], rec[offset + 1], rec[offset + 2], rec[offset + 3]])
}

/// Decode one 50-byte record. The attribute word is ignored.
fn decode_record(rec: &[u8]) -> Triangle {
    let v = |i: usize| [read_f32(rec, i), read_f32(rec, i + 4), read_f32(rec, i + 8)];
    Triangle::new(v(0), [v(12), v(24), v(36)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chunker::ChunkPlanner;
    use crate::core::loader::{BackgroundLoader, LoadOutcome};
    use crate::core::source::MemorySource;
    use crate::core::traits::NullSink;
    use crate::core::workers::ThreadCoordinator;
    use crate::core::CancellationToken;
    use std::io::Write;

    fn encode(tri: &Triangle, out: &mut Vec<u8>) {
        for v in tri.normal.iter().chain(tri.vertices.iter().flatten()) {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&0u16.to_le_bytes());
    }

    /// Binary STL bytes with `count` triangles stacked along Z
    fn synthetic_stl(count: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(STL_HEADER_LEN as usize + count as usize * 50);
        let mut desc = [0u8; STL_DESCRIPTION_LEN];
        desc[..9].copy_from_slice(b"meshvault");
        out.extend_from_slice(&desc);
        out.extend_from_slice(&count.to_le_bytes());
        for i in 0..count {
            let z = i as f32;
            encode(
                &Triangle::new([0.0, 0.0, 1.0], [[0.0, 0.0, z], [1.0, 0.0, z], [0.0, 1.0, z]]),
                &mut out,
            );
        }
        out
    }

    #[test]
    fn test_decode_record() {
        let bytes = synthetic_stl(1);
        let tri = decode_record(&bytes[84..134]);
        assert_eq!(tri.normal, [0.0, 0.0, 1.0]);
        assert_eq!(tri.vertices[1], [1.0, 0.0, 0.0]);
    }

    /// Test: Parse STL chunks through the worker pool
    /// Validates: every triangle decoded, in order, across several chunks
    #[test]
    fn test_parse_in_chunks() {
        let bytes = synthetic_stl(10_000);
        let source = MemorySource::new(bytes);
        // Hand-built plan: real plans never go below 10 MiB per chunk
        let chunks: Vec<FileChunk> = (0..10u32)
            .map(|id| FileChunk {
                id,
                start_offset: STL_HEADER_LEN + id as u64 * 50_000,
                size: 50_000,
            })
            .collect();

        let report = ThreadCoordinator::new(4)
            .with_record_size(STL_RECORD_SIZE)
            .coordinate(&source, &chunks, &StlParser, &CancellationToken::new(), |_| {});

        let tris: Vec<Triangle> = report.results.into_iter().flat_map(|r| r.records).collect();
        assert_eq!(tris.len(), 10_000);
        for (i, t) in tris.iter().enumerate() {
            assert_eq!(t.vertices[0][2], i as f32);
        }
    }

    #[test]
    fn test_non_finite_is_malformed() {
        let mut bytes = synthetic_stl(3);
        // second triangle, first vertex x
        let at = 84 + 50 + 12;
        bytes[at..at + 4].copy_from_slice(&f32::NAN.to_le_bytes());
        let size = bytes.len() as u64;
        let source = MemorySource::new(bytes);
        let chunks = ChunkPlanner::new(STL_RECORD_SIZE)
            .with_data_offset(STL_HEADER_LEN)
            .plan(size, 1)
            .unwrap();

        let token = CancellationToken::new();
        let report =
            ThreadCoordinator::new(1).coordinate(&source, &chunks, &StlParser, &token, |_| {});
        let err = report.errors().next().unwrap();
        assert!(err.message.contains("non-finite"));
    }

    #[test]
    fn test_read_header() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&synthetic_stl(12)).unwrap();
        file.flush().unwrap();

        let header = read_header(file.path()).unwrap();
        assert_eq!(header.description, "meshvault");
        assert_eq!(header.triangle_count, 12);
        assert_eq!(header.expected_file_size(), 84 + 12 * 50);

        let mut ascii = tempfile::NamedTempFile::new().unwrap();
        ascii
            .write_all(b"solid cube\n  facet normal 0 0 1\n    outer loop\n      vertex 0 0 0\n")
            .unwrap();
        ascii.write_all(&[b' '; 40]).unwrap();
        ascii.flush().unwrap();
        assert!(read_header(ascii.path()).is_err());
    }

    /// Test: Full background load of a synthetic STL file
    #[test]
    fn test_background_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&synthetic_stl(2_500)).unwrap();
        file.flush().unwrap();

        let loader = BackgroundLoader::default();
        let handle = loader
            .start_with(StlParser::request(file.path()), StlParser, NullSink)
            .unwrap();
        match handle.wait() {
            LoadOutcome::Completed(model) => {
                assert_eq!(model.records.len(), 2_500);
                assert!(!model.is_partial());
                assert_eq!(model.bytes, 2_500 * 50);
            }
            other => panic!("unexpected outcome: {:?}", other.status()),
        }
    }
}
