//! Byte sources for chunk reads.
//!
//! Each worker opens its own reader, so workers only ever block on their own
//! I/O and never share a file cursor.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Something workers can open independently and read chunks from.
pub trait ChunkSource: Sync {
    type Reader: Read + Seek;

    /// Open a fresh reader positioned at offset 0.
    fn open(&self) -> io::Result<Self::Reader>;
}

/// File on disk
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChunkSource for FileSource {
    type Reader = File;

    fn open(&self) -> io::Result<File> {
        File::open(&self.path)
    }
}

/// In-memory buffer (tests, already-mapped data)
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Arc<[u8]>,
}

impl MemorySource {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl ChunkSource for MemorySource {
    type Reader = Cursor<Arc<[u8]>>;

    fn open(&self) -> io::Result<Self::Reader> {
        Ok(Cursor::new(Arc::clone(&self.data)))
    }
}
