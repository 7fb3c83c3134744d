//! Byte-source and byte-sink capability traits plus the built-in adapters
//!
//! The engine depends only on these capability sets: a [`Source`] is a
//! random-access window reader, a [`Sink`] is an append-only window writer.
//! Adapters for in-memory buffers and files are provided; anything else
//! (network ranges, custom stores) can implement the traits directly.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::Result;

/// Random-access byte source.
pub trait Source {
    /// Called once before the first window is read.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Total length of the source in bytes.
    fn size(&self) -> u64;

    /// Read exactly `length` bytes starting at `offset`.
    ///
    /// Reads may be non-contiguous; a read past the end is an error.
    fn read_window(&mut self, offset: u64, length: usize) -> Result<Vec<u8>>;
}

/// Append-only byte sink.
pub trait Sink {
    /// Called once before the first window is written.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Append `bytes` to the sink.
    fn write_window(&mut self, bytes: &[u8]) -> Result<()>;

    /// Flush any buffered state. Called once when the session ends.
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: Source + ?Sized> Source for &mut S {
    fn init(&mut self) -> Result<()> {
        (**self).init()
    }

    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read_window(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        (**self).read_window(offset, length)
    }
}

impl<S: Sink + ?Sized> Sink for &mut S {
    fn init(&mut self) -> Result<()> {
        (**self).init()
    }

    fn write_window(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).write_window(bytes)
    }

    fn finalize(&mut self) -> Result<()> {
        (**self).finalize()
    }
}

/// Source over an in-memory byte buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for MemorySource {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<&[u8]> for MemorySource {
    fn from(data: &[u8]) -> Self {
        Self::new(data.to_vec())
    }
}

impl Source for MemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_window(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let start = offset as usize;
        let end = start.checked_add(length).filter(|end| *end <= self.data.len());
        match end {
            Some(end) => Ok(self.data[start..end].to_vec()),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read window past end of source",
            )
            .into()),
        }
    }
}

/// Sink into an in-memory byte buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    data: Vec<u8>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Sink for MemorySink {
    fn write_window(&mut self, bytes: &[u8]) -> Result<()> {
        self.data.extend_from_slice(bytes);
        Ok(())
    }
}

/// Source over a file on disk.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    size: u64,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

impl Source for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_window(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Sink into a file on disk.
#[derive(Debug)]
pub struct FileSink {
    file: File,
}

impl FileSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            file: File::create(path)?,
        })
    }
}

impl Sink for FileSink {
    fn write_window(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes)?;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}
