//! # zipflow: Streaming ZIP Container Engine
//!
//! `zipflow` reads and writes ZIP archives as streams: entries flow through
//! a chunked codec pipeline (DEFLATE, CRC-32 signing, WinZip AES-256
//! encryption) between pluggable byte sources and sinks, with constant
//! memory use regardless of archive size.
//!
//! ## Features
//!
//! - **Streaming read**: locate and parse the central directory from any
//!   random-access source, extract entries window by window
//! - **Streaming write**: local headers, payloads and data descriptors go
//!   straight to an append-only sink; no temp files, no seeking
//! - **ZIP64**: archives beyond 4 GiB and 65 534 entries, promoted
//!   automatically
//! - **WinZip AES-256 (AE-2)**: password-protected entries, authenticated
//!   by HMAC-SHA1
//! - **Worker dispatch**: heavy codec stages can run on a bounded pool of
//!   worker threads
//!
//! ## Quick Start
//!
//! ### Reading an archive
//!
//! ```no_run
//! use zipflow::{FileSource, ZipReader};
//!
//! let source = FileSource::open("archive.zip")?;
//! let mut reader = ZipReader::new(source)?;
//!
//! for entry in reader.entries() {
//!     println!("{}: {} bytes", entry.name, entry.uncompressed_size);
//! }
//!
//! let data = reader.read_entry_by_name("file.txt")?;
//! # Ok::<(), zipflow::ZipError>(())
//! ```
//!
//! ### Writing an archive
//!
//! ```no_run
//! use zipflow::{AddOptions, FileSink, MemorySource, ZipWriter};
//!
//! let writer = ZipWriter::new(FileSink::create("output.zip")?)?;
//!
//! let hello = MemorySource::from(&b"Hello, World!"[..]);
//! writer.add("hello.txt", Some(hello), AddOptions::default())?;
//!
//! let secret = MemorySource::from(&b"for your eyes only"[..]);
//! writer.add(
//!     "secret.txt",
//!     Some(secret),
//!     AddOptions {
//!         password: Some("hunter2".to_string()),
//!         ..AddOptions::default()
//!     },
//! )?;
//!
//! writer.close(Some("archive comment"))?;
//! # Ok::<(), zipflow::ZipError>(())
//! ```

pub mod codec;
pub mod config;
pub mod cp437;
pub mod crypto;
pub mod dos_time;
pub mod error;
pub mod extra;
pub mod io;
pub mod mover;
pub mod reader;
pub mod worker;
pub mod writer;

pub use codec::{CodecPolicy, Crc32Acc, Direction, FlushOutput, Stage};
pub use config::{configure, ConfigPatch, ZipConfig};
pub use error::{Result, ZipError};
pub use extra::{AesExtra, Zip64Extra};
pub use io::{FileSink, FileSource, MemorySink, MemorySource, Sink, Source};
pub use reader::{ExtractOptions, ReaderOptions, ZipEntry, ZipReader};
pub use worker::{WorkerPool, WorkerStage};
pub use writer::{AddOptions, WriterOptions, ZipWriter};
