//! Streaming ZIP writer: local headers, payloads, descriptors, directory
//!
//! Entries are added in order and streamed straight to the sink through the
//! codec pipeline (CRC, deflate, encrypt); sizes and signatures travel in a
//! trailing data descriptor, so the sink never needs to seek. The central
//! directory accumulates in memory and is emitted on `close`, together with
//! the ZIP64 trailer records when the archive crossed a ZIP64 threshold.
//!
//! `add` may be called from several threads. Each call reserves its slot in
//! invocation order; with `buffered_write` the whole entry is built into a
//! transient in-memory sink off the lock and appended atomically, so
//! concurrent adds race on their own buffers and serialise on append order.

use std::sync::{Condvar, Mutex, MutexGuard};

use chrono::{Local, NaiveDateTime};
use indexmap::IndexMap;

use crate::codec::{CodecPolicy, Direction};
use crate::config::ZipConfig;
use crate::dos_time;
use crate::error::{Result, ZipError};
use crate::extra::{build_extra_field, AesExtra, ZIP64_EXTRA_TAG};
use crate::io::{MemorySink, MemorySource, Sink, Source};
use crate::mover;
use crate::reader::{AES_METHOD, FLAG_DATA_DESCRIPTOR, FLAG_ENCRYPTED, FLAG_UTF8};
use crate::worker;

const VERSION_DEFAULT: u16 = 0x14;
const VERSION_ZIP64: u16 = 0x2D;
const VERSION_AES: u16 = 0x33;

/// Writer-wide options.
#[derive(Debug, Clone, Default)]
pub struct WriterOptions {
    /// Lay out every entry and the archive trailer as ZIP64
    pub zip64: bool,
}

/// Per-entry options for [`ZipWriter::add`].
pub struct AddOptions<'a> {
    /// Entry is a directory; a trailing "/" is appended to the name
    pub directory: bool,
    /// DEFLATE level; 0 stores the payload uncompressed
    pub level: u32,
    /// Encrypt the payload with WinZip AES-256 under this password
    pub password: Option<String>,
    /// Force ZIP64 layout for this entry
    pub zip64: bool,
    /// Build the entry in memory and append it to the sink atomically
    pub buffered_write: bool,
    /// Entry comment for the central directory
    pub comment: Option<String>,
    /// Last-modified timestamp; defaults to now
    pub last_modified: Option<NaiveDateTime>,
    /// Caller extra fields, appended after the ZIP64 and AES extras
    pub extra_fields: Vec<(u16, Vec<u8>)>,
    /// Progress callback, called `(bytes_processed, total)` per window
    pub on_progress: Option<&'a mut dyn FnMut(u64, u64)>,
}

impl Default for AddOptions<'_> {
    fn default() -> Self {
        Self {
            directory: false,
            level: 6,
            password: None,
            zip64: false,
            buffered_write: false,
            comment: None,
            last_modified: None,
            extra_fields: Vec::new(),
            on_progress: None,
        }
    }
}

// Central-directory state for one written entry. Sizes and CRC are
// backfilled once the payload has gone through the pipeline.
#[derive(Debug, Clone)]
struct PendingEntry {
    raw_name: Vec<u8>,
    raw_comment: Vec<u8>,
    version: u16,
    flags: u16,
    method: u16,
    inner_method: u16,
    dos_time: u16,
    dos_date: u16,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    local_offset: u64,
    zip64: bool,
    directory: bool,
    encrypted: bool,
    raw_extra: Vec<u8>,
}

enum EntrySlot {
    Reserved,
    Done(PendingEntry),
}

struct WriterState<W> {
    sink: W,
    offset: u64,
    entries: IndexMap<String, EntrySlot>,
    next_ticket: u64,
    turn: u64,
    zip64: bool,
}

/// Streaming archive writer over an append-only sink.
pub struct ZipWriter<W: Sink> {
    state: Mutex<WriterState<W>>,
    turn: Condvar,
    config: ZipConfig,
}

impl<W: Sink> ZipWriter<W> {
    /// Start an archive session; the writer owns the sink until `close`.
    pub fn new(sink: W) -> Result<Self> {
        Self::with_options(sink, WriterOptions::default())
    }

    pub fn with_options(mut sink: W, options: WriterOptions) -> Result<Self> {
        sink.init()?;
        Ok(Self {
            state: Mutex::new(WriterState {
                sink,
                offset: 0,
                entries: IndexMap::new(),
                next_ticket: 0,
                turn: 0,
                zip64: options.zip64,
            }),
            turn: Condvar::new(),
            config: ZipConfig::snapshot(),
        })
    }

    /// Add one entry. Names collide after normalisation; a failed add
    /// leaves the archive state untouched.
    pub fn add<Src: Source>(
        &self,
        name: &str,
        source: Option<Src>,
        options: AddOptions<'_>,
    ) -> Result<()> {
        let name = normalize_name(name, options.directory)?;

        let ticket = {
            let mut state = self.state.lock().unwrap();
            if state.entries.contains_key(&name) {
                return Err(ZipError::DuplicatedName(name));
            }
            state.entries.insert(name.clone(), EntrySlot::Reserved);
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            ticket
        };

        match self.write_entry(&name, ticket, source, options) {
            Ok(entry) => {
                let mut state = self.state.lock().unwrap();
                if entry.zip64 {
                    state.zip64 = true;
                }
                state.entries.insert(name, EntrySlot::Done(entry));
                Ok(())
            }
            Err(e) => {
                // the ticket must still be consumed, or every later add
                // would wait on it forever
                self.abandon_turn(ticket);
                let mut state = self.state.lock().unwrap();
                state.entries.shift_remove(&name);
                Err(e)
            }
        }
    }

    /// Add a directory entry.
    pub fn add_directory(&self, name: &str, options: AddOptions<'_>) -> Result<()> {
        self.add(
            name,
            None::<MemorySource>,
            AddOptions {
                directory: true,
                ..options
            },
        )
    }

    /// Emit the central directory, ZIP64 trailer records when promoted, and
    /// the EOCD, then finalise and return the sink.
    pub fn close(self, comment: Option<&str>) -> Result<W> {
        let mut state = self.state.into_inner().unwrap();
        let comment_bytes = comment.unwrap_or_default().as_bytes();
        if comment_bytes.len() > u16::MAX as usize {
            return Err(ZipError::ZipCommentTooLong);
        }

        let mut entries = Vec::with_capacity(state.entries.len());
        for (name, slot) in std::mem::take(&mut state.entries) {
            match slot {
                EntrySlot::Done(entry) => entries.push(entry),
                EntrySlot::Reserved => {
                    return Err(ZipError::BadFormat(format!(
                        "entry still being written: {}",
                        name
                    )));
                }
            }
        }

        let cd_offset = state.offset;
        for entry in &entries {
            let record = build_central_record(entry);
            state.sink.write_window(&record)?;
            state.offset += record.len() as u64;
        }
        let cd_size = state.offset - cd_offset;
        let entry_count = entries.len() as u64;

        let zip64 = state.zip64
            || entry_count >= u16::MAX as u64
            || cd_offset >= u32::MAX as u64;
        if zip64 {
            let zip64_eocd_offset = state.offset;
            let mut trailer = Vec::with_capacity(76);
            trailer.extend_from_slice(&[0x50, 0x4B, 0x06, 0x06]);
            trailer.extend_from_slice(&44u64.to_le_bytes()); // remaining record size
            trailer.extend_from_slice(&VERSION_ZIP64.to_le_bytes()); // version made by
            trailer.extend_from_slice(&VERSION_ZIP64.to_le_bytes()); // version needed
            trailer.extend_from_slice(&0u32.to_le_bytes()); // this disk
            trailer.extend_from_slice(&0u32.to_le_bytes()); // directory disk
            trailer.extend_from_slice(&entry_count.to_le_bytes());
            trailer.extend_from_slice(&entry_count.to_le_bytes());
            trailer.extend_from_slice(&cd_size.to_le_bytes());
            trailer.extend_from_slice(&cd_offset.to_le_bytes());

            trailer.extend_from_slice(&[0x50, 0x4B, 0x06, 0x07]);
            trailer.extend_from_slice(&0u32.to_le_bytes()); // disk with the ZIP64 EOCD
            trailer.extend_from_slice(&zip64_eocd_offset.to_le_bytes());
            trailer.extend_from_slice(&1u32.to_le_bytes()); // total disks
            state.sink.write_window(&trailer)?;
            state.offset += trailer.len() as u64;
        }

        let count_field = if zip64 { u16::MAX } else { entry_count as u16 };
        let size_field = if cd_size >= u32::MAX as u64 {
            u32::MAX
        } else {
            cd_size as u32
        };
        let offset_field = if zip64 { u32::MAX } else { cd_offset as u32 };

        let mut eocd = Vec::with_capacity(22 + comment_bytes.len());
        eocd.extend_from_slice(&[0x50, 0x4B, 0x05, 0x06]);
        eocd.extend_from_slice(&0u16.to_le_bytes()); // this disk
        eocd.extend_from_slice(&0u16.to_le_bytes()); // directory disk
        eocd.extend_from_slice(&count_field.to_le_bytes());
        eocd.extend_from_slice(&count_field.to_le_bytes());
        eocd.extend_from_slice(&size_field.to_le_bytes());
        eocd.extend_from_slice(&offset_field.to_le_bytes());
        eocd.extend_from_slice(&(comment_bytes.len() as u16).to_le_bytes());
        eocd.extend_from_slice(comment_bytes);
        state.sink.write_window(&eocd)?;
        state.sink.finalize()?;
        Ok(state.sink)
    }

    fn write_entry<Src: Source>(
        &self,
        name: &str,
        ticket: u64,
        source: Option<Src>,
        options: AddOptions<'_>,
    ) -> Result<PendingEntry> {
        let raw_name = name.as_bytes().to_vec();
        if raw_name.len() > u16::MAX as usize {
            return Err(ZipError::BadFormat("entry name too long".to_string()));
        }
        let raw_comment = options.comment.clone().unwrap_or_default().into_bytes();
        if raw_comment.len() > u16::MAX as usize {
            return Err(ZipError::BadFormat("entry comment too long".to_string()));
        }

        let mut source = source;
        let source_size = match &mut source {
            Some(src) => {
                src.init()?;
                src.size()
            }
            None => 0,
        };

        let directory = options.directory || name.ends_with('/');
        let encrypted = options.password.is_some() && !directory;
        let compressed = options.level != 0 && !directory;
        // the sticky flag is live: once any entry promoted the archive,
        // every later entry is laid out as ZIP64 too
        let zip64 = options.zip64
            || self.state.lock().unwrap().zip64
            || source_size >= u32::MAX as u64;

        let inner_method: u16 = if compressed { 8 } else { 0 };
        let method = if encrypted { AES_METHOD } else { inner_method };
        let version = match (encrypted, zip64) {
            (true, _) => VERSION_AES,
            (false, true) => VERSION_ZIP64,
            (false, false) => VERSION_DEFAULT,
        };

        let mut flags = FLAG_DATA_DESCRIPTOR;
        if encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        let non_ascii = |bytes: &[u8]| bytes.iter().any(|b| *b >= 0x80);
        if non_ascii(&raw_name) || non_ascii(&raw_comment) {
            flags |= FLAG_UTF8;
        }

        let moment = options
            .last_modified
            .unwrap_or_else(|| Local::now().naive_local());
        let (dos_time, dos_date) = dos_time::to_dos(moment);

        let mut entry = PendingEntry {
            raw_name,
            raw_comment,
            version,
            flags,
            method,
            inner_method,
            dos_time,
            dos_date,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: if directory { 0 } else { source_size },
            local_offset: 0,
            zip64,
            directory,
            encrypted,
            raw_extra: build_caller_extras(&options.extra_fields),
        };

        let policy = CodecPolicy {
            compressed,
            signed: !encrypted,
            password: if encrypted { options.password.clone() } else { None },
            expected_signature: None,
            level: options.level,
        };
        let mut progress = options.on_progress;
        let source_dyn = source.as_mut().map(|src| src as &mut dyn Source);

        if options.buffered_write {
            let mut buffer = MemorySink::new();
            self.emit_entry(&mut buffer, &mut entry, source_dyn, &policy, progress.take())?;
            let blob = buffer.into_bytes();

            let mut state = self.wait_turn(ticket);
            entry.local_offset = state.offset;
            let outcome = state.sink.write_window(&blob);
            match outcome {
                Ok(()) => {
                    state.offset += blob.len() as u64;
                    self.end_turn(state);
                    Ok(entry)
                }
                Err(e) => {
                    self.end_turn(state);
                    Err(e)
                }
            }
        } else {
            let mut state = self.wait_turn(ticket);
            entry.local_offset = state.offset;
            let before = state.offset;
            let outcome =
                self.emit_entry(&mut state.sink, &mut entry, source_dyn, &policy, progress.take());
            match outcome {
                Ok(written) => {
                    state.offset = before + written;
                    self.end_turn(state);
                    Ok(entry)
                }
                Err(e) => {
                    self.end_turn(state);
                    Err(e)
                }
            }
        }
    }

    // Local header, payload through the pipeline, data descriptor. The
    // entry record is backfilled with the CRC and both sizes on the way
    // out; the central directory is built from it at close.
    fn emit_entry(
        &self,
        sink: &mut dyn Sink,
        entry: &mut PendingEntry,
        source: Option<&mut dyn Source>,
        policy: &CodecPolicy,
        progress: Option<&mut dyn FnMut(u64, u64)>,
    ) -> Result<u64> {
        let mut written = 0u64;

        let mut local_extra = Vec::new();
        if entry.zip64 {
            // sizes and offset are unknown here; the directory copy carries
            // the real values
            local_extra.extend_from_slice(&build_extra_field(ZIP64_EXTRA_TAG, &[0u8; 24]));
        }
        if entry.encrypted {
            local_extra.extend_from_slice(&AesExtra::build(entry.inner_method));
        }
        local_extra.extend_from_slice(&entry.raw_extra);

        let size_placeholder = if entry.zip64 { u32::MAX } else { 0 };
        let mut header = Vec::with_capacity(30 + entry.raw_name.len() + local_extra.len());
        header.extend_from_slice(&[0x50, 0x4B, 0x03, 0x04]);
        header.extend_from_slice(&entry.version.to_le_bytes());
        header.extend_from_slice(&entry.flags.to_le_bytes());
        header.extend_from_slice(&entry.method.to_le_bytes());
        header.extend_from_slice(&entry.dos_time.to_le_bytes());
        header.extend_from_slice(&entry.dos_date.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes()); // crc, in the descriptor
        header.extend_from_slice(&size_placeholder.to_le_bytes());
        header.extend_from_slice(&size_placeholder.to_le_bytes());
        header.extend_from_slice(&(entry.raw_name.len() as u16).to_le_bytes());
        header.extend_from_slice(&(local_extra.len() as u16).to_le_bytes());
        header.extend_from_slice(&entry.raw_name);
        header.extend_from_slice(&local_extra);
        sink.write_window(&header)?;
        written += header.len() as u64;

        if !entry.directory {
            let mut empty = MemorySource::default();
            let src = source.unwrap_or(&mut empty as &mut dyn Source);
            let mut stage =
                worker::acquire_stage(Direction::Deflate, policy.clone(), &self.config)?;
            let result = mover::pump(
                src,
                0,
                entry.uncompressed_size,
                stage.as_mut(),
                sink,
                self.config.effective_chunk_size(),
                progress,
            )?;
            entry.compressed_size = result.written;
            entry.crc32 = result.signature.unwrap_or(0);
            written += result.written;

            if !entry.zip64 && entry.compressed_size >= u32::MAX as u64 {
                return Err(ZipError::BadFormat(
                    "compressed payload crossed the ZIP64 threshold".to_string(),
                ));
            }
        }

        let mut descriptor = Vec::with_capacity(24);
        descriptor.extend_from_slice(&[0x50, 0x4B, 0x07, 0x08]);
        descriptor.extend_from_slice(&entry.crc32.to_le_bytes());
        if entry.zip64 {
            descriptor.extend_from_slice(&entry.compressed_size.to_le_bytes());
            descriptor.extend_from_slice(&entry.uncompressed_size.to_le_bytes());
        } else {
            descriptor.extend_from_slice(&(entry.compressed_size as u32).to_le_bytes());
            descriptor.extend_from_slice(&(entry.uncompressed_size as u32).to_le_bytes());
        }
        sink.write_window(&descriptor)?;
        written += descriptor.len() as u64;
        Ok(written)
    }

    fn wait_turn(&self, ticket: u64) -> MutexGuard<'_, WriterState<W>> {
        let mut state = self.state.lock().unwrap();
        while state.turn < ticket {
            state = self.turn.wait(state).unwrap();
        }
        state
    }

    fn end_turn(&self, mut state: MutexGuard<'_, WriterState<W>>) {
        state.turn += 1;
        drop(state);
        self.turn.notify_all();
    }

    // Consume `ticket` unless `write_entry` already did. Safe to call after
    // a failure at any point of the entry's lifecycle.
    fn abandon_turn(&self, ticket: u64) {
        let mut state = self.state.lock().unwrap();
        while state.turn < ticket {
            state = self.turn.wait(state).unwrap();
        }
        if state.turn == ticket {
            self.end_turn(state);
        }
    }
}

fn normalize_name(name: &str, directory: bool) -> Result<String> {
    let mut name = name.trim_end().to_string();
    if directory && !name.ends_with('/') {
        name.push('/');
    }
    if name.is_empty() || name == "/" {
        return Err(ZipError::BadFormat("empty entry name".to_string()));
    }
    Ok(name)
}

fn build_caller_extras(fields: &[(u16, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (tag, data) in fields {
        out.extend_from_slice(&build_extra_field(*tag, data));
    }
    out
}

fn build_central_record(entry: &PendingEntry) -> Vec<u8> {
    let offset_overflow = entry.local_offset >= u32::MAX as u64;

    let mut extra = Vec::new();
    if entry.zip64 {
        let mut data = Vec::with_capacity(24);
        data.extend_from_slice(&entry.uncompressed_size.to_le_bytes());
        data.extend_from_slice(&entry.compressed_size.to_le_bytes());
        data.extend_from_slice(&entry.local_offset.to_le_bytes());
        extra.extend_from_slice(&build_extra_field(ZIP64_EXTRA_TAG, &data));
    } else if offset_overflow {
        extra.extend_from_slice(&build_extra_field(
            ZIP64_EXTRA_TAG,
            &entry.local_offset.to_le_bytes(),
        ));
    }
    if entry.encrypted {
        extra.extend_from_slice(&AesExtra::build(entry.inner_method));
    }
    extra.extend_from_slice(&entry.raw_extra);

    let (compressed_field, uncompressed_field) = if entry.zip64 {
        (u32::MAX, u32::MAX)
    } else {
        (entry.compressed_size as u32, entry.uncompressed_size as u32)
    };
    let offset_field = if entry.zip64 || offset_overflow {
        u32::MAX
    } else {
        entry.local_offset as u32
    };
    let external_attrs: u32 = if entry.directory { 0x10 } else { 0 };

    let mut out = Vec::with_capacity(
        46 + entry.raw_name.len() + extra.len() + entry.raw_comment.len(),
    );
    out.extend_from_slice(&[0x50, 0x4B, 0x01, 0x02]);
    out.extend_from_slice(&entry.version.to_le_bytes()); // version made by
    out.extend_from_slice(&entry.version.to_le_bytes()); // version needed
    out.extend_from_slice(&entry.flags.to_le_bytes());
    out.extend_from_slice(&entry.method.to_le_bytes());
    out.extend_from_slice(&entry.dos_time.to_le_bytes());
    out.extend_from_slice(&entry.dos_date.to_le_bytes());
    out.extend_from_slice(&entry.crc32.to_le_bytes());
    out.extend_from_slice(&compressed_field.to_le_bytes());
    out.extend_from_slice(&uncompressed_field.to_le_bytes());
    out.extend_from_slice(&(entry.raw_name.len() as u16).to_le_bytes());
    out.extend_from_slice(&(extra.len() as u16).to_le_bytes());
    out.extend_from_slice(&(entry.raw_comment.len() as u16).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // disk number start
    out.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
    out.extend_from_slice(&external_attrs.to_le_bytes());
    out.extend_from_slice(&offset_field.to_le_bytes());
    out.extend_from_slice(&entry.raw_name);
    out.extend_from_slice(&extra);
    out.extend_from_slice(&entry.raw_comment);
    out
}
