//! Streaming ZIP reader over a random-access byte source
//!
//! Locates the end-of-central-directory record from the tail of the source,
//! follows the ZIP64 locator when the EOCD carries sentinel values, walks
//! the central directory into entry records, and extracts entry payloads
//! through the chunked codec pipeline (decrypt, inflate, CRC verify).

use chrono::NaiveDateTime;
use indexmap::IndexMap;

use crate::codec::{CodecPolicy, Direction};
use crate::config::ZipConfig;
use crate::cp437;
use crate::dos_time;
use crate::error::{Result, ZipError};
use crate::extra::{
    self, le_u16, le_u32, le_u64, AesExtra, Zip64Extra, AES_EXTRA_TAG, ZIP64_EXTRA_TAG,
};
use crate::io::{MemorySink, Sink, Source};
use crate::mover;
use crate::worker;

const LOCAL_HEADER_SIGNATURE: u32 = 0x04034b50;
const CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x02014b50;
const EOCD_SIGNATURE: u32 = 0x06054b50;
const ZIP64_EOCD_SIGNATURE: u32 = 0x06064b50;
const ZIP64_LOCATOR_SIGNATURE: u32 = 0x07064b50;

const EOCD_LENGTH: u64 = 22;
const MAX_COMMENT_LENGTH: u64 = 65536;
const ZIP64_LOCATOR_LENGTH: u64 = 20;
const ZIP64_EOCD_LENGTH: u64 = 56;
const CENTRAL_RECORD_LENGTH: usize = 46;
const LOCAL_HEADER_LENGTH: u64 = 30;

/// AES wrapper compression method stored for encrypted entries
pub const AES_METHOD: u16 = 0x63;
/// General-purpose flag bit 0: entry is encrypted
pub const FLAG_ENCRYPTED: u16 = 0x0001;
/// General-purpose flag bit 3: sizes follow in a data descriptor
pub const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;
/// General-purpose flag bit 11: name and comment are UTF-8
pub const FLAG_UTF8: u16 = 0x0800;

/// One central-directory record.
///
/// Records are produced by the parser, live for the lifetime of the reader
/// and are read-only to clients.
#[derive(Debug, Clone)]
pub struct ZipEntry {
    /// Decoded filename (UTF-8 or CP437 per flag bit 11)
    pub name: String,
    /// Filename exactly as stored
    pub raw_name: Vec<u8>,
    /// Decoded comment
    pub comment: String,
    /// Comment exactly as stored
    pub raw_comment: Vec<u8>,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub flags: u16,
    /// Compression method stored in the record (0x63 for AES wrappers)
    pub stored_method: u16,
    /// Method actually applied to the payload (from the AES extra if present)
    pub compression_method: u16,
    pub dos_time: u16,
    pub dos_date: u16,
    /// Last-modified moment decoded from the DOS fields
    pub last_modified: NaiveDateTime,
    /// Stored CRC-32 (zero for AE-2 encrypted entries)
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    /// Offset of the entry's local file header
    pub local_offset: u64,
    pub directory: bool,
    pub encrypted: bool,
    pub internal_attrs: u16,
    pub external_attrs: u32,
    /// Parsed extra fields keyed by tag, in order of appearance
    pub extra_fields: IndexMap<u16, Vec<u8>>,
    /// Extra-field blob exactly as stored
    pub raw_extra: Vec<u8>,
    /// ZIP64 extended information, when the record carried sentinels
    pub zip64: Option<Zip64Extra>,
    /// WinZip AES extra field, when the entry is encrypted
    pub aes: Option<AesExtra>,
}

/// Reader-wide options.
#[derive(Debug, Clone, Default)]
pub struct ReaderOptions {
    /// Default password for encrypted entries
    pub password: Option<String>,
}

/// Per-extraction options.
#[derive(Default)]
pub struct ExtractOptions<'a> {
    /// Password override for this extraction
    pub password: Option<String>,
    /// Progress callback, called `(bytes_processed, total)` per window
    pub on_progress: Option<&'a mut dyn FnMut(u64, u64)>,
}

/// Streaming archive reader.
pub struct ZipReader<S: Source> {
    source: S,
    entries: Vec<ZipEntry>,
    comment: Vec<u8>,
    password: Option<String>,
    config: ZipConfig,
}

impl<S: Source> std::fmt::Debug for ZipReader<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipReader")
            .field("entries", &self.entries)
            .field("comment", &self.comment)
            .field("config", &self.config)
            .finish()
    }
}

impl<S: Source> ZipReader<S> {
    /// Open an archive and parse its central directory.
    pub fn new(source: S) -> Result<Self> {
        Self::with_options(source, ReaderOptions::default())
    }

    /// Open an archive with a default password for encrypted entries.
    pub fn with_options(mut source: S, options: ReaderOptions) -> Result<Self> {
        source.init()?;
        let config = ZipConfig::snapshot();
        let (entries, comment) = parse_archive(&mut source)?;
        Ok(Self {
            source,
            entries,
            comment,
            password: options.password,
            config,
        })
    }

    /// All entries, in central-directory order.
    pub fn entries(&self) -> &[ZipEntry] {
        &self.entries
    }

    /// The archive comment bytes from the EOCD record.
    pub fn comment(&self) -> &[u8] {
        &self.comment
    }

    /// Find an entry by decoded name.
    pub fn entry(&self, name: &str) -> Option<&ZipEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Extract one entry into `sink`, returning the bytes written.
    pub fn extract_entry(
        &mut self,
        entry: &ZipEntry,
        sink: &mut dyn Sink,
        options: ExtractOptions<'_>,
    ) -> Result<u64> {
        sink.init()?;
        if entry.directory {
            return Ok(0);
        }

        let password = options.password.or_else(|| self.password.clone());
        if entry.encrypted && password.is_none() {
            return Err(ZipError::Encrypted);
        }
        let method = entry.compression_method;
        if method != 0 && method != 8 {
            return Err(ZipError::UnsupportedCompression(method));
        }

        let data_offset = self.locate_entry_data(entry)?;
        let policy = CodecPolicy {
            compressed: method == 8,
            signed: !entry.encrypted,
            password: if entry.encrypted { password } else { None },
            expected_signature: (!entry.encrypted).then_some(entry.crc32),
            level: 0,
        };
        let mut stage = worker::acquire_stage(Direction::Inflate, policy, &self.config)?;
        let result = mover::pump(
            &mut self.source,
            data_offset,
            entry.compressed_size,
            stage.as_mut(),
            sink,
            self.config.effective_chunk_size(),
            options.on_progress,
        )?;
        Ok(result.written)
    }

    /// Extract one entry into memory.
    pub fn read_entry(&mut self, entry: &ZipEntry) -> Result<Vec<u8>> {
        self.read_entry_with(entry, ExtractOptions::default())
    }

    /// Extract one entry into memory with options.
    pub fn read_entry_with(
        &mut self,
        entry: &ZipEntry,
        options: ExtractOptions<'_>,
    ) -> Result<Vec<u8>> {
        let mut sink = MemorySink::new();
        self.extract_entry(entry, &mut sink, options)?;
        Ok(sink.into_bytes())
    }

    /// Extract an entry by decoded name into memory.
    pub fn read_entry_by_name(&mut self, name: &str) -> Result<Vec<u8>> {
        let entry = self
            .entry(name)
            .ok_or_else(|| ZipError::EntryNotFound(name.to_string()))?
            .clone();
        self.read_entry(&entry)
    }

    /// Give the source back.
    pub fn into_source(self) -> S {
        self.source
    }

    // Re-read the local header so the payload offset accounts for the local
    // name and extra lengths, which may differ from the directory's copy.
    fn locate_entry_data(&mut self, entry: &ZipEntry) -> Result<u64> {
        let header = read_exact_window(
            &mut self.source,
            entry.local_offset,
            LOCAL_HEADER_LENGTH as usize,
        )?;
        if le_u32(&header, 0) != Some(LOCAL_HEADER_SIGNATURE) {
            return Err(ZipError::BadFormat(
                "invalid local file header signature".to_string(),
            ));
        }
        let name_length = le_u16(&header, 26).unwrap() as u64;
        let extra_length = le_u16(&header, 28).unwrap() as u64;
        let data_offset = entry.local_offset + LOCAL_HEADER_LENGTH + name_length + extra_length;
        let end = data_offset.checked_add(entry.compressed_size);
        if end.is_none() || end.unwrap() > self.source.size() {
            return Err(ZipError::BadFormat(
                "entry payload extends past end of archive".to_string(),
            ));
        }
        Ok(data_offset)
    }
}

// A window shorter than requested breaks every fixed-offset decode below,
// so the source contract is enforced once here.
fn read_exact_window(source: &mut dyn Source, offset: u64, length: usize) -> Result<Vec<u8>> {
    let window = source.read_window(offset, length)?;
    if window.len() != length {
        return Err(ZipError::BadFormat(
            "source returned a short window".to_string(),
        ));
    }
    Ok(window)
}

fn parse_archive(source: &mut dyn Source) -> Result<(Vec<ZipEntry>, Vec<u8>)> {
    let size = source.size();
    let eocd_offset = locate_eocd(source, size)?;
    let eocd = read_exact_window(source, eocd_offset, EOCD_LENGTH as usize)?;

    let entry_count_16 = le_u16(&eocd, 10).unwrap();
    let cd_size_32 = le_u32(&eocd, 12).unwrap();
    let cd_offset_32 = le_u32(&eocd, 16).unwrap();
    let comment_length = le_u16(&eocd, 20).unwrap() as u64;

    let available = size - eocd_offset - EOCD_LENGTH;
    let comment = source.read_window(eocd_offset + EOCD_LENGTH, comment_length.min(available) as usize)?;

    let (entry_count, cd_size, cd_offset) =
        if entry_count_16 == u16::MAX || cd_offset_32 == u32::MAX {
            read_zip64_eocd(source, eocd_offset)?
        } else {
            (entry_count_16 as u64, cd_size_32 as u64, cd_offset_32 as u64)
        };

    let cd_end = cd_offset.checked_add(cd_size);
    if cd_end.is_none() || cd_end.unwrap() > size {
        return Err(ZipError::BadFormat(
            "central directory out of range".to_string(),
        ));
    }
    if entry_count > cd_size / CENTRAL_RECORD_LENGTH as u64 {
        return Err(ZipError::BadFormat(
            "entry count out of range for central directory size".to_string(),
        ));
    }

    let window = read_exact_window(source, cd_offset, cd_size as usize)?;
    let mut entries = Vec::with_capacity(entry_count as usize);
    let mut pos = 0usize;
    for _ in 0..entry_count {
        entries.push(parse_central_record(&window, &mut pos)?);
    }
    Ok((entries, comment))
}

// Fast path reads the minimal 22-byte record at the tail; when a comment is
// present the scan widens to the maximum comment length and walks backward
// byte-by-byte for the signature.
fn locate_eocd(source: &mut dyn Source, size: u64) -> Result<u64> {
    if size < EOCD_LENGTH {
        return Err(ZipError::BadFormat(
            "source too short for an archive".to_string(),
        ));
    }
    let tail = read_exact_window(source, size - EOCD_LENGTH, EOCD_LENGTH as usize)?;
    if le_u32(&tail, 0) == Some(EOCD_SIGNATURE) {
        return Ok(size - EOCD_LENGTH);
    }

    let scan_length = (EOCD_LENGTH + MAX_COMMENT_LENGTH).min(size);
    let scan_start = size - scan_length;
    let window = read_exact_window(source, scan_start, scan_length as usize)?;
    let last = window.len() - EOCD_LENGTH as usize;
    for pos in (0..=last).rev() {
        if le_u32(&window, pos) == Some(EOCD_SIGNATURE) {
            return Ok(scan_start + pos as u64);
        }
    }
    Err(ZipError::BadFormat(
        "end of central directory record not found".to_string(),
    ))
}

fn read_zip64_eocd(source: &mut dyn Source, eocd_offset: u64) -> Result<(u64, u64, u64)> {
    if eocd_offset < ZIP64_LOCATOR_LENGTH {
        return Err(ZipError::BadFormat(
            "ZIP64 locator does not fit before the EOCD".to_string(),
        ));
    }
    let locator = read_exact_window(
        source,
        eocd_offset - ZIP64_LOCATOR_LENGTH,
        ZIP64_LOCATOR_LENGTH as usize,
    )?;
    if le_u32(&locator, 0) != Some(ZIP64_LOCATOR_SIGNATURE) {
        return Err(ZipError::BadFormat(
            "invalid ZIP64 locator signature".to_string(),
        ));
    }
    let zip64_eocd_offset = le_u64(&locator, 8).unwrap();
    let end = zip64_eocd_offset.checked_add(ZIP64_EOCD_LENGTH);
    if end.is_none() || end.unwrap() > source.size() {
        return Err(ZipError::BadFormat(
            "ZIP64 EOCD out of range".to_string(),
        ));
    }

    let record = read_exact_window(source, zip64_eocd_offset, ZIP64_EOCD_LENGTH as usize)?;
    if le_u32(&record, 0) != Some(ZIP64_EOCD_SIGNATURE) {
        return Err(ZipError::BadFormat(
            "invalid ZIP64 EOCD signature".to_string(),
        ));
    }
    let entry_count = le_u64(&record, 32).unwrap();
    let cd_size = le_u64(&record, 40).unwrap();
    let cd_offset = le_u64(&record, 48).unwrap();
    Ok((entry_count, cd_size, cd_offset))
}

fn parse_central_record(window: &[u8], pos: &mut usize) -> Result<ZipEntry> {
    let base = *pos;
    let truncated = || ZipError::BadFormat("truncated central directory".to_string());

    if le_u32(window, base).ok_or_else(truncated)? != CENTRAL_DIRECTORY_SIGNATURE {
        return Err(ZipError::BadFormat(
            "invalid central directory record signature".to_string(),
        ));
    }
    let fixed = window.get(base..base + CENTRAL_RECORD_LENGTH).ok_or_else(truncated)?;

    let version_made_by = le_u16(fixed, 4).unwrap();
    let version_needed = le_u16(fixed, 6).unwrap();
    let flags = le_u16(fixed, 8).unwrap();
    let stored_method = le_u16(fixed, 10).unwrap();
    let dos_time = le_u16(fixed, 12).unwrap();
    let dos_date = le_u16(fixed, 14).unwrap();
    let crc32 = le_u32(fixed, 16).unwrap();
    let compressed_size_32 = le_u32(fixed, 20).unwrap();
    let uncompressed_size_32 = le_u32(fixed, 24).unwrap();
    let name_length = le_u16(fixed, 28).unwrap() as usize;
    let extra_length = le_u16(fixed, 30).unwrap() as usize;
    let comment_length = le_u16(fixed, 32).unwrap() as usize;
    let internal_attrs = le_u16(fixed, 36).unwrap();
    let external_attrs = le_u32(fixed, 38).unwrap();
    let local_offset_32 = le_u32(fixed, 42).unwrap();

    let mut cursor = base + CENTRAL_RECORD_LENGTH;
    let raw_name = window.get(cursor..cursor + name_length).ok_or_else(truncated)?.to_vec();
    cursor += name_length;
    let raw_extra = window.get(cursor..cursor + extra_length).ok_or_else(truncated)?.to_vec();
    cursor += extra_length;
    let raw_comment = window.get(cursor..cursor + comment_length).ok_or_else(truncated)?.to_vec();
    cursor += comment_length;
    *pos = cursor;

    let utf8 = flags & FLAG_UTF8 != 0;
    let name = cp437::decode_text(&raw_name, utf8);
    let comment = cp437::decode_text(&raw_comment, utf8);
    let directory = external_attrs & 0x10 != 0 || name.ends_with('/');

    let extra_fields = extra::parse_extra_fields(&raw_extra);
    let (uncompressed_size, compressed_size, local_offset, zip64) = extra::resolve_zip64(
        extra_fields.get(&ZIP64_EXTRA_TAG).map(Vec::as_slice),
        uncompressed_size_32,
        compressed_size_32,
        local_offset_32,
    )?;

    let encrypted = flags & FLAG_ENCRYPTED != 0;
    let (aes, compression_method) = if encrypted {
        if stored_method != AES_METHOD {
            return Err(ZipError::UnsupportedCompression(stored_method));
        }
        let data = extra_fields.get(&AES_EXTRA_TAG).ok_or_else(|| {
            ZipError::BadFormat("encrypted entry without a WinZip AES extra field".to_string())
        })?;
        let aes = AesExtra::parse(data)?;
        (Some(aes), aes.inner_method)
    } else {
        (None, stored_method)
    };

    Ok(ZipEntry {
        name,
        raw_name,
        comment,
        raw_comment,
        version_made_by,
        version_needed,
        flags,
        stored_method,
        compression_method,
        dos_time,
        dos_date,
        last_modified: dos_time::from_dos(dos_time, dos_date),
        crc32,
        compressed_size,
        uncompressed_size,
        local_offset,
        directory,
        encrypted,
        internal_attrs,
        external_attrs,
        extra_fields,
        raw_extra,
        zip64,
        aes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemorySource;

    #[test]
    fn source_shorter_than_eocd_is_bad_format() {
        let err = ZipReader::new(MemorySource::from(&b"PK"[..])).unwrap_err();
        assert!(matches!(err, ZipError::BadFormat(_)));
    }

    #[test]
    fn missing_eocd_is_bad_format() {
        let err = ZipReader::new(MemorySource::new(vec![0u8; 4096])).unwrap_err();
        assert!(matches!(err, ZipError::BadFormat(_)));
    }
}
