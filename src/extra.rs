//! Extra-field parsing and assembly for central directory and local headers
//!
//! Extra fields are a sequence of `(tagU16LE, sizeU16LE, data)` blocks. The
//! two tags the engine interprets are ZIP64 (0x0001), which backs 0xFFFFFFFF
//! sentinels in the fixed header fields, and WinZip AES (0x9901), which
//! wraps the real compression method of an encrypted entry.

use indexmap::IndexMap;

use crate::error::{Result, ZipError};

/// ZIP64 extended-information extra field tag
pub const ZIP64_EXTRA_TAG: u16 = 0x0001;
/// WinZip AES extra field tag
pub const AES_EXTRA_TAG: u16 = 0x9901;

/// WinZip AE-2 vendor version
pub const AES_VENDOR_VERSION: u16 = 2;
/// WinZip vendor id, "AE"
pub const AES_VENDOR_ID: [u8; 2] = *b"AE";
/// Strength code for AES-256, the only accepted strength
pub const AES_STRENGTH_256: u8 = 3;

pub(crate) fn le_u16(buf: &[u8], pos: usize) -> Option<u16> {
    let bytes = buf.get(pos..pos + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn le_u32(buf: &[u8], pos: usize) -> Option<u32> {
    let bytes = buf.get(pos..pos + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().unwrap()))
}

pub(crate) fn le_u64(buf: &[u8], pos: usize) -> Option<u64> {
    let bytes = buf.get(pos..pos + 8)?;
    Some(u64::from_le_bytes(bytes.try_into().unwrap()))
}

/// Walk a raw extra-field blob into a tag-keyed map, preserving order.
///
/// A truncated trailing block is ignored, matching what most extractors do
/// with padding emitted by other tools.
pub fn parse_extra_fields(raw: &[u8]) -> IndexMap<u16, Vec<u8>> {
    let mut fields = IndexMap::new();
    let mut pos = 0usize;
    while pos + 4 <= raw.len() {
        let tag = le_u16(raw, pos).unwrap();
        let size = le_u16(raw, pos + 2).unwrap() as usize;
        pos += 4;
        if pos + size > raw.len() {
            break;
        }
        fields.insert(tag, raw[pos..pos + size].to_vec());
        pos += size;
    }
    fields
}

/// Lay out one `(tag, size, data)` block.
pub fn build_extra_field(tag: u16, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + data.len());
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&(data.len() as u16).to_le_bytes());
    out.extend_from_slice(data);
    out
}

/// Resolved ZIP64 extended information for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zip64Extra {
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub local_offset: u64,
}

/// Resolve 0xFFFFFFFF sentinels in the fixed header fields against the
/// ZIP64 extra data. Slots appear in APPNOTE order (uncompressed size,
/// compressed size, local-header offset) and only for fields that carry the
/// sentinel, so each present sentinel consumes the next 8-byte slot.
///
/// Fails with `BadFormat` when a sentinel has no backing slot.
pub fn resolve_zip64(
    extra: Option<&[u8]>,
    uncompressed_size: u32,
    compressed_size: u32,
    local_offset: u32,
) -> Result<(u64, u64, u64, Option<Zip64Extra>)> {
    let any_sentinel = uncompressed_size == u32::MAX
        || compressed_size == u32::MAX
        || local_offset == u32::MAX;
    if !any_sentinel {
        return Ok((
            uncompressed_size as u64,
            compressed_size as u64,
            local_offset as u64,
            None,
        ));
    }

    let data = extra.ok_or_else(|| {
        ZipError::BadFormat("ZIP64 sentinel without a ZIP64 extra field".to_string())
    })?;
    let mut cursor = 0usize;
    let mut take_slot = |sentinel: bool, fallback: u32| -> Result<u64> {
        if !sentinel {
            return Ok(fallback as u64);
        }
        let value = le_u64(data, cursor).ok_or_else(|| {
            ZipError::BadFormat("ZIP64 extra field too short for its sentinels".to_string())
        })?;
        cursor += 8;
        Ok(value)
    };

    let uncompressed = take_slot(uncompressed_size == u32::MAX, uncompressed_size)?;
    let compressed = take_slot(compressed_size == u32::MAX, compressed_size)?;
    let offset = take_slot(local_offset == u32::MAX, local_offset)?;
    Ok((
        uncompressed,
        compressed,
        offset,
        Some(Zip64Extra {
            uncompressed_size: uncompressed,
            compressed_size: compressed,
            local_offset: offset,
        }),
    ))
}

/// Parsed WinZip AES extra field (tag 0x9901).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AesExtra {
    pub vendor_version: u16,
    pub strength: u8,
    /// Compression method actually applied to the plaintext
    pub inner_method: u16,
}

impl AesExtra {
    /// Decode the 7-byte data of an AES extra field.
    ///
    /// Only strength 3 (AES-256) is accepted; anything else is
    /// `UnsupportedEncryption`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 7 {
            return Err(ZipError::BadFormat(
                "WinZip AES extra field too short".to_string(),
            ));
        }
        let vendor_version = le_u16(data, 0).unwrap();
        let strength = data[4];
        let inner_method = le_u16(data, 5).unwrap();
        if strength != AES_STRENGTH_256 {
            return Err(ZipError::UnsupportedEncryption(strength));
        }
        Ok(Self {
            vendor_version,
            strength,
            inner_method,
        })
    }

    /// Lay out the full 11-byte extra field block for this entry.
    pub fn build(inner_method: u16) -> Vec<u8> {
        let mut data = Vec::with_capacity(7);
        data.extend_from_slice(&AES_VENDOR_VERSION.to_le_bytes());
        data.extend_from_slice(&AES_VENDOR_ID);
        data.push(AES_STRENGTH_256);
        data.extend_from_slice(&inner_method.to_le_bytes());
        build_extra_field(AES_EXTRA_TAG, &data)
    }
}
