//! Codec stages and the per-entry pipeline assembler
//!
//! A [`Stage`] transforms a payload window-by-window: `append` consumes one
//! input window and returns whatever output is ready for the sink, `flush`
//! finalises internal state, emits any buffered tail and produces or
//! verifies the signature. Stage order is fixed: extraction runs decrypt →
//! inflate → CRC, writing runs CRC → deflate → encrypt. The CRC is only
//! tracked for signed, unencrypted payloads; AE-2 entries are authenticated
//! by their HMAC and carry a zero CRC.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::crypto::{self, EntryDecryptor, EntryEncryptor};
use crate::error::{Result, ZipError};

const CODEC_BUF: usize = 16 * 1024;

/// Rolling CRC-32 (IEEE) accumulator.
///
/// Folding windows one at a time yields the same value as a single update
/// over their concatenation.
#[derive(Debug, Clone, Default)]
pub struct Crc32Acc {
    hasher: crc32fast::Hasher,
}

impl Crc32Acc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn get(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

/// Which way a pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Extraction: decrypt, decompress, verify
    Inflate,
    /// Writing: sign, compress, encrypt
    Deflate,
}

/// Per-entry codec policy, decided by the reader or writer.
#[derive(Debug, Clone)]
pub struct CodecPolicy {
    /// Payload is DEFLATE-compressed (method 8)
    pub compressed: bool,
    /// Payload carries a CRC-32 signature
    pub signed: bool,
    /// Password for WinZip AE-2 payloads
    pub password: Option<String>,
    /// CRC-32 the inflate path must match on flush
    pub expected_signature: Option<u32>,
    /// DEFLATE level for the deflate path
    pub level: u32,
}

/// Output of [`Stage::flush`].
#[derive(Debug, Default)]
pub struct FlushOutput {
    pub bytes: Vec<u8>,
    pub signature: Option<u32>,
}

/// One cooperatively driven codec unit.
///
/// `flush` is terminal; a stage must not be used again afterwards.
pub trait Stage {
    fn append(&mut self, input: &[u8]) -> Result<Vec<u8>>;
    fn flush(&mut self) -> Result<FlushOutput>;
}

/// True when no codec work is needed at all (stored, unsigned, plaintext)
/// and the stage can be a passthrough run in-process.
pub fn is_passthrough(policy: &CodecPolicy) -> bool {
    !policy.compressed && !policy.signed && policy.password.is_none()
}

/// Assemble the stage for one entry.
pub fn build_stage(direction: Direction, policy: &CodecPolicy) -> Result<Box<dyn Stage>> {
    let stage: Box<dyn Stage> = match direction {
        Direction::Deflate => Box::new(WriteStage::new(policy)?),
        Direction::Inflate => Box::new(ReadStage::new(policy)),
    };
    Ok(stage)
}

// Streaming raw-deflate compressor over flate2's low-level state machine.
struct Deflater {
    raw: Compress,
}

impl Deflater {
    fn new(level: u32) -> Self {
        Self {
            raw: Compress::new(Compression::new(level.min(9)), false),
        }
    }

    fn append(&mut self, mut input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() / 2 + 64);
        while !input.is_empty() {
            if out.len() == out.capacity() {
                out.reserve(CODEC_BUF);
            }
            let before = self.raw.total_in();
            let status = self
                .raw
                .compress_vec(input, &mut out, FlushCompress::None)
                .map_err(|e| ZipError::BadFormat(format!("deflate failed: {}", e)))?;
            let consumed = (self.raw.total_in() - before) as usize;
            input = &input[consumed..];
            if let Status::StreamEnd = status {
                break;
            }
        }
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(CODEC_BUF);
        loop {
            if out.len() == out.capacity() {
                out.reserve(CODEC_BUF);
            }
            let status = self
                .raw
                .compress_vec(&[], &mut out, FlushCompress::Finish)
                .map_err(|e| ZipError::BadFormat(format!("deflate failed: {}", e)))?;
            if let Status::StreamEnd = status {
                return Ok(out);
            }
        }
    }
}

// Streaming raw-inflate decompressor.
struct Inflater {
    raw: Decompress,
    done: bool,
}

impl Inflater {
    fn new() -> Self {
        Self {
            raw: Decompress::new(false),
            done: false,
        }
    }

    fn append(&mut self, mut input: &[u8]) -> Result<Vec<u8>> {
        if self.done {
            return if input.is_empty() {
                Ok(Vec::new())
            } else {
                Err(ZipError::BadFormat(
                    "trailing data after deflate stream".to_string(),
                ))
            };
        }
        let mut out = Vec::with_capacity(input.len() * 2 + 64);
        while !input.is_empty() {
            if out.len() == out.capacity() {
                out.reserve(CODEC_BUF);
            }
            let before = self.raw.total_in();
            let status = self
                .raw
                .decompress_vec(input, &mut out, FlushDecompress::None)
                .map_err(|e| ZipError::BadFormat(format!("inflate failed: {}", e)))?;
            let consumed = (self.raw.total_in() - before) as usize;
            input = &input[consumed..];
            if let Status::StreamEnd = status {
                self.done = true;
                if !input.is_empty() {
                    return Err(ZipError::BadFormat(
                        "trailing data after deflate stream".to_string(),
                    ));
                }
                break;
            }
        }
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        if self.done {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(CODEC_BUF);
        loop {
            if out.len() == out.capacity() {
                out.reserve(CODEC_BUF);
            }
            let status = self
                .raw
                .decompress_vec(&[], &mut out, FlushDecompress::Finish)
                .map_err(|e| ZipError::BadFormat(format!("inflate failed: {}", e)))?;
            match status {
                Status::StreamEnd => {
                    self.done = true;
                    return Ok(out);
                }
                Status::Ok => {}
                Status::BufError => {
                    // no further progress possible: the stream was truncated
                    return Err(ZipError::BadFormat(
                        "deflate stream ended unexpectedly".to_string(),
                    ));
                }
            }
        }
    }
}

/// Write path: plaintext → CRC → deflate → encrypt.
struct WriteStage {
    crc: Option<Crc32Acc>,
    deflater: Option<Deflater>,
    encryptor: Option<EntryEncryptor>,
    flushed: bool,
}

impl WriteStage {
    fn new(policy: &CodecPolicy) -> Result<Self> {
        let encryptor = match &policy.password {
            Some(password) => Some(EntryEncryptor::new(password)?),
            None => None,
        };
        let crc = (policy.signed && encryptor.is_none()).then(Crc32Acc::new);
        let deflater = policy.compressed.then(|| Deflater::new(policy.level));
        Ok(Self {
            crc,
            deflater,
            encryptor,
            flushed: false,
        })
    }
}

impl Stage for WriteStage {
    fn append(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        if self.flushed {
            return Err(ZipError::WorkerFailed("stage used after flush".to_string()));
        }
        if let Some(crc) = &mut self.crc {
            crc.append(input);
        }
        let data = match &mut self.deflater {
            Some(deflater) => deflater.append(input)?,
            None => input.to_vec(),
        };
        Ok(match &mut self.encryptor {
            Some(encryptor) => encryptor.encrypt(&data),
            None => data,
        })
    }

    fn flush(&mut self) -> Result<FlushOutput> {
        if self.flushed {
            return Err(ZipError::WorkerFailed("stage used after flush".to_string()));
        }
        self.flushed = true;
        let tail = match &mut self.deflater {
            Some(deflater) => deflater.finish()?,
            None => Vec::new(),
        };
        let bytes = match self.encryptor.take() {
            Some(mut encryptor) => {
                let mut bytes = encryptor.encrypt(&tail);
                bytes.extend_from_slice(&encryptor.finish());
                bytes
            }
            None => tail,
        };
        Ok(FlushOutput {
            bytes,
            signature: self.crc.as_ref().map(Crc32Acc::get),
        })
    }
}

// Absorbs the salt+verify prefix, holds back the 10-byte auth tail, and
// streams the ciphertext in between through the CTR keystream.
struct DecryptFilter {
    password: String,
    header: Vec<u8>,
    pending: Vec<u8>,
    decryptor: Option<EntryDecryptor>,
}

impl DecryptFilter {
    fn new(password: String) -> Self {
        Self {
            password,
            header: Vec::with_capacity(crypto::SALT_LENGTH + crypto::VERIFY_LENGTH),
            pending: Vec::new(),
            decryptor: None,
        }
    }

    fn append(&mut self, mut input: &[u8]) -> Result<Vec<u8>> {
        let header_len = crypto::SALT_LENGTH + crypto::VERIFY_LENGTH;
        if self.header.len() < header_len {
            let need = header_len - self.header.len();
            let take = need.min(input.len());
            self.header.extend_from_slice(&input[..take]);
            input = &input[take..];
            if self.header.len() == header_len {
                let verify = [
                    self.header[crypto::SALT_LENGTH],
                    self.header[crypto::SALT_LENGTH + 1],
                ];
                self.decryptor = Some(EntryDecryptor::new(
                    &self.password,
                    &self.header[..crypto::SALT_LENGTH],
                    &verify,
                )?);
            }
        }
        self.pending.extend_from_slice(input);
        if self.pending.len() <= crypto::AUTH_LENGTH {
            return Ok(Vec::new());
        }
        let ready = self.pending.len() - crypto::AUTH_LENGTH;
        let mut out: Vec<u8> = self.pending.drain(..ready).collect();
        match &mut self.decryptor {
            Some(decryptor) => decryptor.decrypt(&mut out),
            // unreachable while pending is only fed after the header fills
            None => return Err(ZipError::BadFormat("encrypted payload truncated".to_string())),
        }
        Ok(out)
    }

    fn finish(&mut self) -> Result<()> {
        let decryptor = self.decryptor.as_ref().ok_or_else(|| {
            ZipError::BadFormat("encrypted payload shorter than its header".to_string())
        })?;
        if self.pending.len() != crypto::AUTH_LENGTH {
            return Err(ZipError::BadFormat(
                "encrypted payload shorter than its authentication code".to_string(),
            ));
        }
        decryptor.verify_auth(&self.pending)
    }
}

/// Read path: ciphertext → decrypt → inflate → CRC check.
struct ReadStage {
    decrypt: Option<DecryptFilter>,
    inflater: Option<Inflater>,
    crc: Option<Crc32Acc>,
    expected_signature: Option<u32>,
    flushed: bool,
}

impl ReadStage {
    fn new(policy: &CodecPolicy) -> Self {
        let decrypt = policy.password.clone().map(DecryptFilter::new);
        let crc = (policy.signed && decrypt.is_none()).then(Crc32Acc::new);
        Self {
            decrypt,
            inflater: policy.compressed.then(Inflater::new),
            crc,
            expected_signature: policy.expected_signature,
            flushed: false,
        }
    }

    fn produce(&mut self, data: Vec<u8>) -> Result<Vec<u8>> {
        let out = match &mut self.inflater {
            Some(inflater) => inflater.append(&data)?,
            None => data,
        };
        if let Some(crc) = &mut self.crc {
            crc.append(&out);
        }
        Ok(out)
    }
}

impl Stage for ReadStage {
    fn append(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        if self.flushed {
            return Err(ZipError::WorkerFailed("stage used after flush".to_string()));
        }
        let plaintext = match &mut self.decrypt {
            Some(filter) => filter.append(input)?,
            None => input.to_vec(),
        };
        self.produce(plaintext)
    }

    fn flush(&mut self) -> Result<FlushOutput> {
        if self.flushed {
            return Err(ZipError::WorkerFailed("stage used after flush".to_string()));
        }
        self.flushed = true;
        if let Some(filter) = &mut self.decrypt {
            filter.finish()?;
        }
        let tail = match &mut self.inflater {
            Some(inflater) => inflater.finish()?,
            None => Vec::new(),
        };
        if let Some(crc) = &mut self.crc {
            crc.append(&tail);
        }
        let signature = self.crc.as_ref().map(Crc32Acc::get);
        if let (Some(found), Some(expected)) = (signature, self.expected_signature) {
            if found != expected {
                return Err(ZipError::InvalidSignature(format!(
                    "CRC-32 mismatch: expected 0x{:08x}, found 0x{:08x}",
                    expected, found
                )));
            }
        }
        Ok(FlushOutput {
            bytes: tail,
            signature,
        })
    }
}
