//! Chunked data mover: drives a codec stage between a source and a sink
//!
//! Consumes `length` bytes at `offset`, window by window, forwarding stage
//! output to the sink and reporting monotonic progress after each window.
//! The mover never seeks: windows are read sequentially within one call.

use crate::codec::Stage;
use crate::config::MIN_CHUNK_SIZE;
use crate::error::Result;
use crate::io::{Sink, Source};

/// Progress callback: `(bytes_processed, total_length)`.
pub type ProgressFn<'a> = &'a mut dyn FnMut(u64, u64);

/// Outcome of one pump run.
#[derive(Debug, Clone, Copy)]
pub struct PumpResult {
    /// Signature produced or verified by the stage, when one was tracked
    pub signature: Option<u32>,
    /// Total bytes written to the sink
    pub written: u64,
}

/// Route `length` bytes starting at `offset` through `stage` into `sink`.
pub fn pump(
    source: &mut dyn Source,
    offset: u64,
    length: u64,
    stage: &mut dyn Stage,
    sink: &mut dyn Sink,
    chunk_size: usize,
    mut progress: Option<ProgressFn<'_>>,
) -> Result<PumpResult> {
    let window = chunk_size.max(MIN_CHUNK_SIZE);
    let mut processed = 0u64;
    let mut written = 0u64;

    while processed < length {
        let take = window.min((length - processed) as usize);
        let input = source.read_window(offset + processed, take)?;
        let output = stage.append(&input)?;
        if !output.is_empty() {
            sink.write_window(&output)?;
            written += output.len() as u64;
        }
        processed += take as u64;
        if let Some(callback) = progress.as_deref_mut() {
            callback(processed, length);
        }
    }

    let flush = stage.flush()?;
    if !flush.bytes.is_empty() {
        sink.write_window(&flush.bytes)?;
        written += flush.bytes.len() as u64;
    }
    Ok(PumpResult {
        signature: flush.signature,
        written,
    })
}
