//! Process-wide tunables for readers, writers and the worker pool
//!
//! The configuration is initialised with defaults on first use and mutated
//! only through [`configure`], which performs a shallow merge of the given
//! patch. Readers and writers snapshot the configuration at construction;
//! later `configure` calls do not affect operations already in flight.

use std::sync::{Mutex, OnceLock};

use crate::error::{Result, ZipError};

/// Smallest read window the data mover will use, regardless of `chunk_size`.
pub const MIN_CHUNK_SIZE: usize = 64;

const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Snapshot of the process-wide tunables.
#[derive(Debug, Clone)]
pub struct ZipConfig {
    /// Read window used by the chunked data mover (effective minimum 64 B)
    pub chunk_size: usize,
    /// Ceiling on concurrently alive codec workers
    pub max_workers: usize,
    /// Master switch for dispatching codec stages to the worker pool
    pub use_workers: bool,
}

impl Default for ZipConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_workers: default_max_workers(),
            use_workers: true,
        }
    }
}

impl ZipConfig {
    /// Clone the current process-wide configuration.
    pub fn snapshot() -> Self {
        global().lock().unwrap().clone()
    }

    /// Effective read window after applying the minimum.
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.max(MIN_CHUNK_SIZE)
    }
}

/// Partial configuration, shallow-merged over the current values.
#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
    pub chunk_size: Option<usize>,
    pub max_workers: Option<usize>,
    pub use_workers: Option<bool>,
}

/// Shallow-merge `patch` into the process-wide configuration.
///
/// Fails with [`ZipError::ConfigurationError`] when the merged result asks
/// for worker dispatch with a zero-sized pool.
pub fn configure(patch: ConfigPatch) -> Result<()> {
    let mut config = global().lock().unwrap();
    let mut merged = config.clone();
    if let Some(chunk_size) = patch.chunk_size {
        merged.chunk_size = chunk_size;
    }
    if let Some(max_workers) = patch.max_workers {
        merged.max_workers = max_workers;
    }
    if let Some(use_workers) = patch.use_workers {
        merged.use_workers = use_workers;
    }
    if merged.use_workers && merged.max_workers == 0 {
        return Err(ZipError::ConfigurationError(
            "use_workers requires max_workers > 0".to_string(),
        ));
    }
    *config = merged;
    Ok(())
}

fn default_max_workers() -> usize {
    match num_cpus::get() {
        0 => 2,
        n => n,
    }
}

fn global() -> &'static Mutex<ZipConfig> {
    static CONFIG: OnceLock<Mutex<ZipConfig>> = OnceLock::new();
    CONFIG.get_or_init(|| Mutex::new(ZipConfig::default()))
}
