//! Layered configuration: built-in defaults, overridden by an optional TOML
//! config file, overridden in turn by CLI flags.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Options recognized at `open`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Trie chunk width, in bytes. Affects index depth vs fanout.
    pub chunk_size: usize,
    /// Width of a document offset as stored in index slots. Always 8.
    pub offset_size: usize,
    /// Bytes of block cache; divided by the block size for cache slots.
    pub buffercache_size: usize,
    /// WAL item count that triggers an automatic flush during `set`/`commit`.
    pub wal_threshold: usize,
    /// Enable the secondary sequence-number index.
    pub seqtree: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            chunk_size: 8,
            offset_size: 8,
            buffercache_size: 1 << 20, // 1 MiB
            wal_threshold: 4096,
            seqtree: false,
        }
    }
}

/// Overrides loadable from a TOML config file. Every field is optional so a
/// partial file only overrides what it names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub chunk_size: Option<usize>,
    pub buffercache_size: Option<usize>,
    pub wal_threshold: Option<usize>,
    pub seqtree: Option<bool>,
}

impl ConfigFile {
    /// # Errors
    /// Returns an error if the file cannot be read or does not parse as TOML.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

impl Config {
    /// Apply a config file's overrides on top of the current values.
    #[must_use]
    pub fn with_file(mut self, file: &ConfigFile) -> Self {
        if let Some(v) = file.chunk_size {
            self.chunk_size = v;
        }
        if let Some(v) = file.buffercache_size {
            self.buffercache_size = v;
        }
        if let Some(v) = file.wal_threshold {
            self.wal_threshold = v;
        }
        if let Some(v) = file.seqtree {
            self.seqtree = v;
        }
        self
    }
}
