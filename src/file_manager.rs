//! Block-addressed paged access to a single file, with a buffer cache and a
//! crash-safe superblock region.
//!
//! Document records and B-tree nodes share one monotonically growing byte
//! space: block allocation rounds the shared cursor up to a block boundary
//! and claims one block there, while the document log appends raw bytes at
//! whatever offset the cursor currently sits at. Because the cursor only
//! ever moves forward, a superblock appended at commit time can never be
//! straddled by a later write — later writes start strictly after it.

use crate::block::{Bid, Block, BlockType, BLOCK_SIZE, NOT_FOUND};
use crate::error::{Result, StoreError};
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SUPERBLOCK_MAGIC: u32 = 0x4642_4442; // "FBDB"

struct CacheEntry {
    block: Block,
    dirty: bool,
}

struct Inner {
    file: File,
    cache: LruCache<Bid, CacheEntry>,
    ncacheblock: usize,
    /// End of all data ever written (blocks and raw document bytes). The
    /// next allocation or append starts here.
    next_offset: u64,
    /// Opaque header bytes queued by `update_header`, written at the next
    /// `commit`.
    pending_header: Option<Vec<u8>>,
    generation: u64,
}

/// Paged, cached access to a single backing file. Cheap to clone: internally
/// `Arc<Mutex<..>>`, so handles onto the same file share one cache, matching
/// the single-writer/shared-cache concurrency model.
#[derive(Clone)]
pub struct FileManager {
    inner: Arc<Mutex<Inner>>,
    path: PathBuf,
}

impl FileManager {
    /// # Errors
    /// Returns `IO_ERROR` if the file cannot be opened.
    pub fn open(path: &Path, buffercache_size: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let ncacheblock = (buffercache_size / BLOCK_SIZE).max(1);
        let file_len = file.metadata()?.len();

        let mut inner = Inner {
            file,
            cache: LruCache::new(NonZeroUsize::new(ncacheblock).unwrap()),
            ncacheblock,
            next_offset: file_len,
            pending_header: None,
            generation: 0,
        };

        if let Some((generation, _)) = inner.read_last_superblock()? {
            inner.generation = generation;
        }

        Ok(FileManager { inner: Arc::new(Mutex::new(inner)), path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocates a fresh block id, rounding the shared cursor up to a block
    /// boundary first.
    pub fn alloc_block(&self) -> Bid {
        let mut inner = self.inner.lock();
        let rem = inner.next_offset % BLOCK_SIZE as u64;
        if rem != 0 {
            inner.next_offset += BLOCK_SIZE as u64 - rem;
        }
        let bid = inner.next_offset / BLOCK_SIZE as u64;
        inner.next_offset += BLOCK_SIZE as u64;
        bid
    }

    /// Reads a block, returning the dirty in-cache copy if present.
    ///
    /// # Errors
    /// Returns `IO_ERROR` on underlying read failure.
    pub fn read_block(&self, bid: Bid) -> Result<Block> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.cache.get(&bid) {
            return Ok(entry.block.clone());
        }
        let offset = bid * BLOCK_SIZE as u64;
        let file_len = inner.file.metadata()?.len();
        let block = if offset + BLOCK_SIZE as u64 > file_len {
            Block::zeroed()
        } else {
            let mut buf = vec![0u8; BLOCK_SIZE];
            inner.file.seek(SeekFrom::Start(offset))?;
            inner.file.read_exact(&mut buf)?;
            Block::from_bytes(buf)
        };
        inner.insert_cache(bid, CacheEntry { block: block.clone(), dirty: false })?;
        Ok(block)
    }

    /// Marks a block dirty in the cache. Not visible on disk until `commit`.
    ///
    /// # Errors
    /// Returns `IO_ERROR` if an eviction triggered by this write fails to
    /// flush a dirty neighbor.
    pub fn write_block(&self, bid: Bid, block: Block) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.insert_cache(bid, CacheEntry { block, dirty: true })
    }

    /// Supplies opaque header bytes to be written at the next `commit`.
    pub fn update_header(&self, header: Vec<u8>) {
        self.inner.lock().pending_header = Some(header);
    }

    /// Appends raw bytes (a document record) at the current end of data and
    /// returns the starting offset.
    ///
    /// # Errors
    /// Returns `IO_ERROR` on underlying write failure.
    pub fn append_raw(&self, bytes: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock();
        let offset = inner.next_offset;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(bytes)?;
        inner.next_offset += bytes.len() as u64;
        Ok(offset)
    }

    /// Reads raw bytes written by `append_raw`.
    ///
    /// # Errors
    /// Returns `IO_ERROR` on underlying read failure.
    pub fn read_raw(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        let mut buf = vec![0u8; len];
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Flushes all dirty blocks, then appends a new superblock generation
    /// carrying the pending header, and fsyncs. Either the new superblock is
    /// present and valid on the next open, or this call returned an error
    /// and it is not.
    ///
    /// # Errors
    /// Returns `IO_ERROR` on underlying write or sync failure.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        let dirty_bids: Vec<Bid> = inner
            .cache
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(bid, _)| *bid)
            .collect();
        for bid in dirty_bids {
            let bytes = inner.cache.peek(&bid).unwrap().block.as_bytes().to_vec();
            let offset = bid * BLOCK_SIZE as u64;
            inner.file.seek(SeekFrom::Start(offset))?;
            inner.file.write_all(&bytes)?;
            if let Some(e) = inner.cache.get_mut(&bid) {
                e.dirty = false;
            }
        }

        let header = inner.pending_header.clone().unwrap_or_default();
        let generation = inner.generation + 1;
        let record = encode_superblock(generation, &header);
        let offset = inner.next_offset;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&record)?;
        inner.next_offset += record.len() as u64;
        inner.file.sync_all()?;
        inner.generation = generation;

        Ok(())
    }

    /// Scans backward from the end of the file for the most recent valid
    /// superblock and returns its payload, or `None` if the store is empty.
    ///
    /// # Errors
    /// Returns `IO_ERROR` on underlying read failure.
    pub fn recover_header(&self) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        Ok(inner.read_last_superblock()?.map(|(_, payload)| payload))
    }
}

impl Inner {
    fn insert_cache(&mut self, bid: Bid, entry: CacheEntry) -> Result<()> {
        if let Some(old) = self.cache.push(bid, entry) {
            // `push` evicts the LRU tail when at capacity and the key is new;
            // write back if what got evicted was dirty and isn't the key we
            // just inserted.
            if old.0 != bid && old.1.dirty {
                self.flush_one(old.0, &old.1.block)?;
            }
        }
        while self.cache.len() > self.ncacheblock {
            if let Some((evicted_bid, evicted)) = self.cache.pop_lru() {
                if evicted.dirty {
                    self.flush_one(evicted_bid, &evicted.block)?;
                }
            } else {
                break;
            }
        }
        Ok(())
    }

    fn flush_one(&mut self, bid: Bid, block: &Block) -> Result<()> {
        let offset = bid * BLOCK_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(block.as_bytes())?;
        Ok(())
    }

    /// Returns `(generation, payload)` for the most recent valid superblock
    /// at the tail of the file, if any. An invalid or absent trailer means an
    /// empty store, not an error.
    fn read_last_superblock(&self) -> Result<Option<(u64, Vec<u8>)>> {
        let file_len = self.file.metadata()?.len();
        if file_len < 8 {
            return Ok(None);
        }
        let mut file = self.file.try_clone()?;
        let mut trailer = [0u8; 8];
        file.seek(SeekFrom::Start(file_len - 8))?;
        file.read_exact(&mut trailer)?;
        let record_len = u64::from_le_bytes(trailer);
        if record_len == 0 || record_len > file_len {
            return Ok(None);
        }
        let start = file_len - record_len;
        let mut record = vec![0u8; record_len as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut record)?;
        Ok(decode_superblock(&record).ok())
    }
}

fn encode_superblock(generation: u64, header: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 8 + 4 + header.len() + 8);
    buf.extend_from_slice(&SUPERBLOCK_MAGIC.to_le_bytes());
    buf.extend_from_slice(&generation.to_le_bytes());
    buf.extend_from_slice(&(header.len() as u32).to_le_bytes());
    buf.extend_from_slice(header);
    let total_len = buf.len() as u64 + 8;
    buf.extend_from_slice(&total_len.to_le_bytes());
    buf
}


fn decode_superblock(record: &[u8]) -> Result<(u64, Vec<u8>)> {
    if record.len() < 4 + 8 + 4 + 8 {
        return Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "superblock record too short",
        )));
    }
    let magic = u32::from_le_bytes(record[0..4].try_into().unwrap());
    if magic != SUPERBLOCK_MAGIC {
        return Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad superblock magic",
        )));
    }
    let generation = u64::from_le_bytes(record[4..12].try_into().unwrap());
    let header_len = u32::from_le_bytes(record[12..16].try_into().unwrap()) as usize;
    let header_start = 16;
    let header_end = header_start + header_len;
    if header_end + 8 != record.len() {
        return Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "superblock length mismatch",
        )));
    }
    Ok((generation, record[header_start..header_end].to_vec()))
}
