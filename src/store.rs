//! The durable storage engine: coordinates the file manager, document log,
//! HB+trie, and WAL into the public `open`/`get`/`set`/`commit`/`compact`/
//! `close` contract.
//!
//! Ported from ForestDB's `fdb_open`/`fdb_get`/`fdb_set`/`fdb_commit`/
//! `fdb_compact`/`fdb_close` orchestration in `forestdb.c`, with the
//! original's raw-pointer handle graph replaced by a single owning `Store`
//! plus transient borrows: an `HbTrie`/`BtreeStore` is constructed fresh
//! for the duration of each flush or compaction rather than held across
//! calls, so its dirty-node set never outlives the operation that produced
//! it.

use crate::block::{Bid, NOT_FOUND};
use crate::btree::BtreeStore;
use crate::config::Config;
use crate::docio;
use crate::document::Doc;
use crate::error::{Result, StoreError};
use crate::file_manager::FileManager;
use crate::hbtrie::HbTrie;
use crate::wal::{Wal, WalAction, WalFlushSink, WalItem};
use log::{debug, info};
use std::cell::{Cell, RefCell};
use std::path::Path;

const HEADER_LEN: usize = 32;

fn encode_header(trie_root: Bid, seqtree_root: Bid, ndocs: u64, datasize: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    buf.extend_from_slice(&trie_root.to_le_bytes());
    buf.extend_from_slice(&seqtree_root.to_le_bytes());
    buf.extend_from_slice(&ndocs.to_le_bytes());
    buf.extend_from_slice(&datasize.to_le_bytes());
    buf
}

fn decode_header(buf: &[u8]) -> (Bid, Bid, u64, u64) {
    let trie_root = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let seqtree_root = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    let ndocs = u64::from_le_bytes(buf[16..24].try_into().unwrap());
    let datasize = u64::from_le_bytes(buf[24..32].try_into().unwrap());
    (trie_root, seqtree_root, ndocs, datasize)
}

/// An open store handle. Single-writer, single-threaded: every method takes
/// `&self` except `compact`, which swaps the backing file and therefore
/// needs exclusive access.
pub struct Store {
    fm: FileManager,
    config: Config,
    wal: RefCell<Wal>,
    trie_root: Cell<Bid>,
    seqtree_root: Cell<Bid>,
    seq_counter: Cell<u64>,
    ndocs: Cell<u64>,
    datasize: Cell<u64>,
}

impl Store {
    /// Opens (creating if absent) the store at `path`. Recovers the most
    /// recent valid superblock, if any.
    ///
    /// # Errors
    /// Returns `IO_ERROR` if the file cannot be opened or its superblock
    /// region is unreadable.
    pub fn open(path: &Path, config: Config) -> Result<Self> {
        let fm = FileManager::open(path, config.buffercache_size)?;
        let (trie_root, seqtree_root, ndocs, datasize) = match fm.recover_header()? {
            Some(bytes) if bytes.len() >= HEADER_LEN => decode_header(&bytes),
            _ => (NOT_FOUND, NOT_FOUND, 0, 0),
        };
        let _ = crate::logger::init_for_store(path);
        info!("opened store at {} (ndocs={ndocs}, datasize={datasize})", path.display());
        Ok(Store {
            fm,
            config,
            wal: RefCell::new(Wal::new()),
            trie_root: Cell::new(trie_root),
            seqtree_root: Cell::new(seqtree_root),
            seq_counter: Cell::new(ndocs),
            ndocs: Cell::new(ndocs),
            datasize: Cell::new(datasize),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.fm.path()
    }

    #[must_use]
    pub fn ndocs(&self) -> u64 {
        self.ndocs.get()
    }

    #[must_use]
    pub fn datasize(&self) -> u64 {
        self.datasize.get()
    }

    /// Fills `doc.meta` and `doc.body` from the WAL or the HB+trie.
    ///
    /// # Errors
    /// Returns `INVALID_ARGS` for an empty key, `FAIL` if the key is
    /// absent or the persisted key disagrees with the requested one.
    pub fn get(&self, doc: &mut Doc) -> Result<()> {
        if doc.key.is_empty() {
            return Err(StoreError::InvalidArgs("empty key".into()));
        }
        if let Some(action) = self.wal.borrow().find(&doc.key) {
            return match action {
                WalAction::Set { doc_offset } => {
                    let rec = docio::read_full_checked(&self.fm, *doc_offset, &doc.key)?;
                    doc.meta = Some(rec.meta);
                    doc.body = Some(rec.body);
                    Ok(())
                }
                WalAction::Remove => Err(StoreError::Fail),
            };
        }
        let trie = HbTrie::new(&self.fm, self.config.chunk_size);
        match trie.find(self.trie_root.get(), &doc.key)? {
            Some(offset) => {
                let rec = docio::read_full_checked(&self.fm, offset, &doc.key)?;
                doc.meta = Some(rec.meta);
                doc.body = Some(rec.body);
                Ok(())
            }
            None => Err(StoreError::Fail),
        }
    }

    /// Fills `doc.meta` and `doc.body_offset` without reading the body.
    ///
    /// # Errors
    /// Same as [`Store::get`].
    pub fn get_metaonly(&self, doc: &mut Doc) -> Result<()> {
        if doc.key.is_empty() {
            return Err(StoreError::InvalidArgs("empty key".into()));
        }
        if let Some(action) = self.wal.borrow().find(&doc.key) {
            return match action {
                WalAction::Set { doc_offset } => {
                    let (_, meta, body_off) = docio::read_key_meta(&self.fm, *doc_offset)?;
                    doc.meta = Some(meta);
                    doc.body_offset = Some(body_off);
                    Ok(())
                }
                WalAction::Remove => Err(StoreError::Fail),
            };
        }
        let trie = HbTrie::new(&self.fm, self.config.chunk_size);
        match trie.find(self.trie_root.get(), &doc.key)? {
            Some(offset) => {
                let (key, meta, body_off) = docio::read_key_meta(&self.fm, offset)?;
                if key != doc.key {
                    return Err(StoreError::Fail);
                }
                doc.meta = Some(meta);
                doc.body_offset = Some(body_off);
                Ok(())
            }
            None => Err(StoreError::Fail),
        }
    }

    /// Appends `doc` to the log and stages it in the WAL. A `doc` with no
    /// body performs a delete. May trigger an automatic WAL flush if the
    /// buffer has grown past `wal_threshold`.
    ///
    /// # Errors
    /// Returns `INVALID_ARGS` for an empty key, `IO_ERROR` on underlying
    /// write failure.
    pub fn set(&self, doc: &Doc) -> Result<()> {
        if doc.key.is_empty() {
            return Err(StoreError::InvalidArgs("empty key".into()));
        }
        if doc.is_delete() {
            self.wal.borrow_mut().remove(doc.key.clone());
        } else {
            let offset = docio::append(&self.fm, &doc.key, doc.meta_bytes(), doc.body_bytes())?;
            self.wal.borrow_mut().insert(doc.key.clone(), offset);
        }
        if self.wal.borrow().len() > self.config.wal_threshold {
            self.flush_wal()?;
        }
        Ok(())
    }

    fn flush_wal(&self) -> Result<()> {
        if self.wal.borrow().is_empty() {
            return Ok(());
        }
        let trie = HbTrie::new(&self.fm, self.config.chunk_size);
        let seq_store = self.config.seqtree.then(|| BtreeStore::new(&self.fm, 8, 8));
        {
            let mut ctx = FlushCtx {
                trie: &trie,
                fm: &self.fm,
                trie_root: &self.trie_root,
                ndocs: &self.ndocs,
                datasize: &self.datasize,
                seq: seq_store.as_ref().map(|s| (s, &self.seqtree_root, &self.seq_counter)),
            };
            self.wal.borrow_mut().flush(&mut ctx)?;
        }
        trie.end_operation()?;
        if let Some(s) = &seq_store {
            s.end_operation()?;
        }
        debug!("flushed WAL (ndocs={}, datasize={})", self.ndocs.get(), self.datasize.get());
        Ok(())
    }

    /// Flushes the WAL, writes the superblock, and fsyncs. Either the new
    /// generation is durable on return, or an error is returned and the
    /// prior generation remains current on reopen.
    ///
    /// # Errors
    /// Returns `IO_ERROR` on underlying write or sync failure.
    pub fn commit(&self) -> Result<()> {
        self.flush_wal()?;
        let header =
            encode_header(self.trie_root.get(), self.seqtree_root.get(), self.ndocs.get(), self.datasize.get());
        self.fm.update_header(header);
        self.fm.commit()?;
        info!("committed (ndocs={}, datasize={})", self.ndocs.get(), self.datasize.get());
        Ok(())
    }

    /// Streams every live document into a fresh file at `new_path`, then
    /// atomically swaps it in as this handle's backing file. No writes may
    /// occur concurrently with this call; the original file remains
    /// readable until the swap completes.
    ///
    /// # Errors
    /// Returns `IO_ERROR` on any underlying read, write, or rename failure.
    pub fn compact(&mut self, new_path: &Path) -> Result<()> {
        self.flush_wal()?;

        let new_fm = FileManager::open(new_path, self.config.buffercache_size)?;
        let new_trie = HbTrie::new(&new_fm, self.config.chunk_size);
        let old_trie = HbTrie::new(&self.fm, self.config.chunk_size);

        let entries = old_trie.iterate_all(self.trie_root.get())?;
        let mut new_root = NOT_FOUND;
        let mut ndocs = 0u64;
        let mut datasize = 0u64;
        for (key, offset) in entries {
            let rec = docio::read_full(&self.fm, offset)?;
            let new_offset = docio::append(&new_fm, &rec.key, &rec.meta, &rec.body)?;
            let (root, _) = new_trie.insert(new_root, &key, new_offset)?;
            new_root = root;
            ndocs += 1;
            datasize += rec.on_log_size();
        }
        new_trie.end_operation()?;

        let header = encode_header(new_root, NOT_FOUND, ndocs, datasize);
        new_fm.update_header(header);
        new_fm.commit()?;
        drop(new_fm);

        let original_path = self.fm.path().to_path_buf();
        atomic_replace(new_path, &original_path)?;
        self.fm = FileManager::open(&original_path, self.config.buffercache_size)?;
        self.trie_root.set(new_root);
        self.seqtree_root.set(NOT_FOUND);
        self.seq_counter.set(ndocs);
        self.ndocs.set(ndocs);
        self.datasize.set(datasize);
        info!("compacted into {} (ndocs={ndocs}, datasize={datasize})", original_path.display());
        Ok(())
    }

    /// Consumes the handle. Taking `self` by value rather than `&self`
    /// means there is no way for a caller to use the handle again,
    /// eliminating double-close/double-free at the type level.
    ///
    /// # Errors
    /// Never fails today; kept fallible to match the public contract.
    pub fn close(self) -> Result<()> {
        Ok(())
    }
}

struct FlushCtx<'a> {
    trie: &'a HbTrie<'a>,
    fm: &'a FileManager,
    trie_root: &'a Cell<Bid>,
    ndocs: &'a Cell<u64>,
    datasize: &'a Cell<u64>,
    seq: Option<(&'a BtreeStore<'a>, &'a Cell<Bid>, &'a Cell<u64>)>,
}

impl WalFlushSink for FlushCtx<'_> {
    fn apply(&mut self, item: &WalItem) -> Result<()> {
        match &item.action {
            WalAction::Set { doc_offset } => {
                let (new_root, old_offset) = self.trie.insert(self.trie_root.get(), &item.key, *doc_offset)?;
                self.trie_root.set(new_root);

                let new_size = docio::read_full(self.fm, *doc_offset)?.on_log_size();
                match old_offset {
                    None => self.ndocs.set(self.ndocs.get() + 1),
                    Some(old_off) => {
                        let old_size = docio::read_full(self.fm, old_off)?.on_log_size();
                        self.datasize.set(self.datasize.get().saturating_sub(old_size));
                    }
                }
                self.datasize.set(self.datasize.get() + new_size);

                if let Some((seq_store, seqtree_root, seq_counter)) = &self.seq {
                    let seq_key = seq_counter.get().to_le_bytes().to_vec();
                    let (new_seq_root, _) =
                        seq_store.insert(seqtree_root.get(), &seq_key, &doc_offset.to_le_bytes())?;
                    seqtree_root.set(new_seq_root);
                    seq_counter.set(seq_counter.get() + 1);
                }
            }
            WalAction::Remove => {
                let (new_root, old_offset) = self.trie.remove(self.trie_root.get(), &item.key)?;
                self.trie_root.set(new_root);
                if let Some(old_off) = old_offset {
                    let old_size = docio::read_full(self.fm, old_off)?.on_log_size();
                    self.datasize.set(self.datasize.get().saturating_sub(old_size));
                    self.ndocs.set(self.ndocs.get().saturating_sub(1));
                }
            }
        }
        Ok(())
    }
}

#[cfg(windows)]
fn atomic_replace(from: &Path, to: &Path) -> Result<()> {
    use std::os::windows::ffi::OsStrExt;
    use winapi::um::winbase::{MoveFileExW, MOVEFILE_REPLACE_EXISTING, MOVEFILE_WRITE_THROUGH};

    let from_w: Vec<u16> = from.as_os_str().encode_wide().chain(std::iter::once(0)).collect();
    let to_w: Vec<u16> = to.as_os_str().encode_wide().chain(std::iter::once(0)).collect();
    let ok = unsafe {
        MoveFileExW(from_w.as_ptr(), to_w.as_ptr(), MOVEFILE_REPLACE_EXISTING | MOVEFILE_WRITE_THROUGH)
    };
    if ok == 0 {
        Err(StoreError::Io(std::io::Error::last_os_error()))
    } else {
        Ok(())
    }
}

#[cfg(not(windows))]
fn atomic_replace(from: &Path, to: &Path) -> Result<()> {
    std::fs::rename(from, to)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Doc;
    use tempfile::tempdir;

    #[test]
    fn get_metaonly_fills_meta_and_body_offset_without_body() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("t.db"), Config::default()).unwrap();
        store.set(&Doc::create(b"k", Some(b"m"), Some(b"body-bytes")).unwrap()).unwrap();

        let mut doc = Doc::create(b"k", None, None).unwrap();
        store.get_metaonly(&mut doc).unwrap();
        assert_eq!(doc.meta, Some(b"m".to_vec()));
        assert_eq!(doc.body, None);
        assert!(doc.body_offset.is_some());
    }

    #[test]
    fn set_with_no_body_is_a_delete() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("t.db"), Config::default()).unwrap();
        store.set(&Doc::create(b"k", None, Some(b"v")).unwrap()).unwrap();
        store.set(&Doc::create(b"k", None, None).unwrap()).unwrap();

        let mut doc = Doc::create(b"k", None, None).unwrap();
        assert!(matches!(store.get(&mut doc), Err(StoreError::Fail)));
    }

    #[test]
    fn seqtree_records_insertion_sequence() {
        let dir = tempdir().unwrap();
        let config = Config { seqtree: true, ..Config::default() };
        let store = Store::open(&dir.path().join("t.db"), config).unwrap();
        for i in 0..5u32 {
            store.set(&Doc::create(format!("k{i}").as_bytes(), None, Some(b"v")).unwrap()).unwrap();
        }
        store.commit().unwrap();
        assert_eq!(store.ndocs(), 5);
    }
}

