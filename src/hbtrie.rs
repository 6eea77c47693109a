//! Hierarchical B+trie: a trie whose levels are each a block-indexed B-tree
//! keyed on fixed-width chunks of the user key.
//!
//! Each level's B-tree maps a chunk of bytes to a [`Slot`]: either a pointer
//! straight into the document log, or the root of a deeper level's B-tree
//! covering the next chunk. A chunk is normally `chunk_size` bytes, but the
//! final chunk of a key is whatever is left over, down to zero bytes. Rust's
//! `Vec<u8>` ordering gives a shorter final chunk a well-defined place among
//! its siblings for free, so no reserved terminator value is needed: two
//! keys that agree on every full chunk but differ in length simply diverge
//! at the chunk where one of them runs out of bytes.
//!
//! Ported from ForestDB's `hbtrie.c`, simplified accordingly: the slot tag
//! there distinguishes a direct value / doc pointer / sub-trie pointer;
//! here a bare value never occurs (this engine always pages through the
//! document log), so [`Slot`] only needs two cases.

use crate::block::{Bid, NOT_FOUND};
use crate::btree::{BtreeStore, InsertResult};
use crate::error::Result;
use crate::file_manager::FileManager;

const SLOT_DOC: u8 = 0;
const SLOT_SUBTRIE: u8 = 1;
const SLOT_ENCODED_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Doc(u64),
    SubTrie(Bid),
}

impl Slot {
    fn encode(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SLOT_ENCODED_LEN);
        match self {
            Slot::Doc(off) => {
                buf.push(SLOT_DOC);
                buf.extend_from_slice(&off.to_le_bytes());
            }
            Slot::SubTrie(bid) => {
                buf.push(SLOT_SUBTRIE);
                buf.extend_from_slice(&bid.to_le_bytes());
            }
        }
        buf
    }

    fn decode(buf: &[u8]) -> Self {
        let n = u64::from_le_bytes(buf[1..9].try_into().unwrap());
        if buf[0] == SLOT_DOC {
            Slot::Doc(n)
        } else {
            Slot::SubTrie(n)
        }
    }
}

/// Splits `key` into `chunk_size`-wide chunks, the last possibly shorter.
fn chunks(key: &[u8], chunk_size: usize) -> Vec<&[u8]> {
    if key.is_empty() {
        return vec![&[]];
    }
    key.chunks(chunk_size).collect()
}

pub struct HbTrie<'a> {
    store: BtreeStore<'a>,
    chunk_size: usize,
}

impl<'a> HbTrie<'a> {
    #[must_use]
    pub fn new(fm: &'a FileManager, chunk_size: usize) -> Self {
        HbTrie { store: BtreeStore::new(fm, chunk_size, SLOT_ENCODED_LEN), chunk_size }
    }

    /// Flushes every node touched by calls made through this handle.
    ///
    /// # Errors
    /// Returns `IO_ERROR` if a staged node fails to write.
    pub fn end_operation(&self) -> Result<()> {
        self.store.end_operation()
    }

    /// Looks up `key`, returning its document-log offset if present.
    ///
    /// # Errors
    /// Returns `IO_ERROR` on underlying read failure.
    pub fn find(&self, root: Bid, key: &[u8]) -> Result<Option<u64>> {
        self.find_rec(root, &chunks(key, self.chunk_size))
    }

    fn find_rec(&self, root: Bid, remaining: &[&[u8]]) -> Result<Option<u64>> {
        if root == NOT_FOUND {
            return Ok(None);
        }
        let Some(slot_bytes) = self.store.find(root, remaining[0])? else {
            return Ok(None);
        };
        match Slot::decode(&slot_bytes) {
            Slot::Doc(off) => {
                if remaining.len() == 1 {
                    Ok(Some(off))
                } else {
                    Ok(None)
                }
            }
            Slot::SubTrie(child_root) => {
                if remaining.len() == 1 {
                    // A shorter key was demoted under this sub-trie's empty
                    // chunk when a longer key collided with it; follow it.
                    self.find_rec(child_root, &[&[]])
                } else {
                    self.find_rec(child_root, &remaining[1..])
                }
            }
        }
    }

    /// Inserts or updates `key` to point at `doc_offset`, returning the new
    /// trie root and the document-log offset it replaced, if any.
    ///
    /// # Errors
    /// Returns `IO_ERROR` if a node allocation or write fails.
    pub fn insert(&self, root: Bid, key: &[u8], doc_offset: u64) -> Result<(Bid, Option<u64>)> {
        self.insert_rec(root, &chunks(key, self.chunk_size), doc_offset)
    }

    fn insert_rec(&self, root: Bid, remaining: &[&[u8]], doc_offset: u64) -> Result<(Bid, Option<u64>)> {
        let chunk = remaining[0];
        let is_last = remaining.len() == 1;

        if root == NOT_FOUND {
            return if is_last {
                let new_root = self.store.insert(NOT_FOUND, chunk, &Slot::Doc(doc_offset).encode())?.0;
                Ok((new_root, None))
            } else {
                let child_root = self.insert_rec(NOT_FOUND, &remaining[1..], doc_offset)?.0;
                let new_root =
                    self.store.insert(NOT_FOUND, chunk, &Slot::SubTrie(child_root).encode())?.0;
                Ok((new_root, None))
            };
        }

        match self.store.find(root, chunk)? {
            None => {
                let slot = if is_last {
                    Slot::Doc(doc_offset)
                } else {
                    let child_root = self.insert_rec(NOT_FOUND, &remaining[1..], doc_offset)?.0;
                    Slot::SubTrie(child_root)
                };
                let (new_root, _) = self.store.insert(root, chunk, &slot.encode())?;
                Ok((new_root, None))
            }
            Some(existing) => match (Slot::decode(&existing), is_last) {
                (Slot::Doc(old_off), true) => {
                    let (new_root, res) = self.store.insert(root, chunk, &Slot::Doc(doc_offset).encode())?;
                    debug_assert!(matches!(res, InsertResult::Updated(_)));
                    Ok((new_root, Some(old_off)))
                }
                (Slot::SubTrie(child_root), false) => {
                    let (new_child, old_off) = self.insert_rec(child_root, &remaining[1..], doc_offset)?;
                    let (new_root, _) = self.store.insert(root, chunk, &Slot::SubTrie(new_child).encode())?;
                    Ok((new_root, old_off))
                }
                (Slot::Doc(old_off), false) => {
                    // A shorter existing key shares this chunk exactly with a
                    // longer new one: demote the existing doc pointer one
                    // level down under the empty chunk, which always sorts
                    // first among that level's siblings.
                    let child_root = self.insert_rec(NOT_FOUND, &[&[]], old_off)?.0;
                    let (child_root, _) =
                        self.insert_rec(child_root, &remaining[1..], doc_offset)?;
                    let (new_root, _) =
                        self.store.insert(root, chunk, &Slot::SubTrie(child_root).encode())?;
                    Ok((new_root, None))
                }
                (Slot::SubTrie(child_root), true) => {
                    // The new key is the shorter one: descend and insert it
                    // under the empty chunk of the existing sub-trie.
                    let (new_child, old_off) = self.insert_rec(child_root, &[&[]], doc_offset)?;
                    let (new_root, _) =
                        self.store.insert(root, chunk, &Slot::SubTrie(new_child).encode())?;
                    Ok((new_root, old_off))
                }
            },
        }
    }

    /// Removes `key`, returning the document-log offset it pointed to, if
    /// any. Sub-tries left empty by a removal are not collapsed back into
    /// their parent; they simply sit as a one-entry level until reused.
    ///
    /// # Errors
    /// Returns `IO_ERROR` on underlying read or write failure.
    pub fn remove(&self, root: Bid, key: &[u8]) -> Result<(Bid, Option<u64>)> {
        self.remove_rec(root, &chunks(key, self.chunk_size))
    }

    fn remove_rec(&self, root: Bid, remaining: &[&[u8]]) -> Result<(Bid, Option<u64>)> {
        if root == NOT_FOUND {
            return Ok((root, None));
        }
        let chunk = remaining[0];
        let Some(existing) = self.store.find(root, chunk)? else {
            return Ok((root, None));
        };
        match (Slot::decode(&existing), remaining.len() == 1) {
            (Slot::Doc(old_off), true) => {
                self.store.remove(root, chunk)?;
                Ok((root, Some(old_off)))
            }
            (Slot::SubTrie(child_root), false) => {
                let (_, old_off) = self.remove_rec(child_root, &remaining[1..])?;
                Ok((root, old_off))
            }
            (Slot::SubTrie(child_root), true) => {
                let (_, old_off) = self.remove_rec(child_root, &[&[]])?;
                Ok((root, old_off))
            }
            _ => Ok((root, None)),
        }
    }

    /// Pre-order traversal over the chunk trees, yielding `(key, offset)`
    /// pairs in strict ascending key-lexicographic order.
    ///
    /// # Errors
    /// Returns `IO_ERROR` on underlying read failure.
    pub fn iterate_all(&self, root: Bid) -> Result<Vec<(Vec<u8>, u64)>> {
        let mut out = Vec::new();
        if root != NOT_FOUND {
            self.iterate_rec(root, &[], &mut out)?;
        }
        Ok(out)
    }

    fn iterate_rec(&self, root: Bid, prefix: &[u8], out: &mut Vec<(Vec<u8>, u64)>) -> Result<()> {
        for (chunk, slot_bytes) in self.store.iterate(root, None)? {
            let mut full = prefix.to_vec();
            full.extend_from_slice(&chunk);
            match Slot::decode(&slot_bytes) {
                Slot::Doc(off) => out.push((full, off)),
                Slot::SubTrie(child) => self.iterate_rec(child, &full, out)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_manager::FileManager;
    use tempfile::tempdir;

    fn fm() -> FileManager {
        let dir = tempdir().unwrap();
        FileManager::open(&dir.path().join("t.db"), 1 << 16).unwrap()
    }

    #[test]
    fn insert_find_single_key() {
        let fm = fm();
        let trie = HbTrie::new(&fm, 8);
        let (root, old) = trie.insert(NOT_FOUND, b"hello", 100).unwrap();
        assert_eq!(old, None);
        trie.end_operation().unwrap();
        assert_eq!(trie.find(root, b"hello").unwrap(), Some(100));
        assert_eq!(trie.find(root, b"nope").unwrap(), None);
    }

    #[test]
    fn key_shorter_than_chunk_and_key_exact_multiple_of_chunk() {
        let fm = fm();
        let trie = HbTrie::new(&fm, 8);
        let mut root = NOT_FOUND;
        for (key, off) in [(&b"a"[..], 1u64), (&b"abcdefgh"[..], 2), (&b"abcdefghijklmnop"[..], 3)] {
            let (r, _) = trie.insert(root, key, off).unwrap();
            root = r;
        }
        trie.end_operation().unwrap();
        assert_eq!(trie.find(root, b"a").unwrap(), Some(1));
        assert_eq!(trie.find(root, b"abcdefgh").unwrap(), Some(2));
        assert_eq!(trie.find(root, b"abcdefghijklmnop").unwrap(), Some(3));
    }

    #[test]
    fn colliding_prefix_promotes_to_subtrie() {
        let fm = fm();
        let trie = HbTrie::new(&fm, 8);
        let (root, _) = trie.insert(NOT_FOUND, b"0123456789abcdefX", 10).unwrap();
        let (root, _) = trie.insert(root, b"0123456789abcdefY", 20).unwrap();
        trie.end_operation().unwrap();
        assert_eq!(trie.find(root, b"0123456789abcdefX").unwrap(), Some(10));
        assert_eq!(trie.find(root, b"0123456789abcdefY").unwrap(), Some(20));
    }

    #[test]
    fn update_existing_key_returns_old_offset() {
        let fm = fm();
        let trie = HbTrie::new(&fm, 8);
        let (root, _) = trie.insert(NOT_FOUND, b"key", 1).unwrap();
        let (root, old) = trie.insert(root, b"key", 2).unwrap();
        assert_eq!(old, Some(1));
        trie.end_operation().unwrap();
        assert_eq!(trie.find(root, b"key").unwrap(), Some(2));
    }

    #[test]
    fn remove_then_find_fails() {
        let fm = fm();
        let trie = HbTrie::new(&fm, 8);
        let (root, _) = trie.insert(NOT_FOUND, b"key", 1).unwrap();
        trie.end_operation().unwrap();
        let (root, old) = trie.remove(root, b"key").unwrap();
        assert_eq!(old, Some(1));
        trie.end_operation().unwrap();
        assert_eq!(trie.find(root, b"key").unwrap(), None);
    }

    #[test]
    fn iterate_all_yields_ascending_order() {
        let fm = fm();
        let trie = HbTrie::new(&fm, 4);
        let mut root = NOT_FOUND;
        let keys: Vec<Vec<u8>> =
            (0..50u32).map(|i| format!("key-{i:04}").into_bytes()).collect();
        for (i, key) in keys.iter().enumerate() {
            let (r, _) = trie.insert(root, key, i as u64).unwrap();
            root = r;
        }
        trie.end_operation().unwrap();

        let mut all = trie.iterate_all(root).unwrap();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        let mut sorted_keys = keys.clone();
        sorted_keys.sort();
        let got_keys: Vec<Vec<u8>> = all.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(got_keys, sorted_keys);
    }
}
