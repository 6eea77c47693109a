//! Block-indexed, copy-on-write B-tree store. Every node lives in one block;
//! a mutation allocates new blocks for every node on the path to the root
//! and stages them in a per-operation dirty set, released to the file
//! manager as a single batch when the caller signals end-of-operation.
//!
//! Keys and values are opaque byte vectors. The HB+trie (`hbtrie.rs`) uses
//! this store with fixed-width-ish chunk keys and a small tagged-slot value
//! encoding; the sequence index uses it with 8-byte sequence number keys.

use crate::block::{Bid, Block, BlockType, BLOCK_SIZE, NOT_FOUND};
use crate::error::Result;
use crate::file_manager::FileManager;
use std::cell::RefCell;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf { keys: Vec<Vec<u8>>, values: Vec<Vec<u8>> },
    Internal { keys: Vec<Vec<u8>>, children: Vec<Bid> },
}

impl Node {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Node::Leaf { keys, values } => {
                buf.push(0u8);
                encode_kv_list(&mut buf, keys, values);
            }
            Node::Internal { keys, children } => {
                buf.push(1u8);
                encode_len(&mut buf, keys.len());
                for k in keys {
                    encode_bytes(&mut buf, k);
                }
                encode_len(&mut buf, children.len());
                for c in children {
                    buf.extend_from_slice(&c.to_le_bytes());
                }
            }
        }
        buf
    }

    fn decode(payload: &[u8]) -> Self {
        let mut pos = 0usize;
        let tag = payload[pos];
        pos += 1;
        if tag == 0 {
            let (keys, values, _) = decode_kv_list(payload, pos);
            Node::Leaf { keys, values }
        } else {
            let (nkeys, mut p) = decode_len(payload, pos);
            pos = p;
            let mut keys = Vec::with_capacity(nkeys);
            for _ in 0..nkeys {
                let (b, np) = decode_bytes(payload, pos);
                keys.push(b);
                pos = np;
            }
            let (nchildren, np) = decode_len(payload, pos);
            p = np;
            let mut children = Vec::with_capacity(nchildren);
            for _ in 0..nchildren {
                children.push(u64::from_le_bytes(payload[p..p + 8].try_into().unwrap()));
                p += 8;
            }
            Node::Internal { keys, children }
        }
    }
}

fn encode_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&(len as u32).to_le_bytes());
}

fn decode_len(buf: &[u8], pos: usize) -> (usize, usize) {
    (u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize, pos + 4)
}

fn encode_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    encode_len(buf, b.len());
    buf.extend_from_slice(b);
}

fn decode_bytes(buf: &[u8], pos: usize) -> (Vec<u8>, usize) {
    let (len, p) = decode_len(buf, pos);
    (buf[p..p + len].to_vec(), p + len)
}

fn encode_kv_list(buf: &mut Vec<u8>, keys: &[Vec<u8>], values: &[Vec<u8>]) {
    encode_len(buf, keys.len());
    for k in keys {
        encode_bytes(buf, k);
    }
    for v in values {
        encode_bytes(buf, v);
    }
}

fn decode_kv_list(buf: &[u8], pos: usize) -> (Vec<Vec<u8>>, Vec<Vec<u8>>, usize) {
    let (n, mut p) = decode_len(buf, pos);
    let mut keys = Vec::with_capacity(n);
    for _ in 0..n {
        let (b, np) = decode_bytes(buf, p);
        keys.push(b);
        p = np;
    }
    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        let (b, np) = decode_bytes(buf, p);
        values.push(b);
        p = np;
    }
    (keys, values, p)
}

/// Outcome of an insert: whether the key was new, and if not, the value it
/// replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    Updated(Vec<u8>),
}

/// Result of inserting into one node: either it absorbed the change in
/// place, or it overflowed and split, handing a separator key and a new
/// right sibling up to the parent.
enum Insertion {
    Fit(Bid),
    Split { left: Bid, sep: Vec<u8>, right: Bid },
}

/// A block-indexed B-tree rooted at a given block id, with a dirty set
/// scoped to one logical operation (e.g. one HB+trie insert, which may
/// touch several chunk-level trees).
pub struct BtreeStore<'a> {
    fm: &'a FileManager,
    fanout: usize,
    dirty: RefCell<HashMap<Bid, Node>>,
}

impl<'a> BtreeStore<'a> {
    /// `key_size` and `value_size` are used only to estimate fanout; nodes
    /// are packed to fit one block regardless, and split as soon as they
    /// would overflow it in practice.
    #[must_use]
    pub fn new(fm: &'a FileManager, key_size: usize, value_size: usize) -> Self {
        let fanout = (BLOCK_SIZE / (key_size + value_size + 8)).max(4);
        BtreeStore { fm, fanout, dirty: RefCell::new(HashMap::new()) }
    }

    fn load(&self, bid: Bid) -> Result<Node> {
        if let Some(n) = self.dirty.borrow().get(&bid) {
            return Ok(n.clone());
        }
        let block = self.fm.read_block(bid)?;
        Ok(Node::decode(block.payload()))
    }

    fn stage(&self, bid: Bid, node: Node) {
        self.dirty.borrow_mut().insert(bid, node);
    }

    /// Releases the accumulated dirty set to the file manager as a single
    /// batch, enabling copy-on-write and atomic group updates from the
    /// caller's point of view.
    ///
    /// # Errors
    /// Returns `IO_ERROR` if writing a staged block fails.
    pub fn end_operation(&self) -> Result<()> {
        let mut dirty = self.dirty.borrow_mut();
        for (bid, node) in dirty.drain() {
            let payload = node.encode();
            self.fm.write_block(bid, Block::from_payload(&payload, BlockType::BtreeNode))?;
        }
        Ok(())
    }

    /// Pure lookup; does not mutate the dirty set.
    ///
    /// # Errors
    /// Returns `IO_ERROR` on underlying read failure.
    pub fn find(&self, root: Bid, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if root == NOT_FOUND {
            return Ok(None);
        }
        let node = self.load(root)?;
        match node {
            Node::Leaf { keys, values } => Ok(keys
                .iter()
                .position(|k| k.as_slice() == key)
                .map(|i| values[i].clone())),
            Node::Internal { keys, children } => {
                let idx = child_index(&keys, key);
                self.find(children[idx], key)
            }
        }
    }

    /// Inserts or updates `key` -> `value` under `root`, returning the new
    /// root block id and the result.
    ///
    /// # Errors
    /// Returns `IO_ERROR` if allocating or staging a node fails.
    pub fn insert(&self, root: Bid, key: &[u8], value: &[u8]) -> Result<(Bid, InsertResult)> {
        if root == NOT_FOUND {
            let bid = self.fm.alloc_block();
            self.stage(bid, Node::Leaf { keys: vec![key.to_vec()], values: vec![value.to_vec()] });
            return Ok((bid, InsertResult::Inserted));
        }
        match self.insert_node(root, key, value)? {
            (Insertion::Fit(bid), result) => Ok((bid, result)),
            (Insertion::Split { left, sep, right }, result) => {
                let root_bid = self.fm.alloc_block();
                self.stage(root_bid, Node::Internal { keys: vec![sep], children: vec![left, right] });
                Ok((root_bid, result))
            }
        }
    }

    /// Inserts into the subtree rooted at `bid`, reporting either the
    /// (possibly restaged) node in place, or a split that the caller must
    /// fold into its own keys/children.
    fn insert_node(&self, bid: Bid, key: &[u8], value: &[u8]) -> Result<(Insertion, InsertResult)> {
        match self.load(bid)? {
            Node::Leaf { mut keys, mut values } => {
                match keys.binary_search_by(|k| k.as_slice().cmp(key)) {
                    Ok(i) => {
                        let old = std::mem::replace(&mut values[i], value.to_vec());
                        self.stage(bid, Node::Leaf { keys, values });
                        Ok((Insertion::Fit(bid), InsertResult::Updated(old)))
                    }
                    Err(i) => {
                        keys.insert(i, key.to_vec());
                        values.insert(i, value.to_vec());
                        if keys.len() <= self.fanout {
                            self.stage(bid, Node::Leaf { keys, values });
                            Ok((Insertion::Fit(bid), InsertResult::Inserted))
                        } else {
                            let split = self.split_leaf(keys, values)?;
                            Ok((split, InsertResult::Inserted))
                        }
                    }
                }
            }
            Node::Internal { mut keys, mut children } => {
                let idx = child_index(&keys, key);
                let (child_outcome, result) = self.insert_node(children[idx], key, value)?;
                match child_outcome {
                    Insertion::Fit(new_child) => {
                        children[idx] = new_child;
                        self.stage(bid, Node::Internal { keys, children });
                        Ok((Insertion::Fit(bid), result))
                    }
                    Insertion::Split { left, sep, right } => {
                        children[idx] = left;
                        children.insert(idx + 1, right);
                        keys.insert(idx, sep);
                        if children.len() <= self.fanout + 1 {
                            self.stage(bid, Node::Internal { keys, children });
                            Ok((Insertion::Fit(bid), result))
                        } else {
                            let split = self.split_internal(keys, children)?;
                            Ok((split, result))
                        }
                    }
                }
            }
        }
    }

    fn split_leaf(&self, keys: Vec<Vec<u8>>, values: Vec<Vec<u8>>) -> Result<Insertion> {
        let mid = keys.len() / 2;
        let mut left_keys = keys;
        let mut left_values = values;
        let right_keys = left_keys.split_off(mid);
        let right_values = left_values.split_off(mid);
        let sep = right_keys[0].clone();

        let left_bid = self.fm.alloc_block();
        let right_bid = self.fm.alloc_block();
        self.stage(left_bid, Node::Leaf { keys: left_keys, values: left_values });
        self.stage(right_bid, Node::Leaf { keys: right_keys, values: right_values });
        Ok(Insertion::Split { left: left_bid, sep, right: right_bid })
    }

    /// Splits an overflowing internal node, promoting its middle separator
    /// key to the caller rather than duplicating it on either side.
    fn split_internal(&self, mut keys: Vec<Vec<u8>>, mut children: Vec<Bid>) -> Result<Insertion> {
        let mid = keys.len() / 2;
        let right_keys = keys.split_off(mid + 1);
        let sep = keys.remove(mid);
        let right_children = children.split_off(mid + 1);
        let (left_keys, left_children) = (keys, children);

        let left_bid = self.fm.alloc_block();
        let right_bid = self.fm.alloc_block();
        self.stage(left_bid, Node::Internal { keys: left_keys, children: left_children });
        self.stage(right_bid, Node::Internal { keys: right_keys, children: right_children });
        Ok(Insertion::Split { left: left_bid, sep, right: right_bid })
    }

    /// Removes `key` if present, returning its old value. Does not rebalance
    /// or merge underfull nodes; only leaves ever shrink.
    ///
    /// # Errors
    /// Returns `IO_ERROR` on underlying read or write failure.
    pub fn remove(&self, root: Bid, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if root == NOT_FOUND {
            return Ok(None);
        }
        match self.load(root)? {
            Node::Leaf { mut keys, mut values } => {
                match keys.binary_search_by(|k| k.as_slice().cmp(key)) {
                    Ok(i) => {
                        keys.remove(i);
                        let old = values.remove(i);
                        self.stage(root, Node::Leaf { keys, values });
                        Ok(Some(old))
                    }
                    Err(_) => Ok(None),
                }
            }
            Node::Internal { keys, children } => {
                let idx = child_index(&keys, key);
                self.remove(children[idx], key)
            }
        }
    }

    /// Inorder traversal from `start` (or the beginning, if `None`),
    /// yielding `(key, value)` pairs in strict ascending order.
    ///
    /// # Errors
    /// Returns `IO_ERROR` on underlying read failure.
    pub fn iterate(&self, root: Bid, start: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        if root != NOT_FOUND {
            self.iterate_into(root, start, &mut out)?;
        }
        Ok(out)
    }

    fn iterate_into(&self, bid: Bid, start: Option<&[u8]>, out: &mut Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        match self.load(bid)? {
            Node::Leaf { keys, values } => {
                for (k, v) in keys.into_iter().zip(values) {
                    if start.is_none_or(|s| k.as_slice() >= s) {
                        out.push((k, v));
                    }
                }
            }
            Node::Internal { keys, children } => {
                let start_idx = start.map_or(0, |s| child_index(&keys, s));
                for (i, child) in children.iter().enumerate().skip(start_idx) {
                    let child_start = if i == start_idx { start } else { None };
                    self.iterate_into(*child, child_start, out)?;
                }
            }
        }
        Ok(())
    }
}

/// For an internal node's sorted `keys` (the separators between
/// `keys.len() + 1` children), finds which child subtree `key` falls into.
fn child_index(keys: &[Vec<u8>], key: &[u8]) -> usize {
    match keys.binary_search_by(|k| k.as_slice().cmp(key)) {
        Ok(i) => i + 1,
        Err(i) => i,
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
    fn insert_then_find_roundtrips() {
        let fm = fm();
        let store = BtreeStore::new(&fm, 8, 8);
        let (root, res) = store.insert(NOT_FOUND, b"key1", b"value1").unwrap();
        assert_eq!(res, InsertResult::Inserted);
        store.end_operation().unwrap();
        assert_eq!(store.find(root, b"key1").unwrap(), Some(b"value1".to_vec()));
        assert_eq!(store.find(root, b"missing").unwrap(), None);
    }

    #[test]
    fn insert_existing_key_updates_and_returns_old_value() {
        let fm = fm();
        let store = BtreeStore::new(&fm, 8, 8);
        let (root, _) = store.insert(NOT_FOUND, b"key1", b"v1").unwrap();
        let (root, res) = store.insert(root, b"key1", b"v2").unwrap();
        assert_eq!(res, InsertResult::Updated(b"v1".to_vec()));
        store.end_operation().unwrap();
        assert_eq!(store.find(root, b"key1").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn many_inserts_split_and_iterate_in_order() {
        let fm = fm();
        let store = BtreeStore::new(&fm, 4, 4);
        let mut root = NOT_FOUND;
        for i in 0..300u32 {
            let key = i.to_be_bytes().to_vec();
            let (new_root, _) = store.insert(root, &key, &key).unwrap();
            root = new_root;
        }
        store.end_operation().unwrap();

        let all = store.iterate(root, None).unwrap();
        assert_eq!(all.len(), 300);
        let mut prev: Option<Vec<u8>> = None;
        for (k, _) in &all {
            if let Some(p) = &prev {
                assert!(p < k);
            }
            prev = Some(k.clone());
        }
    }

    #[test]
    fn remove_deletes_entry() {
        let fm = fm();
        let store = BtreeStore::new(&fm, 8, 8);
        let (root, _) = store.insert(NOT_FOUND, b"a", b"1").unwrap();
        let (root, _) = store.insert(root, b"b", b"2").unwrap();
        store.end_operation().unwrap();

        let old = store.remove(root, b"a").unwrap();
        assert_eq!(old, Some(b"1".to_vec()));
        store.end_operation().unwrap();
        assert_eq!(store.find(root, b"a").unwrap(), None);
        assert_eq!(store.find(root, b"b").unwrap(), Some(b"2".to_vec()));
    }
}
