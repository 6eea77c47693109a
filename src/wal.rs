//! Write-ahead buffer: an in-memory staging area for recent mutations,
//! flushed into the HB+trie in insertion order once it grows past a
//! threshold or the caller commits.
//!
//! Writes to the same key coalesce: a second `set` for a key already
//! buffered overwrites the first buffered entry in place rather than
//! appending a second one, so flush only ever applies each key's latest
//! action once.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalAction {
    Set { doc_offset: u64 },
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalItem {
    pub key: Vec<u8>,
    pub action: WalAction,
}

/// Receives flushed WAL items in order and applies them to the durable
/// index. Implemented by the store's flush context, which wraps the
/// HB+trie (and, when enabled, the sequence index).
pub trait WalFlushSink {
    /// # Errors
    /// Returns an error if the underlying index fails to apply the item.
    fn apply(&mut self, item: &WalItem) -> crate::error::Result<()>;
}

/// Hash-indexed write buffer with a parallel insertion-order queue, so
/// flush can process items in the order they were first buffered even
/// after later coalescing.
#[derive(Debug, Default)]
pub struct Wal {
    index: HashMap<Vec<u8>, WalAction>,
    order: VecDeque<Vec<u8>>,
}

impl Wal {
    #[must_use]
    pub fn new() -> Self {
        Wal { index: HashMap::new(), order: VecDeque::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Buffers a set/update, coalescing with any pending action for the
    /// same key.
    pub fn insert(&mut self, key: Vec<u8>, doc_offset: u64) {
        self.stage(key, WalAction::Set { doc_offset });
    }

    /// Buffers a removal, coalescing with any pending action for the same
    /// key.
    pub fn remove(&mut self, key: Vec<u8>) {
        self.stage(key, WalAction::Remove);
    }

    fn stage(&mut self, key: Vec<u8>, action: WalAction) {
        match self.index.entry(key.clone()) {
            Entry::Occupied(mut e) => {
                e.insert(action);
            }
            Entry::Vacant(e) => {
                e.insert(action);
                self.order.push_back(key);
            }
        }
    }

    /// Returns the buffered action for `key`, if any is still pending.
    #[must_use]
    pub fn find(&self, key: &[u8]) -> Option<&WalAction> {
        self.index.get(key)
    }

    /// Applies every buffered item, in the order each key was first
    /// staged, to `sink`, then clears the buffer. Items buffered by the
    /// sink's own `apply` calls (there are none in this engine) would not
    /// be visited; flush is not reentrant.
    ///
    /// # Errors
    /// Returns an error if `sink` fails partway; already-applied items stay
    /// applied; items not yet applied remain buffered for a later flush.
    pub fn flush(&mut self, sink: &mut dyn WalFlushSink) -> crate::error::Result<()> {
        while let Some(key) = self.order.pop_front() {
            if let Some(action) = self.index.remove(&key) {
                let item = WalItem { key, action };
                sink.apply(&item)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        applied: Vec<WalItem>,
    }

    impl WalFlushSink for RecordingSink {
        fn apply(&mut self, item: &WalItem) -> crate::error::Result<()> {
            self.applied.push(item.clone());
            Ok(())
        }
    }

    #[test]
    fn duplicate_writes_coalesce_to_one_item() {
        let mut wal = Wal::new();
        wal.insert(b"k".to_vec(), 1);
        wal.insert(b"k".to_vec(), 2);
        assert_eq!(wal.len(), 1);
        assert_eq!(wal.find(b"k"), Some(&WalAction::Set { doc_offset: 2 }));
    }

    #[test]
    fn flush_preserves_first_insertion_order() {
        let mut wal = Wal::new();
        wal.insert(b"b".to_vec(), 1);
        wal.insert(b"a".to_vec(), 2);
        wal.insert(b"b".to_vec(), 3); // coalesces, keeps "b"'s original position

        let mut sink = RecordingSink::default();
        wal.flush(&mut sink).unwrap();
        assert!(wal.is_empty());

        let keys: Vec<&[u8]> = sink.applied.iter().map(|i| i.key.as_slice()).collect();
        assert_eq!(keys, vec![b"b".as_slice(), b"a".as_slice()]);
        assert_eq!(sink.applied[0].action, WalAction::Set { doc_offset: 3 });
    }

    #[test]
    fn remove_replaces_pending_set() {
        let mut wal = Wal::new();
        wal.insert(b"k".to_vec(), 1);
        wal.remove(b"k".to_vec());
        assert_eq!(wal.find(b"k"), Some(&WalAction::Remove));
        assert_eq!(wal.len(), 1);
    }
}
