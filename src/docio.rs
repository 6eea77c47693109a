//! Append-only document log over the file manager's raw byte space.
//!
//! A record written at offset `O` with total length `L` occupies bytes
//! `[O, O+L)` and can be decoded deterministically given `O` alone: a fixed
//! 12-byte length prefix (`keylen`, `metalen`, `bodylen`, each `u32`
//! little-endian) followed by the three payloads back to back.

use crate::error::{Result, StoreError};
use crate::file_manager::FileManager;

const PREFIX_LEN: usize = 12;

/// A fully decoded document record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocRecord {
    pub key: Vec<u8>,
    pub meta: Vec<u8>,
    pub body: Vec<u8>,
}

impl DocRecord {
    /// Total on-log size of this record, including its length prefix.
    #[must_use]
    pub fn on_log_size(&self) -> u64 {
        (PREFIX_LEN + self.key.len() + self.meta.len() + self.body.len()) as u64
    }
}

/// Serializes `{keylen, metalen, bodylen, key, meta, body}` and appends it at
/// the next available offset.
///
/// # Errors
/// Returns `IO_ERROR` on underlying write failure.
pub fn append(fm: &FileManager, key: &[u8], meta: &[u8], body: &[u8]) -> Result<u64> {
    let mut buf = Vec::with_capacity(PREFIX_LEN + key.len() + meta.len() + body.len());
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(meta.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(meta);
    buf.extend_from_slice(body);
    fm.append_raw(&buf)
}

fn read_prefix(fm: &FileManager, offset: u64) -> Result<(usize, usize, usize)> {
    let prefix = fm.read_raw(offset, PREFIX_LEN)?;
    let keylen = u32::from_le_bytes(prefix[0..4].try_into().unwrap()) as usize;
    let metalen = u32::from_le_bytes(prefix[4..8].try_into().unwrap()) as usize;
    let bodylen = u32::from_le_bytes(prefix[8..12].try_into().unwrap()) as usize;
    Ok((keylen, metalen, bodylen))
}

/// Reads just the key, the cheapest projection; used by the HB+trie during
/// disambiguation.
///
/// # Errors
/// Returns `IO_ERROR` on underlying read failure.
pub fn read_key(fm: &FileManager, offset: u64) -> Result<Vec<u8>> {
    let (keylen, _, _) = read_prefix(fm, offset)?;
    fm.read_raw(offset + PREFIX_LEN as u64, keylen)
}

/// Reads the key and metadata, plus the offset where the body begins.
///
/// # Errors
/// Returns `IO_ERROR` on underlying read failure.
pub fn read_key_meta(fm: &FileManager, offset: u64) -> Result<(Vec<u8>, Vec<u8>, u64)> {
    let (keylen, metalen, _) = read_prefix(fm, offset)?;
    let key = fm.read_raw(offset + PREFIX_LEN as u64, keylen)?;
    let meta_off = offset + PREFIX_LEN as u64 + keylen as u64;
    let meta = fm.read_raw(meta_off, metalen)?;
    let body_off = meta_off + metalen as u64;
    Ok((key, meta, body_off))
}

/// Reads the full record.
///
/// # Errors
/// Returns `IO_ERROR` on underlying read failure.
pub fn read_full(fm: &FileManager, offset: u64) -> Result<DocRecord> {
    let (key, meta, body_off) = read_key_meta(fm, offset)?;
    let (_, _, bodylen) = read_prefix(fm, offset)?;
    let body = fm.read_raw(body_off, bodylen)?;
    Ok(DocRecord { key, meta, body })
}

/// Reads a record and verifies its stored key matches `expected_key`
/// exactly, surfacing the disambiguation-miss contract from `get`.
///
/// # Errors
/// Returns `StoreError::Fail` if the stored key does not match.
pub fn read_full_checked(fm: &FileManager, offset: u64, expected_key: &[u8]) -> Result<DocRecord> {
    let rec = read_full(fm, offset)?;
    if rec.key != expected_key {
        return Err(StoreError::Fail);
    }
    Ok(rec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fm() -> FileManager {
        let dir = tempdir().unwrap();
        FileManager::open(&dir.path().join("t.db"), 1 << 16).unwrap()
    }

    #[test]
    fn append_and_read_full_round_trips() {
        let fm = fm();
        let off = append(&fm, b"key", b"meta", b"body").unwrap();
        let rec = read_full(&fm, off).unwrap();
        assert_eq!(rec, DocRecord { key: b"key".to_vec(), meta: b"meta".to_vec(), body: b"body".to_vec() });
    }

    #[test]
    fn read_key_only_is_cheap_projection() {
        let fm = fm();
        let off = append(&fm, b"key", b"meta", b"a rather long body").unwrap();
        assert_eq!(read_key(&fm, off).unwrap(), b"key".to_vec());
    }

    #[test]
    fn checked_read_rejects_mismatched_key() {
        let fm = fm();
        let off = append(&fm, b"key", b"", b"body").unwrap();
        assert!(matches!(read_full_checked(&fm, off, b"other"), Err(StoreError::Fail)));
        assert!(read_full_checked(&fm, off, b"key").is_ok());
    }

    #[test]
    fn empty_meta_and_body_round_trip() {
        let fm = fm();
        let off = append(&fm, b"k", b"", b"").unwrap();
        let rec = read_full(&fm, off).unwrap();
        assert_eq!(rec.meta, Vec::<u8>::new());
        assert_eq!(rec.body, Vec::<u8>::new());
    }

    #[test]
    fn successive_records_do_not_overlap() {
        let fm = fm();
        let off1 = append(&fm, b"k1", b"", b"first").unwrap();
        let off2 = append(&fm, b"k2", b"", b"second").unwrap();
        assert_eq!(read_full(&fm, off1).unwrap().body, b"first".to_vec());
        assert_eq!(read_full(&fm, off2).unwrap().body, b"second".to_vec());
    }
}
