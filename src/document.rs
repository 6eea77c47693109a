//! Document handles: the caller-owned `{key, meta, body}` triple passed to
//! `get`/`set`. Meta and body are each optional independently of the other;
//! allocation is explicit and fallible so a resource-exhausted caller gets
//! `ALLOC_FAIL` instead of an abort.

use crate::error::{Result, StoreError};

/// A document handle. `meta` and `body` start `None` on `get`/`get_metaonly`
/// calls and are filled in place; `set` reads them as given. A `set` whose
/// `body` is `None` performs a delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Doc {
    pub key: Vec<u8>,
    pub meta: Option<Vec<u8>>,
    pub body: Option<Vec<u8>>,
    /// Offset of this document's body within the log, set by
    /// `get_metaonly` so the caller may fetch the body lazily.
    pub body_offset: Option<u64>,
}

impl Doc {
    /// Allocates a document handle for `key` with optional `meta`/`body`.
    ///
    /// # Errors
    /// Returns `ALLOC_FAIL` if reserving storage for any field fails. No
    /// partially constructed document is returned to the caller.
    pub fn create(key: &[u8], meta: Option<&[u8]>, body: Option<&[u8]>) -> Result<Self> {
        let mut key_buf = Vec::new();
        key_buf.try_reserve_exact(key.len()).map_err(|e| StoreError::AllocFail(e.to_string()))?;
        key_buf.extend_from_slice(key);

        let meta_buf = match meta {
            Some(m) => {
                let mut b = Vec::new();
                b.try_reserve_exact(m.len()).map_err(|e| StoreError::AllocFail(e.to_string()))?;
                b.extend_from_slice(m);
                Some(b)
            }
            None => None,
        };
        let body_buf = match body {
            Some(bd) => {
                let mut b = Vec::new();
                b.try_reserve_exact(bd.len()).map_err(|e| StoreError::AllocFail(e.to_string()))?;
                b.extend_from_slice(bd);
                Some(b)
            }
            None => None,
        };
        Ok(Doc { key: key_buf, meta: meta_buf, body: body_buf, body_offset: None })
    }

    /// A `set` with a null body performs a delete.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.body.is_none()
    }

    pub(crate) fn meta_bytes(&self) -> &[u8] {
        self.meta.as_deref().unwrap_or(&[])
    }

    pub(crate) fn body_bytes(&self) -> &[u8] {
        self.body.as_deref().unwrap_or(&[])
    }
}
