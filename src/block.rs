//! Block addressing primitives shared by the file manager, the B-tree store,
//! and the HB+trie.

/// Fixed block size. Changing it invalidates existing files.
pub const BLOCK_SIZE: usize = 4096;

/// Block identifier: a byte offset divided by [`BLOCK_SIZE`].
pub type Bid = u64;

/// Sentinel meaning "no block".
pub const NOT_FOUND: Bid = u64::MAX;

/// Tag byte trailing each block, identifying what it currently holds. Blocks
/// carry no checksum — durability comes from the superblock, not per-block
/// integrity bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockType {
    Free = 0,
    BtreeNode = 1,
    Superblock = 2,
}

impl BlockType {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => BlockType::BtreeNode,
            2 => BlockType::Superblock,
            _ => BlockType::Free,
        }
    }
}

/// A single cached, fixed-size block.
#[derive(Clone)]
pub struct Block {
    data: Vec<u8>,
}

impl Block {
    pub fn zeroed() -> Self {
        Block { data: vec![0u8; BLOCK_SIZE] }
    }

    pub fn from_payload(payload: &[u8], block_type: BlockType) -> Self {
        assert!(payload.len() + 1 <= BLOCK_SIZE, "payload does not fit in a block");
        let mut data = vec![0u8; BLOCK_SIZE];
        data[..payload.len()].copy_from_slice(payload);
        data[BLOCK_SIZE - 1] = block_type as u8;
        Block { data }
    }

    pub fn block_type(&self) -> BlockType {
        BlockType::from_u8(self.data[BLOCK_SIZE - 1])
    }

    /// The payload region, excluding the trailing tag byte. Trailing zero
    /// bytes are not stripped; decoders must be self-describing (length
    /// prefixed) about how much of this to consume.
    pub fn payload(&self) -> &[u8] {
        &self.data[..BLOCK_SIZE - 1]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        assert_eq!(bytes.len(), BLOCK_SIZE);
        Block { data: bytes }
    }
}
