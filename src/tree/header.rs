//! The fixed-size header stored at the very start of a tree's root node
//! range, ahead of caller userdata and the root node's own packed bytes.

use crate::error::{Result, StorageError};

const MAGIC: &[u8; 8] = b"BTREEv01";

pub const HEADER_SIZE: usize = 8 + 2 + 2 + 2 + 1 + 1 + 2 + 2;

#[derive(Debug, Clone, Copy)]
pub struct TreeHeader {
    pub max_leaf_keys: u16,
    pub max_interior_keys: u16,
    pub height: i16,
    pub key_size: u8,
    pub value_size: u8,
    pub userdata_size: u16,
    pub root_offset: u16,
}

pub fn write_header(buf: &mut [u8], h: &TreeHeader) {
    buf[0..8].copy_from_slice(MAGIC);
    buf[8..10].copy_from_slice(&h.max_leaf_keys.to_le_bytes());
    buf[10..12].copy_from_slice(&h.max_interior_keys.to_le_bytes());
    buf[12..14].copy_from_slice(&h.height.to_le_bytes());
    buf[14] = h.key_size;
    buf[15] = h.value_size;
    buf[16..18].copy_from_slice(&h.userdata_size.to_le_bytes());
    buf[18..20].copy_from_slice(&h.root_offset.to_le_bytes());
}

pub fn read_header(buf: &[u8]) -> Result<TreeHeader> {
    if buf.len() < HEADER_SIZE || &buf[0..8] != MAGIC {
        return Err(StorageError::corruption("bad tree header magic"));
    }
    Ok(TreeHeader {
        max_leaf_keys: u16::from_le_bytes([buf[8], buf[9]]),
        max_interior_keys: u16::from_le_bytes([buf[10], buf[11]]),
        height: i16::from_le_bytes([buf[12], buf[13]]),
        key_size: buf[14],
        value_size: buf[15],
        userdata_size: u16::from_le_bytes([buf[16], buf[17]]),
        root_offset: u16::from_le_bytes([buf[18], buf[19]]),
    })
}

/// Offset of the height field within the header, for in-place rewrites that
/// don't want to touch the rest of the header.
pub const HEIGHT_OFFSET: usize = 12;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let h = TreeHeader {
            max_leaf_keys: 7,
            max_interior_keys: 5,
            height: 3,
            key_size: 8,
            value_size: 4,
            userdata_size: 16,
            root_offset: 36,
        };
        let mut buf = vec![0u8; HEADER_SIZE];
        write_header(&mut buf, &h);
        let back = read_header(&buf).unwrap();
        assert_eq!(back.max_leaf_keys, 7);
        assert_eq!(back.height, 3);
        assert_eq!(back.root_offset, 36);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = vec![0u8; HEADER_SIZE];
        assert!(read_header(&buf).is_err());
    }
}
