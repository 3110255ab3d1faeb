//! On-disk framing: block handles, the block trailer, and the table footer.

use crc::{Crc, CRC_32_ISCSI};
use integer_encoding::VarInt;

use crate::errdata;
use crate::error::Result;

/// CRC32C, as used for every block trailer.
pub const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Every block is followed by a one-byte compression type and a four-byte
/// little-endian masked CRC32C of the payload plus the type byte.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Two varint-encoded u64s never exceed this.
pub const MAX_ENCODED_HANDLE_SIZE: usize = 10 + 10;

/// The footer holds two handles padded to 40 bytes, then the magic number.
pub const FOOTER_SIZE: usize = 48;
const FOOTER_PADDED_SIZE: usize = 40;
const MAGIC_BYTES: [u8; 8] = [0x57, 0xfb, 0x80, 0x8b, 0x24, 0x75, 0x47, 0xdb];

const CRC_MASK_DELTA: u32 = 0xa282_ead8;

/// Masks a CRC so that a block whose payload embeds its own checksum does not
/// verify by coincidence.
pub fn mask_crc(crc: u32) -> u32 {
    crc.rotate_right(15).wrapping_add(CRC_MASK_DELTA)
}

/// Inverse of [`mask_crc`].
pub fn unmask_crc(masked: u32) -> u32 {
    masked.wrapping_sub(CRC_MASK_DELTA).rotate_left(15)
}

/// Checksum over a block payload and its compression type byte.
pub fn block_crc(payload: &[u8], compression_type: u8) -> u32 {
    let mut digest = CASTAGNOLI.digest();
    digest.update(payload);
    digest.update(&[compression_type]);
    digest.finalize()
}

/// Locates a framed block's payload within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Appends the varint encoding of `(offset, size)` to `dst` and returns
    /// the number of bytes written.
    pub fn encode_to(&self, dst: &mut Vec<u8>) -> usize {
        let before = dst.len();
        dst.extend_from_slice(&self.offset.encode_var_vec());
        dst.extend_from_slice(&self.size.encode_var_vec());
        dst.len() - before
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dst = Vec::with_capacity(MAX_ENCODED_HANDLE_SIZE);
        self.encode_to(&mut dst);
        dst
    }

    /// Decodes a handle from the front of `src`, returning it along with the
    /// number of bytes consumed.
    pub fn decode(src: &[u8]) -> Result<(Self, usize)> {
        let Some((offset, offset_len)) = u64::decode_var(src) else {
            return errdata!("bad block handle offset");
        };
        let Some((size, size_len)) = u64::decode_var(&src[offset_len..]) else {
            return errdata!("bad block handle size");
        };
        Ok((Self { offset, size }, offset_len + size_len))
    }
}

/// The fixed-size record at the end of every table, locating the metaindex
/// and index blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub metaindex_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    pub fn new(metaindex_handle: BlockHandle, index_handle: BlockHandle) -> Self {
        Self {
            metaindex_handle,
            index_handle,
        }
    }

    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        let mut handles = Vec::with_capacity(FOOTER_PADDED_SIZE);
        self.metaindex_handle.encode_to(&mut handles);
        self.index_handle.encode_to(&mut handles);
        buf[..handles.len()].copy_from_slice(&handles);
        buf[FOOTER_PADDED_SIZE..].copy_from_slice(&MAGIC_BYTES);
        buf
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() != FOOTER_SIZE {
            return errdata!("footer must be {FOOTER_SIZE} bytes, got {}", src.len());
        }
        if src[FOOTER_PADDED_SIZE..] != MAGIC_BYTES {
            return errdata!("bad magic number in footer");
        }

        let (metaindex_handle, len) = BlockHandle::decode(src)?;
        let (index_handle, _) = BlockHandle::decode(&src[len..])?;
        Ok(Self {
            metaindex_handle,
            index_handle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_roundtrip() {
        for (offset, size) in [(0, 0), (1, 127), (128, 300), (u64::MAX, u64::MAX / 7)] {
            let handle = BlockHandle::new(offset, size);
            let encoded = handle.encode();
            assert!(encoded.len() <= MAX_ENCODED_HANDLE_SIZE);
            let (decoded, consumed) = BlockHandle::decode(&encoded).unwrap();
            assert_eq!(decoded, handle);
            assert_eq!(consumed, encoded.len());
        }
    }

    #[test]
    fn test_handle_decode_truncated() {
        let handle = BlockHandle::new(1 << 40, 1 << 20);
        let encoded = handle.encode();
        assert!(BlockHandle::decode(&encoded[..2]).is_err());
        assert!(BlockHandle::decode(&[]).is_err());
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = Footer::new(BlockHandle::new(44, 4), BlockHandle::new(55, 5));
        let encoded = footer.encode();
        assert_eq!(encoded.len(), FOOTER_SIZE);

        let decoded = Footer::decode(&encoded).unwrap();
        assert_eq!(decoded, footer);
    }

    #[test]
    fn test_footer_magic_is_little_endian() {
        let footer = Footer::new(BlockHandle::default(), BlockHandle::default());
        let encoded = footer.encode();
        let magic = u64::from_le_bytes(encoded[40..48].try_into().unwrap());
        assert_eq!(magic, 0xdb4775248b80fb57);
    }

    #[test]
    fn test_footer_rejects_bad_magic() {
        let footer = Footer::new(BlockHandle::new(1, 2), BlockHandle::new(3, 4));
        let mut encoded = footer.encode();
        encoded[47] ^= 0x01;
        assert!(Footer::decode(&encoded).is_err());
        assert!(Footer::decode(&encoded[..40]).is_err());
    }

    #[test]
    fn test_crc_mask_roundtrip() {
        for crc in [0, 1, 0xdead_beef, u32::MAX] {
            assert_eq!(unmask_crc(mask_crc(crc)), crc);
            // Masking must actually change the value.
            assert_ne!(mask_crc(crc), crc);
        }
    }

    #[test]
    fn test_block_crc_covers_type_byte() {
        let payload = b"some block payload";
        assert_ne!(block_crc(payload, 0), block_crc(payload, 1));
        assert_ne!(block_crc(payload, 0), block_crc(b"some block payloae", 0));
    }
}
