//! Hash slot calculation.
//!
//! Keys map to one of 16384 slots via CRC16. When a key contains a hash tag
//! (`{...}` with a non-empty interior), only the tag is hashed, so related
//! keys can be pinned to one slot.

use crc::{Crc, CRC_16_XMODEM};

/// Number of hash slots.
pub const SLOT_COUNT: u16 = 16384;

/// CRC-16/XMODEM, the algorithm the cluster specification prescribes.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Calculates the hash slot for a key.
///
/// # Examples
///
/// ```
/// use replex::key_slot;
///
/// assert_eq!(key_slot(b"{user1000}.following"), key_slot(b"{user1000}.followers"));
/// assert_ne!(key_slot(b"user1000"), key_slot(b"user2000"));
/// ```
pub fn key_slot(key: &[u8]) -> u16 {
    CRC16.checksum(extract_hash_tag(key)) % SLOT_COUNT
}

/// Extracts the hash tag from a key.
///
/// The tag is the content of the first `{...}` pair with a non-empty
/// interior; a key without one hashes in full.
fn extract_hash_tag(key: &[u8]) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[start + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[start + 1..start + 1 + len];
            }
        }
    }
    key
}
