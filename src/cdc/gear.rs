//! Gear rolling hash.
//!
//! The table is derived from BLAKE3 of each single byte value, first 8 bytes
//! read little-endian, so it is reproducible without shipping constants.

use std::sync::OnceLock;

pub type GearTable = [u64; 256];

/// Bytes that influence one hash value; older bytes have been shifted out.
pub const GEAR_WINDOW: usize = 64;

static GEAR_TABLE: OnceLock<GearTable> = OnceLock::new();

pub fn gear_table() -> &'static GearTable {
    GEAR_TABLE.get_or_init(build_table)
}

fn build_table() -> GearTable {
    let mut table = [0u64; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let hash = blake3::hash(&[i as u8]);
        let mut first = [0u8; 8];
        first.copy_from_slice(&hash.as_bytes()[..8]);
        *slot = u64::from_le_bytes(first);
    }
    table
}

#[inline]
pub fn roll(hash: u64, byte: u8, table: &GearTable) -> u64 {
    (hash << 1).wrapping_add(table[byte as usize])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gear_table_spot_checks() {
        let table = gear_table();
        assert_eq!(table[0], 0xf1611bf1dfde3a2d, "GEAR[0] mismatch: got {:#x}", table[0]);
        assert_eq!(table[1], 0xe072c1bb1f72fc48, "GEAR[1] mismatch: got {:#x}", table[1]);
        assert_eq!(table[255], 0x6d93c57b374dd499, "GEAR[255] mismatch: got {:#x}", table[255]);
    }

    #[test]
    fn test_hash_forgets_old_bytes() {
        let table = gear_table();
        let tail = [0x5au8; GEAR_WINDOW];
        let fold = |prefix: u8| {
            let mut h = roll(0, prefix, table);
            for &b in &tail {
                h = roll(h, b, table);
            }
            h
        };
        assert_eq!(fold(1), fold(200));
    }
}
